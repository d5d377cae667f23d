//! Call transcript file.
//!
//! Append-only, flushed and synced after every line so a crash leaves a
//! valid partial record.

use crate::error::Result;
use crate::triggers::Role;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::debug;

/// Writer for one call's transcript.
pub struct TranscriptWriter {
    file: File,
    started: Instant,
}

impl TranscriptWriter {
    /// Create (or append to) the transcript at `path` and write the header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written.
    pub fn create(path: &Path, number: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        let started_wall = chrono::Local::now();
        writeln!(
            file,
            "Call Transcript — {}",
            started_wall.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(file, "Number: {number}")?;
        writeln!(file, "{}", "-".repeat(40))?;
        file.flush()?;
        file.sync_data()?;

        debug!("transcript open at {}", path.display());
        Ok(Self {
            file,
            started: Instant::now(),
        })
    }

    /// Append one timestamped line.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn line(&mut self, role: Role, text: &str) -> Result<()> {
        let elapsed = self.started.elapsed();
        let minutes = elapsed.as_secs() / 60;
        let seconds = elapsed.as_secs_f64() - (minutes * 60) as f64;
        writeln!(
            self.file,
            "[{minutes:02}:{seconds:04.1}] {}: {text}",
            role_label(role)
        )?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Write the closing line with the call duration.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn close(&mut self) -> Result<()> {
        let duration = self.started.elapsed().as_secs();
        writeln!(self.file, "Call ended (duration: {duration}s)")?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Caller => "Caller",
        Role::Agent => "Agent",
        Role::System => "System",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lines_and_closing_are_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.txt");

        let mut transcript = TranscriptWriter::create(&path, "15558675309").expect("create");
        transcript.line(Role::Caller, "Okay, goodbye!").expect("line");
        transcript
            .line(Role::Agent, "Take care, bye now.")
            .expect("line");
        transcript.close().expect("close");

        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].starts_with("Call Transcript — "));
        assert_eq!(lines[1], "Number: 15558675309");
        assert!(lines[2].chars().all(|c| c == '-'));
        assert!(lines[3].contains("Caller: Okay, goodbye!"));
        assert!(lines[3].starts_with("[00:0"));
        assert!(lines[4].contains("Agent: Take care, bye now."));
        assert!(lines[5].starts_with("Call ended (duration: "));
    }

    #[test]
    fn timestamps_use_minute_second_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.txt");

        let mut transcript = TranscriptWriter::create(&path, "1").expect("create");
        transcript.line(Role::System, "silence check").expect("line");

        let contents = std::fs::read_to_string(&path).expect("read");
        let line = contents
            .lines()
            .find(|l| l.contains("System:"))
            .expect("system line");
        // "[mm:ss.s]" prefix
        assert_eq!(&line[0..1], "[");
        assert_eq!(&line[3..4], ":");
        assert_eq!(&line[8..9], "]");
    }
}
