//! Single-instance PID lock.
//!
//! One call per host: the session writes its PID to a lock file at start and
//! removes it on every terminal path. A lock file naming a dead PID is stale
//! and taken over silently.

use crate::error::{AgentError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held PID lock; released on drop.
pub struct PidLock {
    path: PathBuf,
    held: bool,
}

impl PidLock {
    /// Acquire the lock at `path` for the current process.
    ///
    /// # Errors
    ///
    /// Returns a lock error naming the live holder when another session is
    /// running.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Ok(contents) = std::fs::read_to_string(path) {
            match contents.trim().parse::<u32>() {
                Ok(pid) if pid_alive(pid) => {
                    return Err(AgentError::Lock(format!(
                        "Another call is already running (pid {pid}). \
                         Run `garbo hangup` to end it first."
                    )));
                }
                Ok(pid) => {
                    warn!("removing stale lock from dead pid {pid}");
                }
                Err(_) => {
                    warn!("removing unreadable lock file {}", path.display());
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        debug!("acquired pid lock at {}", path.display());
        Ok(Self {
            path: path.to_owned(),
            held: true,
        })
    }

    /// Remove the lock file. A missing file is a no-op; the lock may have
    /// been cleaned up externally.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("released pid lock at {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove lock file {}: {e}", self.path.display()),
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether a PID names a live process.
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A PID far above any kernel's pid_max.
    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.pid");

        let _lock = PidLock::acquire(&path).expect("acquire");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            contents.trim().parse::<u32>().expect("pid"),
            std::process::id()
        );
    }

    #[test]
    fn stale_pid_is_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.pid");
        std::fs::write(&path, format!("{DEAD_PID}\n")).expect("seed");

        let _lock = PidLock::acquire(&path).expect("acquire over stale");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            contents.trim().parse::<u32>().expect("pid"),
            std::process::id()
        );
    }

    #[test]
    fn live_pid_blocks_acquisition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.pid");
        std::fs::write(&path, format!("{}\n", std::process::id())).expect("seed");

        match PidLock::acquire(&path) {
            Err(AgentError::Lock(message)) => {
                assert!(message.contains("already running"), "{message}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected lock error"),
        }
    }

    #[test]
    fn release_is_idempotent_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.pid");

        let mut lock = PidLock::acquire(&path).expect("acquire");
        std::fs::remove_file(&path).expect("external cleanup");
        lock.release();
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.pid");
        {
            let _lock = PidLock::acquire(&path).expect("acquire");
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
