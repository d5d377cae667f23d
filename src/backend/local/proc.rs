//! STT/TTS subprocess plumbing for the local pipeline.
//!
//! Both servers speak line-buffered JSON on stderr for status. The STT
//! server reads raw S16LE 8 kHz on stdin and writes JSON transcript lines on
//! stdout; the TTS server reads JSON request lines on stdin and writes raw
//! S16LE frames on stdout, terminating each utterance with a 4-byte
//! sentinel.

use crate::audio::{self, ulaw};
use crate::backend::{BackendEvent, EventSender};
use crate::error::{AgentError, Result};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Utterance-boundary sentinel, `0xDEADBEEF` little-endian.
///
/// A four-byte marker inside an otherwise raw audio stream can in principle
/// collide with payload bytes, but utterances are zero-padded to 320-byte
/// boundaries and the pattern never occurs in padded speech in practice.
/// Both ends of the subprocess contract share this constant.
pub const UTTERANCE_BOUNDARY: [u8; 4] = 0xDEAD_BEEFu32.to_le_bytes();

/// Events parsed from the STT server's stdout.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// VAD detected the start of caller speech.
    SpeechStarted,
    /// VAD detected the end of caller speech.
    SpeechStopped,
    /// A completed utterance transcription.
    Transcript {
        /// Transcribed text.
        text: String,
        /// Transcription latency in seconds, as reported by the server.
        latency: f64,
    },
}

/// One transcript line from the STT server.
#[derive(Debug, Deserialize)]
struct SttLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    latency: f64,
}

/// One status line from either server's stderr.
#[derive(Debug, Deserialize)]
struct StatusLine {
    status: String,
    #[serde(default)]
    message: String,
}

/// A spawned STT or TTS server with its piped streams taken.
pub struct Server {
    /// Child handle, kept for kill on teardown.
    pub child: Child,
    /// Piped stdin.
    pub stdin: ChildStdin,
    /// Piped stdout.
    pub stdout: ChildStdout,
    /// Stderr status reader task.
    pub status_handle: JoinHandle<()>,
}

/// Spawn a subprocess server and wait for its `{"status":"ready"}` stderr
/// line. Model loading dominates startup, so the wait is generous.
///
/// # Errors
///
/// Returns an error if the command is empty, the spawn fails, or the server
/// does not report ready within `startup_timeout`.
pub async fn spawn_server(
    command: &[String],
    label: &'static str,
    startup_timeout: Duration,
) -> Result<Server> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| AgentError::Config(format!("{label} command is empty")))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Config(format!("cannot spawn {label} ({program}): {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AgentError::Config(format!("{label} stdin not piped")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::Config(format!("{label} stdout not piped")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AgentError::Config(format!("{label} stderr not piped")))?;

    let (ready_tx, ready_rx) = oneshot::channel();
    let status_handle = tokio::spawn(run_status_reader(stderr, label, ready_tx));

    info!("waiting for {label} to load (up to {}s)", startup_timeout.as_secs());
    match tokio::time::timeout(startup_timeout, ready_rx).await {
        Ok(Ok(())) => info!("{label} ready"),
        Ok(Err(_)) => {
            return Err(AgentError::Timeout(format!(
                "{label} exited before reporting ready"
            )));
        }
        Err(_) => {
            return Err(AgentError::Timeout(format!(
                "{label} did not report ready within {}s",
                startup_timeout.as_secs()
            )));
        }
    }

    Ok(Server {
        child,
        stdin,
        stdout,
        status_handle,
    })
}

/// Log stderr status lines for the lifetime of the subprocess, signalling
/// `ready_tx` on the first ready status. Non-JSON lines are model-loader
/// noise and logged at debug.
async fn run_status_reader(
    stderr: tokio::process::ChildStderr,
    label: &'static str,
    ready_tx: oneshot::Sender<()>,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut ready_tx = Some(ready_tx);
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<StatusLine>(&line) {
            Ok(status) => {
                match status.status.as_str() {
                    "ready" => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    "error" => warn!("{label}: {}", status.message),
                    other => debug!("{label} status: {other}"),
                }
            }
            Err(_) => debug!("{label} stderr: {line}"),
        }
    }
    debug!("{label} stderr closed");
}

/// Read STT stdout JSON lines and forward parsed events. Malformed lines are
/// skipped; EOF ends the reader.
pub async fn run_stt_reader(stdout: ChildStdout, events_tx: mpsc::UnboundedSender<SttEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: SttLine = match serde_json::from_str(trimmed) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("skipping malformed STT line: {e}");
                continue;
            }
        };
        let event = match parsed.kind.as_str() {
            "speech_started" => SttEvent::SpeechStarted,
            "speech_stopped" => SttEvent::SpeechStopped,
            "transcript" => SttEvent::Transcript {
                text: parsed.text,
                latency: parsed.latency,
            },
            other => {
                debug!("unknown STT event type: {other}");
                continue;
            }
        };
        if events_tx.send(event).is_err() {
            break;
        }
    }
    debug!("STT stdout closed");
}

/// Scanner state for the sentinel-framed TTS audio stream.
pub struct TtsAudioReader {
    accumulator: Vec<u8>,
    /// The first sentinel flushes warm-up noise and must not count as a
    /// delivered utterance.
    warmed_up: bool,
    events: EventSender,
    delivered_tx: mpsc::UnboundedSender<()>,
}

impl TtsAudioReader {
    /// Create a reader that emits μ-law audio on `events` and one delivery
    /// signal per completed utterance on `delivered_tx`.
    pub fn new(events: EventSender, delivered_tx: mpsc::UnboundedSender<()>) -> Self {
        Self {
            accumulator: Vec::new(),
            warmed_up: false,
            events,
            delivered_tx,
        }
    }

    /// Consume the TTS stdout until EOF.
    pub async fn run(mut self, stdout: ChildStdout) {
        let mut stdout = stdout;
        let mut chunk = [0u8; 4096];
        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => self.feed(&chunk[..n]),
                Err(e) => {
                    debug!("TTS stdout read failed: {e}");
                    break;
                }
            }
        }
        debug!("TTS stdout closed");
    }

    /// Feed newly-read bytes through the sentinel scanner.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.accumulator.extend_from_slice(bytes);

        while let Some(pos) = find_sentinel(&self.accumulator) {
            let pre: Vec<u8> = self.accumulator.drain(..pos).collect();
            self.accumulator.drain(..UTTERANCE_BOUNDARY.len());

            if !self.warmed_up {
                // Warm-up flush: discard anything the model leaked to stdout
                // before the first real utterance.
                self.warmed_up = true;
                if !pre.is_empty() {
                    debug!("discarded {} warm-up bytes from TTS", pre.len());
                }
                continue;
            }

            self.emit_frames(&pre, true);
            let _ = self.delivered_tx.send(());
        }

        if !self.warmed_up {
            // Keep only a possible sentinel prefix while waiting for the
            // warm-up flush; everything earlier is noise.
            let keep = UTTERANCE_BOUNDARY.len() - 1;
            if self.accumulator.len() > keep {
                let drop = self.accumulator.len() - keep;
                self.accumulator.drain(..drop);
            }
            return;
        }

        // Stream out whole frames as they arrive, but never consume bytes
        // that could be the start of a sentinel.
        let safe = self
            .accumulator
            .len()
            .saturating_sub(UTTERANCE_BOUNDARY.len() - 1);
        let whole = safe / audio::LINEAR_FRAME_BYTES * audio::LINEAR_FRAME_BYTES;
        if whole > 0 {
            let frames: Vec<u8> = self.accumulator.drain(..whole).collect();
            self.emit_frames(&frames, false);
        }
    }

    /// Convert linear bytes to μ-law frames and emit them. When `flush` is
    /// set, a trailing partial frame is zero-padded; otherwise callers must
    /// pass whole frames.
    fn emit_frames(&self, linear: &[u8], flush: bool) {
        if linear.is_empty() {
            return;
        }
        let mut linear = linear.to_vec();
        let remainder = linear.len() % audio::LINEAR_FRAME_BYTES;
        if remainder != 0 {
            if !flush {
                warn!("dropping {remainder} unaligned TTS bytes");
                linear.truncate(linear.len() - remainder);
            } else {
                linear.resize(
                    linear.len() + audio::LINEAR_FRAME_BYTES - remainder,
                    0,
                );
            }
        }
        if linear.is_empty() {
            return;
        }
        let _ = self
            .events
            .send(BackendEvent::Audio(ulaw::linear_to_ulaw(&linear)));
    }
}

fn find_sentinel(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(UTTERANCE_BOUNDARY.len())
        .position(|window| window == UTTERANCE_BOUNDARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> (
        TtsAudioReader,
        mpsc::UnboundedReceiver<BackendEvent>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        (
            TtsAudioReader::new(events_tx, delivered_tx),
            events_rx,
            delivered_rx,
        )
    }

    fn audio_bytes(rx: &mut mpsc::UnboundedReceiver<BackendEvent>) -> usize {
        let mut total = 0;
        while let Ok(event) = rx.try_recv() {
            if let BackendEvent::Audio(ulaw) = event {
                total += ulaw.len();
            }
        }
        total
    }

    #[test]
    fn warmup_sentinel_is_swallowed() {
        let (mut reader, mut events_rx, mut delivered_rx) = reader();
        reader.feed(b"progress bar noise");
        reader.feed(&UTTERANCE_BOUNDARY);
        assert_eq!(audio_bytes(&mut events_rx), 0);
        assert!(delivered_rx.try_recv().is_err());
    }

    #[test]
    fn utterance_is_framed_and_delivered() {
        let (mut reader, mut events_rx, mut delivered_rx) = reader();
        reader.feed(&UTTERANCE_BOUNDARY); // warm-up

        let mut utterance = vec![0u8; audio::LINEAR_FRAME_BYTES * 3];
        utterance.extend_from_slice(&UTTERANCE_BOUNDARY);
        reader.feed(&utterance);

        // 3 linear frames -> 3 μ-law frames
        assert_eq!(audio_bytes(&mut events_rx), audio::ULAW_FRAME_BYTES * 3);
        assert!(delivered_rx.try_recv().is_ok());
        assert!(delivered_rx.try_recv().is_err());
    }

    #[test]
    fn sentinel_split_across_chunks_is_found() {
        let (mut reader, mut events_rx, mut delivered_rx) = reader();
        reader.feed(&UTTERANCE_BOUNDARY); // warm-up

        reader.feed(&vec![0u8; audio::LINEAR_FRAME_BYTES]);
        reader.feed(&UTTERANCE_BOUNDARY[..2]);
        assert!(delivered_rx.try_recv().is_err());
        reader.feed(&UTTERANCE_BOUNDARY[2..]);

        assert_eq!(audio_bytes(&mut events_rx), audio::ULAW_FRAME_BYTES);
        assert!(delivered_rx.try_recv().is_ok());
    }

    #[test]
    fn partial_frames_stream_before_the_sentinel_arrives() {
        let (mut reader, mut events_rx, _delivered_rx) = reader();
        reader.feed(&UTTERANCE_BOUNDARY); // warm-up

        // Two frames plus a bit: the two whole frames flow immediately.
        reader.feed(&vec![0u8; audio::LINEAR_FRAME_BYTES * 2 + 7]);
        assert_eq!(audio_bytes(&mut events_rx), audio::ULAW_FRAME_BYTES * 2);
    }

    #[test]
    fn back_to_back_utterances_deliver_twice() {
        let (mut reader, mut events_rx, mut delivered_rx) = reader();
        reader.feed(&UTTERANCE_BOUNDARY); // warm-up

        let mut stream = Vec::new();
        stream.extend_from_slice(&vec![0u8; audio::LINEAR_FRAME_BYTES]);
        stream.extend_from_slice(&UTTERANCE_BOUNDARY);
        stream.extend_from_slice(&vec![0u8; audio::LINEAR_FRAME_BYTES * 2]);
        stream.extend_from_slice(&UTTERANCE_BOUNDARY);
        reader.feed(&stream);

        assert_eq!(audio_bytes(&mut events_rx), audio::ULAW_FRAME_BYTES * 3);
        assert!(delivered_rx.try_recv().is_ok());
        assert!(delivered_rx.try_recv().is_ok());
        assert!(delivered_rx.try_recv().is_err());
    }

    #[test]
    fn stt_lines_parse_to_events() {
        let line: SttLine =
            serde_json::from_str(r#"{"type":"transcript","text":"hello there","latency":0.8}"#)
                .expect("parse");
        assert_eq!(line.kind, "transcript");
        assert_eq!(line.text, "hello there");
        assert!((line.latency - 0.8).abs() < f64::EPSILON);
    }
}
