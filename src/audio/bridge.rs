//! Full-duplex audio bridge between the SIP-side Unix socket and a voice
//! backend.
//!
//! The socket carries raw S16LE mono 8 kHz in both directions, one 320-byte
//! frame per 20 ms. The backend speaks μ-law. Two workers run per bridge:
//!
//! - **read**: frame-exact reads from the socket, μ-law conversion, handoff
//!   to the backend's audio sink.
//! - **write**: drains a queue of μ-law blobs from the backend, splits them
//!   into frames and writes them on a drift-free 20 ms cadence with a small
//!   write-ahead reserve so scheduler jitter never starves the SIP reader.

use crate::audio::{self, ulaw};
use crate::config::AudioConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period for worker shutdown before aborting.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Consumer of caller audio leaving the bridge, one μ-law frame at a time.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Deliver one frame-aligned μ-law buffer of caller audio.
    async fn send_audio(&self, ulaw: &[u8]) -> Result<()>;
}

/// Byte counters exposed for call statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeStats {
    /// Cumulative S16LE bytes read from the socket.
    pub bytes_in: u64,
    /// Cumulative S16LE bytes written to the socket.
    pub bytes_out: u64,
    /// Frames currently queued for playout.
    pub queued_frames: usize,
}

/// Full-duplex bridge over the SIP-side audio socket.
pub struct AudioBridge {
    config: AudioConfig,
    queue_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    queued_bytes: Arc<AtomicUsize>,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    cancel: CancellationToken,
    read_handle: Option<JoinHandle<()>>,
    write_handle: Option<JoinHandle<()>>,
}

impl AudioBridge {
    /// Create an unstarted bridge.
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            queue_tx: None,
            queued_bytes: Arc::new(AtomicUsize::new(0)),
            bytes_in: Arc::new(AtomicU64::new(0)),
            bytes_out: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            read_handle: None,
            write_handle: None,
        }
    }

    /// Connect to the audio socket and launch both workers.
    ///
    /// Caller audio read from the socket is converted to μ-law and handed to
    /// `sink`, one frame per call.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened after the configured
    /// number of retries.
    pub async fn start(&mut self, sink: Arc<dyn AudioSink>) -> Result<()> {
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        self.queue_tx = Some(queue_tx);
        self.cancel = CancellationToken::new();

        let cancel = self.cancel.clone();
        let bytes_in = Arc::clone(&self.bytes_in);
        self.read_handle = Some(tokio::spawn(async move {
            run_read_worker(read_half, sink, bytes_in, cancel).await;
        }));

        let cancel = self.cancel.clone();
        let bytes_out = Arc::clone(&self.bytes_out);
        let queued_bytes = Arc::clone(&self.queued_bytes);
        let write_ahead = Duration::from_millis(self.config.write_ahead_ms);
        self.write_handle = Some(tokio::spawn(async move {
            run_write_worker(
                write_half,
                queue_rx,
                queued_bytes,
                bytes_out,
                write_ahead,
                cancel,
            )
            .await;
        }));

        info!("audio bridge started on {}", self.config.socket_path.display());
        Ok(())
    }

    async fn connect(&self) -> Result<UnixStream> {
        let mut attempt = 0;
        loop {
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt + 1 < self.config.connect_retries => {
                    attempt += 1;
                    warn!(
                        "audio socket connect attempt {attempt} failed: {e}, retrying in {}ms",
                        self.config.connect_retry_delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.connect_retry_delay_ms))
                        .await;
                }
                Err(e) => {
                    return Err(AgentError::Audio(format!(
                        "cannot connect to audio socket {}: {e}",
                        self.config.socket_path.display()
                    )));
                }
            }
        }
    }

    /// Queue a μ-law blob from the backend for paced playout.
    ///
    /// Blobs may be any multiple of one frame; realtime backends typically
    /// burst several seconds at once.
    pub fn enqueue(&self, ulaw: Vec<u8>) {
        let Some(tx) = &self.queue_tx else {
            debug!("enqueue on a stopped bridge, dropping {} bytes", ulaw.len());
            return;
        };
        self.queued_bytes.fetch_add(ulaw.len(), Ordering::Relaxed);
        if tx.send(ulaw).is_err() {
            debug!("write worker gone, dropping queued audio");
        }
    }

    /// Frames currently queued for playout.
    pub fn write_queue_size(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed) / audio::ULAW_FRAME_BYTES
    }

    /// Current byte counters.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            queued_frames: self.write_queue_size(),
        }
    }

    /// Stop both workers: close the queue and socket, join with a bounded
    /// grace, abort stragglers. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.queue_tx = None;
        self.cancel.cancel();
        for handle in [self.read_handle.take(), self.write_handle.take()]
            .into_iter()
            .flatten()
        {
            let mut handle = handle;
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("bridge worker did not stop within grace period, aborting");
                handle.abort();
            }
        }
        info!(
            "audio bridge stopped ({} bytes in, {} bytes out)",
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed)
        );
    }
}

/// Read exactly one linear frame per iteration and hand it to the sink as
/// μ-law. Any short read or socket error ends the worker.
async fn run_read_worker(
    mut socket: OwnedReadHalf,
    sink: Arc<dyn AudioSink>,
    bytes_in: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut frame = [0u8; audio::LINEAR_FRAME_BYTES];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = socket.read_exact(&mut frame) => {
                match read {
                    Ok(_) => {
                        bytes_in.fetch_add(audio::LINEAR_FRAME_BYTES as u64, Ordering::Relaxed);
                        let converted = ulaw::linear_to_ulaw(&frame);
                        if let Err(e) = sink.send_audio(&converted).await {
                            warn!("backend rejected caller audio: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("audio socket read ended: {e}");
                        break;
                    }
                }
            }
        }
    }
    debug!("bridge read worker exited");
}

/// Drain the μ-law queue, writing one linear frame per 20 ms with up to
/// `write_ahead` of reserve in the socket.
async fn run_write_worker(
    mut socket: OwnedWriteHalf,
    mut queue_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    bytes_out: Arc<AtomicU64>,
    write_ahead: Duration,
    cancel: CancellationToken,
) {
    let frame_duration = Duration::from_millis(audio::FRAME_MS);
    let mut next_frame_at: Option<Instant> = None;
    // Backends must enqueue whole frames; any tail is carried across blobs
    // so a partial frame is never written.
    let mut carry: Vec<u8> = Vec::new();

    'outer: loop {
        let blob = tokio::select! {
            () = cancel.cancelled() => break,
            blob = queue_rx.recv() => match blob {
                Some(blob) => blob,
                None => break,
            },
        };

        carry.extend_from_slice(&blob);
        let whole = carry.len() / audio::ULAW_FRAME_BYTES * audio::ULAW_FRAME_BYTES;
        let frames: Vec<u8> = carry.drain(..whole).collect();

        for chunk in frames.chunks_exact(audio::ULAW_FRAME_BYTES) {
            let now = Instant::now();
            let target = *next_frame_at.get_or_insert(now);

            // Sleep only the surplus beyond the write-ahead window, keeping
            // a few frames of reserve in the socket.
            let ahead = target.saturating_duration_since(now);
            if ahead > write_ahead {
                let sleep = tokio::time::sleep(ahead - write_ahead);
                tokio::select! {
                    () = cancel.cancelled() => break 'outer,
                    () = sleep => {}
                }
            }

            let pcm = ulaw::ulaw_to_linear(chunk);
            if let Err(e) = socket.write_all(&pcm).await {
                debug!("audio socket write ended: {e}");
                break 'outer;
            }
            bytes_out.fetch_add(pcm.len() as u64, Ordering::Relaxed);
            queued_bytes.fetch_sub(audio::ULAW_FRAME_BYTES, Ordering::Relaxed);

            // Exactly one frame-duration advance per written chunk. Advancing
            // further would write one frame per 40 ms and the SIP side would
            // hear silence on every other read.
            let advanced = target + frame_duration;
            next_frame_at = Some(if advanced < Instant::now() {
                Instant::now() + frame_duration
            } else {
                advanced
            });
        }
    }
    debug!("bridge write worker exited");
}
