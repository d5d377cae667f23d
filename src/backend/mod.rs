//! Voice backend abstraction.
//!
//! A voice backend holds the conversational half of a call: it consumes the
//! caller's μ-law audio and produces agent audio, transcripts, and tool
//! calls. Two parallel implementations exist behind the same trait — a
//! remote realtime WebSocket API and a local STT→LLM→TTS pipeline.

pub mod local;
pub mod realtime;

pub use local::LocalBackend;
pub use realtime::RealtimeBackend;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Telephony codec advertised to backends.
pub const CODEC: &str = "PCMU";

/// Telephony MIME type advertised to backends.
pub const AUDIO_MIME: &str = "audio/PCMU";

/// Usage metadata reported with a completed response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Tokens consumed from the caller side.
    pub input_tokens: u64,
    /// Tokens produced by the agent.
    pub output_tokens: u64,
}

/// Events emitted by a backend over the channel handed to [`VoiceBackend::connect`].
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Session configured, ready to stream audio.
    Ready,
    /// Agent audio, μ-law, frame-aligned (multiple of 160 bytes).
    Audio(Vec<u8>),
    /// An incremental fragment of the agent utterance in progress.
    TextDelta(String),
    /// A completed agent utterance.
    Transcript(String),
    /// A completed caller utterance.
    InputTranscript(String),
    /// VAD detected the start of caller speech.
    SpeechStarted,
    /// VAD detected the end of caller speech.
    SpeechStopped,
    /// The backend finished producing an utterance.
    ResponseDone(Usage),
    /// The backend invoked a tool.
    ToolCall {
        /// Tool name.
        name: String,
        /// Raw argument text (usually JSON).
        arguments: String,
        /// Identifier to echo back via `send_tool_result`.
        call_id: String,
    },
    /// A backend error; may or may not be fatal.
    Error(String),
    /// The backend disconnected.
    Closed,
}

/// Sender half for backend events.
pub type EventSender = mpsc::UnboundedSender<BackendEvent>;

/// Contract every voice backend implements.
///
/// All outbound methods are no-ops returning `Ok(())` when the backend is
/// not connected, so callers never have to order sends against teardown.
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Connect and configure the session. Events flow on `events` until
    /// [`VoiceBackend::disconnect`]; implementations emit
    /// [`BackendEvent::Ready`] once streaming may begin.
    async fn connect(&mut self, events: EventSender) -> Result<()>;

    /// Stream caller audio (μ-law, frame-aligned) into the backend.
    async fn send_audio(&self, ulaw: &[u8]) -> Result<()>;

    /// Inject a caller text turn and ask for a spoken response.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Deliver a tool result and ask for a spoken response.
    async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<()>;

    /// Ask the backend to speak specific content without a caller turn.
    async fn prompt_response(&self, instructions: &str) -> Result<()>;

    /// Tear down the connection and all workers.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the backend is currently connected.
    fn is_connected(&self) -> bool;
}
