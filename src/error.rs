//! Error types for the voice agent.

/// Top-level error type for the telephone voice agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration error (missing credentials, unknown backend or profile).
    #[error("config error: {0}")]
    Config(String),

    /// Another session holds the PID lock.
    #[error("lock error: {0}")]
    Lock(String),

    /// Audio bridge or socket error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice backend error (WebSocket, event dispatch).
    #[error("backend error: {0}")]
    Backend(String),

    /// Speech-to-text subprocess error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech subprocess error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// SIP control channel error.
    #[error("SIP error: {0}")]
    Sip(String),

    /// Session lifecycle error.
    #[error("session error: {0}")]
    Session(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Operation timed out (subprocess startup, sentinel wait).
    #[error("timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
