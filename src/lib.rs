//! Garbo: a telephone-facing AI voice agent.
//!
//! Answers or places a SIP call, streams the caller's audio into a
//! speech-capable model backend, and streams synthesized voice back in real
//! time.
//!
//! # Architecture
//!
//! Independent stages run as tokio tasks connected by channels:
//! - **Audio bridge**: full-duplex S16LE ↔ μ-law conversion over the
//!   SIP-side Unix socket, paced at 20 ms frames with write-ahead
//! - **Voice backend**: the conversation itself — either a realtime
//!   WebSocket API or a local STT→LLM→TTS subprocess pipeline
//! - **Triggers**: farewell, silence, delegation, and wake-phrase watchers
//!   over the live transcript and tool stream
//! - **Session**: one call's lifecycle, from PID lock and dial to the
//!   two-phase goodbye and hangup

pub mod assistant;
pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod session;
pub mod sip;
pub mod triggers;

pub use backend::{BackendEvent, LocalBackend, RealtimeBackend, VoiceBackend};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use session::{CallSession, CallSessionBuilder};
