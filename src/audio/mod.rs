//! Telephony audio: G.711 μ-law codec and the SIP-side socket bridge.
//!
//! Everything here works in 20 ms frames of mono 8 kHz audio: 160 samples,
//! 320 bytes as S16LE, 160 bytes as μ-law. All internal boundaries are
//! multiples of one frame.

pub mod bridge;
pub mod ulaw;

pub use bridge::{AudioBridge, BridgeStats};

/// Telephony sample rate in Hz.
pub const SAMPLE_RATE: u32 = 8_000;

/// Frame duration in milliseconds.
pub const FRAME_MS: u64 = 20;

/// Samples per frame (20 ms at 8 kHz).
pub const FRAME_SAMPLES: usize = 160;

/// Bytes per frame as S16LE.
pub const LINEAR_FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Bytes per frame as μ-law.
pub const ULAW_FRAME_BYTES: usize = FRAME_SAMPLES;
