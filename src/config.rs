//! Configuration types for the voice agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a call session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Audio bridge settings (socket path, pacing).
    pub audio: AudioConfig,
    /// Session lifecycle settings (lock, transcript, silence handling).
    pub session: SessionConfig,
    /// Realtime WebSocket backend settings.
    pub realtime: RealtimeConfig,
    /// Local STT/LLM/TTS pipeline settings.
    pub local: LocalConfig,
    /// SIP control channel settings.
    pub sip: SipConfig,
    /// Delegation assistant gateway settings.
    pub assistant: AssistantConfig,
    /// Agent persona.
    pub profile: AgentProfile,
}

/// Audio bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Path to the SIP-side Unix audio socket.
    pub socket_path: PathBuf,
    /// How far ahead of real time the write pacer may run, in ms.
    pub write_ahead_ms: u64,
    /// Connection attempts before giving up.
    pub connect_retries: u32,
    /// Delay between connection attempts, in ms.
    pub connect_retry_delay_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            write_ahead_ms: 100,
            connect_retries: 5,
            connect_retry_delay_ms: 500,
        }
    }
}

/// Resolve the audio socket path, honouring the `AUSOCK_PATH` override used
/// by the SIP-side module.
fn default_socket_path() -> PathBuf {
    match std::env::var("AUSOCK_PATH") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from("/tmp/ausock.sock"),
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// PID lock file path (one call per host).
    pub lock_path: PathBuf,
    /// Transcript file path (None = no transcript).
    pub transcript_path: Option<PathBuf>,
    /// Silence timeout before the "are you still there?" check, in seconds.
    pub silence_timeout_secs: u64,
    /// Safety timer after the still-there prompt, in seconds.
    pub still_there_timer_secs: u64,
    /// Safety timer for goodbye completion, in seconds.
    pub goodbye_timer_secs: u64,
    /// Log caller/agent turns at info level.
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from("/tmp/garbo-call.pid"),
            transcript_path: None,
            silence_timeout_secs: 30,
            still_there_timer_secs: 10,
            goodbye_timer_secs: 8,
            verbose: false,
        }
    }
}

/// Realtime WebSocket backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint URL.
    pub url: String,
    /// Model to request.
    pub model: String,
    /// Bearer token. Empty = read `OPENAI_API_KEY` at connect time.
    pub api_key: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime?model=gpt-realtime".to_owned(),
            model: "gpt-realtime".to_owned(),
            api_key: String::new(),
        }
    }
}

/// Local pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// STT subprocess settings.
    pub stt: SttConfig,
    /// TTS subprocess settings.
    pub tts: TtsConfig,
    /// Streaming LLM settings.
    pub llm: LlmConfig,
    /// Tuning knobs for turn-taking.
    pub turns: TurnConfig,
}

/// STT subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Program to spawn (first element) and its arguments.
    pub command: Vec<String>,
    /// Seconds to wait for the subprocess "ready" status (model load).
    pub startup_timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_owned(), "tts/stt_server.py".to_owned()],
            startup_timeout_secs: 120,
        }
    }
}

/// TTS subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Program to spawn (first element) and its arguments.
    pub command: Vec<String>,
    /// Seconds to wait for the subprocess "ready" status (model load).
    pub startup_timeout_secs: u64,
    /// Seconds to wait for each utterance's audio to be delivered.
    pub sentinel_wait_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_owned(), "tts/tts_server.py".to_owned()],
            startup_timeout_secs: 120,
            sentinel_wait_secs: 30,
        }
    }
}

/// Streaming LLM configuration for the local pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the chat-completions API.
    pub api_url: String,
    /// Model name to request.
    pub api_model: String,
    /// Bearer token. Empty = read `OPENAI_API_KEY` at request time.
    pub api_key: String,
    /// Maximum tokens to generate per response.
    pub max_tokens: usize,
    /// Sampling temperature.
    pub temperature: f64,
    /// Conversation entries sent with each request (beyond the system message).
    pub max_history_messages: usize,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            api_model: "gpt-4o-mini".to_owned(),
            api_key: String::new(),
            max_tokens: 256,
            temperature: 0.7,
            max_history_messages: 20,
            read_timeout_secs: 30,
        }
    }
}

/// Turn-taking knobs for the local pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Minimum candidate length before a sentence boundary is honoured.
    /// Avoids splitting on "Mr." or "U.S.".
    pub sentence_min_chars: usize,
    /// Echo cooldown after the agent finishes speaking, in ms.
    pub echo_cooldown_ms: u64,
    /// Minimum characters for a transcript to count as a barge-in.
    pub barge_in_min_chars: usize,
    /// Minimum whitespace-separated words for a barge-in.
    pub barge_in_min_words: usize,
    /// Transcripts shorter than this are dropped until the caller has
    /// genuinely spoken once (ring-tone hallucination filter).
    pub greeting_gate_min_chars: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            sentence_min_chars: 20,
            echo_cooldown_ms: 1500,
            barge_in_min_chars: 10,
            barge_in_min_words: 2,
            greeting_gate_min_chars: 4,
        }
    }
}

/// SIP control channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// Host of the netstring control endpoint.
    pub ctrl_host: String,
    /// Port of the netstring control endpoint.
    pub ctrl_port: u16,
    /// SIP server domain used to build dial URIs.
    pub server: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            ctrl_host: "127.0.0.1".to_owned(),
            ctrl_port: 4444,
            server: "sip.example.com".to_owned(),
        }
    }
}

/// Delegation assistant gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Chat-completion endpoint base URL.
    pub api_url: String,
    /// Model name to request.
    pub api_model: String,
    /// Bearer token. Empty = read `OPENAI_API_KEY` at request time.
    pub api_key: String,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            api_model: "gpt-4o-mini".to_owned(),
            api_key: String::new(),
            read_timeout_secs: 30,
        }
    }
}

/// Agent persona: who the caller is talking to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// The agent's name, spoken and used in instructions.
    pub name: String,
    /// Voice identifier passed to the backend (realtime voice or TTS speaker).
    pub voice: String,
    /// Personality / behaviour instructions.
    pub instructions: String,
    /// Optional TTS delivery instruction (tone, pacing).
    pub tts_instruct: Option<String>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            name: "Garbo".to_owned(),
            voice: "alloy".to_owned(),
            instructions: "You are a friendly assistant on a phone call. \
                Keep responses to one or two sentences and speak naturally."
                .to_owned(),
            tts_instruct: None,
        }
    }
}

impl AgentProfile {
    /// The instructions as sent to a backend, with the persona's name
    /// prepended.
    pub fn named_instructions(&self) -> String {
        format!("Your name is {}. {}", self.name, self.instructions)
    }

    /// Replace the instructions, keeping `name` and `voice` and prepending
    /// the name so the persona survives the override.
    pub fn with_instructions(&self, instructions: &str) -> Self {
        Self {
            name: self.name.clone(),
            voice: self.voice.clone(),
            instructions: format!("Your name is {}. {}", self.name, instructions),
            tts_instruct: self.tts_instruct.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_without_env() {
        let config = AudioConfig::default();
        // AUSOCK_PATH may be set by the harness; accept either outcome.
        if std::env::var("AUSOCK_PATH").is_err() {
            assert_eq!(config.socket_path, PathBuf::from("/tmp/ausock.sock"));
        }
    }

    #[test]
    fn instruction_override_keeps_name_and_voice() {
        let profile = AgentProfile {
            name: "Garbo".to_owned(),
            voice: "marin".to_owned(),
            instructions: "Be terse.".to_owned(),
            tts_instruct: None,
        };
        let overridden = profile.with_instructions("Ask the caller to hold.");
        assert_eq!(overridden.name, "Garbo");
        assert_eq!(overridden.voice, "marin");
        assert_eq!(
            overridden.instructions,
            "Your name is Garbo. Ask the caller to hold."
        );
    }

    #[test]
    fn turn_defaults_match_pipeline_contract() {
        let turns = TurnConfig::default();
        assert_eq!(turns.sentence_min_chars, 20);
        assert_eq!(turns.echo_cooldown_ms, 1500);
        assert_eq!(turns.barge_in_min_chars, 10);
        assert_eq!(turns.barge_in_min_words, 2);
        assert_eq!(turns.greeting_gate_min_chars, 4);
    }
}
