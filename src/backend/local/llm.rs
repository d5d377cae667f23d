//! Streaming chat-completions client for the local pipeline.
//!
//! Bridges blocking HTTP (SSE lines over `ureq`) to async via a token
//! channel, so the utterance worker can assemble sentences as tokens arrive.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// A single message in the conversation history.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: &'static str,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    /// A caller turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    /// An agent turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Chat-completions client with SSE streaming.
#[derive(Clone)]
pub struct ChatClient {
    config: LlmConfig,
    agent: ureq::Agent,
}

impl ChatClient {
    /// Build a client from the LLM configuration.
    pub fn new(config: &LlmConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_read(Duration::from_secs(config.read_timeout_secs))
            .build();
        Self {
            config: config.clone(),
            agent,
        }
    }

    fn api_key(&self) -> String {
        if !self.config.api_key.is_empty() {
            return self.config.api_key.clone();
        }
        std::env::var("OPENAI_API_KEY").unwrap_or_default()
    }

    /// Stream a completion for `messages`, sending each token on `token_tx`.
    ///
    /// The `interrupt` flag is checked per SSE line; when set, the stream is
    /// abandoned mid-response. Returns once the stream ends or is abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response stream breaks.
    pub async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        token_tx: mpsc::Sender<String>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "model": self.config.api_model,
            "messages": messages
                .iter()
                .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
                .collect::<Vec<_>>(),
            "stream": true,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        let body_str = serde_json::to_string(&body)
            .map_err(|e| AgentError::Llm(format!("request serialization failed: {e}")))?;

        let base = self.config.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        let url = format!("{base}/v1/chat/completions");

        let agent = self.agent.clone();
        let api_key = self.api_key();

        let handle = tokio::task::spawn_blocking(move || -> std::result::Result<(), String> {
            let mut request = agent.post(&url).set("Content-Type", "application/json");
            if !api_key.is_empty() {
                let auth = format!("Bearer {api_key}");
                request = request.set("Authorization", &auth);
            }

            let response = request
                .send_string(&body_str)
                .map_err(|e| format!("chat request failed: {e}"))?;

            let reader = std::io::BufReader::new(response.into_reader());
            for line in std::io::BufRead::lines(reader) {
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }

                let line = line.map_err(|e| format!("stream read error: {e}"))?;
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break;
                }

                let chunk: serde_json::Value = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        // Malformed SSE chunks are skipped, not fatal.
                        tracing::debug!("skipping malformed SSE chunk: {e}");
                        continue;
                    }
                };

                if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str()
                    && !content.is_empty()
                    && token_tx.blocking_send(content.to_owned()).is_err()
                {
                    break;
                }

                if chunk["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break;
                }
            }
            Ok(())
        });

        match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AgentError::Llm(e)),
            Err(e) => Err(AgentError::Llm(format!("HTTP task panicked: {e}"))),
        }
    }
}

/// Find the byte index just past a sentence boundary in `text`.
///
/// A boundary is `.`, `!`, or `?` followed by whitespace, and only counts
/// once the candidate sentence is at least `min_chars` long — otherwise
/// "Mr. Smith" and "U.S. markets" split mid-phrase.
pub fn find_sentence_end(text: &str, min_chars: usize) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let Some(&(_, next)) = chars.peek() else {
            break;
        };
        if next.is_whitespace() && i + c.len_utf8() >= min_chars {
            return Some(i + c.len_utf8());
        }
    }
    None
}
