//! Delegation assistant gateway.
//!
//! When the agent classifies a caller request as something to hand off
//! (sending a text, looking something up), the session forwards it here and
//! speaks the reply back. Thin HTTP glue over a chat-completion endpoint.

use crate::config::AssistantConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Handles a delegated caller request and returns the text to speak back.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Process one request; `intent` is the agent's classification label.
    async fn request(&self, intent: &str, request: &str) -> Result<String>;
}

/// Chat-completion-backed assistant.
pub struct HttpAssistant {
    config: AssistantConfig,
    agent: ureq::Agent,
}

impl HttpAssistant {
    /// Build a client from the assistant configuration.
    pub fn new(config: &AssistantConfig) -> Self {
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
}

#[async_trait]
impl Assistant for HttpAssistant {
    async fn request(&self, intent: &str, request: &str) -> Result<String> {
        info!("delegating to assistant: intent={intent} request={request}");

        let body = serde_json::json!({
            "model": self.config.api_model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a phone agent's back-office assistant. \
                        Handle the request and reply with one short sentence \
                        the agent can speak to the caller.",
                },
                { "role": "user", "content": format!("[{intent}] {request}") },
            ],
        });
        let body_str = serde_json::to_string(&body)
            .map_err(|e| AgentError::Llm(format!("request serialization failed: {e}")))?;

        let base = self.config.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        let url = format!("{base}/v1/chat/completions");
        let agent = self.agent.clone();
        let api_key = self.api_key();

        let reply = tokio::task::spawn_blocking(move || -> std::result::Result<String, String> {
            let mut http = agent.post(&url).set("Content-Type", "application/json");
            if !api_key.is_empty() {
                let auth = format!("Bearer {api_key}");
                http = http.set("Authorization", &auth);
            }
            let response = http
                .send_string(&body_str)
                .map_err(|e| format!("assistant request failed: {e}"))?;
            let parsed: serde_json::Value = response
                .into_json()
                .map_err(|e| format!("assistant response unreadable: {e}"))?;
            parsed["choices"][0]["message"]["content"]
                .as_str()
                .map(|s| s.trim().to_owned())
                .ok_or_else(|| "assistant response missing content".to_owned())
        })
        .await
        .map_err(|e| AgentError::Llm(format!("assistant task panicked: {e}")))?
        .map_err(AgentError::Llm)?;

        Ok(reply)
    }
}
