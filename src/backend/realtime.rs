//! Realtime WebSocket voice backend.
//!
//! A single secure WebSocket to a vendor realtime endpoint carries the whole
//! conversation: caller audio goes up as base64 μ-law append events, agent
//! audio and transcripts come down as typed JSON frames, turn-taking is
//! handled by server-side VAD.

use crate::backend::{BackendEvent, EventSender, Usage, VoiceBackend};
use crate::config::{AgentProfile, RealtimeConfig};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

/// Grace period for pump shutdown before aborting.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// WebSocket client for a realtime voice API.
pub struct RealtimeBackend {
    config: RealtimeConfig,
    profile: AgentProfile,
    outbound_tx: Option<mpsc::UnboundedSender<String>>,
    connected: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl RealtimeBackend {
    /// Create an unconnected backend for the given persona.
    pub fn new(config: RealtimeConfig, profile: AgentProfile) -> Self {
        Self {
            config,
            profile,
            outbound_tx: None,
            connected: Arc::new(AtomicBool::new(false)),
            reader_handle: None,
            writer_handle: None,
        }
    }

    fn api_key(&self) -> Result<String> {
        if !self.config.api_key.is_empty() {
            return Ok(self.config.api_key.clone());
        }
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                AgentError::Config("missing realtime API key (set OPENAI_API_KEY)".to_owned())
            })
    }

    /// Queue an outbound event if connected; silently drop otherwise.
    fn send_event(&self, event: serde_json::Value) {
        if !self.is_connected() {
            return;
        }
        if let Some(tx) = &self.outbound_tx
            && tx.send(event.to_string()).is_err()
        {
            debug!("outbound pump gone, dropping realtime event");
        }
    }

    fn session_update(&self) -> serde_json::Value {
        let instructions = self.profile.named_instructions();
        serde_json::json!({
            "type": "session.update",
            "session": {
                "model": self.config.model,
                "voice": self.profile.voice,
                "modalities": ["text", "audio"],
                "instructions": instructions,
                "input_audio_format": "g711_ulaw",
                "output_audio_format": "g711_ulaw",
                "input_audio_transcription": { "model": "whisper-1" },
                "turn_detection": { "type": "server_vad" },
                "tools": [delegation_tool_schema()],
            }
        })
    }
}

/// Schema for the delegation tool the agent may invoke mid-call.
fn delegation_tool_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "name": "classify_intent",
        "description": "Classify a caller request that should be handled by \
            the assistant rather than answered directly, e.g. sending a text \
            or looking something up.",
        "parameters": {
            "type": "object",
            "properties": {
                "intent": { "type": "string", "description": "Short intent label" },
                "request": { "type": "string", "description": "The caller's request, verbatim" }
            },
            "required": ["intent", "request"]
        }
    })
}

#[async_trait]
impl VoiceBackend for RealtimeBackend {
    async fn connect(&mut self, events: EventSender) -> Result<()> {
        let api_key = self.api_key()?;

        let mut request = self
            .config
            .url
            .clone()
            .into_client_request()
            .map_err(|e| AgentError::Backend(format!("bad realtime endpoint: {e}")))?;
        {
            let headers = request.headers_mut();
            let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| AgentError::Backend(format!("bad auth header: {e}")))?;
            headers.insert("Authorization", auth);
            headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }

        info!("connecting to realtime endpoint {}", self.config.url);
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AgentError::Backend(format!("realtime connect failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        self.outbound_tx = Some(outbound_tx);
        self.connected.store(true, Ordering::Relaxed);

        // Writer pump: owns the sink half, exits when the sender side drops.
        let connected = Arc::clone(&self.connected);
        self.writer_handle = Some(tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("realtime send failed: {e}");
                    connected.store(false, Ordering::Relaxed);
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("realtime writer pump exited");
        }));

        // Reader pump: dispatches typed events until the socket closes.
        let connected = Arc::clone(&self.connected);
        let reader_events = events.clone();
        self.reader_handle = Some(tokio::spawn(async move {
            let events = reader_events;
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                        Ok(value) => dispatch_event(&value, &events),
                        Err(e) => debug!("unparseable realtime frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(BackendEvent::Error(format!("realtime socket: {e}")));
                        break;
                    }
                }
            }
            connected.store(false, Ordering::Relaxed);
            let _ = events.send(BackendEvent::Closed);
            debug!("realtime reader pump exited");
        }));

        self.send_event(self.session_update());
        let _ = events.send(BackendEvent::Ready);
        Ok(())
    }

    async fn send_audio(&self, ulaw: &[u8]) -> Result<()> {
        self.send_event(serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": B64.encode(ulaw),
        }));
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.send_event(serde_json::json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            }
        }));
        self.send_event(serde_json::json!({
            "type": "response.create",
            "response": { "modalities": ["text", "audio"] },
        }));
        Ok(())
    }

    async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<()> {
        self.send_event(serde_json::json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            }
        }));
        self.send_event(serde_json::json!({
            "type": "response.create",
            "response": { "modalities": ["text", "audio"] },
        }));
        Ok(())
    }

    async fn prompt_response(&self, instructions: &str) -> Result<()> {
        self.send_event(serde_json::json!({
            "type": "response.create",
            "response": {
                "modalities": ["text", "audio"],
                "instructions": instructions,
            }
        }));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        // Dropping the sender closes the writer pump, which closes the socket
        // and in turn ends the reader pump.
        self.outbound_tx = None;
        for handle in [self.writer_handle.take(), self.reader_handle.take()]
            .into_iter()
            .flatten()
        {
            let mut handle = handle;
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("realtime pump did not stop within grace period, aborting");
                handle.abort();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Map one inbound realtime frame to a backend event.
fn dispatch_event(value: &serde_json::Value, events: &EventSender) {
    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "response.audio.delta" | "response.output_audio.delta" => {
            let field = value
                .get("delta")
                .or_else(|| value.get("audio"))
                .and_then(|a| a.as_str())
                .unwrap_or("");
            match B64.decode(field) {
                Ok(audio) if !audio.is_empty() => {
                    let _ = events.send(BackendEvent::Audio(audio));
                }
                Ok(_) => {}
                Err(e) => debug!("bad audio delta payload: {e}"),
            }
        }
        "response.audio_transcript.delta" => {
            if let Some(delta) = value.get("delta").and_then(|d| d.as_str()) {
                let _ = events.send(BackendEvent::TextDelta(delta.to_owned()));
            }
        }
        "response.audio_transcript.done" => {
            if let Some(transcript) = value.get("transcript").and_then(|t| t.as_str()) {
                let _ = events.send(BackendEvent::Transcript(transcript.to_owned()));
            }
        }
        "response.done" => {
            let usage = value
                .pointer("/response/usage")
                .map(|u| Usage {
                    input_tokens: u.get("input_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
                    output_tokens: u.get("output_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
                })
                .unwrap_or_default();
            let _ = events.send(BackendEvent::ResponseDone(usage));
        }
        "input_audio_buffer.speech_started" => {
            let _ = events.send(BackendEvent::SpeechStarted);
        }
        "input_audio_buffer.speech_stopped" => {
            let _ = events.send(BackendEvent::SpeechStopped);
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(transcript) = value.get("transcript").and_then(|t| t.as_str()) {
                let _ = events.send(BackendEvent::InputTranscript(transcript.trim().to_owned()));
            }
        }
        "response.function_call_arguments.done" => {
            let name = value.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let arguments = value
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("");
            let call_id = value.get("call_id").and_then(|c| c.as_str()).unwrap_or("");
            let _ = events.send(BackendEvent::ToolCall {
                name: name.to_owned(),
                arguments: arguments.to_owned(),
                call_id: call_id.to_owned(),
            });
        }
        "session.created" | "session.updated" => {
            debug!("realtime session event: {event_type}");
        }
        "error" => {
            let message = value
                .pointer("/error/message")
                .or_else(|| value.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown realtime error");
            let _ = events.send(BackendEvent::Error(message.to_owned()));
        }
        other => debug!("ignoring realtime event type: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(value: serde_json::Value) -> Vec<BackendEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_event(&value, &tx);
        drop(tx);
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn audio_delta_is_decoded() {
        let ulaw = vec![0xFFu8; 160];
        let events = collect(serde_json::json!({
            "type": "response.audio.delta",
            "delta": B64.encode(&ulaw),
        }));
        match events.as_slice() {
            [BackendEvent::Audio(audio)] => assert_eq!(audio, &ulaw),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn tool_call_carries_arguments_and_call_id() {
        let events = collect(serde_json::json!({
            "type": "response.function_call_arguments.done",
            "name": "classify_intent",
            "arguments": r#"{"intent":"send_text","request":"text Alice"}"#,
            "call_id": "c1",
        }));
        match events.as_slice() {
            [BackendEvent::ToolCall {
                name,
                arguments,
                call_id,
            }] => {
                assert_eq!(name, "classify_intent");
                assert!(arguments.contains("send_text"));
                assert_eq!(call_id, "c1");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn response_done_extracts_usage() {
        let events = collect(serde_json::json!({
            "type": "response.done",
            "response": { "usage": { "input_tokens": 12, "output_tokens": 34 } },
        }));
        match events.as_slice() {
            [BackendEvent::ResponseDone(usage)] => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 34);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn nested_error_message_is_unwrapped() {
        let events = collect(serde_json::json!({
            "type": "error",
            "error": { "message": "session expired" },
        }));
        match events.as_slice() {
            [BackendEvent::Error(message)] => assert_eq!(message, "session expired"),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        assert!(collect(serde_json::json!({ "type": "rate_limits.updated" })).is_empty());
    }
}
