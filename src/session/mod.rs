//! Call session orchestrator.
//!
//! Owns the call from dial to hangup: acquires the single-instance lock,
//! dials, wires the audio bridge and voice backend together, feeds the
//! trigger bank, runs the two-phase goodbye sequence, and tears everything
//! down exactly once no matter which path ends the call.

pub mod lock;
pub mod transcript;

pub use lock::PidLock;
pub use transcript::TranscriptWriter;

use crate::assistant::Assistant;
use crate::audio;
use crate::audio::bridge::{AudioBridge, AudioSink};
use crate::backend::{BackendEvent, VoiceBackend};
use crate::config::SessionConfig;
use crate::error::{AgentError, Result};
use crate::sip::CallControl;
use crate::triggers::{
    Role, TriggerAction, TriggerContext, TriggerManager, TriggerPayload,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event-loop tick; also the goodbye drain poll interval.
const TICK: Duration = Duration::from_millis(100);

/// Extra wait for tail audio after the write queue drains on goodbye.
const GOODBYE_TAIL: Duration = Duration::from_millis(500);

/// Interval between bridge stats log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Which goodbye is in flight, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GoodbyePending {
    /// No goodbye in progress.
    None,
    /// Hanging up because the line went quiet twice.
    Silence,
    /// Hanging up because someone said goodbye.
    Keyword,
}

/// A trigger firing forwarded out of the manager's callbacks.
struct TriggerFire {
    action: TriggerAction,
    payload: TriggerPayload,
    call_id: Option<String>,
    /// Whether the firing context carried a transcript (keyword) or not
    /// (periodic silence check).
    from_transcript: bool,
}

/// Shared backend handle: the bridge's read worker, the delegation task,
/// and the session itself all talk to the same backend.
type SharedBackend = Arc<tokio::sync::Mutex<Box<dyn VoiceBackend>>>;

struct BackendSink {
    backend: SharedBackend,
}

#[async_trait]
impl AudioSink for BackendSink {
    async fn send_audio(&self, ulaw: &[u8]) -> Result<()> {
        self.backend.lock().await.send_audio(ulaw).await
    }
}

/// Builder for [`CallSession`]; components are injected so tests can swap
/// in scripted backends and recorders.
pub struct CallSessionBuilder {
    number: String,
    config: SessionConfig,
    backend: Option<Box<dyn VoiceBackend>>,
    bridge: Option<AudioBridge>,
    triggers: TriggerManager,
    assistant: Option<Arc<dyn Assistant>>,
    control: Option<Arc<dyn CallControl>>,
}

impl CallSessionBuilder {
    /// Start building a session for a phone number.
    pub fn new(number: &str, config: SessionConfig) -> Self {
        Self {
            number: number.to_owned(),
            config,
            backend: None,
            bridge: None,
            triggers: TriggerManager::new(),
            assistant: None,
            control: None,
        }
    }

    /// Voice backend to converse with.
    pub fn backend(mut self, backend: Box<dyn VoiceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Audio bridge to the SIP socket.
    pub fn bridge(mut self, bridge: AudioBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Trigger bank watching the conversation.
    pub fn triggers(mut self, triggers: TriggerManager) -> Self {
        self.triggers = triggers;
        self
    }

    /// Assistant handling delegated requests.
    pub fn assistant(mut self, assistant: Arc<dyn Assistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    /// SIP call control (dial/hangup).
    pub fn control(mut self, control: Arc<dyn CallControl>) -> Self {
        self.control = Some(control);
        self
    }

    /// Assemble the session.
    ///
    /// # Errors
    ///
    /// Returns a config error when a required component is missing.
    pub fn build(self) -> Result<CallSession> {
        let backend = self
            .backend
            .ok_or_else(|| AgentError::Config("session needs a voice backend".to_owned()))?;
        let bridge = self
            .bridge
            .ok_or_else(|| AgentError::Config("session needs an audio bridge".to_owned()))?;
        let control = self
            .control
            .ok_or_else(|| AgentError::Config("session needs call control".to_owned()))?;

        Ok(CallSession {
            number: self.number,
            config: self.config,
            backend: Arc::new(tokio::sync::Mutex::new(backend)),
            bridge,
            triggers: self.triggers,
            assistant: self.assistant,
            control,
            shutdown: CancellationToken::new(),
        })
    }
}

/// One phone call, from dial to hangup.
pub struct CallSession {
    number: String,
    config: SessionConfig,
    backend: SharedBackend,
    bridge: AudioBridge,
    triggers: TriggerManager,
    assistant: Option<Arc<dyn Assistant>>,
    control: Arc<dyn CallControl>,
    shutdown: CancellationToken,
}

impl CallSession {
    /// Token that ends the call when cancelled; safe to trigger from a
    /// signal handler task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the call to completion. Blocks until hangup.
    ///
    /// # Errors
    ///
    /// Returns lock, dial, or connect errors from startup; a call that
    /// reached the conversation always ends with `Ok`.
    pub async fn run(mut self) -> Result<()> {
        let mut lock = PidLock::acquire(&self.config.lock_path)?;

        let result = self.run_inner().await;

        lock.release();
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let started = Instant::now();

        self.control.dial(&self.number).await?;

        let mut transcript = match &self.config.transcript_path {
            Some(path) => Some(TranscriptWriter::create(path, &self.number)?),
            None => None,
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let connect_result = self.backend.lock().await.connect(events_tx).await;
        if let Err(e) = connect_result {
            self.finish(&mut transcript).await;
            return Err(e);
        }

        let sink = Arc::new(BackendSink {
            backend: Arc::clone(&self.backend),
        });
        if let Err(e) = self.bridge.start(sink).await {
            self.finish(&mut transcript).await;
            return Err(e);
        }

        // Trigger firings come back through the manager's callbacks on this
        // channel so the event loop sees them in order with backend events.
        let (fires_tx, mut fires_rx) = mpsc::unbounded_channel::<TriggerFire>();
        for action in [
            TriggerAction::Hangup,
            TriggerAction::Delegate,
            TriggerAction::Wake,
        ] {
            let tx = fires_tx.clone();
            self.triggers.on(
                action,
                Box::new(move |ctx, payload| {
                    let _ = tx.send(TriggerFire {
                        action,
                        payload: payload.clone(),
                        call_id: ctx.tool_call_id.clone(),
                        from_transcript: ctx.transcript.is_some(),
                    });
                }),
            );
        }

        info!("call to {} started", self.number);

        // Conversation state, confined to this loop.
        let mut is_speaking = false;
        let mut last_response_at: Option<Instant> = None;
        let mut goodbye_pending = GoodbyePending::None;
        let mut silence_check_pending = false;
        let mut asked_still_there = false;
        let mut drain_done_at: Option<Instant> = None;
        let mut hangup_at: Option<Instant> = None;
        let mut still_there_deadline: Option<Instant> = None;
        let mut goodbye_deadline: Option<Instant> = None;
        let mut last_stats = Instant::now();

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'call: loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    break 'call;
                }

                event = events_rx.recv() => {
                    let Some(event) = event else {
                        warn!("backend event channel closed");
                        break 'call;
                    };
                    match event {
                        BackendEvent::Ready => {
                            debug!("backend ready");
                        }
                        BackendEvent::Audio(ulaw) => {
                            is_speaking = true;
                            self.bridge.enqueue(ulaw);
                        }
                        BackendEvent::TextDelta(delta) => {
                            if self.config.verbose {
                                debug!("agent: {delta}");
                            }
                        }
                        BackendEvent::Transcript(text) => {
                            if self.config.verbose {
                                info!("agent: {text}");
                            }
                            if let Some(t) = transcript.as_mut()
                                && let Err(e) = t.line(Role::Agent, &text)
                            {
                                warn!("transcript write failed: {e}");
                            }
                            self.triggers.check(&TriggerContext::transcript(text, Role::Agent));
                        }
                        BackendEvent::InputTranscript(text) => {
                            if self.config.verbose {
                                info!("caller: {text}");
                            }
                            if let Some(t) = transcript.as_mut()
                                && let Err(e) = t.line(Role::Caller, &text)
                            {
                                warn!("transcript write failed: {e}");
                            }
                            self.triggers.check(&TriggerContext::transcript(text, Role::Caller));
                        }
                        BackendEvent::SpeechStarted => {
                            // The caller is talking again: abandon any pending
                            // silence check or goodbye and re-arm the triggers.
                            if silence_check_pending || goodbye_pending != GoodbyePending::None {
                                info!("caller spoke, cancelling pending goodbye");
                            }
                            silence_check_pending = false;
                            asked_still_there = false;
                            goodbye_pending = GoodbyePending::None;
                            hangup_at = None;
                            still_there_deadline = None;
                            goodbye_deadline = None;
                            self.triggers.reset();
                        }
                        BackendEvent::SpeechStopped => {
                            debug!("caller speech stopped");
                        }
                        BackendEvent::ResponseDone(usage) => {
                            debug!(
                                "response done (in={} out={} tokens)",
                                usage.input_tokens, usage.output_tokens
                            );
                            // The silence timer must not start while queued
                            // audio is still playing out; estimate the drain.
                            let backlog = self.bridge.write_queue_size() as u64
                                * audio::FRAME_MS;
                            drain_done_at = Some(Instant::now() + Duration::from_millis(backlog));
                        }
                        BackendEvent::ToolCall { name, arguments, call_id } => {
                            debug!("tool call {name}({arguments}) id={call_id}");
                            self.triggers.check(&TriggerContext::tool_call(
                                &name, &arguments, &call_id,
                            ));
                        }
                        BackendEvent::Error(message) => {
                            warn!("backend error: {message}");
                        }
                        BackendEvent::Closed => {
                            info!("backend closed, ending call");
                            break 'call;
                        }
                    }
                }

                fire = fires_rx.recv() => {
                    let Some(fire) = fire else { break 'call };
                    match fire.action {
                        TriggerAction::Hangup => {
                            if goodbye_pending != GoodbyePending::None || silence_check_pending {
                                // Already saying goodbye, or the still-there
                                // prompt is still in flight.
                            } else if fire.from_transcript {
                                info!("farewell detected, waiting for the closing response");
                                goodbye_pending = GoodbyePending::Keyword;
                                goodbye_deadline = Some(
                                    Instant::now()
                                        + Duration::from_secs(self.config.goodbye_timer_secs),
                                );
                            } else if !asked_still_there {
                                // Phase 1: check the line before giving up.
                                info!("silence detected, asking if the caller is still there");
                                asked_still_there = true;
                                silence_check_pending = true;
                                still_there_deadline = Some(
                                    Instant::now()
                                        + Duration::from_secs(self.config.still_there_timer_secs),
                                );
                                let prompt_result = self
                                    .backend
                                    .lock()
                                    .await
                                    .prompt_response(
                                        "The caller has been quiet for a while. \
                                         Briefly ask if they are still there.",
                                    )
                                    .await;
                                if let Err(e) = prompt_result {
                                    warn!("still-there prompt failed: {e}");
                                }
                                self.triggers.reset();
                            } else {
                                // Phase 2: still silent after the check.
                                info!("still silent, saying goodbye");
                                goodbye_pending = GoodbyePending::Silence;
                                goodbye_deadline = Some(
                                    Instant::now()
                                        + Duration::from_secs(self.config.goodbye_timer_secs),
                                );
                                let prompt_result = self
                                    .backend
                                    .lock()
                                    .await
                                    .prompt_response(
                                        "Nobody seems to be on the line. Give a brief, \
                                         polite closing statement and say goodbye.",
                                    )
                                    .await;
                                if let Err(e) = prompt_result {
                                    warn!("goodbye prompt failed: {e}");
                                }
                            }
                        }
                        TriggerAction::Delegate => {
                            self.dispatch_delegate(fire.payload, fire.call_id);
                        }
                        TriggerAction::Wake => {
                            if let TriggerPayload::Text(request) = fire.payload {
                                info!("wake-phrase request: {request}");
                                self.dispatch_delegate(
                                    TriggerPayload::Parsed(
                                        serde_json::json!({
                                            "intent": "wake_phrase",
                                            "request": request,
                                        })
                                        .as_object()
                                        .cloned()
                                        .unwrap_or_default(),
                                    ),
                                    None,
                                );
                            }
                        }
                    }
                }

                _ = tick.tick() => {
                    let now = Instant::now();

                    // Finish a response once its backlog has played out.
                    if let Some(done_at) = drain_done_at
                        && now >= done_at
                        && self.bridge.write_queue_size() == 0
                    {
                        drain_done_at = None;
                        is_speaking = false;
                        last_response_at = Some(now);
                        if goodbye_pending != GoodbyePending::None {
                            hangup_at = Some(now + GOODBYE_TAIL);
                        }
                    }

                    if let Some(at) = hangup_at
                        && now >= at
                    {
                        info!("goodbye complete, hanging up");
                        break 'call;
                    }

                    // Safety timers: never leave a pending state stuck.
                    if let Some(deadline) = still_there_deadline
                        && now >= deadline
                    {
                        debug!("still-there safety timer expired");
                        still_there_deadline = None;
                        silence_check_pending = false;
                    }
                    if let Some(deadline) = goodbye_deadline
                        && goodbye_pending != GoodbyePending::None
                        && now >= deadline
                    {
                        warn!("goodbye did not complete in time, forcing hangup");
                        break 'call;
                    }

                    // Periodic silence evaluation.
                    self.triggers.check(&TriggerContext {
                        last_response_at: last_response_at.map(Instant::into_std),
                        is_speaking,
                        ..TriggerContext::default()
                    });

                    if now.duration_since(last_stats) >= STATS_INTERVAL {
                        last_stats = now;
                        let stats = self.bridge.stats();
                        debug!(
                            "bridge: {} in, {} out, {} queued frames",
                            stats.bytes_in, stats.bytes_out, stats.queued_frames
                        );
                    }
                }
            }
        }

        self.finish(&mut transcript).await;
        info!(
            "call to {} ended after {}s",
            self.number,
            started.elapsed().as_secs()
        );
        Ok(())
    }

    /// Run a delegated request on its own task and feed the reply back as a
    /// tool result. Without a call id the backend has nothing to answer, so
    /// the result is logged and dropped.
    fn dispatch_delegate(&self, payload: TriggerPayload, call_id: Option<String>) {
        let Some(assistant) = self.assistant.clone() else {
            warn!("delegation requested but no assistant configured");
            return;
        };

        let (intent, request) = match &payload {
            TriggerPayload::Parsed(map) => (
                map.get("intent")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_owned(),
                map.get("request")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned(),
            ),
            TriggerPayload::Raw(raw) => ("unknown".to_owned(), raw.clone()),
            TriggerPayload::Text(text) => ("unknown".to_owned(), text.clone()),
            TriggerPayload::Empty => {
                warn!("delegation fired with no payload");
                return;
            }
        };

        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let reply = match assistant.request(&intent, &request).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!("assistant request failed: {e}");
                    "Sorry, I wasn't able to complete that request.".to_owned()
                }
            };
            match call_id {
                Some(call_id) => {
                    let backend = backend.lock().await;
                    if let Err(e) = backend.send_tool_result(&call_id, &reply).await {
                        warn!("tool result delivery failed: {e}");
                    }
                }
                None => info!("assistant replied without a call id: {reply}"),
            }
        });
    }

    /// Tear down in order: bridge, backend, SIP call, transcript. Each step
    /// is best-effort; the call must always end cleanly.
    async fn finish(&mut self, transcript: &mut Option<TranscriptWriter>) {
        self.bridge.stop().await;

        if let Err(e) = self.backend.lock().await.disconnect().await {
            warn!("backend disconnect failed: {e}");
        }

        if let Err(e) = self.control.hangup().await {
            warn!("SIP hangup failed: {e}");
        }

        if let Some(t) = transcript.as_mut()
            && let Err(e) = t.close()
        {
            warn!("transcript close failed: {e}");
        }
    }
}
