//! Local voice pipeline backend.
//!
//! Replaces the realtime API with three cooperating parts: an STT
//! subprocess, a TTS subprocess, and a streaming chat-completions call.
//! Generation is sentence-paced — each sentence goes to TTS as soon as it is
//! complete, and the next one waits for the previous utterance's audio to be
//! delivered. The gaps double as barge-in checkpoints.
//!
//! Echo suppression is content-based: while the agent is speaking (and for a
//! short cooldown afterwards) STT output is assumed to be acoustic echo and
//! dropped, unless it is substantial enough to be a real interruption.

pub mod llm;
pub mod proc;

use crate::audio::ulaw;
use crate::backend::{BackendEvent, EventSender, Usage, VoiceBackend};
use crate::config::{AgentProfile, LocalConfig, TurnConfig};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use llm::{ChatClient, ChatMessage};
use proc::SttEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period for reader/worker shutdown before aborting.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// A unit of work for the utterance worker. Exactly one generation runs at
/// a time; two would interleave audio and corrupt the conversation.
enum Job {
    /// A caller turn: append to history, then generate.
    Caller(String),
    /// Speak per explicit instructions without a caller turn.
    Prompt(String),
}

/// Turn-taking state shared between the STT router and the utterance worker.
struct TurnState {
    /// True from the first sentence of a response to the last.
    speaking: AtomicBool,
    /// Set when a real interruption arrives mid-response.
    barge_in: AtomicBool,
    /// Interrupt flag handed to the LLM stream; shared so the router can
    /// stop token consumption the moment a barge-in lands.
    interrupt: Arc<AtomicBool>,
    /// The transcript that caused the barge-in, re-queued after the halt.
    pending_interrupt: StdMutex<Option<String>>,
    /// Echo cooldown: STT output before this instant is suspect.
    cooldown_until: StdMutex<Option<Instant>>,
    /// Released once the caller has genuinely spoken (ring-tone filter).
    gate_open: AtomicBool,
    /// Conversation history. Snapshot under the lock before each request.
    history: StdMutex<Vec<ChatMessage>>,
}

impl TurnState {
    fn new() -> Self {
        Self {
            speaking: AtomicBool::new(false),
            barge_in: AtomicBool::new(false),
            interrupt: Arc::new(AtomicBool::new(false)),
            pending_interrupt: StdMutex::new(None),
            cooldown_until: StdMutex::new(None),
            gate_open: AtomicBool::new(false),
            history: StdMutex::new(Vec::new()),
        }
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .lock()
            .expect("cooldown lock")
            .is_some_and(|until| Instant::now() < until)
    }
}

/// Live resources for a connected backend.
struct Running {
    stt_stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    utterance_tx: mpsc::UnboundedSender<Job>,
    events: EventSender,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    children: Vec<Child>,
}

/// Sentence-paced STT→LLM→TTS backend.
pub struct LocalBackend {
    config: LocalConfig,
    profile: AgentProfile,
    connected: Arc<AtomicBool>,
    running: Option<Running>,
}

impl LocalBackend {
    /// Create an unconnected backend for the given persona.
    pub fn new(config: LocalConfig, profile: AgentProfile) -> Self {
        Self {
            config,
            profile,
            connected: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }
}

#[async_trait]
impl VoiceBackend for LocalBackend {
    async fn connect(&mut self, events: EventSender) -> Result<()> {
        let stt = proc::spawn_server(
            &self.config.stt.command,
            "STT",
            Duration::from_secs(self.config.stt.startup_timeout_secs),
        )
        .await?;
        let tts = proc::spawn_server(
            &self.config.tts.command,
            "TTS",
            Duration::from_secs(self.config.tts.startup_timeout_secs),
        )
        .await?;

        let state = Arc::new(TurnState::new());
        let cancel = CancellationToken::new();
        let mut handles = vec![stt.status_handle, tts.status_handle];

        // TTS stdout: sentinel-framed audio → μ-law events + delivery signals.
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let tts_reader = proc::TtsAudioReader::new(events.clone(), delivered_tx);
        handles.push(tokio::spawn(tts_reader.run(tts.stdout)));

        // STT stdout: JSON lines → typed events.
        let (stt_tx, stt_rx) = mpsc::unbounded_channel();
        handles.push(tokio::spawn(proc::run_stt_reader(stt.stdout, stt_tx)));

        // Utterance worker: the single serialized generation loop.
        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        handles.push(tokio::spawn(run_utterance_worker(UtteranceWorker {
            job_rx: utterance_rx,
            delivered_rx,
            tts_stdin: tts.stdin,
            client: ChatClient::new(&self.config.llm),
            state: Arc::clone(&state),
            turns: self.config.turns.clone(),
            profile: self.profile.clone(),
            llm_history_limit: self.config.llm.max_history_messages,
            sentinel_wait: Duration::from_secs(self.config.tts.sentinel_wait_secs),
            events: events.clone(),
            cancel: cancel.clone(),
        })));

        // Router: applies the greeting gate and echo suppression, forwards
        // accepted caller turns to the worker.
        handles.push(tokio::spawn(run_stt_router(
            stt_rx,
            Arc::clone(&state),
            self.config.turns.clone(),
            utterance_tx.clone(),
            events.clone(),
            cancel.clone(),
        )));

        self.running = Some(Running {
            stt_stdin: Arc::new(tokio::sync::Mutex::new(stt.stdin)),
            utterance_tx,
            events: events.clone(),
            cancel,
            handles,
            children: vec![stt.child, tts.child],
        });
        self.connected.store(true, Ordering::Relaxed);

        let _ = events.send(BackendEvent::Ready);
        info!("local pipeline ready");
        Ok(())
    }

    async fn send_audio(&self, ulaw_bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let Some(running) = &self.running else {
            return Ok(());
        };
        let pcm = ulaw::ulaw_to_linear(ulaw_bytes);
        let mut stdin = running.stt_stdin.lock().await;
        stdin
            .write_all(&pcm)
            .await
            .map_err(|e| AgentError::Stt(format!("STT stdin write failed: {e}")))?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        if let Some(running) = &self.running {
            let _ = running
                .events
                .send(BackendEvent::InputTranscript(text.to_owned()));
            let _ = running.utterance_tx.send(Job::Caller(text.to_owned()));
        }
        Ok(())
    }

    async fn send_tool_result(&self, call_id: &str, _output: &str) -> Result<()> {
        // The local LLM runs without tools, so nothing ever produces a
        // call_id to answer.
        debug!("ignoring tool result for {call_id} on local backend");
        Ok(())
    }

    async fn prompt_response(&self, instructions: &str) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        if let Some(running) = &self.running {
            let _ = running
                .utterance_tx
                .send(Job::Prompt(instructions.to_owned()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        // Closing the job queue and STT stdin lets every stage drain
        // naturally: the STT server exits on EOF, its reader and the router
        // follow, and the worker drops the TTS stdin on exit.
        running.cancel.cancel();
        drop(running.utterance_tx);
        drop(running.stt_stdin);

        for handle in running.handles {
            let mut handle = handle;
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("pipeline task did not stop within grace period, aborting");
                handle.abort();
            }
        }
        for mut child in running.children {
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.start_kill();
            }
        }

        let _ = running.events.send(BackendEvent::Closed);
        info!("local pipeline stopped");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Route STT events: forward VAD edges, gate and echo-filter transcripts.
async fn run_stt_router(
    mut stt_rx: mpsc::UnboundedReceiver<SttEvent>,
    state: Arc<TurnState>,
    turns: TurnConfig,
    utterance_tx: mpsc::UnboundedSender<Job>,
    events: EventSender,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = stt_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            SttEvent::SpeechStarted => {
                let _ = events.send(BackendEvent::SpeechStarted);
            }
            SttEvent::SpeechStopped => {
                let _ = events.send(BackendEvent::SpeechStopped);
            }
            SttEvent::Transcript { text, latency } => {
                let text = text.trim().to_owned();
                if text.is_empty() {
                    continue;
                }
                debug!("STT ({latency:.1}s): {text}");

                if !state.gate_open.load(Ordering::Relaxed) {
                    if !releases_greeting_gate(&text, &turns) {
                        debug!("greeting gate dropped: {text}");
                        continue;
                    }
                    state.gate_open.store(true, Ordering::Relaxed);
                }

                if state.speaking.load(Ordering::Relaxed) {
                    if is_substantial(&text, &turns) {
                        info!("barge-in: {text}");
                        *state
                            .pending_interrupt
                            .lock()
                            .expect("pending interrupt lock") = Some(text);
                        state.barge_in.store(true, Ordering::Relaxed);
                        state.interrupt.store(true, Ordering::Relaxed);
                    } else {
                        debug!("echo suppressed while speaking: {text}");
                    }
                    continue;
                }

                if state.in_cooldown() && !is_substantial(&text, &turns) {
                    debug!("echo suppressed in cooldown: {text}");
                    continue;
                }

                let _ = events.send(BackendEvent::InputTranscript(text.clone()));
                if utterance_tx.send(Job::Caller(text)).is_err() {
                    break;
                }
            }
        }
    }
    debug!("STT router exited");
}

/// A transcript long enough to be a deliberate interruption rather than
/// acoustic echo of the agent's own voice.
fn is_substantial(text: &str, turns: &TurnConfig) -> bool {
    text.chars().count() >= turns.barge_in_min_chars
        && text.split_whitespace().count() >= turns.barge_in_min_words
}

/// Whether a transcript opens the greeting gate. Ring-tones and line noise
/// yield one-word hallucinations ("the", "you", "mm-hmm"); a real opener has
/// both length and more than one word.
fn releases_greeting_gate(text: &str, turns: &TurnConfig) -> bool {
    text.chars().count() >= turns.greeting_gate_min_chars
        && text.split_whitespace().count() >= 2
}

/// Everything the utterance worker needs, bundled to keep the spawn site
/// readable.
struct UtteranceWorker {
    job_rx: mpsc::UnboundedReceiver<Job>,
    delivered_rx: mpsc::UnboundedReceiver<()>,
    tts_stdin: ChildStdin,
    client: ChatClient,
    state: Arc<TurnState>,
    turns: TurnConfig,
    profile: AgentProfile,
    llm_history_limit: usize,
    sentinel_wait: Duration,
    events: EventSender,
    cancel: CancellationToken,
}

/// Serialize caller turns through the LLM→TTS path, one generation at a
/// time.
async fn run_utterance_worker(mut worker: UtteranceWorker) {
    let mut requeued: Option<Job> = None;
    loop {
        let job = match requeued.take() {
            Some(job) => job,
            None => {
                let received = tokio::select! {
                    () = worker.cancel.cancelled() => None,
                    job = worker.job_rx.recv() => job,
                };
                match received {
                    Some(job) => job,
                    None => break,
                }
            }
        };

        let instructions = match job {
            Job::Caller(text) => {
                worker
                    .state
                    .history
                    .lock()
                    .expect("history lock")
                    .push(ChatMessage::user(text));
                None
            }
            Job::Prompt(instructions) => Some(instructions),
        };

        match stream_and_speak(&mut worker, instructions).await {
            Ok(()) => {}
            Err(e) => {
                error!("generation failed: {e}");
                let _ = worker.events.send(BackendEvent::Error(e.to_string()));
                // The session may be waiting on a response to finish (e.g.
                // during goodbye); report an empty one rather than hang it.
                worker.state.speaking.store(false, Ordering::Relaxed);
                let _ = worker
                    .events
                    .send(BackendEvent::ResponseDone(Usage::default()));
            }
        }

        // Pick up an interruption stored during this generation (or during
        // the tail of its audio) before waiting for new STT input.
        let pending = worker
            .state
            .pending_interrupt
            .lock()
            .expect("pending interrupt lock")
            .take();
        if let Some(text) = pending {
            let _ = worker
                .events
                .send(BackendEvent::InputTranscript(text.clone()));
            requeued = Some(Job::Caller(text));
        }
    }
    debug!("utterance worker exited");
}

/// Stream one LLM response, speaking it sentence by sentence.
///
/// Returns `Ok` for both completed and barged-in generations; a barge-in
/// suppresses `ResponseDone` and leaves the interrupting transcript in
/// `pending_interrupt` for the worker to re-queue.
async fn stream_and_speak(
    worker: &mut UtteranceWorker,
    instructions: Option<String>,
) -> Result<()> {
    let state = Arc::clone(&worker.state);
    state.interrupt.store(false, Ordering::Relaxed);
    state.barge_in.store(false, Ordering::Relaxed);

    // Discard delivery signals left over from an errored generation so this
    // one paces against its own utterances only.
    while worker.delivered_rx.try_recv().is_ok() {}

    // Snapshot the conversation under the lock; the stream runs lock-free.
    let messages = {
        let history = state.history.lock().expect("history lock");
        let mut messages = vec![ChatMessage::system(worker.profile.named_instructions())];
        let skip = history.len().saturating_sub(worker.llm_history_limit);
        messages.extend(history.iter().skip(skip).cloned());
        if let Some(ref instructions) = instructions {
            messages.push(ChatMessage::system(instructions.clone()));
        }
        messages
    };

    let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
    let client = worker.client.clone();
    let interrupt = Arc::clone(&state.interrupt);
    let llm_interrupt = Arc::clone(&interrupt);
    let llm_handle =
        tokio::spawn(async move { client.stream(messages, token_tx, llm_interrupt).await });

    let mut full_text = String::new();
    let mut buffer = String::new();
    let mut token_count = 0u64;
    let mut sent = 0usize;
    let mut delivered = 0usize;
    let mut barged_in = false;

    'stream: while let Some(token) = token_rx.recv().await {
        token_count += 1;
        full_text.push_str(&token);
        buffer.push_str(&token);

        while let Some(end) = llm::find_sentence_end(&buffer, worker.turns.sentence_min_chars) {
            let sentence = buffer[..end].trim().to_owned();
            buffer = buffer[end..].to_owned();
            if sentence.is_empty() {
                continue;
            }

            // Pace on the previous sentence's audio; the wait is also the
            // barge-in checkpoint.
            if sent > delivered {
                wait_for_delivery(worker, &mut delivered).await?;
                if state.barge_in.load(Ordering::Relaxed) {
                    barged_in = true;
                    interrupt.store(true, Ordering::Relaxed);
                    break 'stream;
                }
            }

            speak_sentence(worker, &sentence).await?;
            sent += 1;
            state.speaking.store(true, Ordering::Relaxed);
        }

        if state.barge_in.load(Ordering::Relaxed) {
            barged_in = true;
            interrupt.store(true, Ordering::Relaxed);
            break;
        }
    }

    match llm_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if !barged_in => return Err(e),
        Ok(Err(e)) => debug!("LLM stream error after barge-in: {e}"),
        Err(e) => return Err(AgentError::Llm(format!("LLM task panicked: {e}"))),
    }

    if !barged_in {
        // Flush whatever is left in the buffer as the final sentence.
        let remaining = buffer.trim().to_owned();
        if !remaining.is_empty() {
            if sent > delivered {
                wait_for_delivery(worker, &mut delivered).await?;
                barged_in = state.barge_in.load(Ordering::Relaxed);
            }
            if !barged_in {
                speak_sentence(worker, &remaining).await?;
                sent += 1;
                state.speaking.store(true, Ordering::Relaxed);
            }
        }
    }

    // Drain outstanding utterances so the next generation starts clean and
    // the caller hears the tail of what was already synthesized.
    while delivered < sent {
        wait_for_delivery(worker, &mut delivered).await?;
    }

    state.speaking.store(false, Ordering::Relaxed);

    let final_text = full_text.trim().to_owned();
    if !final_text.is_empty() {
        state
            .history
            .lock()
            .expect("history lock")
            .push(ChatMessage::assistant(final_text.clone()));
    }

    if barged_in {
        info!("generation halted by barge-in after {sent} sentences");
        return Ok(());
    }

    let _ = worker.events.send(BackendEvent::Transcript(final_text));
    *state.cooldown_until.lock().expect("cooldown lock") = Some(
        Instant::now() + Duration::from_millis(worker.turns.echo_cooldown_ms),
    );
    let _ = worker.events.send(BackendEvent::ResponseDone(Usage {
        input_tokens: 0,
        output_tokens: token_count,
    }));
    Ok(())
}

/// Send one sentence to the TTS server.
async fn speak_sentence(worker: &mut UtteranceWorker, sentence: &str) -> Result<()> {
    let mut request = serde_json::json!({ "text": sentence });
    if !worker.profile.voice.is_empty() {
        request["voice"] = serde_json::Value::String(worker.profile.voice.clone());
    }
    if let Some(ref instruct) = worker.profile.tts_instruct {
        request["instruct"] = serde_json::Value::String(instruct.clone());
    }
    let mut line = request.to_string();
    line.push('\n');
    worker
        .tts_stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| AgentError::Tts(format!("TTS stdin write failed: {e}")))?;
    worker
        .tts_stdin
        .flush()
        .await
        .map_err(|e| AgentError::Tts(format!("TTS stdin flush failed: {e}")))?;
    Ok(())
}

/// Wait for the next utterance-delivered signal from the TTS audio reader.
async fn wait_for_delivery(worker: &mut UtteranceWorker, delivered: &mut usize) -> Result<()> {
    match tokio::time::timeout(worker.sentinel_wait, worker.delivered_rx.recv()).await {
        Ok(Some(())) => {
            *delivered += 1;
            Ok(())
        }
        Ok(None) => Err(AgentError::Tts("TTS audio stream closed".to_owned())),
        Err(_) => Err(AgentError::Timeout(format!(
            "no TTS audio within {}s",
            worker.sentinel_wait.as_secs()
        ))),
    }
}
