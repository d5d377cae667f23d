//! Session lifecycle against a scripted backend: farewell hangup, the
//! two-phase silence goodbye, and the delegation round-trip.

use async_trait::async_trait;
use garbo::Result;
use garbo::assistant::Assistant;
use garbo::audio::bridge::AudioBridge;
use garbo::backend::{BackendEvent, EventSender, Usage, VoiceBackend};
use garbo::config::{AudioConfig, SessionConfig};
use garbo::session::CallSessionBuilder;
use garbo::sip::CallControl;
use garbo::triggers::{DelegateTrigger, FarewellTrigger, Role, SilenceTrigger, TriggerManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;

/// Records dial/hangup calls instead of talking to a SIP stack.
#[derive(Default)]
struct RecordingControl {
    dialed: Mutex<Vec<String>>,
    hangups: AtomicUsize,
}

#[async_trait]
impl CallControl for RecordingControl {
    async fn dial(&self, number: &str) -> Result<()> {
        self.dialed.lock().expect("lock").push(number.to_owned());
        Ok(())
    }

    async fn hangup(&self) -> Result<()> {
        self.hangups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Replies to every delegated request with a fixed line.
struct CannedAssistant {
    reply: String,
}

#[async_trait]
impl Assistant for CannedAssistant {
    async fn request(&self, _intent: &str, _request: &str) -> Result<String> {
        Ok(self.reply.clone())
    }
}

/// Scripted backend: records outbound calls, lets the test inject events,
/// and can answer every prompt with a short canned response.
#[derive(Default)]
struct ScriptedInner {
    events: Mutex<Option<EventSender>>,
    prompts: Mutex<Vec<String>>,
    tool_results: Mutex<Vec<(String, String)>>,
    auto_respond: bool,
}

impl ScriptedInner {
    fn send(&self, event: BackendEvent) {
        if let Some(events) = self.events.lock().expect("lock").as_ref() {
            let _ = events.send(event);
        }
    }

    /// Emit a full spoken response: one audio frame, transcript, done.
    fn respond(&self, text: &str) {
        self.send(BackendEvent::Audio(vec![0xFF; 160]));
        self.send(BackendEvent::Transcript(text.to_owned()));
        self.send(BackendEvent::ResponseDone(Usage::default()));
    }
}

struct ScriptedBackend {
    inner: Arc<ScriptedInner>,
    connected: bool,
}

impl ScriptedBackend {
    fn new(auto_respond: bool) -> (Self, Arc<ScriptedInner>) {
        let inner = Arc::new(ScriptedInner {
            auto_respond,
            ..ScriptedInner::default()
        });
        (
            Self {
                inner: Arc::clone(&inner),
                connected: false,
            },
            inner,
        )
    }
}

#[async_trait]
impl VoiceBackend for ScriptedBackend {
    async fn connect(&mut self, events: EventSender) -> Result<()> {
        *self.inner.events.lock().expect("lock") = Some(events.clone());
        self.connected = true;
        let _ = events.send(BackendEvent::Ready);
        Ok(())
    }

    async fn send_audio(&self, _ulaw: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<()> {
        self.inner
            .tool_results
            .lock()
            .expect("lock")
            .push((call_id.to_owned(), output.to_owned()));
        self.inner.respond("Done.");
        Ok(())
    }

    async fn prompt_response(&self, instructions: &str) -> Result<()> {
        self.inner
            .prompts
            .lock()
            .expect("lock")
            .push(instructions.to_owned());
        if self.inner.auto_respond {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                inner.respond("Alright then, goodbye!");
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Accept the bridge's socket connection and swallow whatever it writes.
fn spawn_sip_side(listener: UnixListener) {
    tokio::spawn(async move {
        let Ok((mut peer, _)) = listener.accept().await else {
            return;
        };
        let mut sink = [0u8; 4096];
        while peer.read(&mut sink).await.is_ok_and(|n| n > 0) {}
    });
}

struct Harness {
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            lock_path: self.dir.path().join("call.pid"),
            transcript_path: Some(self.dir.path().join("call.txt")),
            ..SessionConfig::default()
        }
    }

    fn bridge(&self) -> AudioBridge {
        let config = AudioConfig {
            socket_path: self.dir.path().join("au.sock"),
            ..AudioConfig::default()
        };
        let listener = UnixListener::bind(&config.socket_path).expect("bind");
        spawn_sip_side(listener);
        AudioBridge::new(config)
    }

    fn transcript(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("call.txt")).expect("transcript")
    }
}

#[tokio::test]
async fn farewell_hangs_up_after_the_closing_response() {
    let harness = Harness::new();
    let (backend, inner) = ScriptedBackend::new(false);
    let control = Arc::new(RecordingControl::default());

    let mut triggers = TriggerManager::new();
    triggers.add(Box::new(
        FarewellTrigger::new().expect("pattern").for_role(Role::Caller),
    ));

    let session = CallSessionBuilder::new("5558675309", harness.session_config())
        .backend(Box::new(backend))
        .bridge(harness.bridge())
        .triggers(triggers)
        .control(Arc::clone(&control) as Arc<dyn CallControl>)
        .build()
        .expect("build");

    let run = tokio::spawn(session.run());

    // Let the session wire up, then script the final exchange.
    tokio::time::sleep(Duration::from_millis(200)).await;
    inner.send(BackendEvent::InputTranscript("Okay, goodbye!".to_owned()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    inner.respond("Take care, talk soon!");

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("clean hangup");

    assert_eq!(control.dialed.lock().expect("lock").as_slice(), ["5558675309"]);
    assert_eq!(control.hangups.load(Ordering::Relaxed), 1);

    let transcript = harness.transcript();
    let caller_at = transcript.find("Caller: Okay, goodbye!").expect("caller line");
    let agent_at = transcript
        .find("Agent: Take care, talk soon!")
        .expect("agent line");
    assert!(caller_at < agent_at);
    assert!(transcript.contains("Call ended (duration:"));
}

#[tokio::test]
async fn silence_runs_the_two_phase_goodbye() {
    let harness = Harness::new();
    let (backend, inner) = ScriptedBackend::new(true);
    let control = Arc::new(RecordingControl::default());

    let mut config = harness.session_config();
    config.silence_timeout_secs = 1;
    config.still_there_timer_secs = 1;

    let mut triggers = TriggerManager::new();
    triggers.add(Box::new(SilenceTrigger::with_timeout(Duration::from_secs(
        1,
    ))));

    let session = CallSessionBuilder::new("5550000000", config)
        .backend(Box::new(backend))
        .bridge(harness.bridge())
        .triggers(triggers)
        .control(Arc::clone(&control) as Arc<dyn CallControl>)
        .build()
        .expect("build");

    let run = tokio::spawn(session.run());

    // A first response establishes the silence reference point.
    tokio::time::sleep(Duration::from_millis(200)).await;
    inner.respond("Hello, this is Garbo.");

    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("clean hangup");

    let prompts = inner.prompts.lock().expect("lock").clone();
    assert_eq!(prompts.len(), 2, "prompts: {prompts:?}");
    assert!(prompts[0].contains("still there"), "{}", prompts[0]);
    assert!(prompts[1].contains("goodbye"), "{}", prompts[1]);
    assert_eq!(control.hangups.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn delegation_round_trips_through_the_assistant() {
    let harness = Harness::new();
    let (backend, inner) = ScriptedBackend::new(false);
    let control = Arc::new(RecordingControl::default());

    let mut triggers = TriggerManager::new();
    triggers.add(Box::new(DelegateTrigger::new()));

    let session = CallSessionBuilder::new("5551112222", harness.session_config())
        .backend(Box::new(backend))
        .bridge(harness.bridge())
        .triggers(triggers)
        .assistant(Arc::new(CannedAssistant {
            reply: "Sent.".to_owned(),
        }))
        .control(Arc::clone(&control) as Arc<dyn CallControl>)
        .build()
        .expect("build");

    let shutdown = session.shutdown_token();
    let run = tokio::spawn(session.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    inner.send(BackendEvent::ToolCall {
        name: "classify_intent".to_owned(),
        arguments: r#"{"intent":"send_text","request":"text Alice"}"#.to_owned(),
        call_id: "c1".to_owned(),
    });

    // Wait for the round-trip, then end the call.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !inner.tool_results.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("tool result arrives");

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("clean shutdown");

    let results = inner.tool_results.lock().expect("lock").clone();
    assert_eq!(results, [("c1".to_owned(), "Sent.".to_owned())]);
    assert_eq!(control.hangups.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn second_session_is_blocked_by_the_pid_lock() {
    let harness = Harness::new();
    let lock_path = harness.dir.path().join("call.pid");
    std::fs::write(&lock_path, format!("{}\n", std::process::id())).expect("seed lock");

    let (backend, _inner) = ScriptedBackend::new(false);
    let control = Arc::new(RecordingControl::default());

    let mut config = harness.session_config();
    config.lock_path = lock_path;

    let session = CallSessionBuilder::new("5553334444", config)
        .backend(Box::new(backend))
        .bridge(harness.bridge())
        .control(Arc::clone(&control) as Arc<dyn CallControl>)
        .build()
        .expect("build");

    let error = session.run().await.expect_err("lock contention");
    assert!(error.to_string().contains("already running"));
    // Nothing was dialed.
    assert!(control.dialed.lock().expect("lock").is_empty());
}
