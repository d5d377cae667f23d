//! Entrypoint: dial a number and run the call.

use clap::{Parser, ValueEnum};
use garbo::audio::bridge::AudioBridge;
use garbo::config::AgentConfig;
use garbo::error::AgentError;
use garbo::session::CallSessionBuilder;
use garbo::sip::SipControl;
use garbo::triggers::{
    DelegateTrigger, FarewellTrigger, Role, SilenceTrigger, TriggerManager, WakePhraseTrigger,
};
use garbo::{LocalBackend, RealtimeBackend, VoiceBackend};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Remote realtime WebSocket API.
    Realtime,
    /// Local STT→LLM→TTS subprocess pipeline.
    Local,
}

/// Place a phone call and hold the conversation.
#[derive(Parser)]
#[command(name = "garbo", version)]
struct Args {
    /// Phone number to dial.
    number: String,

    /// Voice backend to use.
    #[arg(long, value_enum, default_value_t = BackendKind::Realtime)]
    backend: BackendKind,

    /// Write a transcript of the call to this file.
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Override the persona's instructions for this call.
    #[arg(long)]
    instructions: Option<String>,

    /// Log caller/agent turns as they happen.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if args.verbose {
                    "garbo=debug".into()
                } else {
                    "garbo=info".into()
                }
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = AgentConfig::default();
    config.session.transcript_path = args.transcript;
    config.session.verbose = args.verbose;
    if let Some(ref instructions) = args.instructions {
        config.profile = config.profile.with_instructions(instructions);
    }

    let backend: Box<dyn VoiceBackend> = match args.backend {
        BackendKind::Realtime => Box::new(RealtimeBackend::new(
            config.realtime.clone(),
            config.profile.clone(),
        )),
        BackendKind::Local => Box::new(LocalBackend::new(
            config.local.clone(),
            config.profile.clone(),
        )),
    };

    // The session checks agent transcripts against the same bank, so the
    // keyword triggers must only answer to the caller — a friendly "take
    // care" from the agent itself is not a hangup request.
    let mut triggers = TriggerManager::new();
    match FarewellTrigger::new() {
        Ok(trigger) => triggers.add(Box::new(trigger.for_role(Role::Caller))),
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    }
    triggers.add(Box::new(SilenceTrigger::with_timeout(Duration::from_secs(
        config.session.silence_timeout_secs,
    ))));
    triggers.add(Box::new(DelegateTrigger::new()));
    match WakePhraseTrigger::new(&config.profile.name) {
        Ok(trigger) => triggers.add(Box::new(trigger.for_role(Role::Caller))),
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    }

    let session = CallSessionBuilder::new(&args.number, config.session.clone())
        .backend(backend)
        .bridge(AudioBridge::new(config.audio.clone()))
        .triggers(triggers)
        .assistant(Arc::new(garbo::assistant::HttpAssistant::new(
            &config.assistant,
        )))
        .control(Arc::new(SipControl::new(config.sip.clone())))
        .build();

    let session = match session {
        Ok(session) => session,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    // Ctrl-C ends the call through the normal hangup path.
    let shutdown = session.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    match session.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            match e {
                AgentError::Lock(_) => ExitCode::from(2),
                AgentError::Timeout(_) => ExitCode::from(3),
                _ => ExitCode::from(1),
            }
        }
    }
}
