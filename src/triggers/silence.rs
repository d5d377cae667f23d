//! Silence trigger.

use super::{Trigger, TriggerAction, TriggerContext};
use std::time::{Duration, Instant};

/// Fires when the line has been quiet for longer than a timeout.
///
/// The counter resets whenever the agent is speaking, and the trigger does
/// nothing until a first response has established `last_response_at`.
pub struct SilenceTrigger {
    name: String,
    timeout: Duration,
    last_silence: Duration,
}

impl SilenceTrigger {
    /// Trigger with the default 10 s timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    /// Trigger with a specific timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            name: "silence".to_owned(),
            timeout,
            last_silence: Duration::ZERO,
        }
    }

    /// The silence measured on the last check.
    pub fn last_silence(&self) -> Duration {
        self.last_silence
    }
}

impl Default for SilenceTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for SilenceTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn one_shot(&self) -> bool {
        true
    }

    fn check(&mut self, ctx: &TriggerContext) -> Option<TriggerAction> {
        if ctx.is_speaking {
            self.last_silence = Duration::ZERO;
            return None;
        }
        let last_response_at = ctx.last_response_at?;
        self.last_silence = Instant::now().saturating_duration_since(last_response_at);
        (self.last_silence > self.timeout).then_some(TriggerAction::Hangup)
    }
}
