//! Conversational triggers.
//!
//! Triggers watch the live transcript and tool stream and fire actions —
//! hang up on a farewell, prompt after silence, delegate a tool call,
//! capture a wake-phrase request. A [`TriggerManager`] owns the bank of
//! triggers and the callbacks registered per action.

pub mod delegate;
pub mod farewell;
pub mod silence;
pub mod wakephrase;

pub use delegate::DelegateTrigger;
pub use farewell::FarewellTrigger;
pub use silence::SilenceTrigger;
pub use wakephrase::WakePhraseTrigger;

use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

/// Action fired by a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerAction {
    /// End the call (after a goodbye).
    Hangup,
    /// Hand a caller request to the delegation assistant.
    Delegate,
    /// A wake-phrase request was captured.
    Wake,
}

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The human on the phone.
    Caller,
    /// The AI persona.
    Agent,
    /// Session-generated lines.
    System,
}

/// Everything a trigger may inspect. All fields optional; a context carries
/// only what the originating event knows.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    /// A completed utterance.
    pub transcript: Option<String>,
    /// Who spoke it.
    pub role: Option<Role>,
    /// When the agent last finished a response (with playout drained).
    pub last_response_at: Option<Instant>,
    /// Whether the agent is speaking right now.
    pub is_speaking: bool,
    /// Tool name from a backend tool call.
    pub tool_name: Option<String>,
    /// Raw tool arguments (usually JSON text).
    pub tool_arguments: Option<String>,
    /// Tool call id to echo back with the result.
    pub tool_call_id: Option<String>,
}

impl TriggerContext {
    /// Context for a completed utterance.
    pub fn transcript(text: impl Into<String>, role: Role) -> Self {
        Self {
            transcript: Some(text.into()),
            role: Some(role),
            ..Self::default()
        }
    }

    /// Context for a backend tool call.
    pub fn tool_call(name: &str, arguments: &str, call_id: &str) -> Self {
        Self {
            tool_name: Some(name.to_owned()),
            tool_arguments: Some(arguments.to_owned()),
            tool_call_id: Some(call_id.to_owned()),
            ..Self::default()
        }
    }
}

/// Payload published by a trigger for its callbacks.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TriggerPayload {
    /// Tool arguments parsed to a JSON object.
    Parsed(serde_json::Map<String, serde_json::Value>),
    /// Arguments that did not parse; kept verbatim.
    Raw(String),
    /// Captured free text (wake-phrase tail).
    Text(String),
    /// Nothing published.
    #[default]
    Empty,
}

impl TriggerPayload {
    /// Look up a string field of a parsed payload.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self {
            Self::Parsed(map) => map.get(key).and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

/// A conversational trigger.
pub trait Trigger: Send {
    /// Stable name, used for one-shot bookkeeping.
    fn name(&self) -> &str;

    /// Whether the trigger is currently armed.
    fn enabled(&self) -> bool {
        true
    }

    /// Whether the trigger may fire at most once per [`TriggerManager::reset`].
    fn one_shot(&self) -> bool {
        false
    }

    /// Inspect a context; return the action to fire, if any.
    fn check(&mut self, ctx: &TriggerContext) -> Option<TriggerAction>;

    /// Payload published for callbacks after a fire.
    fn payload(&self) -> TriggerPayload {
        TriggerPayload::Empty
    }
}

/// Callback invoked when an action fires.
pub type TriggerCallback = Box<dyn Fn(&TriggerContext, &TriggerPayload) + Send + Sync>;

/// Ordered bank of triggers plus per-action callbacks.
#[derive(Default)]
pub struct TriggerManager {
    triggers: Vec<Box<dyn Trigger>>,
    callbacks: HashMap<TriggerAction, Vec<TriggerCallback>>,
    fired: HashSet<(String, TriggerAction)>,
}

impl TriggerManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trigger; evaluation order follows insertion order.
    pub fn add(&mut self, trigger: Box<dyn Trigger>) {
        self.triggers.push(trigger);
    }

    /// Register a callback for an action.
    pub fn on(&mut self, action: TriggerAction, callback: TriggerCallback) {
        self.callbacks.entry(action).or_default().push(callback);
    }

    /// Evaluate every enabled trigger against `ctx`, firing callbacks for
    /// each hit. One-shot triggers that already fired are skipped until
    /// [`TriggerManager::reset`].
    pub fn check(&mut self, ctx: &TriggerContext) -> Vec<TriggerAction> {
        let mut fired_actions = Vec::new();
        for trigger in &mut self.triggers {
            if !trigger.enabled() {
                continue;
            }
            let Some(action) = trigger.check(ctx) else {
                continue;
            };
            let key = (trigger.name().to_owned(), action);
            if trigger.one_shot() && self.fired.contains(&key) {
                debug!("one-shot trigger {} already fired, skipping", trigger.name());
                continue;
            }
            self.fired.insert(key);
            fired_actions.push(action);

            let payload = trigger.payload();
            if let Some(callbacks) = self.callbacks.get(&action) {
                for callback in callbacks {
                    callback(ctx, &payload);
                }
            }
        }
        fired_actions
    }

    /// Re-arm one-shot triggers (called when the caller speaks again).
    pub fn reset(&mut self) {
        self.fired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysFire;

    impl Trigger for AlwaysFire {
        fn name(&self) -> &str {
            "always"
        }
        fn one_shot(&self) -> bool {
            true
        }
        fn check(&mut self, _ctx: &TriggerContext) -> Option<TriggerAction> {
            Some(TriggerAction::Hangup)
        }
    }

    #[test]
    fn one_shot_fires_once_until_reset() {
        let mut manager = TriggerManager::new();
        manager.add(Box::new(AlwaysFire));

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        manager.on(
            TriggerAction::Hangup,
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        let ctx = TriggerContext::default();
        assert_eq!(manager.check(&ctx), vec![TriggerAction::Hangup]);
        assert!(manager.check(&ctx).is_empty());
        assert_eq!(count.load(Ordering::Relaxed), 1);

        manager.reset();
        assert_eq!(manager.check(&ctx), vec![TriggerAction::Hangup]);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
