//! Wake-phrase request capture.

use super::{Role, Trigger, TriggerAction, TriggerContext, TriggerPayload};
use crate::error::{AgentError, Result};
use regex::Regex;

/// Captures the request following an addressed wake phrase, e.g.
/// "Hey Garbo, send a text to mom" → "send a text to mom".
pub struct WakePhraseTrigger {
    name: String,
    prefixes: Vec<Regex>,
    role: Option<Role>,
    captured: Option<String>,
}

impl WakePhraseTrigger {
    /// Trigger on the standard ways of addressing `agent_name`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the name breaks the assembled patterns.
    pub fn new(agent_name: &str) -> Result<Self> {
        let name = regex::escape(&agent_name.to_lowercase());
        Self::from_prefixes(&[
            format!(r"(?i)^hey,?\s+{name}\b"),
            format!(r"(?i)^ok(?:ay)?,?\s+{name}\b"),
            format!(r"(?i)^{name},"),
        ])
    }

    /// Trigger on explicit anchored prefix patterns, tried in order.
    ///
    /// # Errors
    ///
    /// Returns a config error if a pattern does not compile.
    pub fn from_prefixes<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let prefixes = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref())
                    .map_err(|e| AgentError::Config(format!("bad wake-phrase pattern: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: "wake_phrase".to_owned(),
            prefixes,
            role: None,
            captured: None,
        })
    }

    /// Only fire on transcripts from `role`.
    pub fn for_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

/// A captured request that is only punctuation is a false positive
/// ("Hey Garbo," with nothing after it).
fn meaningful(tail: &str) -> bool {
    tail.chars().any(|c| c.is_alphanumeric())
}

impl Trigger for WakePhraseTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&mut self, ctx: &TriggerContext) -> Option<TriggerAction> {
        let transcript = ctx.transcript.as_deref()?.trim();
        if let Some(wanted) = self.role
            && ctx.role != Some(wanted)
        {
            return None;
        }
        for prefix in &self.prefixes {
            let Some(matched) = prefix.find(transcript) else {
                continue;
            };
            if matched.start() != 0 {
                continue;
            }
            let tail = transcript[matched.end()..]
                .trim_start_matches([',', ':', '!', '.', ' '])
                .trim();
            if !meaningful(tail) {
                return None;
            }
            self.captured = Some(tail.to_owned());
            return Some(TriggerAction::Wake);
        }
        None
    }

    fn payload(&self) -> TriggerPayload {
        match &self.captured {
            Some(text) => TriggerPayload::Text(text.clone()),
            None => TriggerPayload::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(text: &str) -> TriggerContext {
        TriggerContext::transcript(text, Role::Caller)
    }

    #[test]
    fn captures_the_request_after_the_phrase() {
        let mut trigger = WakePhraseTrigger::new("Garbo").expect("patterns");
        assert_eq!(
            trigger.check(&ctx("Hey Garbo, send a text to mom")),
            Some(TriggerAction::Wake)
        );
        assert_eq!(
            trigger.payload(),
            TriggerPayload::Text("send a text to mom".to_owned())
        );
    }

    #[test]
    fn bare_phrase_does_not_fire() {
        let mut trigger = WakePhraseTrigger::new("Garbo").expect("patterns");
        assert_eq!(trigger.check(&ctx("Hey Garbo,")), None);
        assert_eq!(trigger.check(&ctx("Hey Garbo, ...")), None);
    }

    #[test]
    fn phrase_must_anchor_at_the_start() {
        let mut trigger = WakePhraseTrigger::new("Garbo").expect("patterns");
        assert_eq!(
            trigger.check(&ctx("I was telling hey Garbo stories all day")),
            None
        );
    }

    #[test]
    fn alternate_prefixes_work() {
        let mut trigger = WakePhraseTrigger::new("Garbo").expect("patterns");
        assert_eq!(
            trigger.check(&ctx("Okay Garbo what's the weather")),
            Some(TriggerAction::Wake)
        );
        assert_eq!(
            trigger.payload(),
            TriggerPayload::Text("what's the weather".to_owned())
        );
    }

    #[test]
    fn role_filter_applies() {
        let mut trigger = WakePhraseTrigger::new("Garbo")
            .expect("patterns")
            .for_role(Role::Caller);
        let agent_ctx = TriggerContext::transcript("Hey Garbo, do something", Role::Agent);
        assert_eq!(trigger.check(&agent_ctx), None);
    }
}
