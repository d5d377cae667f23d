//! Farewell keyword trigger.

use super::{Role, Trigger, TriggerAction, TriggerContext};
use crate::error::{AgentError, Result};
use regex::Regex;

/// Phrases that end a phone call in ordinary speech.
const DEFAULT_WORDS: &[&str] = &[
    "goodbye",
    "good bye",
    "bye",
    "see you later",
    "take care",
    "gotta go",
    "talk to you later",
];

/// Fires when a transcript matches a farewell pattern.
pub struct FarewellTrigger {
    name: String,
    pattern: Regex,
    role: Option<Role>,
    one_shot: bool,
    last_match: Option<String>,
}

impl FarewellTrigger {
    /// Trigger on the default farewell phrases, any role, one-shot.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in pattern; kept fallible for parity with
    /// the custom constructors.
    pub fn new() -> Result<Self> {
        Self::from_words(DEFAULT_WORDS)
    }

    /// Trigger on any of `words`, each anchored at word boundaries and
    /// matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns a config error if a word breaks the assembled pattern.
    pub fn from_words<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let alternation = words
            .iter()
            .map(|w| regex::escape(w.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        Self::from_regex(&format!(r"(?i)\b(?:{alternation})\b"))
    }

    /// Trigger on a caller-supplied regular expression.
    ///
    /// # Errors
    ///
    /// Returns a config error if the pattern does not compile.
    pub fn from_regex(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AgentError::Config(format!("bad farewell pattern: {e}")))?;
        Ok(Self {
            name: "farewell".to_owned(),
            pattern,
            role: None,
            one_shot: true,
            last_match: None,
        })
    }

    /// Only fire on transcripts from `role`.
    pub fn for_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Allow repeated fires.
    pub fn repeating(mut self) -> Self {
        self.one_shot = false;
        self
    }

    /// The substring that matched on the last fire.
    pub fn last_match(&self) -> Option<&str> {
        self.last_match.as_deref()
    }
}

impl Trigger for FarewellTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn one_shot(&self) -> bool {
        self.one_shot
    }

    fn check(&mut self, ctx: &TriggerContext) -> Option<TriggerAction> {
        let transcript = ctx.transcript.as_deref()?;
        if let Some(wanted) = self.role
            && ctx.role != Some(wanted)
        {
            return None;
        }
        let matched = self.pattern.find(transcript)?;
        self.last_match = Some(matched.as_str().to_owned());
        Some(TriggerAction::Hangup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(text: &str, role: Role) -> TriggerContext {
        TriggerContext::transcript(text, role)
    }

    #[test]
    fn default_patterns_fire_on_farewells() {
        let mut trigger = FarewellTrigger::new().expect("pattern");
        for text in [
            "Goodbye",
            "bye",
            "see you later",
            "take care",
            "gotta go",
            "Okay, goodbye!",
        ] {
            assert_eq!(
                trigger.check(&ctx(text, Role::Caller)),
                Some(TriggerAction::Hangup),
                "{text}"
            );
        }
    }

    #[test]
    fn default_patterns_ignore_small_talk() {
        let mut trigger = FarewellTrigger::new().expect("pattern");
        for text in ["hello", "how are you", "maybe later"] {
            assert_eq!(trigger.check(&ctx(text, Role::Caller)), None, "{text}");
        }
    }

    #[test]
    fn role_filter_ignores_other_roles() {
        let mut trigger = FarewellTrigger::new().expect("pattern").for_role(Role::Caller);
        assert_eq!(trigger.check(&ctx("goodbye", Role::Agent)), None);
        assert_eq!(
            trigger.check(&ctx("goodbye", Role::Caller)),
            Some(TriggerAction::Hangup)
        );
    }

    #[test]
    fn matched_substring_is_stored() {
        let mut trigger = FarewellTrigger::new().expect("pattern");
        trigger.check(&ctx("Okay, goodbye now!", Role::Caller));
        assert_eq!(trigger.last_match(), Some("goodbye"));
    }

    #[test]
    fn word_boundaries_hold() {
        // "bye" inside another word must not fire.
        let mut trigger = FarewellTrigger::from_words(&["bye"]).expect("pattern");
        assert_eq!(trigger.check(&ctx("lullabye music", Role::Caller)), None);
    }
}
