//! Delegation tool-call trigger.

use super::{Trigger, TriggerAction, TriggerContext, TriggerPayload};

/// Fires when the backend invokes the delegation tool, capturing its parsed
/// arguments and call id for the assistant round-trip.
pub struct DelegateTrigger {
    name: String,
    tool: String,
    payload: TriggerPayload,
    call_id: Option<String>,
}

impl DelegateTrigger {
    /// Trigger on the default `classify_intent` tool.
    pub fn new() -> Self {
        Self::for_tool("classify_intent")
    }

    /// Trigger on a specific tool name.
    pub fn for_tool(tool: &str) -> Self {
        Self {
            name: "delegate".to_owned(),
            tool: tool.to_owned(),
            payload: TriggerPayload::Empty,
            call_id: None,
        }
    }

    /// The call id captured on the last fire.
    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }
}

impl Default for DelegateTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for DelegateTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&mut self, ctx: &TriggerContext) -> Option<TriggerAction> {
        if ctx.tool_name.as_deref() != Some(self.tool.as_str()) {
            return None;
        }
        self.payload = parse_arguments(ctx.tool_arguments.as_deref());
        self.call_id = ctx.tool_call_id.clone();
        Some(TriggerAction::Delegate)
    }

    fn payload(&self) -> TriggerPayload {
        self.payload.clone()
    }
}

/// Tool arguments arrive as untyped JSON text; anything that is not an
/// object is preserved verbatim rather than guessed at.
fn parse_arguments(arguments: Option<&str>) -> TriggerPayload {
    let Some(text) = arguments else {
        return TriggerPayload::Empty;
    };
    if text.trim().is_empty() {
        return TriggerPayload::Empty;
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => TriggerPayload::Parsed(map),
        Ok(serde_json::Value::Null) => TriggerPayload::Empty,
        _ => TriggerPayload::Raw(text.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_arguments_and_stores_call_id() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext::tool_call(
            "classify_intent",
            r#"{"intent":"x","request":"y"}"#,
            "c1",
        );
        assert_eq!(trigger.check(&ctx), Some(TriggerAction::Delegate));
        let payload = trigger.payload();
        assert_eq!(payload.get_str("intent"), Some("x"));
        assert_eq!(payload.get_str("request"), Some("y"));
        assert_eq!(trigger.call_id(), Some("c1"));
    }

    #[test]
    fn non_json_arguments_become_raw() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext::tool_call("classify_intent", "not json at all", "c2");
        assert_eq!(trigger.check(&ctx), Some(TriggerAction::Delegate));
        assert_eq!(
            trigger.payload(),
            TriggerPayload::Raw("not json at all".to_owned())
        );
    }

    #[test]
    fn missing_arguments_become_empty() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext {
            tool_name: Some("classify_intent".to_owned()),
            tool_call_id: Some("c3".to_owned()),
            ..TriggerContext::default()
        };
        assert_eq!(trigger.check(&ctx), Some(TriggerAction::Delegate));
        assert_eq!(trigger.payload(), TriggerPayload::Empty);
    }

    #[test]
    fn other_tools_do_not_fire() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext::tool_call("weather", "{}", "c4");
        assert_eq!(trigger.check(&ctx), None);
    }

    #[test]
    fn repeats_across_calls() {
        let mut trigger = DelegateTrigger::new();
        assert!(!trigger.one_shot());
        let ctx = TriggerContext::tool_call("classify_intent", "{}", "c5");
        assert_eq!(trigger.check(&ctx), Some(TriggerAction::Delegate));
        assert_eq!(trigger.check(&ctx), Some(TriggerAction::Delegate));
    }
}
