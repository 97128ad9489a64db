//! Delegation tool-call trigger.

use serde_json::Value;

use super::{Action, Trigger, TriggerContext, TriggerPayload};

/// Tool the agent uses to hand a request off to the assistant.
const DEFAULT_TOOL: &str = "classify_intent";

/// Tool arguments as received: parsed when they were valid JSON, the raw
/// text when not, or nothing at all.
#[derive(Debug, Clone)]
pub enum ToolPayload {
    Parsed(serde_json::Map<String, Value>),
    Raw(String),
    Empty,
}

impl ToolPayload {
    /// Parse the arguments text the backend delivered.
    pub fn parse(arguments: Option<&str>) -> Self {
        let Some(text) = arguments else {
            return Self::Empty;
        };
        if text.trim().is_empty() {
            return Self::Empty;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Self::Parsed(map),
            _ => Self::Raw(text.to_string()),
        }
    }

    /// Look up a string field in a parsed payload.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            Self::Parsed(map) => map.get(key).and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Fires when the backend invokes the configured tool.
pub struct DelegateTrigger {
    name: String,
    tool: String,
    pub enabled: bool,
    last_payload: Option<ToolPayload>,
    last_call_id: Option<String>,
}

impl DelegateTrigger {
    pub fn new() -> Self {
        Self::for_tool(DEFAULT_TOOL)
    }

    pub fn for_tool(tool: &str) -> Self {
        Self {
            name: "delegate".to_string(),
            tool: tool.to_string(),
            enabled: true,
            last_payload: None,
            last_call_id: None,
        }
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

    fn action(&self) -> Action {
        Action::Delegate
    }

    fn check(&mut self, ctx: &TriggerContext) -> bool {
        if ctx.tool_name.as_deref() != Some(self.tool.as_str()) {
            return false;
        }
        self.last_payload = Some(ToolPayload::parse(ctx.tool_arguments.as_deref()));
        self.last_call_id = ctx.tool_call_id.clone();
        true
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn payload(&self) -> Option<TriggerPayload> {
        self.last_payload.clone().map(|payload| TriggerPayload::Tool {
            payload,
            call_id: self.last_call_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_json_arguments_parse_to_fields() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext::tool(
            "classify_intent",
            r#"{"intent":"x","request":"y"}"#,
            Some("c1"),
        );
        assert!(trigger.check(&ctx));

        match trigger.payload() {
            Some(TriggerPayload::Tool { payload, call_id }) => {
                assert_eq!(payload.get("intent"), Some("x"));
                assert_eq!(payload.get("request"), Some("y"));
                assert_eq!(call_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn non_json_arguments_fall_back_to_raw() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext::tool("classify_intent", "not json at all", Some("c2"));
        assert!(trigger.check(&ctx));

        match trigger.payload() {
            Some(TriggerPayload::Tool { payload, .. }) => {
                assert!(matches!(payload, ToolPayload::Raw(ref s) if s == "not json at all"));
                assert_eq!(payload.get("intent"), None);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn missing_arguments_are_empty() {
        assert!(matches!(ToolPayload::parse(None), ToolPayload::Empty));
        assert!(matches!(ToolPayload::parse(Some("")), ToolPayload::Empty));
    }

    #[test]
    fn other_tools_are_ignored() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext::tool("lookup_weather", "{}", None);
        assert!(!trigger.check(&ctx));
    }

    #[test]
    fn refires_on_every_call() {
        let mut trigger = DelegateTrigger::new();
        let ctx = TriggerContext::tool("classify_intent", "{}", Some("c3"));
        assert!(trigger.check(&ctx));
        assert!(trigger.check(&ctx));
        assert!(!trigger.once());
    }
}
