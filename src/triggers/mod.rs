//! Conversational triggers.
//!
//! Triggers watch the live transcript and tool stream and decide when the
//! session should act: hang up on a farewell, prompt after silence, hand a
//! tool call to the assistant, or capture a wake-phrase request. The
//! manager runs every enabled trigger against a context snapshot and
//! reports what fired; the session's event loop is the only dispatcher,
//! so trigger state never needs its own locking.

pub mod delegate;
pub mod farewell;
pub mod silence;
pub mod wake;

use std::collections::HashSet;

use tokio::time::Instant;

use crate::llm::Role;

pub use delegate::{DelegateTrigger, ToolPayload};
pub use farewell::FarewellTrigger;
pub use silence::SilenceTrigger;
pub use wake::WakeTrigger;

/// What a fired trigger asks the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Wind the call down (farewell keyword or silence).
    Hangup,
    /// Hand the request to the delegation assistant.
    Delegate,
    /// A wake-phrase request was captured for out-of-band handling.
    Capture,
}

/// Data a trigger publishes alongside its action.
#[derive(Debug, Clone)]
pub enum TriggerPayload {
    /// The substring a pattern trigger matched.
    Match(String),
    /// Text captured after a wake-phrase prefix.
    Capture(String),
    /// A parsed tool invocation.
    Tool {
        payload: ToolPayload,
        call_id: Option<String>,
    },
}

/// Snapshot of conversation state offered to triggers. All fields are
/// optional; each trigger reads what it needs.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub transcript: Option<String>,
    pub role: Option<Role>,
    pub last_response_at: Option<Instant>,
    pub is_speaking: bool,
    pub tool_name: Option<String>,
    pub tool_arguments: Option<String>,
    pub tool_call_id: Option<String>,
}

impl TriggerContext {
    /// Context for a completed utterance.
    pub fn transcript(text: &str, role: Role) -> Self {
        Self {
            transcript: Some(text.to_string()),
            role: Some(role),
            ..Default::default()
        }
    }

    /// Context for a tool invocation.
    pub fn tool(name: &str, arguments: &str, call_id: Option<&str>) -> Self {
        Self {
            tool_name: Some(name.to_string()),
            tool_arguments: Some(arguments.to_string()),
            tool_call_id: call_id.map(str::to_string),
            ..Default::default()
        }
    }

    /// Context for the periodic silence check.
    pub fn timing(last_response_at: Option<Instant>, is_speaking: bool) -> Self {
        Self {
            last_response_at,
            is_speaking,
            ..Default::default()
        }
    }
}

/// One conversational trigger.
pub trait Trigger: Send {
    fn name(&self) -> &str;

    fn action(&self) -> Action;

    /// Inspect the context; return true when the trigger fires. Triggers
    /// may update private match state here.
    fn check(&mut self, ctx: &TriggerContext) -> bool;

    /// One-shot triggers fire at most once per arm cycle.
    fn once(&self) -> bool {
        false
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Data published for the most recent fire.
    fn payload(&self) -> Option<TriggerPayload> {
        None
    }
}

/// A fired trigger, as reported to the session.
#[derive(Debug)]
pub struct Firing {
    pub trigger: String,
    pub action: Action,
    pub payload: Option<TriggerPayload>,
}

/// Ordered trigger list with one-shot bookkeeping.
#[derive(Default)]
pub struct TriggerManager {
    triggers: Vec<Box<dyn Trigger>>,
    fired: HashSet<(String, Action)>,
}

impl TriggerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, trigger: impl Trigger + 'static) {
        self.triggers.push(Box::new(trigger));
    }

    /// Run every enabled trigger against `ctx` and collect what fired.
    ///
    /// A one-shot trigger whose `(name, action)` pair already fired is
    /// skipped until `reset`.
    pub fn check(&mut self, ctx: &TriggerContext) -> Vec<Firing> {
        let mut firings = Vec::new();
        for trigger in &mut self.triggers {
            if !trigger.enabled() || !trigger.check(ctx) {
                continue;
            }
            let key = (trigger.name().to_string(), trigger.action());
            if trigger.once() && self.fired.contains(&key) {
                continue;
            }
            self.fired.insert(key);
            firings.push(Firing {
                trigger: trigger.name().to_string(),
                action: trigger.action(),
                payload: trigger.payload(),
            });
        }
        firings
    }

    /// Re-arm one-shot triggers; called whenever the caller speaks.
    pub fn reset(&mut self) {
        self.fired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFire {
        once: bool,
    }

    impl Trigger for AlwaysFire {
        fn name(&self) -> &str {
            "always"
        }
        fn action(&self) -> Action {
            Action::Hangup
        }
        fn check(&mut self, _ctx: &TriggerContext) -> bool {
            true
        }
        fn once(&self) -> bool {
            self.once
        }
    }

    #[test]
    fn one_shot_fires_once_until_reset() {
        let mut manager = TriggerManager::new();
        manager.add(AlwaysFire { once: true });
        let ctx = TriggerContext::default();

        assert_eq!(manager.check(&ctx).len(), 1);
        assert!(manager.check(&ctx).is_empty(), "one-shot must not refire");

        manager.reset();
        assert_eq!(manager.check(&ctx).len(), 1, "reset re-arms");
    }

    #[test]
    fn repeatable_triggers_keep_firing() {
        let mut manager = TriggerManager::new();
        manager.add(AlwaysFire { once: false });
        let ctx = TriggerContext::default();

        assert_eq!(manager.check(&ctx).len(), 1);
        assert_eq!(manager.check(&ctx).len(), 1);
    }
}
