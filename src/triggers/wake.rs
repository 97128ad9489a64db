//! Wake-phrase request capture.

use regex::Regex;

use crate::llm::Role;

use super::{Action, Trigger, TriggerContext, TriggerPayload};

/// Captures the text after a wake-phrase prefix, e.g.
/// "Hey Garbo, send a text to mom" → "send a text to mom".
pub struct WakeTrigger {
    name: String,
    prefixes: Vec<Regex>,
    role: Option<Role>,
    pub enabled: bool,
    last_capture: Option<String>,
}

impl WakeTrigger {
    /// Build from literal prefixes, matched case-insensitively at the
    /// start of a transcript.
    pub fn new(prefixes: &[&str]) -> Self {
        let prefixes = prefixes
            .iter()
            .map(|p| {
                Regex::new(&format!(r"^\s*(?i){}", regex::escape(p)))
                    .expect("escaped literal is a valid pattern")
            })
            .collect();
        Self {
            name: "wake".to_string(),
            prefixes,
            role: None,
            enabled: true,
            last_capture: None,
        }
    }

    pub fn for_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

impl Trigger for WakeTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        Action::Capture
    }

    fn check(&mut self, ctx: &TriggerContext) -> bool {
        let Some(transcript) = &ctx.transcript else {
            return false;
        };
        if let Some(want) = self.role {
            if ctx.role != Some(want) {
                return false;
            }
        }
        for prefix in &self.prefixes {
            let Some(found) = prefix.find(transcript) else {
                continue;
            };
            let tail = transcript[found.end()..]
                .trim_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation());
            // A bare wake phrase with no request is not a capture.
            if tail.is_empty() {
                continue;
            }
            self.last_capture = Some(tail.to_string());
            return true;
        }
        false
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn payload(&self) -> Option<TriggerPayload> {
        self.last_capture.clone().map(TriggerPayload::Capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(trigger: &mut WakeTrigger, text: &str) -> bool {
        trigger.check(&TriggerContext::transcript(text, Role::User))
    }

    #[test]
    fn captures_text_after_prefix() {
        let mut trigger = WakeTrigger::new(&["Hey Garbo"]);
        assert!(check(&mut trigger, "Hey Garbo, send a text to mom"));
        match trigger.payload() {
            Some(TriggerPayload::Capture(text)) => assert_eq!(text, "send a text to mom"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn bare_wake_phrase_does_not_fire() {
        let mut trigger = WakeTrigger::new(&["Hey Garbo"]);
        assert!(!check(&mut trigger, "Hey Garbo,"));
        assert!(!check(&mut trigger, "Hey Garbo!?"));
    }

    #[test]
    fn prefix_must_anchor_at_start() {
        let mut trigger = WakeTrigger::new(&["Hey Garbo"]);
        assert!(!check(&mut trigger, "I said Hey Garbo, call mom"));
    }

    #[test]
    fn match_is_case_insensitive() {
        let mut trigger = WakeTrigger::new(&["Hey Garbo"]);
        assert!(check(&mut trigger, "hey garbo what time is it"));
    }

    #[test]
    fn first_matching_prefix_wins() {
        let mut trigger = WakeTrigger::new(&["Hey Garbo", "Garbo"]);
        assert!(check(&mut trigger, "Garbo play some music"));
        match trigger.payload() {
            Some(TriggerPayload::Capture(text)) => assert_eq!(text, "play some music"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
