//! Farewell keyword trigger.

use regex::Regex;

use crate::llm::Role;

use super::{Action, Trigger, TriggerContext, TriggerPayload};

/// Phrases that end a phone call.
const DEFAULT_FAREWELLS: &[&str] = &[
    "goodbye",
    "bye",
    "see you later",
    "take care",
    "gotta go",
    "talk to you later",
];

/// Fires when a transcript contains a farewell phrase.
pub struct FarewellTrigger {
    name: String,
    action: Action,
    patterns: Vec<Regex>,
    role: Option<Role>,
    once: bool,
    pub enabled: bool,
    last_match: Option<String>,
}

impl FarewellTrigger {
    /// Word-boundary-anchored, case-insensitive match over the default
    /// farewell phrases.
    pub fn new() -> Self {
        Self::from_words(DEFAULT_FAREWELLS)
    }

    /// Build from a list of literal words or phrases.
    pub fn from_words(words: &[&str]) -> Self {
        let patterns = words
            .iter()
            .map(|w| {
                Regex::new(&format!(r"(?i)\b{}\b", regex::escape(w)))
                    .expect("escaped literal is a valid pattern")
            })
            .collect();
        Self {
            name: "farewell".to_string(),
            action: Action::Hangup,
            patterns,
            role: None,
            once: true,
            enabled: true,
            last_match: None,
        }
    }

    /// Build from a raw regular expression.
    #[allow(dead_code)]
    pub fn from_regex(pattern: &str) -> anyhow::Result<Self> {
        let regex = Regex::new(pattern)?;
        let mut trigger = Self::from_words(&[]);
        trigger.patterns = vec![regex];
        Ok(trigger)
    }

    /// Only fire on transcripts from this role.
    pub fn for_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    #[allow(dead_code)]
    pub fn repeatable(mut self) -> Self {
        self.once = false;
        self
    }
}

impl Default for FarewellTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for FarewellTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        self.action
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
        for pattern in &self.patterns {
            if let Some(found) = pattern.find(transcript) {
                self.last_match = Some(found.as_str().to_string());
                return true;
            }
        }
        false
    }

    fn once(&self) -> bool {
        self.once
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn payload(&self) -> Option<TriggerPayload> {
        self.last_match.clone().map(TriggerPayload::Match)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(trigger: &mut FarewellTrigger, text: &str, role: Role) -> bool {
        trigger.check(&TriggerContext::transcript(text, role))
    }

    #[test]
    fn default_patterns_match_farewells() {
        let mut trigger = FarewellTrigger::new();
        for text in ["Goodbye", "bye", "see you later", "take care", "gotta go"] {
            assert!(check(&mut trigger, text, Role::User), "{:?} should fire", text);
        }
    }

    #[test]
    fn default_patterns_ignore_smalltalk() {
        let mut trigger = FarewellTrigger::new();
        for text in ["hello", "how are you"] {
            assert!(!check(&mut trigger, text, Role::User), "{:?} must not fire", text);
        }
    }

    #[test]
    fn matched_substring_is_published() {
        let mut trigger = FarewellTrigger::new();
        assert!(check(&mut trigger, "Okay, goodbye!", Role::User));
        match trigger.payload() {
            Some(TriggerPayload::Match(m)) => assert_eq!(m.to_lowercase(), "goodbye"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn role_filter_rejects_other_roles() {
        let mut trigger = FarewellTrigger::new().for_role(Role::User);
        assert!(!check(&mut trigger, "goodbye", Role::Assistant));
        assert!(check(&mut trigger, "goodbye", Role::User));
    }

    #[test]
    fn embedded_words_respect_boundaries() {
        let mut trigger = FarewellTrigger::from_words(&["bye"]);
        assert!(!check(&mut trigger, "the byelaws are strict", Role::User));
        assert!(check(&mut trigger, "bye now", Role::User));
    }
}
