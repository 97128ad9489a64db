//! Configuration: settings file, credentials, and agent profiles.

pub mod paths;

use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::settings_path;

/// Default realtime voice endpoint (model selected by query parameter).
const DEFAULT_REALTIME_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview";

/// Default chat-completions endpoint for the local pipeline and the
/// delegation assistant.
const DEFAULT_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Small text-only model for the local pipeline's replies.
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// Where the out-of-process SIP user agent listens for control commands.
const DEFAULT_SIP_CONTROL: &str = "127.0.0.1:9060";

/// settings.json shape. Everything is optional; env and defaults fill
/// the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub realtime_url: Option<String>,
    #[serde(default)]
    pub chat_url: Option<String>,
    #[serde(default)]
    pub chat_model: Option<String>,
    #[serde(default)]
    pub sip_control: Option<String>,
    #[serde(default)]
    pub sip_server: Option<String>,
    #[serde(default)]
    pub stt_command: Option<Vec<String>>,
    #[serde(default)]
    pub tts_command: Option<Vec<String>>,
    #[serde(default)]
    pub transcript_dir: Option<PathBuf>,
    #[serde(default)]
    pub greeting: Option<String>,
}

/// Read settings.json from the data directory; missing file is fine.
pub fn read_settings() -> Settings {
    let path = settings_path();
    match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                Settings::default()
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            Settings::default()
        }
    }
}

impl Settings {
    pub fn backend_name(&self) -> &str {
        self.backend.as_deref().unwrap_or("realtime")
    }

    pub fn realtime_url(&self) -> &str {
        self.realtime_url.as_deref().unwrap_or(DEFAULT_REALTIME_URL)
    }

    pub fn chat_url(&self) -> &str {
        self.chat_url.as_deref().unwrap_or(DEFAULT_CHAT_URL)
    }

    pub fn chat_model(&self) -> &str {
        self.chat_model.as_deref().unwrap_or(DEFAULT_CHAT_MODEL)
    }

    pub fn sip_control(&self) -> &str {
        self.sip_control.as_deref().unwrap_or(DEFAULT_SIP_CONTROL)
    }

    /// The SIP registrar for dial URIs. Required; no sane default.
    pub fn sip_server(&self) -> Result<&str> {
        self.sip_server
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("sip_server is not configured"))
    }
}

/// Credentials come from the environment, never the settings file.
pub fn api_key() -> Result<String> {
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => bail!("OPENAI_API_KEY is not set"),
    }
}

/// An agent persona: who answers the phone.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    pub voice: String,
    pub instructions: String,
}

impl AgentProfile {
    /// Look up a built-in profile by name.
    pub fn named(profile: &str) -> Result<Self> {
        match profile {
            "garbo" => Ok(Self::new(
                "Garbo",
                "alloy",
                "You are a warm, witty personal assistant on a phone call. \
                 Keep replies short and conversational, one or two sentences at most. \
                 Never mention that you are an AI unless asked directly.",
            )),
            "concierge" => Ok(Self::new(
                "Sam",
                "echo",
                "You are a calm, professional concierge taking a phone call. \
                 Be brief, courteous, and concrete. Offer to take a message \
                 when you cannot help directly.",
            )),
            other => bail!("Unknown agent profile: {}", other),
        }
    }

    pub fn new(name: &str, voice: &str, instructions: &str) -> Self {
        let profile = Self {
            name: name.to_string(),
            voice: voice.to_string(),
            instructions: String::new(),
        };
        profile.with_instructions(instructions)
    }

    /// Replace the instructions, keeping the persona's name and voice.
    /// The name is always prepended so the agent introduces itself
    /// consistently regardless of the override text.
    pub fn with_instructions(&self, instructions: &str) -> Self {
        Self {
            name: self.name.clone(),
            voice: self.voice.clone(),
            instructions: format!("Your name is {}. {}", self.name, instructions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_resolve() {
        let profile = AgentProfile::named("garbo").unwrap();
        assert_eq!(profile.name, "Garbo");
        assert!(profile.instructions.starts_with("Your name is Garbo. "));
    }

    #[test]
    fn unknown_profile_is_an_error() {
        assert!(AgentProfile::named("nobody").is_err());
    }

    #[test]
    fn instruction_override_preserves_name_and_voice() {
        let profile = AgentProfile::named("garbo").unwrap();
        let overridden = profile.with_instructions("Speak only in haiku.");
        assert_eq!(overridden.name, profile.name);
        assert_eq!(overridden.voice, profile.voice);
        assert_eq!(
            overridden.instructions,
            "Your name is Garbo. Speak only in haiku."
        );
    }

    #[test]
    fn settings_defaults_apply() {
        let settings = Settings::default();
        assert_eq!(settings.backend_name(), "realtime");
        assert!(settings.realtime_url().starts_with("wss://"));
        assert!(settings.sip_server().is_err());
    }
}
