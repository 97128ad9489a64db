//! Caller-silence trigger.

use tokio::time::Instant;

use super::{Action, Trigger, TriggerContext};

/// Default silence window before the trigger fires.
const DEFAULT_TIMEOUT_SECS: f64 = 10.0;

/// Fires when nothing has happened for too long after the agent's last
/// response. Resets whenever the agent is mid-playout, and does nothing
/// until a first response has established a reference time.
pub struct SilenceTrigger {
    name: String,
    timeout_secs: f64,
    pub enabled: bool,
    last_silence_secs: f64,
}

impl SilenceTrigger {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(timeout_secs: f64) -> Self {
        Self {
            name: "silence".to_string(),
            timeout_secs,
            enabled: true,
            last_silence_secs: 0.0,
        }
    }

    /// Most recent computed silence duration, for stats logging.
    #[allow(dead_code)]
    pub fn last_silence_secs(&self) -> f64 {
        self.last_silence_secs
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

    fn action(&self) -> Action {
        Action::Hangup
    }

    fn check(&mut self, ctx: &TriggerContext) -> bool {
        if ctx.is_speaking {
            self.last_silence_secs = 0.0;
            return false;
        }
        let Some(last_response_at) = ctx.last_response_at else {
            return false;
        };
        let silence = Instant::now()
            .saturating_duration_since(last_response_at)
            .as_secs_f64();
        self.last_silence_secs = silence;
        silence > self.timeout_secs
    }

    fn once(&self) -> bool {
        true
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_after_timeout() {
        let mut trigger = SilenceTrigger::with_timeout(5.0);
        let ctx = TriggerContext::timing(Some(Instant::now() - Duration::from_secs(10)), false);
        assert!(trigger.check(&ctx));
        assert!(trigger.last_silence_secs() >= 10.0);
    }

    #[test]
    fn speaking_resets_the_counter() {
        let mut trigger = SilenceTrigger::with_timeout(5.0);
        let ctx = TriggerContext::timing(Some(Instant::now() - Duration::from_secs(10)), true);
        assert!(!trigger.check(&ctx));
        assert_eq!(trigger.last_silence_secs(), 0.0);
    }

    #[test]
    fn quiet_below_timeout_does_not_fire() {
        let mut trigger = SilenceTrigger::with_timeout(5.0);
        let ctx = TriggerContext::timing(Some(Instant::now() - Duration::from_secs(2)), false);
        assert!(!trigger.check(&ctx));
    }

    #[test]
    fn no_reference_time_means_no_fire() {
        let mut trigger = SilenceTrigger::with_timeout(5.0);
        let ctx = TriggerContext::timing(None, false);
        assert!(!trigger.check(&ctx));
    }
}
