use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::backoff::ExponentialPollBackoff;
use crate::capabilities::NegotiationSettings;
use crate::orchestrator::OrchestratorSettings;
use crate::retry::RetryPolicy;

/// Client configuration, loadable from TOML. Every field has a default.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    #[serde(default)]
    pub retries: RetrySettings,
    /// Grace for an in-flight call to unwind after cancellation.
    #[serde(default = "default_abandon_grace_ms")]
    pub abandon_grace_ms: u64,
    #[serde(default = "default_complete_abandon_after_ms")]
    pub complete_abandon_after_ms: u64,
    #[serde(default)]
    pub poll_backoff: PollBackoffSettings,
    #[serde(default)]
    pub capabilities: CapabilitySettings,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retry_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_min_remaining_ms")]
    pub min_remaining_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_minimum_attempts")]
    pub minimum_attempts_for_interrupted_calls: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PollBackoffSettings {
    #[serde(default = "default_poll_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub max_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub disabled_services: Vec<String>,
}

impl ClientOptions {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.retries;
        RetryPolicy {
            enabled: r.enabled,
            total_duration: Duration::from_secs(r.duration_secs),
            retry_if_remaining_at_least: Duration::from_millis(r.min_remaining_ms),
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
            minimum_attempts_for_interrupted_calls: r.minimum_attempts_for_interrupted_calls,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            abandon_grace: Duration::from_millis(self.abandon_grace_ms),
            complete_abandon_after: Duration::from_millis(self.complete_abandon_after_ms),
        }
    }

    pub fn poll_backoff(&self) -> ExponentialPollBackoff {
        ExponentialPollBackoff {
            initial: Duration::from_millis(self.poll_backoff.initial_ms),
            max: Duration::from_millis(self.poll_backoff.max_ms),
        }
    }

    pub fn negotiation_settings(&self) -> NegotiationSettings {
        NegotiationSettings {
            enabled: self.capabilities.enabled,
            disabled_services: self
                .capabilities
                .disabled_services
                .iter()
                .cloned()
                .collect::<HashSet<_>>(),
            abandon_after: Duration::from_millis(self.abandon_grace_ms),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retries: RetrySettings::default(),
            abandon_grace_ms: default_abandon_grace_ms(),
            complete_abandon_after_ms: default_complete_abandon_after_ms(),
            poll_backoff: PollBackoffSettings::default(),
            capabilities: CapabilitySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_secs: default_retry_duration_secs(),
            min_remaining_ms: default_min_remaining_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            minimum_attempts_for_interrupted_calls: default_minimum_attempts(),
        }
    }
}

impl Default for PollBackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: default_poll_initial_ms(),
            max_ms: default_poll_max_ms(),
        }
    }
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_services: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_abandon_grace_ms() -> u64 {
    5_000
}

fn default_complete_abandon_after_ms() -> u64 {
    5_000
}

fn default_retry_duration_secs() -> u64 {
    150
}

fn default_min_remaining_ms() -> u64 {
    1_000
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_minimum_attempts() -> u32 {
    1
}

fn default_poll_initial_ms() -> u64 {
    100
}

fn default_poll_max_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let options = ClientOptions::from_toml_str("").unwrap();
        assert_eq!(options, ClientOptions::default());
        let policy = options.retry_policy();
        assert!(policy.enabled);
        assert_eq!(policy.total_duration, Duration::from_secs(150));
        assert_eq!(policy.retry_if_remaining_at_least, Duration::from_secs(1));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let options = ClientOptions::from_toml_str(
            r#"
            abandon_grace_ms = 250

            [retries]
            enabled = false
            duration_secs = 30

            [capabilities]
            disabled_services = ["ScriptServiceV2"]
            "#,
        )
        .unwrap();

        assert_eq!(options.abandon_grace_ms, 250);
        assert!(!options.retries.enabled);
        assert_eq!(options.retries.duration_secs, 30);
        assert_eq!(options.retries.base_delay_ms, 100);
        assert_eq!(options.poll_backoff, PollBackoffSettings::default());
        let negotiation = options.negotiation_settings();
        assert!(negotiation.enabled);
        assert!(negotiation.disabled_services.contains("ScriptServiceV2"));
        assert_eq!(
            options.orchestrator_settings().abandon_grace,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[poll_backoff]\ninitial_ms = 20\nmax_ms = 80\n").unwrap();
        let options = ClientOptions::load(&path).unwrap();
        let backoff = options.poll_backoff();
        assert_eq!(backoff.initial, Duration::from_millis(20));
        assert_eq!(backoff.max, Duration::from_millis(80));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ClientOptions::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
