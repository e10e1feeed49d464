// ABOUTME: Operator configuration for the orchestrator
// ABOUTME: Capacity ceilings, readiness timing, expiry sweep cadence and URL derivation

use serde::Deserialize;
use std::time::Duration;

use crate::backends::BackendKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fallback backend for labs that do not name one.
    pub default_backend: BackendKind,

    // Capacity
    pub max_instances_per_user: i64,
    pub max_total_instances: i64,

    // Lifecycle
    pub default_session_minutes: i64,
    pub auto_cleanup_on_expiry: bool,

    // Readiness polling
    pub readiness_poll_seconds: u64,
    pub readiness_timeout_seconds: u64,

    // Expiry safety-net sweep
    pub sweep_interval_seconds: u64,

    // Status cache
    pub cache_ttl_seconds: u64,

    /// Host advertised in access URLs for locally provisioned labs.
    pub advertised_host: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::Local,
            max_instances_per_user: 3,
            max_total_instances: 50,
            default_session_minutes: 60,
            auto_cleanup_on_expiry: false,
            readiness_poll_seconds: 2,
            readiness_timeout_seconds: 180,
            sweep_interval_seconds: 60,
            cache_ttl_seconds: 120,
            advertised_host: "127.0.0.1".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_seconds)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.default_backend, BackendKind::Local);
        assert!(config.max_instances_per_user > 0);
        assert!(config.readiness_timeout() > config.readiness_poll());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{ "max_total_instances": 5 }"#).unwrap();
        assert_eq!(config.max_total_instances, 5);
        assert_eq!(
            config.default_session_minutes,
            OrchestratorConfig::default().default_session_minutes
        );
    }
}
