//! Store configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use store_lib::StoreConfig;

/// Binary configuration, read from `STORE_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON file seeding the declared state (required)
    pub declared_state_path: String,

    /// Buffer of the pod update listener used for logging
    #[serde(default = "default_pod_listener_buffer")]
    pub pod_listener_buffer: usize,

    /// Buffer of the probe notification channel
    #[serde(default = "default_probe_channel_buffer")]
    pub probe_channel_buffer: usize,

    /// Readiness poll interval during startup, in milliseconds
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    #[serde(default = "default_instance")]
    pub instance: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_pod_listener_buffer() -> usize {
    256
}

fn default_probe_channel_buffer() -> usize {
    1024
}

fn default_ready_poll_interval() -> u64 {
    200
}

fn default_instance() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "app-runtime-store".to_string())
}

impl AppConfig {
    /// Load configuration from the environment
    ///
    /// Fails when the declared state path is missing or a value does not parse.
    pub fn load() -> Result<Self> {
        Self::from_env(config::Environment::with_prefix("STORE"))
    }

    fn from_env(env: config::Environment) -> Result<Self> {
        let config = config::Config::builder().add_source(env).build()?;
        let config: Self = config
            .try_deserialize()
            .context("Invalid STORE_* configuration")?;
        if config.declared_state_path.trim().is_empty() {
            anyhow::bail!("STORE_DECLARED_STATE_PATH must name the declared state file");
        }
        Ok(config)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            probe_channel_buffer: self.probe_channel_buffer,
            ready_poll_interval: Duration::from_millis(self.ready_poll_interval_ms),
            instance: self.instance.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("STORE").source(Some(source))
    }

    #[test]
    fn test_defaults_with_declared_state() {
        let config = AppConfig::from_env(env(&[("STORE_DECLARED_STATE_PATH", "/etc/store/state.json")]))
            .unwrap();
        assert_eq!(config.declared_state_path, "/etc/store/state.json");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.store_config().probe_channel_buffer, 1024);
    }

    #[test]
    fn test_missing_declared_state_is_an_error() {
        assert!(AppConfig::from_env(env(&[])).is_err());
        assert!(AppConfig::from_env(env(&[("STORE_DECLARED_STATE_PATH", " ")])).is_err());
    }

    #[test]
    fn test_invalid_value_is_not_replaced_by_defaults() {
        let result = AppConfig::from_env(env(&[
            ("STORE_DECLARED_STATE_PATH", "/etc/store/state.json"),
            ("STORE_API_PORT", "abc"),
        ]));
        assert!(result.is_err());
    }
}
