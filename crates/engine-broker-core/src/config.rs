//! Broker configuration.
//!
//! Defaults cover a typical deployment; `BrokerConfig::from_env` overlays
//! `ENGINE_BROKER_*` variables (durations in milliseconds).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of all environment overrides.
pub const ENV_PREFIX: &str = "ENGINE_BROKER_";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

/// Transport timing and reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Deadline for every call.
    pub request_timeout: Duration,
    /// Deadline for opening the socket.
    pub connect_timeout: Duration,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Attempts before giving up and reporting a terminal suspension.
    pub max_reconnect_attempts: u32,
    /// Reconnect automatically after an unexpected drop.
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            auto_reconnect: true,
        }
    }
}

impl TransportConfig {
    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.reconnect_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.reconnect_max_delay)
    }
}

/// Context manager policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How often the eviction pass runs.
    pub eviction_interval: Duration,
    /// Idle time after which a context is evicted.
    pub inactivity_timeout: Duration,
    /// Also delete a context's snapshots when the context is deleted.
    pub purge_snapshots_on_delete: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            eviction_interval: Duration::from_secs(5 * 60),
            inactivity_timeout: Duration::from_secs(30 * 60),
            purge_snapshots_on_delete: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub transport: TransportConfig,
    pub manager: ManagerConfig,
}

impl BrokerConfig {
    /// Defaults overlaid with `ENGINE_BROKER_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let t = &mut config.transport;
        let m = &mut config.manager;

        overlay_millis(&lookup, "REQUEST_TIMEOUT_MS", &mut t.request_timeout)?;
        overlay_millis(&lookup, "CONNECT_TIMEOUT_MS", &mut t.connect_timeout)?;
        overlay_millis(&lookup, "RECONNECT_BASE_DELAY_MS", &mut t.reconnect_base_delay)?;
        overlay_millis(&lookup, "RECONNECT_MAX_DELAY_MS", &mut t.reconnect_max_delay)?;
        overlay_parsed(&lookup, "MAX_RECONNECT_ATTEMPTS", &mut t.max_reconnect_attempts)?;
        overlay_parsed(&lookup, "AUTO_RECONNECT", &mut t.auto_reconnect)?;
        overlay_millis(&lookup, "EVICTION_INTERVAL_MS", &mut m.eviction_interval)?;
        overlay_millis(&lookup, "INACTIVITY_TIMEOUT_MS", &mut m.inactivity_timeout)?;
        overlay_parsed(&lookup, "PURGE_SNAPSHOTS_ON_DELETE", &mut m.purge_snapshots_on_delete)?;

        Ok(config)
    }
}

fn overlay_parsed<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let var = format!("{ENV_PREFIX}{name}");
    if let Some(value) = lookup(&var) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value })?;
    }
    Ok(())
}

fn overlay_millis<F>(lookup: &F, name: &str, slot: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis: u64 = u64::try_from(slot.as_millis()).unwrap_or(u64::MAX);
    overlay_parsed(lookup, name, &mut millis)?;
    *slot = Duration::from_millis(millis);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.transport.request_timeout, Duration::from_secs(30));
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.manager.eviction_interval, Duration::from_secs(300));
        assert_eq!(config.manager.inactivity_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let config = TransportConfig::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(config.reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ENGINE_BROKER_REQUEST_TIMEOUT_MS", "5000"),
            ("ENGINE_BROKER_MAX_RECONNECT_ATTEMPTS", "2"),
            ("ENGINE_BROKER_AUTO_RECONNECT", "false"),
        ]);
        let config =
            BrokerConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.transport.request_timeout, Duration::from_secs(5));
        assert_eq!(config.transport.max_reconnect_attempts, 2);
        assert!(!config.transport.auto_reconnect);
        assert_eq!(config.manager, ManagerConfig::default());
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let err = BrokerConfig::from_lookup(|k| {
            (k == "ENGINE_BROKER_EVICTION_INTERVAL_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("ENGINE_BROKER_EVICTION_INTERVAL_MS"));
    }
}
