//! Engine configuration.
//!
//! Plain serde structs with documented defaults; every knob can be
//! overridden through `PROXY_POOL_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::rotation::RotationStrategyKind;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Probe target used by the validator.
    pub test_url: String,
    /// Hard deadline for a single probe, in seconds.
    pub validation_timeout_secs: u64,
    /// Per-source fetch deadline, in seconds.
    pub source_timeout_secs: u64,
    /// Concurrency cap for the validation fan-out.
    pub max_concurrent_validations: usize,
    /// Consecutive failures after which a validated proxy is demoted back
    /// to the candidate set.
    pub max_consecutive_failures: u32,
    /// Default number of proxies returned when the caller does not say.
    pub default_count: usize,
    /// Initial rotation strategy.
    pub rotation: RotationStrategyKind,
    /// Session manager limits.
    pub sessions: SessionConfig,
    /// Which discovery sources are enabled.
    pub sources: SourceSelection,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            test_url: "https://www.google.com".to_string(),
            validation_timeout_secs: 10,
            source_timeout_secs: 15,
            max_concurrent_validations: 10,
            max_consecutive_failures: 5,
            default_count: 20,
            rotation: RotationStrategyKind::RoundRobin,
            sessions: SessionConfig::default(),
            sources: SourceSelection::default(),
        }
    }
}

impl PoolConfig {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs.max(1))
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs.max(1))
    }

    /// Applies `PROXY_POOL_*` environment overrides on top of the current
    /// values. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PROXY_POOL_TEST_URL") {
            self.test_url = url;
        }
        override_u64("PROXY_POOL_VALIDATION_TIMEOUT_SECS", &mut self.validation_timeout_secs);
        override_u64("PROXY_POOL_SOURCE_TIMEOUT_SECS", &mut self.source_timeout_secs);
        override_usize("PROXY_POOL_MAX_CONCURRENT_VALIDATIONS", &mut self.max_concurrent_validations);
        override_u32("PROXY_POOL_MAX_CONSECUTIVE_FAILURES", &mut self.max_consecutive_failures);
        override_usize("PROXY_POOL_DEFAULT_COUNT", &mut self.default_count);
        override_usize("PROXY_POOL_MAX_SESSIONS_PER_PROXY", &mut self.sessions.max_sessions_per_proxy);
        override_u64("PROXY_POOL_MAX_SESSION_AGE_SECS", &mut self.sessions.max_session_age_secs);
        override_u64("PROXY_POOL_MAX_SESSION_IDLE_SECS", &mut self.sessions.max_session_idle_secs);
    }
}

/// Session manager limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Active sessions allowed per proxy endpoint before LRU eviction.
    pub max_sessions_per_proxy: usize,
    /// Sessions older than this are expired regardless of activity.
    pub max_session_age_secs: u64,
    /// Sessions idle longer than this are expired.
    pub max_session_idle_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_proxy: 5,
            max_session_age_secs: 1800,
            max_session_idle_secs: 600,
        }
    }
}

/// Enabled discovery sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSelection {
    pub free_proxy_list: bool,
    pub geonode: bool,
    pub proxy_scrape: bool,
    pub proxy_nova: bool,
    pub hide_my_name: bool,
    pub proxy_list_to: bool,
    /// Extra plain-text `ip:port` list endpoints supplied by the host.
    pub custom_urls: Vec<CustomSourceConfig>,
}

impl Default for SourceSelection {
    fn default() -> Self {
        Self {
            free_proxy_list: true,
            geonode: true,
            proxy_scrape: true,
            proxy_nova: true,
            hide_my_name: true,
            proxy_list_to: true,
            custom_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomSourceConfig {
    pub url: String,
    /// Protocol assumed for every entry in the list.
    pub protocol: crate::ProxyProtocol,
}

fn override_u64(var: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("ignoring unparseable {}={}", var, raw),
        }
    }
}

fn override_u32(var: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("ignoring unparseable {}={}", var, raw),
        }
    }
}

fn override_usize(var: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("ignoring unparseable {}={}", var, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = PoolConfig::default();
        assert_eq!(config.test_url, "https://www.google.com");
        assert_eq!(config.validation_timeout_secs, 10);
        assert_eq!(config.source_timeout_secs, 15);
        assert_eq!(config.max_concurrent_validations, 10);
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.sessions.max_sessions_per_proxy, 5);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = PoolConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rotation, config.rotation);
        assert_eq!(back.default_count, config.default_count);
    }
}
