//! Configuration resolution for the `UniScan` server processes.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/uniscan/settings.json`)
//! 3. Environment variables (`UNISCAN_*`)
//! 4. CLI arguments (highest priority, applied by each binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Poll intervals below this are clamped.
pub const MIN_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchPolicy,
}

/// Gateway-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Lifetime of a pairing code+PIN (seconds).
    pub pairing_ttl_secs: u64,
    /// Wrong-PIN attempts tolerated before the challenge is discarded.
    pub max_pin_failures: u32,
    /// Suffix key sent with every `deliverBarcode` (`Enter`, `Tab` or `None`).
    pub suffix_key: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pairing_ttl_secs: 300,
            max_pin_failures: 5,
            suffix_key: "Enter".to_string(),
        }
    }
}

impl GatewayConfig {
    pub const fn pairing_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_ttl_secs)
    }
}

/// Server-side dispatch retry policy.
///
/// This governs network redelivery only. Local input retries on the agent
/// have their own, unrelated policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchPolicy {
    /// How long a claimed delivery stays leased to one scheduler.
    pub lease_ms: u64,
    /// How long a `sent` delivery may wait for an ack before it is re-leased.
    pub ack_timeout_ms: u64,
    /// Cap on server dispatch attempts per delivery.
    pub max_attempts: i64,
    pub poll_interval_ms: u64,
    /// Concurrent dispatches per scheduler instance.
    pub concurrency: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            ack_timeout_ms: 3_000,
            max_attempts: 5,
            poll_interval_ms: 1_000,
            concurrency: 2,
        }
    }
}

impl DispatchPolicy {
    pub const fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::InvalidPolicy("max_attempts must be at least 1".into()));
        }
        if self.lease_ms <= self.ack_timeout_ms {
            return Err(Error::InvalidPolicy(format!(
                "lease_ms ({}) must exceed ack_timeout_ms ({})",
                self.lease_ms, self.ack_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit_path` replaces the global file lookup when given; a missing
/// explicit file is an error, a missing global file is not.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    match explicit_path {
        Some(path) => merge_config(&mut config, load_config_file(path)?),
        None => {
            if let Some(global_path) = global_config_path() {
                if global_path.exists() {
                    merge_config(&mut config, load_config_file(&global_path)?);
                }
            }
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.dispatch.validate()?;

    Ok(config)
}

/// Global settings file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("uniscan").join("settings.json"))
}

/// Default location of the shared `SQLite` database.
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("uniscan")
        .join("uniscan.db")
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::ReadSettings {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::ParseSettings {
        path: path.display().to_string(),
        source,
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.gateway = overlay.gateway;
    base.dispatch = overlay.dispatch;
}

/// Apply `UNISCAN_*` overrides. Unparseable values are ignored.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        var: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        var(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(n) = parsed(&var, "UNISCAN_PAIRING_TTL_SECS") {
        config.gateway.pairing_ttl_secs = n;
    }
    if let Some(n) = parsed(&var, "UNISCAN_MAX_PIN_FAILURES") {
        config.gateway.max_pin_failures = n;
    }
    if let Some(key) = var("UNISCAN_SUFFIX_KEY") {
        config.gateway.suffix_key = key;
    }
    if let Some(n) = parsed(&var, "UNISCAN_LEASE_MS") {
        config.dispatch.lease_ms = n;
    }
    if let Some(n) = parsed(&var, "UNISCAN_ACK_TIMEOUT_MS") {
        config.dispatch.ack_timeout_ms = n;
    }
    if let Some(n) = parsed(&var, "UNISCAN_MAX_ATTEMPTS") {
        config.dispatch.max_attempts = n;
    }
    if let Some(n) = parsed(&var, "UNISCAN_POLL_MS") {
        config.dispatch.poll_interval_ms = n;
    }
    if let Some(n) = parsed(&var, "UNISCAN_CONCURRENCY") {
        config.dispatch.concurrency = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_dispatch_policy() {
        let p = DispatchPolicy::default();
        assert_eq!(p.lease(), Duration::from_secs(30));
        assert_eq!(p.ack_timeout(), Duration::from_secs(3));
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.concurrency(), 2);
        p.validate().unwrap();
    }

    #[test]
    fn poll_interval_is_clamped() {
        let p = DispatchPolicy {
            poll_interval_ms: 10,
            ..DispatchPolicy::default()
        };
        assert_eq!(p.poll_interval(), Duration::from_millis(MIN_POLL_INTERVAL_MS));
    }

    #[test]
    fn lease_must_outlast_ack_timeout() {
        let p = DispatchPolicy {
            lease_ms: 1_000,
            ack_timeout_ms: 3_000,
            ..DispatchPolicy::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"dispatch":{"concurrency":8}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.dispatch.concurrency, 8);
        assert_eq!(config.dispatch.lease_ms, 30_000);
        assert_eq!(config.gateway.pairing_ttl_secs, 300);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::ParseSettings { .. })));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("UNISCAN_MAX_ATTEMPTS", "7"),
            ("UNISCAN_CONCURRENCY", "lots"),
            ("UNISCAN_SUFFIX_KEY", "Tab"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.dispatch.max_attempts, 7);
        assert_eq!(config.dispatch.concurrency, 2);
        assert_eq!(config.gateway.suffix_key, "Tab");
    }
}
