//! Agent configuration.
//!
//! Persists the gateway URL, identity parts and input target to
//! `<config dir>/uniscan/agent.json`. Saves are atomic and keep the previous
//! file as `agent.json.bak`, which `load` falls back to when the main file
//! is unreadable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Window the agent types into. Both matchers are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title_contains: Option<String>,
}

impl TargetWindow {
    /// A target with no matchers means "whatever has focus".
    pub const fn is_configured(&self) -> bool {
        self.process_name.is_some() || self.window_title_contains.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Gateway WebSocket URL.
    pub server_url: String,
    pub group: String,
    pub device_name: String,
    /// Filled from the OS on first run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_window: Option<TargetWindow>,
    /// Used when a delivery does not name a suffix key.
    pub barcode_suffix_key: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:45444/ws".to_string(),
            group: "default".to_string(),
            device_name: crate::identity::device_name(),
            machine_id: None,
            target_window: None,
            barcode_suffix_key: "Enter".to_string(),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

impl AgentConfig {
    /// `<config dir>/uniscan/agent.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("uniscan")
            .join("agent.json")
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(io_err(path))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load from `path`, falling back to its backup and then to defaults.
    pub fn load(path: &Path) -> Self {
        match Self::read(path) {
            Ok(config) => return config,
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Agent config unreadable, trying backup"),
        }
        let backup = backup_path(path);
        match Self::read(&backup) {
            Ok(config) => config,
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Self::default()
            }
            Err(e) => {
                warn!(path = %backup.display(), error = %e, "Agent config backup unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// Write to a temp file, move the current file to `.bak`, then rename
    /// the temp file into place.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
        if path.exists() {
            let backup = backup_path(path);
            std::fs::copy(path, &backup).map_err(io_err(&backup))?;
        }
        std::fs::rename(&tmp, path).map_err(io_err(path))?;
        Ok(())
    }

    /// Fill `machine_id` if missing. Returns whether it changed.
    pub fn ensure_machine_id(&mut self, detect: impl FnOnce() -> String) -> bool {
        if self.machine_id.as_deref().is_some_and(|id| !id.trim().is_empty()) {
            return false;
        }
        self.machine_id = Some(detect());
        true
    }

    /// The id the gateway derives from our hello.
    pub fn pc_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.group,
            self.device_name,
            self.machine_id.as_deref().unwrap_or_default()
        )
    }

    /// Configured window target, if it actually names something.
    pub fn target(&self) -> Option<&TargetWindow> {
        self.target_window.as_ref().filter(|t| t.is_configured())
    }
}

/// Exponential backoff between gateway reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-indexed), doubling up to
    /// the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Local retry schedule for one barcode. Independent of the server's
/// dispatch attempts.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// One entry per attempt: the wait after that attempt fails. The wait
    /// after the final attempt is skipped.
    pub backoff: Vec<Duration>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            backoff: [100, 200, 400, 800, 1600]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

impl ExecutionPolicy {
    pub fn with_attempts(max_attempts: usize, delay: Duration) -> Self {
        Self {
            backoff: vec![delay; max_attempts.max(1)],
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.backoff.len().max(1)
    }

    /// Wait after failed attempt `attempt` (1-indexed); `None` after the last.
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts() {
            return None;
        }
        self.backoff.get(attempt - 1).copied()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("agent.json"));
        assert_eq!(config.group, "default");
        assert_eq!(config.barcode_suffix_key, "Enter");
        assert!(config.machine_id.is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.json");
        let config = AgentConfig {
            server_url: "ws://gw:1/ws".into(),
            machine_id: Some("mid".into()),
            target_window: Some(TargetWindow {
                process_name: Some("notepad.exe".into()),
                window_title_contains: None,
            }),
            ..AgentConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(AgentConfig::load(&path), config);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["serverUrl"], "ws://gw:1/ws");
        assert_eq!(raw["targetWindow"]["processName"], "notepad.exe");
    }

    #[test]
    fn corrupt_file_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        let first = AgentConfig {
            group: "line1".into(),
            ..AgentConfig::default()
        };
        first.save(&path).unwrap();
        let second = AgentConfig {
            group: "line2".into(),
            ..AgentConfig::default()
        };
        second.save(&path).unwrap();

        std::fs::write(&path, "{ truncated").unwrap();
        assert_eq!(AgentConfig::load(&path).group, "line1");
    }

    #[test]
    fn machine_id_is_filled_once() {
        let mut config = AgentConfig::default();
        assert!(config.ensure_machine_id(|| "abc".into()));
        assert!(!config.ensure_machine_id(|| "other".into()));
        assert_eq!(config.machine_id.as_deref(), Some("abc"));
        config.device_name = "PC-01".into();
        assert_eq!(config.pc_id(), "default:PC-01:abc");
    }

    #[test]
    fn empty_target_is_ignored() {
        let config = AgentConfig {
            target_window: Some(TargetWindow::default()),
            ..AgentConfig::default()
        };
        assert!(config.target().is_none());
    }

    #[test]
    fn reconnect_backoff_doubles_to_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|a| u64::try_from(policy.delay_for_attempt(a).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn execution_schedule() {
        let policy = ExecutionPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay_after(5), None);
        assert_eq!(policy.delay_after(0), None);
        assert_eq!(ExecutionPolicy::with_attempts(0, Duration::ZERO).max_attempts(), 1);
    }
}
