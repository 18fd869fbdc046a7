// Runtime tunables for the messaging core.
// Loaded from JSON; every field falls back to its default when absent.

use anyhow::{anyhow, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "CARECHAT_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub max_connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub liveness_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub outbound_queue_capacity: usize,
    pub typing_expiry_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            max_connect_attempts: 3,
            connect_timeout_ms: 10_000,
            backoff_base_ms: 500,
            heartbeat_interval_ms: 25_000,
            liveness_interval_ms: 5_000,
            ack_timeout_ms: 5_000,
            outbound_queue_capacity: 100,
            typing_expiry_ms: 3_000,
        }
    }
}

impl ChatConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before the retry that follows `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt)))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    fn validate(self) -> Result<Self> {
        if self.max_connect_attempts == 0 {
            return Err(anyhow!("max_connect_attempts must be at least 1"));
        }
        if self.heartbeat_interval_ms == 0 || self.liveness_interval_ms == 0 {
            return Err(anyhow!("heartbeat and liveness intervals must be non-zero"));
        }
        Ok(self)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: ChatConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Malformed config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        config.validate()
    }

    /// Resolve the config location: explicit path, then `CARECHAT_CONFIG`, then the user config dir.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }
        Self::load_from(&default_config_path()?)
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("carechat");
    Ok(dir.join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ChatConfig::default();
        assert_eq!(config.max_connect_attempts, 3);
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.liveness_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.typing_expiry(), Duration::from_millis(3000));
    }

    #[test]
    fn test_backoff_is_exponential() {
        let config = ChatConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ack_timeout_ms": 1200, "outbound_queue_capacity": 7}}"#).unwrap();

        let config = ChatConfig::load_from(file.path()).unwrap();
        assert_eq!(config.ack_timeout_ms, 1200);
        assert_eq!(config.outbound_queue_capacity, 7);
        assert_eq!(config.max_connect_attempts, 3);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn test_malformed_and_invalid_files_are_errors() {
        let mut malformed = tempfile::NamedTempFile::new().unwrap();
        write!(malformed, "{{not json").unwrap();
        assert!(ChatConfig::load_from(malformed.path()).is_err());

        let mut invalid = tempfile::NamedTempFile::new().unwrap();
        write!(invalid, r#"{{"max_connect_attempts": 0}}"#).unwrap();
        assert!(ChatConfig::load_from(invalid.path()).is_err());
    }
}
