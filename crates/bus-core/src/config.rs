//! Configuration for the bus daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. `$BUS_CONFIG` (explicit override)
//!   2. `$XDG_CONFIG_HOME/bus/config.toml`
//!   3. `~/.config/bus/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub listen: ListenConfig,
    pub limits: LimitsConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Unix domain socket path the daemon binds and listens on.
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// How often the event loop retries dispatch after an OOM
    /// back-off, in milliseconds.
    pub oom_retry_interval_ms: u64,
    /// Maximum outgoing bytes queued per connection before it is
    /// considered unresponsive and disconnected.
    pub max_outgoing_bytes: usize,
    /// Maximum match rules a single connection may register.
    pub max_match_rules: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// If true, any connection may own any well-known name and send to
    /// any destination. Mirrors a permissive default policy; a real
    /// deployment would load an allow-list here instead.
    pub allow_all: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            limits: LimitsConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            socket_path: runtime_dir().join("bus.sock"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            oom_retry_interval_ms: 500,
            max_outgoing_bytes: 64 * 1024 * 1024,
            max_match_rules: 256,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { allow_all: true }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("bus")
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

impl BusConfig {
    /// Load config: env vars → file → defaults. Missing file is not an
    /// error; defaults apply.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BusConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("BUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BUS_LISTEN__SOCKET_PATH") {
            self.listen.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BUS_LIMITS__OOM_RETRY_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.limits.oom_retry_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("BUS_POLICY__ALLOW_ALL") {
            self.policy.allow_all = v == "true" || v == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_permissive_and_local() {
        let config = BusConfig::default();
        assert!(config.policy.allow_all);
        assert_eq!(config.limits.oom_retry_interval_ms, 500);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("bus-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("BUS_CONFIG", config_path.to_str().unwrap());
        }

        let path = BusConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = BusConfig::load().expect("load should succeed");
        assert!(config.policy.allow_all);

        unsafe {
            std::env::remove_var("BUS_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
