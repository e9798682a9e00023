use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = ".aegis/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AegisConfig {
    pub log_level: String,
    pub audit_db_path: PathBuf,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub base_url: String,
    /// Name of the environment variable holding the panel API key. The key
    /// itself never lands in the config file.
    pub api_key_env: String,
    pub call_timeout_ms: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://panel.example.com".to_string(),
            api_key_env: "AEGIS_PANEL_API_KEY".to_string(),
            call_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sliding inactivity window added to a session's expiry on every
    /// successful validation.
    pub sliding_window_mins: u64,
    pub shards: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sliding_window_mins: 120,
            shards: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    pub ticket_ttl_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ticket_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for idempotent actions. Non-idempotent actions are
    /// always attempted exactly once regardless of this value.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl Default for AegisConfig {
    fn default() -> Self {
        let audit_db_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aegis/audit.db");

        Self {
            log_level: "info".to_string(),
            audit_db_path,
            panel: PanelConfig::default(),
            session: SessionConfig::default(),
            confirmation: ConfirmationConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("config has invalid value: {0}")]
    ValidationFailed(String),
}

impl AegisConfig {
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = env::var("AEGIS_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, raw).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn load_or_create() -> Result<(Self, PathBuf, bool), ConfigError> {
        let path = Self::resolve_path();
        if path.exists() {
            let cfg = Self::load(&path)?;
            return Ok((cfg, path, false));
        }

        let cfg = Self::default();
        cfg.save(&path)?;
        Ok((cfg, path, true))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "log_level cannot be empty".to_string(),
            ));
        }
        if self.panel.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "panel.base_url cannot be empty".to_string(),
            ));
        }
        if self.panel.api_key_env.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "panel.api_key_env cannot be empty".to_string(),
            ));
        }
        if self.panel.call_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "panel.call_timeout_ms must be positive".to_string(),
            ));
        }
        if self.session.shards == 0 {
            return Err(ConfigError::ValidationFailed(
                "session.shards must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.max_attempts must be positive".to_string(),
            ));
        }
        if self.confirmation.ticket_ttl_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "confirmation.ticket_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_toml() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("config.toml");
        let cfg = AegisConfig::default();
        cfg.save(&path).expect("save");
        let loaded = AegisConfig::load(&path).expect("load");
        assert_eq!(loaded.retry.max_attempts, cfg.retry.max_attempts);
        assert_eq!(loaded.panel.base_url, cfg.panel.base_url);
        assert_eq!(
            loaded.confirmation.ticket_ttl_secs,
            cfg.confirmation.ticket_ttl_secs
        );
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        let mut cfg = AegisConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_panel_url() {
        let mut cfg = AegisConfig::default();
        cfg.panel.base_url = "  ".to_string();
        assert!(cfg.validate().is_err());
    }
}
