//! Process configuration, loaded once at startup and handed by value to
//! every component constructor. There is no global mutable singleton here:
//! a [`GatewayConfig`] is just data, and tests build one directly without
//! touching the filesystem.

use crate::gate::GateMapping;
use serde::{Deserialize, Serialize};
use std::path::Path;

const SECRET_KEY_ENV: &str = "GATEKEEPER_SECRET_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write default config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub fetch_endpoint: String,
    pub sync_endpoint: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "http://demotms.example.com/api/".to_string(),
            fetch_endpoint: "bookings/summary".to_string(),
            sync_endpoint: "bookings/update-used".to_string(),
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

impl ApiConfig {
    pub fn fetch_url(&self) -> String {
        join_url(&self.base_url, &self.fetch_endpoint)
    }

    pub fn sync_url(&self) -> String {
        join_url(&self.base_url, &self.sync_endpoint)
    }
}

fn join_url(base: &str, endpoint: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{endpoint}")
    } else {
        format!("{base}/{endpoint}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub fetch_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub fetch_enabled: bool,
    pub sync_enabled: bool,
    pub cleanup_enabled: bool,
    pub skip_dummy_sync: bool,
    pub add_dummy_tickets: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        ServicesConfig {
            fetch_interval_secs: 300,
            sync_interval_secs: 1,
            fetch_enabled: true,
            sync_enabled: true,
            cleanup_enabled: true,
            skip_dummy_sync: true,
            add_dummy_tickets: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backup_enabled: true,
            max_backups: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// The complete, immutable configuration for one gate's gatekeeper process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub gate_mapping: GateMapping,
    /// HMAC secret. Never serialized back to disk from an env override;
    /// `secret_key()` is what components should call, not this field.
    #[serde(default = "default_secret_key")]
    secret_key: String,
}

fn default_secret_key() -> String {
    "mayur@123".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            api: ApiConfig::default(),
            services: ServicesConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            gate_mapping: GateMapping::default(),
            secret_key: default_secret_key(),
        }
    }
}

impl GatewayConfig {
    /// Load from `path`, writing out the default configuration first if the
    /// file does not yet exist (mirrors the original tool's "materialize
    /// defaults on first run" behavior so an operator can inspect and edit
    /// the file in place). The `GATEKEEPER_SECRET_KEY` environment variable,
    /// when set, always takes precedence over the file's `secret_key`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            let config = GatewayConfig::default();
            config.save(path)?;
            config
        };

        if let Ok(secret) = std::env::var(SECRET_KEY_ENV) {
            config.secret_key = secret;
        }
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn with_secret_key(mut self, secret: impl Into<String>) -> Self {
        self.secret_key = secret.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = GatewayConfig::default();
        assert_eq!(config.services.fetch_interval_secs, 300);
        assert_eq!(config.services.sync_interval_secs, 1);
        assert_eq!(config.api.retry_attempts, 3);
        assert_eq!(config.secret_key(), "mayur@123");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = GatewayConfig::default();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gatekeeper.toml");

        config.save(&path).expect("save");
        let loaded = GatewayConfig::load(&path).expect("load");

        assert_eq!(loaded.api.base_url, config.api.base_url);
        assert_eq!(loaded.services.fetch_interval_secs, config.services.fetch_interval_secs);
    }

    #[test]
    fn first_load_materializes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gatekeeper.toml");
        assert!(!path.exists());

        let _config = GatewayConfig::load(&path).expect("load");
        assert!(path.exists());
    }

    #[test]
    fn env_override_wins_over_file() {
        std::env::set_var(SECRET_KEY_ENV, "from-env");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gatekeeper.toml");

        let config = GatewayConfig::load(&path).expect("load");
        assert_eq!(config.secret_key(), "from-env");
        std::env::remove_var(SECRET_KEY_ENV);
    }
}
