//! Engine configuration loaded from TOML.
//!
//! ```toml
//! [store]
//! database_url = "sqlite://tsuzuki.db?mode=rwc"
//! max_readers = 8
//! busy_timeout_ms = 5000
//!
//! [queue]
//! default = "default"
//! batch_limit = 32
//! lease_secs = 300
//!
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! Every section and key is optional. Without a `database_url` the engine
//! keeps jobs in memory.

use crate::definition::DEFAULT_QUEUE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `store.database_url`.
pub const DATABASE_URL_ENV: &str = "TSUZUKI_DATABASE_URL";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Size of the read-only connection pool.
    pub max_readers: u32,
    /// How long a connection waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_readers: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue drained by [`Engine::run_pending`](crate::Engine::run_pending).
    pub default: String,
    /// Maximum number of jobs taken from a queue per pass.
    pub batch_limit: usize,
    /// A `running` job untouched for this long is treated as interrupted and
    /// dispatched again. Must exceed the longest single task.
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default: DEFAULT_QUEUE.to_string(),
            batch_limit: 32,
            lease_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path`, then applies environment overrides.
    ///
    /// A missing file yields the defaults; an unreadable or malformed file is
    /// an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.apply_env_override(std::env::var(DATABASE_URL_ENV).ok());
        Ok(config)
    }

    /// Replaces the database URL when an override is present and non-empty.
    pub fn apply_env_override(&mut self, database_url: Option<String>) {
        if let Some(url) = database_url.filter(|url| !url.trim().is_empty()) {
            self.store.database_url = Some(url);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.default.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.default must not be empty".into()));
        }
        if self.queue.batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "queue.batch_limit must be at least 1".into(),
            ));
        }
        if self.queue.lease_secs == 0 {
            return Err(ConfigError::Invalid("queue.lease_secs must be at least 1".into()));
        }
        if self.store.max_readers == 0 {
            return Err(ConfigError::Invalid(
                "store.max_readers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.queue.default, "default");
        assert_eq!(config.logging.level, "info");
        assert!(config.store.database_url.is_none());
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
[store]
database_url = "sqlite://jobs.db"

[logging]
json = true
"#,
        )
        .unwrap();
        assert_eq!(config.store.database_url.as_deref(), Some("sqlite://jobs.db"));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.queue.batch_limit, 32);
        assert_eq!(config.queue.lease(), Duration::from_secs(300));
        assert_eq!(config.store.max_readers, 8);
        assert_eq!(config.store.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_pool_and_lease_settings() {
        let config = EngineConfig::from_toml_str(
            r#"
[store]
max_readers = 2
busy_timeout_ms = 250

[queue]
lease_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.store.max_readers, 2);
        assert_eq!(config.store.busy_timeout(), Duration::from_millis(250));
        assert_eq!(config.queue.lease(), Duration::from_secs(30));
        assert_eq!(config.queue.batch_limit, 32);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("[queue]\nbatch_limit = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[queue]\nbatch_limit = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[queue]\nlease_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[store]\nmax_readers = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_override() {
        let mut config = EngineConfig::default();
        config.apply_env_override(Some(String::new()));
        assert!(config.store.database_url.is_none());
        config.apply_env_override(Some("sqlite://override.db".into()));
        assert_eq!(config.store.database_url.as_deref(), Some("sqlite://override.db"));
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(tmp.path().join("tsuzuki.toml")).await.unwrap();
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[tokio::test]
    async fn test_load_malformed_file_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tsuzuki.toml");
        tokio::fs::write(&path, "[store\n").await.unwrap();
        assert!(matches!(
            EngineConfig::load(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }
}
