//! # Engine Configuration
//!
//! JSON configuration file. Every field has a default, so `{}` is a valid
//! file that runs an in-memory store with a local live-query endpoint.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::{ExecutorConfig, DEFAULT_QUERY_LIMIT};
use crate::realtime::LiveServerConfig;

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Live-query endpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveQueryConfig {
    /// Listen address (default "0.0.0.0:1338")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Client reconnect delay in milliseconds (default 1000)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Frames buffered per client subscription (default 256)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Document store settings. Without a URI the engine runs in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// MongoDB connection string
    #[serde(default)]
    pub uri: Option<String>,

    /// Database name (default "docflux")
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: None,
            database: default_database(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Result cap for non-elevated queries (default 50)
    #[serde(default = "default_query_limit")]
    pub query_limit: i64,

    /// Cache entry lifetime in milliseconds (default one hour)
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Collections that need `unlock`
    #[serde(default = "default_reserved_collections")]
    pub reserved_collections: Vec<String>,

    #[serde(default)]
    pub live_query: LiveQueryConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Secret for elevated live queries
    #[serde(default)]
    pub api_secret: Option<String>,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Default filter when `RUST_LOG` is unset (default "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_query_limit() -> i64 {
    DEFAULT_QUERY_LIMIT
}
fn default_cache_ttl_ms() -> u64 {
    3_600_000
}
fn default_true() -> bool {
    true
}
fn default_reserved_collections() -> Vec<String> {
    vec!["Password".to_string(), "_Password".to_string()]
}
fn default_bind_addr() -> String {
    "0.0.0.0:1338".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_channel_capacity() -> usize {
    256
}
fn default_database() -> String {
    "docflux".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_limit: default_query_limit(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_enabled: true,
            reserved_collections: default_reserved_collections(),
            live_query: LiveQueryConfig::default(),
            store: StoreConfig::default(),
            api_secret: None,
            log_format: LogFormat::default(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration JSON
    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let config: EngineConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.query_limit <= 0 {
            return Err(ConfigError::Invalid("query_limit must be > 0".into()));
        }
        if self.cache_ttl_ms == 0 {
            return Err(ConfigError::Invalid("cache_ttl_ms must be > 0".into()));
        }
        if self.reserved_collections.iter().any(|c| c.is_empty()) {
            return Err(ConfigError::Invalid(
                "reserved_collections must not contain empty names".into(),
            ));
        }

        self.live_query
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                ConfigError::Invalid(format!(
                    "Invalid live_query.bind_addr '{}': {}",
                    self.live_query.bind_addr, e
                ))
            })?;
        if self.live_query.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "live_query.reconnect_delay_ms must be > 0".into(),
            ));
        }
        if self.live_query.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "live_query.channel_capacity must be > 0".into(),
            ));
        }

        if let Some(uri) = &self.store.uri {
            if !uri.starts_with("mongodb://") && !uri.starts_with("mongodb+srv://") {
                return Err(ConfigError::Invalid(format!(
                    "store.uri must be a mongodb:// or mongodb+srv:// URI, got '{}'",
                    uri
                )));
            }
        }
        if self.store.database.is_empty() {
            return Err(ConfigError::Invalid("store.database must not be empty".into()));
        }

        if matches!(&self.api_secret, Some(secret) if secret.is_empty()) {
            return Err(ConfigError::Invalid("api_secret must not be empty".into()));
        }

        Ok(())
    }

    /// Cache entry lifetime
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Client reconnect delay
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.live_query.reconnect_delay_ms)
    }

    /// Executor settings
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            query_limit: self.query_limit,
            reserved_collections: self.reserved_collections.clone(),
        }
    }

    /// Live-query server settings
    pub fn server_config(&self) -> LiveServerConfig {
        LiveServerConfig {
            bind_addr: self.live_query.bind_addr.clone(),
            api_secret: self.api_secret.clone(),
        }
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.api_secret.is_some() {
            config.api_secret = Some("********".to_string());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("{}");
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.query_limit, 50);
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.live_query.bind_addr, "0.0.0.0:1338");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.store.uri.is_none());
    }

    #[test]
    fn test_partial_overrides() {
        let file = write_config(
            r#"{
                "query_limit": 10,
                "live_query": { "reconnect_delay_ms": 250 },
                "store": { "uri": "mongodb://localhost:27017" },
                "log_format": "json"
            }"#,
        );
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.executor_config().query_limit, 10);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(config.live_query.channel_capacity, 256);
        assert_eq!(config.store.database, "docflux");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for content in [
            r#"{"query_limit": 0}"#,
            r#"{"cache_ttl_ms": 0}"#,
            r#"{"live_query": {"bind_addr": "nowhere"}}"#,
            r#"{"store": {"uri": "postgres://x"}}"#,
            r#"{"api_secret": ""}"#,
        ] {
            let err = EngineConfig::from_json(content).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{}", content);
        }
    }

    #[test]
    fn test_missing_file_and_bad_json() {
        let missing = EngineConfig::load(Path::new("/nonexistent/docflux.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read(_)));

        let file = write_config("{not json");
        let bad = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(bad, ConfigError::Parse(_)));
    }

    #[test]
    fn test_redacted_hides_secret() {
        let config = EngineConfig {
            api_secret: Some("s3cret".into()),
            ..EngineConfig::default()
        };
        assert_eq!(config.redacted().api_secret.as_deref(), Some("********"));
        assert_eq!(config.server_config().api_secret.as_deref(), Some("s3cret"));
    }
}
