//! Store configuration

use serde::{Deserialize, Serialize};
use sqlsession_core::{Error, Result};
use sqlsession_storage::DEFAULT_MAX_PAYLOAD_BYTES;
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration for a session-state store, resolved once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection descriptor of the backing database
    #[serde(default = "default_connection_string")]
    pub connection_string: String,

    /// Deflate payloads before writing them
    #[serde(default = "default_false")]
    pub compression_enabled: bool,

    /// Force integrated (ambient) credentials; inferred from the descriptor when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrated_security: Option<bool>,

    /// Largest encoded payload accepted on write
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle connections kept; defaults to `min(5000, cpus * 100)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_connections: Option<usize>,

    /// Scavenger period, also the longest a connection may sit idle
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Payload blocks kept for reuse between reads
    #[serde(default = "default_block_cache_capacity")]
    pub block_cache_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,

    #[serde(default = "default_first_severe_backoff_ms")]
    pub first_severe_backoff_ms: u64,

    #[serde(default = "default_severe_backoff_ms")]
    pub severe_backoff_ms: u64,

    #[serde(default = "default_max_total_backoff_ms")]
    pub max_total_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Let sqlx log every statement
    #[serde(default = "default_false")]
    pub log_sql_queries: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: default_connection_string(),
            compression_enabled: false,
            integrated_security: None,
            max_payload_bytes: default_max_payload_bytes(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            block_cache_capacity: default_block_cache_capacity(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            conflict_backoff_ms: default_conflict_backoff_ms(),
            first_severe_backoff_ms: default_first_severe_backoff_ms(),
            severe_backoff_ms: default_severe_backoff_ms(),
            max_total_backoff_ms: default_max_total_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_sql_queries: false,
        }
    }
}

impl StoreConfig {
    /// Create a configuration for `connection_string` with defaults elsewhere
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    /// Load from a YAML or TOML file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid TOML in {}: {}", path.display(), e)))?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid YAML in {}: {}", path.display(), e)))?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("SQLSESSION_DATABASE_URL") {
            self.connection_string = val;
        }

        if let Ok(val) = std::env::var("SQLSESSION_COMPRESSION") {
            if let Ok(enabled) = val.parse::<bool>() {
                self.compression_enabled = enabled;
            }
        }

        if let Ok(val) = std::env::var("SQLSESSION_INTEGRATED_SECURITY") {
            if let Ok(enabled) = val.parse::<bool>() {
                self.integrated_security = Some(enabled);
            }
        }

        if let Ok(val) = std::env::var("SQLSESSION_MAX_POOL_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                self.pool.max_idle_connections = Some(size);
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("SQLSESSION_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("SQLSESSION_LOG_SQL") {
            if let Ok(enabled) = val.parse::<bool>() {
                self.logging.log_sql_queries = enabled;
            }
        }
    }

    /// Reject configurations the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(Error::Config("connection_string must not be empty".to_string()));
        }
        if self.pool.idle_timeout_secs == 0 {
            return Err(Error::Config("pool.idle_timeout_secs must be positive".to_string()));
        }
        if self.retry.max_total_backoff_ms == 0 {
            return Err(Error::Config(
                "retry.max_total_backoff_ms must be positive".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(Error::Config("max_payload_bytes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn with_integrated_security(mut self, enabled: bool) -> Self {
        self.integrated_security = Some(enabled);
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_max_idle_connections(mut self, max: usize) -> Self {
        self.pool.max_idle_connections = Some(max);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool.idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            conflict_backoff: Duration::from_millis(config.conflict_backoff_ms),
            first_severe_backoff: Duration::from_millis(config.first_severe_backoff_ms),
            severe_backoff: Duration::from_millis(config.severe_backoff_ms),
            max_total_backoff: Duration::from_millis(config.max_total_backoff_ms),
        }
    }
}

fn default_connection_string() -> String {
    "postgres://localhost/sessionstate".to_string()
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_block_cache_capacity() -> usize {
    1024
}

fn default_conflict_backoff_ms() -> u64 {
    100
}

fn default_first_severe_backoff_ms() -> u64 {
    3_000
}

fn default_severe_backoff_ms() -> u64 {
    1_000
}

fn default_max_total_backoff_ms() -> u64 {
    120_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert!(!config.compression_enabled);
        assert_eq!(config.integrated_security, None);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
        assert_eq!(RetryPolicy::from(&config.retry), RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("postgres://app:secret@db/sessions")
            .with_compression(true)
            .with_max_idle_connections(8)
            .with_idle_timeout(Duration::from_secs(30))
            .with_max_payload_bytes(1024);

        assert_eq!(config.connection_string, "postgres://app:secret@db/sessions");
        assert!(config.compression_enabled);
        assert_eq!(config.pool.max_idle_connections, Some(8));
        assert_eq!(config.pool.idle_timeout_secs, 30);
        assert_eq!(config.max_payload_bytes, 1024);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(StoreConfig::new("  ").validate().is_err());
        assert!(
            StoreConfig::default()
                .with_idle_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            StoreConfig::default()
                .with_max_payload_bytes(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "connection_string: postgres://db/sessions\ncompression_enabled: true\npool:\n  idle_timeout_secs: 5\nretry:\n  conflict_backoff_ms: 10"
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connection_string, "postgres://db/sessions");
        assert!(config.compression_enabled);
        assert_eq!(config.pool.idle_timeout_secs, 5);
        assert_eq!(config.retry.conflict_backoff_ms, 10);
        assert_eq!(config.retry.severe_backoff_ms, 1_000);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "connection_string = \"postgres://db/sessions\"\nintegrated_security = true\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.integrated_security, Some(true));
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.log_sql_queries);
    }

    #[test]
    fn test_from_file_errors_are_config_errors() {
        let err = StoreConfig::from_file("/nonexistent/sqlsession.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "connection_string = [").unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_merge_env() {
        // SAFETY: serialized with every other test touching the environment
        unsafe {
            std::env::set_var("SQLSESSION_DATABASE_URL", "postgres://env/sessions");
            std::env::set_var("SQLSESSION_COMPRESSION", "true");
            std::env::set_var("SQLSESSION_MAX_POOL_SIZE", "12");
            std::env::set_var("SQLSESSION_LOG_SQL", "not-a-bool");
        }

        let mut config = StoreConfig::default();
        config.merge_env();

        unsafe {
            std::env::remove_var("SQLSESSION_DATABASE_URL");
            std::env::remove_var("SQLSESSION_COMPRESSION");
            std::env::remove_var("SQLSESSION_MAX_POOL_SIZE");
            std::env::remove_var("SQLSESSION_LOG_SQL");
        }

        assert_eq!(config.connection_string, "postgres://env/sessions");
        assert!(config.compression_enabled);
        assert_eq!(config.pool.max_idle_connections, Some(12));
        // Unparseable values leave the setting alone
        assert!(!config.logging.log_sql_queries);
    }
}
