//! Configuration for route-progress

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("route-progress")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding progress.db and config.toml
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Extra meters added to every checkpoint radius to absorb GPS error.
    /// Deployment-wide on purpose: requests cannot widen their own geofence.
    #[serde(default = "default_tolerance")]
    pub geofence_tolerance_m: f64,

    /// Maximum leaderboard entries returned per query
    #[serde(default = "default_leaderboard_max")]
    pub leaderboard_max_entries: usize,

    /// Number of checkpoints listed in route stats
    #[serde(default = "default_popular_checkpoints")]
    pub popular_checkpoints: usize,

    /// Route stats cache lifetime in seconds (0 = no caching)
    #[serde(default = "default_stats_ttl")]
    pub stats_cache_ttl_secs: u64,

    /// Deadline for a single storage transaction
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_ms: u64,

    /// Attempts per storage transaction, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Rate limiting window in seconds
    #[serde(default = "default_rate_window")]
    pub rate_limit_window_secs: u64,

    /// Requests allowed per client per window (0 = unlimited)
    #[serde(default = "default_rate_max")]
    pub rate_limit_max_requests: u32,

    /// HS256 secret for player tokens. Unset means development mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
}

fn default_http_port() -> u16 {
    8095
}

fn default_tolerance() -> f64 {
    10.0
}

fn default_leaderboard_max() -> usize {
    100
}

fn default_popular_checkpoints() -> usize {
    5
}

fn default_stats_ttl() -> u64 {
    30
}

fn default_storage_timeout() -> u64 {
    5000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    50
}

fn default_retry_max_delay() -> u64 {
    1000
}

fn default_rate_window() -> u64 {
    15 * 60
}

fn default_rate_max() -> u32 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            geofence_tolerance_m: default_tolerance(),
            leaderboard_max_entries: default_leaderboard_max(),
            popular_checkpoints: default_popular_checkpoints(),
            stats_cache_ttl_secs: default_stats_ttl(),
            storage_timeout_ms: default_storage_timeout(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            rate_limit_window_secs: default_rate_window(),
            rate_limit_max_requests: default_rate_max(),
            jwt_secret: None,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get progress database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("progress.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn stats_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_cache_ttl_secs)
    }

    /// Retry policy for storage transactions
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("http_port = 9000\ngeofence_tolerance_m = 15.0").unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.geofence_tolerance_m, 15.0);
        assert_eq!(config.leaderboard_max_entries, 100);
        assert_eq!(config.retry_max_attempts, 3);
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.stats_cache_ttl_secs = 0;

        config.save(config.config_path()).unwrap();
        let loaded = Config::load(config.config_path()).unwrap();

        assert_eq!(loaded.storage_dir, dir.path());
        assert_eq!(loaded.stats_cache_ttl_secs, 0);
        assert_eq!(loaded.db_path(), dir.path().join("progress.db"));
    }

    #[test]
    fn test_retry_policy_never_zero_attempts() {
        let mut config = Config::default();
        config.retry_max_attempts = 0;
        assert_eq!(config.retry_policy().max_attempts, 1);
    }
}
