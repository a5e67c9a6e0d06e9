//! Configuration management for the twitter connector.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings. Credentials are deliberately not
//! part of this file; they come from the environment or a saved session bundle.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory settings
    pub data: DataConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Connector settings
    pub connector: ConnectorConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory path
    pub root_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log directory path (relative to data directory or absolute)
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Which backend handles an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Official API first, scraper as fallback
    PreferApi,
    /// Scraper first, official API as fallback
    PreferScraper,
    /// Official API only
    ApiOnly,
    /// Scraper only
    ScraperOnly,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::PreferApi => write!(f, "prefer_api"),
            BackendMode::PreferScraper => write!(f, "prefer_scraper"),
            BackendMode::ApiOnly => write!(f, "api_only"),
            BackendMode::ScraperOnly => write!(f, "scraper_only"),
        }
    }
}

impl FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").to_lowercase().as_str() {
            "prefer_api" => Ok(BackendMode::PreferApi),
            "prefer_scraper" => Ok(BackendMode::PreferScraper),
            "api_only" => Ok(BackendMode::ApiOnly),
            "scraper_only" => Ok(BackendMode::ScraperOnly),
            other => bail!("Unknown backend mode: {}", other),
        }
    }
}

/// Connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Backend selection mode
    pub mode: BackendMode,

    /// Scraper session bundle file (relative to data directory or absolute)
    pub session_file: String,

    /// Official API settings
    pub api: ApiConfig,

    /// Browser-session scraper settings
    pub scraper: ScraperConfig,

    /// Retry policy applied by the dispatcher
    pub retry: RetryConfig,

    /// Completed idempotency keys remembered before the oldest is forgotten
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,
}

fn default_idempotency_capacity() -> usize {
    1024
}

/// Official API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// REST API base URL
    pub base_url: String,

    /// Media upload base URL
    pub upload_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Chunk size for media uploads in bytes
    pub media_chunk_bytes: usize,
}

/// Scraper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Web client base URL
    pub base_url: String,

    /// Bearer token the web client sends with every request
    pub web_bearer_token: String,

    /// Lifetime of a refreshed session in seconds
    pub session_ttl_secs: u64,

    /// Refresh this many seconds before the session expires
    pub refresh_margin_secs: u64,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Client-side pacing
    pub rate_limit: RateLimitConfig,

    /// GraphQL query ids, one per operation
    #[serde(default)]
    pub query_ids: QueryIds,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: f64,

    /// Maximum requests per minute
    pub requests_per_minute: u32,
}

/// GraphQL query ids used by the web client.
///
/// These rotate upstream without notice, so they live in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryIds {
    pub create_tweet: String,
    pub home_timeline: String,
    pub tweet_by_id: String,
    pub user_by_screen_name: String,
    pub user_by_id: String,
    pub user_tweets: String,
    pub search_timeline: String,
    pub followers: String,
    pub following: String,
    pub favorite_tweet: String,
    pub unfavorite_tweet: String,
    pub create_retweet: String,
    pub bookmarks: String,
}

impl Default for QueryIds {
    fn default() -> Self {
        Self {
            create_tweet: "a1p9RWpkYKBjWv_I3WzS-A".to_string(),
            home_timeline: "HJFjzBgCs16TqxewQOeLNg".to_string(),
            tweet_by_id: "Xl5pC_lBk_gcO2ItU39DQw".to_string(),
            user_by_screen_name: "G3KGOASz96M-Qu0nwmGXNg".to_string(),
            user_by_id: "tD8zKvQzwY3kdx5yz6YmOw".to_string(),
            user_tweets: "V7H0Ap3_Hh2FyS75OCDO3Q".to_string(),
            search_timeline: "UN1i3zUiCWa-6r-Uaho4fw".to_string(),
            followers: "3yX7xr2hKjcZYnXt6cU6lQ".to_string(),
            following: "PAnE9toEjRfE-4tozRcsfw".to_string(),
            favorite_tweet: "lI07N6Otwv1PhnEgXILM7A".to_string(),
            unfavorite_tweet: "ZYKSe-w7KEslx3JhSIk5LA".to_string(),
            create_retweet: "ojPdsZsimiJrUGLR1sjUtA".to_string(),
            bookmarks: "j5KExFXtSWj8HjRui17ydA".to_string(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per dispatch, including the first
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twitter.com".to_string(),
            upload_url: "https://upload.twitter.com".to_string(),
            timeout_secs: 30,
            media_chunk_bytes: 1024 * 1024,
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://x.com".to_string(),
            web_bearer_token: "AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA".to_string(),
            session_ttl_secs: 6 * 60 * 60,
            refresh_margin_secs: 60,
            timeout_secs: 30,
            rate_limit: RateLimitConfig {
                requests_per_second: 1.0,
                requests_per_minute: 30,
            },
            query_ids: QueryIds::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                root_dir: "data".to_string(),
            },
            logging: LoggingConfig {
                log_dir: "logs".to_string(),
                default_level: "info".to_string(),
                console: true,
                file: true,
                json_format: false,
            },
            connector: ConnectorConfig {
                mode: BackendMode::PreferApi,
                session_file: "session.json".to_string(),
                api: ApiConfig::default(),
                scraper: ScraperConfig::default(),
                retry: RetryConfig::default(),
                idempotency_capacity: default_idempotency_capacity(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            mode = %config.connector.mode,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Get the path for the data directory
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.root_dir)
    }

    /// Get the path for the log directory
    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.logging.log_dir)
    }

    /// Get the path for the scraper session bundle
    pub fn session_file(&self) -> PathBuf {
        self.resolve(&self.connector.session_file)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data.root_dir, "data");
        assert_eq!(config.connector.mode, BackendMode::PreferApi);
        assert_eq!(config.connector.retry.max_attempts, 3);
        assert_eq!(config.connector.api.media_chunk_bytes, 1024 * 1024);
        assert_eq!(config.connector.idempotency_capacity, 1024);
    }

    #[test]
    fn test_save_and_load_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");

        let mut original_config = Config::default();
        original_config.connector.mode = BackendMode::ScraperOnly;
        original_config.save(&config_path)?;

        assert!(config_path.exists());

        let loaded_config = Config::from_file(&config_path)?;
        assert_eq!(loaded_config.connector.mode, BackendMode::ScraperOnly);
        assert_eq!(
            loaded_config.connector.api.base_url,
            original_config.connector.api.base_url
        );
        assert_eq!(
            loaded_config.connector.scraper.query_ids.create_tweet,
            original_config.connector.scraper.query_ids.create_tweet
        );

        Ok(())
    }

    #[test]
    fn test_load_nonexistent_config() -> Result<()> {
        let config = Config::from_file("nonexistent.toml")?;
        assert_eq!(config.data.root_dir, "data");
        Ok(())
    }

    #[test]
    fn test_query_ids_default_when_omitted() -> Result<()> {
        let mut value = toml::Value::try_from(Config::default())?;
        let removed = value
            .get_mut("connector")
            .and_then(|c| c.get_mut("scraper"))
            .and_then(|s| s.as_table_mut())
            .and_then(|s| s.remove("query_ids"));
        assert!(removed.is_some());

        let config: Config = toml::from_str(&toml::to_string(&value)?)?;
        assert_eq!(config.connector.scraper.query_ids.bookmarks, QueryIds::default().bookmarks);
        Ok(())
    }

    #[test]
    fn test_backend_mode_parsing() {
        assert_eq!("prefer-api".parse::<BackendMode>().ok(), Some(BackendMode::PreferApi));
        assert_eq!("SCRAPER_ONLY".parse::<BackendMode>().ok(), Some(BackendMode::ScraperOnly));
        assert!("both".parse::<BackendMode>().is_err());
        assert_eq!(BackendMode::PreferScraper.to_string(), "prefer_scraper");
    }

    #[test]
    fn test_path_resolution() {
        let config = Config::default();

        let log_dir = config.log_dir();
        assert!(log_dir.ends_with("data/logs"));

        let session_file = config.session_file();
        assert!(session_file.ends_with("data/session.json"));
    }
}
