//! Configuration management for the client.

use std::env;
use std::time::Duration;

use ghostline_engine::{RetryConfig, SyncConfig};

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Id stamped on every outbound change
    pub client_id: String,
    /// Buckets to sync, in channel order
    pub buckets: Vec<String>,
    /// In-flight changes per bucket before saving backs off
    pub max_pending: usize,
    /// Attempts before a change failing with a server error is given up
    pub retry_limit: u32,
    /// Delay before the first retry
    pub retry_base_delay: Duration,
    /// Entries requested per index page
    pub index_page_size: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = SyncConfig::new("");

        let client_id = lookup("GHOSTLINE_CLIENT_ID")
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let buckets: Vec<String> = lookup("GHOSTLINE_BUCKETS")
            .ok_or(ConfigError::MissingBuckets)?
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();
        if buckets.is_empty() {
            return Err(ConfigError::MissingBuckets);
        }

        let max_pending = parse(&lookup, "GHOSTLINE_MAX_PENDING", defaults.max_pending)?;
        if max_pending == 0 {
            return Err(ConfigError::Invalid {
                name: "GHOSTLINE_MAX_PENDING",
                value: "0".into(),
            });
        }
        let retry_limit = parse(&lookup, "GHOSTLINE_RETRY_LIMIT", defaults.retry.max_attempts)?;
        let retry_base_ms = parse(
            &lookup,
            "GHOSTLINE_RETRY_BASE_MS",
            defaults.retry.base_delay.as_millis() as u64,
        )?;
        let index_page_size =
            parse(&lookup, "GHOSTLINE_INDEX_PAGE_SIZE", defaults.index_page_size)?;

        Ok(Self {
            client_id,
            buckets,
            max_pending,
            retry_limit,
            retry_base_delay: Duration::from_millis(retry_base_ms),
            index_page_size,
        })
    }

    /// Engine configuration shared by every bucket.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::new(self.client_id.clone())
            .with_max_pending(self.max_pending)
            .with_retry(RetryConfig::new(self.retry_limit).with_base_delay(self.retry_base_delay))
            .with_index_page_size(self.index_page_size)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GHOSTLINE_BUCKETS environment variable is required")]
    MissingBuckets,

    #[error("Invalid {name} value: {value}")]
    Invalid { name: &'static str, value: String },
}
