//! Configuration for bucket synchronization.

use crate::ClientId;
use std::time::Duration;

/// Configuration shared by every bucket of a client.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Client id stamped on every outbound change.
    pub client_id: ClientId,
    /// Maximum in-flight changes (pending + retry) per bucket.
    pub max_pending: usize,
    /// Retry configuration for server errors.
    pub retry: RetryConfig,
    /// Entries requested per index page.
    pub index_page_size: usize,
}

impl SyncConfig {
    /// Creates a new configuration with defaults.
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            max_pending: 200,
            retry: RetryConfig::default(),
            index_page_size: 500,
        }
    }

    /// Sets the backpressure limit.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the index page size.
    pub fn with_index_page_size(mut self, size: usize) -> Self {
        self.index_page_size = size;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Exponential backoff for server errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts before the change is given up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Sets the initial delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-indexed): base * 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
