//! Settings cache configuration.
//!
//! Loaded from environment variables with sensible defaults; every knob also
//! has a builder-style setter for embedding processes that wire config
//! differently.

use std::time::Duration;

/// Default interval between differential polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
/// Default delay before retrying a read that hit the schema-not-ready race.
pub const DEFAULT_SCHEMA_RETRY_DELAY_MS: u64 = 200;
/// Default number of schema-not-ready retries before giving up.
pub const DEFAULT_SCHEMA_RETRY_LIMIT: u32 = 25;

/// Configuration for [`SettingsCache`](crate::SettingsCache).
#[derive(Debug, Clone)]
pub struct SettingsCacheConfig {
    /// How often the polling loop runs.
    pub poll_interval: Duration,

    /// Fixed delay between retries when the settings relation does not
    /// exist yet (startup race against schema sync).
    pub schema_retry_delay: Duration,

    /// Upper bound on schema-not-ready retries. Exhaustion surfaces the
    /// original error instead of recursing forever.
    pub schema_retry_limit: u32,
}

impl Default for SettingsCacheConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            schema_retry_delay: Duration::from_millis(DEFAULT_SCHEMA_RETRY_DELAY_MS),
            schema_retry_limit: DEFAULT_SCHEMA_RETRY_LIMIT,
        }
    }
}

impl SettingsCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the schema retry delay.
    pub fn with_schema_retry_delay(mut self, delay: Duration) -> Self {
        self.schema_retry_delay = delay;
        self
    }

    /// Set the schema retry limit.
    pub fn with_schema_retry_limit(mut self, limit: u32) -> Self {
        self.schema_retry_limit = limit;
        self
    }

    /// Create a config from environment variables.
    ///
    /// # Environment Variables
    /// - `KEYSTONE_SETTINGS_POLL_INTERVAL_SECS`: poll interval (default: 60)
    /// - `KEYSTONE_SETTINGS_SCHEMA_RETRY_DELAY_MS`: retry delay (default: 200)
    /// - `KEYSTONE_SETTINGS_SCHEMA_RETRY_LIMIT`: retry bound (default: 25)
    pub fn from_env() -> Self {
        let poll_interval = Duration::from_secs(
            std::env::var("KEYSTONE_SETTINGS_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );

        let schema_retry_delay = Duration::from_millis(
            std::env::var("KEYSTONE_SETTINGS_SCHEMA_RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SCHEMA_RETRY_DELAY_MS),
        );

        let schema_retry_limit = std::env::var("KEYSTONE_SETTINGS_SCHEMA_RETRY_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SCHEMA_RETRY_LIMIT);

        Self {
            poll_interval,
            schema_retry_delay,
            schema_retry_limit,
        }
    }
}
