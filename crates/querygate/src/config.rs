//! Admission configuration.

use std::time::Duration;

/// Default cap on concurrently executing queries per database.
pub const DEFAULT_MAX_SIMULTANEOUS_QUERIES_PER_DB: usize = 15;

/// Default interval between keep-alive heartbeats on streaming responses.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Upper bound on queries executing at once against a single database.
    ///
    /// Read once per broker creation; changing it later does not resize
    /// brokers that already exist.
    pub max_simultaneous_queries_per_db: usize,
    /// Interval between heartbeat bytes written to a long-polling client.
    pub keepalive_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_queries_per_db: DEFAULT_MAX_SIMULTANEOUS_QUERIES_PER_DB,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl AdmissionConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("QUERYGATE_MAX_SIMULTANEOUS_QUERIES_PER_DB") {
            match raw.parse::<usize>() {
                Ok(n) => config.max_simultaneous_queries_per_db = n,
                Err(_) => tracing::warn!(
                    value = %raw,
                    "ignoring unparsable QUERYGATE_MAX_SIMULTANEOUS_QUERIES_PER_DB"
                ),
            }
        }

        if let Ok(raw) = std::env::var("QUERYGATE_KEEPALIVE_INTERVAL_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.keepalive_interval = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    value = %raw,
                    "ignoring unparsable QUERYGATE_KEEPALIVE_INTERVAL_MS"
                ),
            }
        }

        config
    }
}
