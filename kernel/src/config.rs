// Stream Configuration
//
// Tunables for the log, the live bridge, and connection writers.
// Every field has a default so a partial JSON document is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Retry policy the pipeline emitter applies to `AppendConflict`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppendRetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for AppendRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 10,
            max_backoff_ms: 1_000,
        }
    }
}

impl AppendRetryConfig {
    /// Exponential backoff before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Stream configuration loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between keep-alive frames on an open stream.
    pub heartbeat_interval_ms: u64,
    /// Events fetched per store query during replay and gap repair.
    pub replay_page_size: usize,
    /// Live events buffered per subscriber before deliveries are dropped.
    pub subscriber_buffer: usize,
    pub max_subscribers_per_build: usize,
    /// CAS attempts per append inside the event log.
    pub cas_retry_budget: u32,
    pub append_retry: AppendRetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            replay_page_size: 256,
            subscriber_buffer: 1_024,
            max_subscribers_per_build: 64,
            cas_retry_budget: crate::log::DEFAULT_CAS_RETRY_BUDGET,
            append_retry: AppendRetryConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zeroes = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms == 0),
            ("replay_page_size", self.replay_page_size == 0),
            ("subscriber_buffer", self.subscriber_buffer == 0),
            ("max_subscribers_per_build", self.max_subscribers_per_build == 0),
            ("cas_retry_budget", self.cas_retry_budget == 0),
            ("append_retry.max_attempts", self.append_retry.max_attempts == 0),
        ];

        match zeroes.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(ConfigError::Invalid(format!("{field} must be non-zero"))),
            None => Ok(()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = StreamConfig::from_json_str(
            r#"{ "heartbeat_interval_ms": 500, "append_retry": { "max_attempts": 2 } }"#,
        )
        .unwrap();

        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.replay_page_size, 256);
        assert_eq!(config.append_retry.max_attempts, 2);
        assert_eq!(config.append_retry.base_backoff_ms, 10);
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = StreamConfig::from_json_str(r#"{ "replay_page_size": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("replay_page_size"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = AppendRetryConfig {
            max_attempts: 10,
            base_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
        assert_eq!(retry.backoff(4), Duration::from_millis(50));
        assert_eq!(retry.backoff(40), Duration::from_millis(50));
    }
}
