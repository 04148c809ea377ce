//! Configuration for the quota sync engine.
//!
//! # Example
//!
//! ```
//! use quota_sync::QuotaSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = QuotaSyncConfig::default();
//! assert_eq!(config.batch_size, 20);
//! assert!(config.validate().is_ok());
//!
//! // Tuned for a flaky network
//! let config = QuotaSyncConfig {
//!     batch_size: 10,
//!     max_attempts: 8,
//!     max_delay_ms: 120_000,
//!     state_path: Some("quota_state.db".into()),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;
use serde::Deserialize;

use crate::batching::processor::BatchConfig;
use crate::error::SyncError;
use crate::resilience::retry::RetryPolicy;

/// Configuration for the quota sync engine.
///
/// All fields have sensible defaults. Batch size, intervals and the retry
/// policy can be changed at runtime through the engine's config channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuotaSyncConfig {
    /// Max actions per submitted batch; a queue this long flushes at once
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush timer
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Periodic resync with the remote store
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Failed deliveries an action survives before it is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Attempts per remote call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff settings
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Window length for counters opened locally
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,

    /// Acked/dropped ids remembered for enqueue dedupe
    #[serde(default = "default_settled_id_capacity")]
    pub settled_id_capacity: usize,

    /// SQLite file for persisted state (None = caller supplies a store or none)
    #[serde(default)]
    pub state_path: Option<String>,
}

fn default_batch_size() -> usize { 20 }
fn default_flush_interval_ms() -> u64 { 5_000 }
fn default_sync_interval_ms() -> u64 { 60_000 }
fn default_max_retries() -> u32 { 3 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_jitter_ratio() -> f64 { 0.2 }
fn default_window_ms() -> i64 { 24 * 60 * 60 * 1000 } // 24h
fn default_settled_id_capacity() -> usize { 1024 }

impl Default for QuotaSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            max_retries: default_max_retries(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            window_ms: default_window_ms(),
            settled_id_capacity: default_settled_id_capacity(),
            state_path: None,
        }
    }
}

impl QuotaSyncConfig {
    /// Reject values the engine can't run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if self.flush_interval_ms == 0 || self.sync_interval_ms == 0 {
            return Err(SyncError::Config("flush and sync intervals must be non-zero".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(SyncError::Config(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(SyncError::Config(format!(
                "jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            )));
        }
        if self.window_ms <= 0 {
            return Err(SyncError::Config("window_ms must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }

    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            flush_interval_ms: self.flush_interval_ms,
            max_retries: self.max_retries,
            settled_id_capacity: self.settled_id_capacity,
        }
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QuotaSyncConfig::default();
        assert_eq!(config.flush_interval_ms, 5_000);
        assert_eq!(config.sync_interval_ms, 60_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.window_ms, 86_400_000);
        assert!(config.state_path.is_none());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: QuotaSyncConfig =
            serde_json::from_str(r#"{"batch_size": 5, "jitter_ratio": 0.1}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.jitter_ratio, 0.1);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            QuotaSyncConfig { batch_size: 0, ..Default::default() },
            QuotaSyncConfig { max_attempts: 0, ..Default::default() },
            QuotaSyncConfig { jitter_ratio: 1.5, ..Default::default() },
            QuotaSyncConfig { base_delay_ms: 10, max_delay_ms: 5, ..Default::default() },
            QuotaSyncConfig { window_ms: 0, ..Default::default() },
            QuotaSyncConfig { flush_interval_ms: 0, ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(SyncError::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn test_derived_policies() {
        let config = QuotaSyncConfig::default();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        let batch = config.batch_config();
        assert_eq!(batch.batch_size, 20);
        assert_eq!(batch.max_retries, 3);
    }
}
