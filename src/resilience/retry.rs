// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Every remote call in the crate goes through [`RetryCoordinator::with_retry`].
//! Failures are classified via [`Classify`]: retryable ones are retried up
//! to `max_attempts`, fatal ones are handed back at once without touching
//! the retry budget.
//!
//! # Example
//!
//! ```
//! use quota_sync::resilience::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 5,
//!     base_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_millis(1_000),
//!     jitter_ratio: 0.0,
//! };
//!
//! assert_eq!(policy.backoff(1), Duration::from_millis(100));
//! assert_eq!(policy.backoff(3), Duration::from_millis(400));
//! assert_eq!(policy.backoff(10), Duration::from_millis(1_000)); // capped
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::metrics;

/// Backoff policy for a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delay is scaled by a uniform factor in `1 ± jitter_ratio`
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::flush()
    }
}

impl RetryPolicy {
    /// Batch submission: a handful of attempts, backing off to 30s.
    #[must_use]
    pub fn flush() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }

    /// No waiting between attempts. For tests and the shutdown flush.
    #[must_use]
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        }
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    ///
    /// `min(max_delay, base_delay * 2^(attempt-1))`, non-decreasing in
    /// `attempt`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) with random jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.apply_jitter(self.backoff(attempt), unit)
    }

    /// Scale `delay` by `1 + jitter_ratio * unit` (`unit` in `[-1, 1]`),
    /// never past `max_delay`.
    #[must_use]
    pub fn apply_jitter(&self, delay: Duration, unit: f64) -> Duration {
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + ratio * unit.clamp(-1.0, 1.0);
        // Out of range (or NaN) saturates to the cap
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |scaled| scaled.min(self.max_delay))
    }
}

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Try again, after `retry_after` if the server gave one
    Retryable { retry_after: Option<Duration> },
    /// Give up immediately
    Fatal,
}

/// Errors that can be sorted into retryable and fatal.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

impl Classify for SyncError {
    fn classify(&self) -> ErrorClass {
        match self {
            SyncError::Network { .. } => ErrorClass::Retryable { retry_after: None },
            SyncError::RateLimited { retry_after } => ErrorClass::Retryable {
                retry_after: *retry_after,
            },
            SyncError::Validation { .. }
            | SyncError::Auth { .. }
            | SyncError::CorruptState { .. }
            | SyncError::Persistence(_)
            | SyncError::Config(_)
            | SyncError::Cancelled { .. } => ErrorClass::Fatal,
        }
    }
}

/// Why a retried operation did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    #[error("{0}")]
    Fatal(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// The underlying error, if there was one.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            Self::Fatal(e) | Self::Exhausted { last: e, .. } => Some(e),
            Self::Cancelled { .. } => None,
        }
    }
}

impl RetryError<SyncError> {
    /// Flatten into a single [`SyncError`], naming the operation on cancel.
    pub fn into_sync_error(self, operation: &str) -> SyncError {
        match self {
            Self::Fatal(e) | Self::Exhausted { last: e, .. } => e,
            Self::Cancelled { attempts } => SyncError::Cancelled {
                operation: operation.to_string(),
                attempts,
            },
        }
    }
}

/// Cooperative cancellation shared between the engine and its retries.
///
/// Checked between attempts only; an attempt already in progress runs to
/// completion.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Shared retry driver. The policy can be swapped at runtime.
#[derive(Debug, Default)]
pub struct RetryCoordinator {
    policy: RwLock<RetryPolicy>,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.write() = policy;
    }

    /// Run `operation` until it succeeds, fails fatally, runs out of
    /// attempts, or `cancel` is set between attempts.
    ///
    /// A retry-after hint from the server replaces the computed backoff.
    pub async fn with_retry<F, Fut, T, E>(
        &self,
        operation_name: &str,
        cancel: &CancelFlag,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let policy = self.policy();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            if attempts > 0 && cancel.is_cancelled() {
                metrics::record_retry_outcome(operation_name, "cancelled");
                return Err(RetryError::Cancelled { attempts });
            }

            attempts += 1;
            metrics::record_retry_attempt(operation_name);

            let err = match operation().await {
                Ok(val) => {
                    if attempts > 1 {
                        info!("Operation '{}' succeeded after {} attempts", operation_name, attempts);
                    }
                    metrics::record_retry_outcome(operation_name, "success");
                    return Ok(val);
                }
                Err(err) => err,
            };

            let retry_after = match err.classify() {
                ErrorClass::Fatal => {
                    warn!("Operation '{}' failed fatally (attempt {}): {}", operation_name, attempts, err);
                    metrics::record_retry_outcome(operation_name, "fatal");
                    return Err(RetryError::Fatal(err));
                }
                ErrorClass::Retryable { retry_after } => retry_after,
            };

            if attempts >= max_attempts {
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Giving up",
                    operation_name, attempts, max_attempts, err
                );
                metrics::record_retry_outcome(operation_name, "exhausted");
                return Err(RetryError::Exhausted { attempts, last: err });
            }

            let delay = retry_after.unwrap_or_else(|| policy.jittered_delay(attempts));
            warn!(
                "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                operation_name, attempts, max_attempts, err, delay
            );

            tokio::select! {
                () = sleep(delay) => {}
                () = cancel.cancelled() => {
                    metrics::record_retry_outcome(operation_name, "cancelled");
                    return Err(RetryError::Cancelled { attempts });
                }
            }
        }
    }
}
