// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for quota-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing a recorder.
//!
//! # Metric Naming Convention
//! - `quota_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `action_type`: swipe, match, message
//! - `operation`: submit_batch, pull, persist
//! - `outcome`: operation specific (allowed, denied, delivered, ...)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// QUOTA CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a reservation decision
pub fn record_reservation(action_type: &str, outcome: &str) {
    counter!(
        "quota_sync_reservations_total",
        "action_type" => action_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a reservation confirmed by the server
pub fn record_commit(action_type: &str) {
    counter!(
        "quota_sync_commits_total",
        "action_type" => action_type.to_string()
    )
    .increment(1);
}

/// Record a reservation released after a drop
pub fn record_rollback(action_type: &str) {
    counter!(
        "quota_sync_rollbacks_total",
        "action_type" => action_type.to_string()
    )
    .increment(1);
}

/// Record a counter window rolling over
pub fn record_window_reset(action_type: &str) {
    counter!(
        "quota_sync_window_resets_total",
        "action_type" => action_type.to_string()
    )
    .increment(1);
}

/// Set the remaining allowance for an action type
pub fn set_remaining(action_type: &str, remaining: u32) {
    gauge!(
        "quota_sync_remaining",
        "action_type" => action_type.to_string()
    )
    .set(f64::from(remaining));
}

// ═══════════════════════════════════════════════════════════════════════════
// BATCHING
// ═══════════════════════════════════════════════════════════════════════════

/// Record an enqueue attempt
pub fn record_enqueue(action_type: &str, outcome: &str) {
    counter!(
        "quota_sync_enqueued_total",
        "action_type" => action_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set unresolved actions for a type
pub fn set_pending(action_type: &str, count: usize) {
    gauge!(
        "quota_sync_pending_actions",
        "action_type" => action_type.to_string()
    )
    .set(count as f64);
}

/// Record batch size
pub fn record_batch_size(action_type: &str, count: usize) {
    histogram!(
        "quota_sync_batch_size",
        "action_type" => action_type.to_string()
    )
    .record(count as f64);
}

/// Record a finished flush
pub fn record_flush(action_type: &str, outcome: &str) {
    counter!(
        "quota_sync_flushes_total",
        "action_type" => action_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an action dropped for good
pub fn record_dropped(action_type: &str, reason: &str) {
    counter!(
        "quota_sync_dropped_total",
        "action_type" => action_type.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record flush duration
pub fn record_flush_duration(duration: Duration) {
    histogram!("quota_sync_flush_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// RETRY
// ═══════════════════════════════════════════════════════════════════════════

/// Record one attempt of a retried operation
pub fn record_retry_attempt(operation: &str) {
    counter!(
        "quota_sync_retry_attempts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record how a retried operation ended
pub fn record_retry_outcome(operation: &str, outcome: &str) {
    counter!(
        "quota_sync_retry_outcomes_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC / PERSISTENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a pull of authoritative state
pub fn record_sync(outcome: &str) {
    counter!(
        "quota_sync_pulls_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a state save
pub fn record_persist(outcome: &str) {
    counter!(
        "quota_sync_persists_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a record that failed validation
pub fn record_corrupt_record(kind: &str) {
    counter!(
        "quota_sync_corrupt_records_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record remote call latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "quota_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup/shutdown phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "quota_sync_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "quota_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed here; these only check the calls don't panic.

    #[test]
    fn test_quota_metrics() {
        record_reservation("swipe", "allowed");
        record_reservation("swipe", "denied");
        record_commit("match");
        record_rollback("message");
        record_window_reset("swipe");
        set_remaining("swipe", 42);
    }

    #[test]
    fn test_batch_metrics() {
        record_enqueue("swipe", "queued");
        set_pending("swipe", 3);
        record_batch_size("swipe", 20);
        record_flush("swipe", "delivered");
        record_dropped("swipe", "rejected");
        record_flush_duration(Duration::from_millis(12));
    }

    #[test]
    fn test_retry_and_sync_metrics() {
        record_retry_attempt("submit_batch");
        record_retry_outcome("submit_batch", "exhausted");
        record_sync("success");
        record_persist("failure");
        record_corrupt_record("counter");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("pull");
            std::thread::sleep(Duration::from_millis(1));
        }
        record_startup_phase("load", Duration::from_millis(3));
        set_engine_state("Ready");
    }
}
