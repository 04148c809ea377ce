//! Reconciliation with the authoritative store.
//!
//! Remote wins for counters; local wins for actions the remote hasn't
//! acknowledged yet. A type with queued, in-flight or held actions keeps
//! its optimistic local counter until those actions settle.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::metrics;
use crate::validation::Validator;

use super::{PullSummary, SyncEngine, SyncEvent, SyncHealth};

/// Clears the running flag when a sync ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    /// Fetch counters and tier limits from the remote and merge them in.
    ///
    /// Pulled counters go through the [`Validator`] first. Tier limits are
    /// always replaced. Failures are recorded in the sync state; an auth
    /// failure also raises [`SyncEvent::AuthRequired`].
    #[tracing::instrument(skip(self))]
    pub async fn pull_authoritative(&self) -> Result<PullSummary, SyncError> {
        let identity = self.user.read().clone();
        let generations = self.core.lock().batches.settle_generations();
        let result = {
            let _timer = metrics::LatencyTimer::new("pull");
            let identity = &identity;
            self.retry
                .with_retry("pull", &self.cancel, move || self.remote.pull(identity))
                .await
        };

        let remote_state = match result {
            Ok(state) => state,
            Err(e) => {
                let err = e.into_sync_error("pull");
                self.record_pull_failure(&err);
                return Err(err);
            }
        };

        let summary = {
            let now = self.clock.now();
            let mut core = self.core.lock();
            let tier = core.quota.tier();
            let report = Validator::new(tier, &remote_state.tier_limits)
                .validate_local(remote_state.counters, Vec::new());

            core.quota.apply_limits(remote_state.tier_limits);

            let mut summary = PullSummary {
                corrupt: report.corrupt.len(),
                healed: report.healed,
                ..PullSummary::default()
            };
            for counter in report.counters {
                let action_type = counter.action_type;
                // A snapshot taken before an ack or drop landed is stale for that type
                if core.batches.has_unresolved(action_type)
                    || core.batches.settled_since(action_type, &generations)
                {
                    summary.kept_local.push(action_type);
                } else {
                    core.quota.replace_counter(counter);
                    summary.replaced.push(action_type);
                }
            }

            core.sync.last_sync_timestamp = Some(now);
            core.sync.last_sync_error = None;
            if core.health == SyncHealth::Degraded {
                core.health = SyncHealth::Healthy;
            }
            self.publish_status(&core);
            summary
        };

        metrics::record_sync("success");
        info!(
            replaced = summary.replaced.len(),
            kept_local = summary.kept_local.len(),
            corrupt = summary.corrupt,
            "Pulled authoritative state"
        );
        if !summary.replaced.is_empty() {
            self.emit(SyncEvent::CountersChanged {
                action_types: summary.replaced.clone(),
            });
        }

        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist state after pull");
        }
        Ok(summary)
    }

    /// Validate local state and pull from the remote.
    ///
    /// Without `force` the call is skipped (`Ok(None)`) when the last
    /// successful sync is younger than the sync interval or another sync is
    /// already running.
    #[tracing::instrument(skip(self))]
    pub async fn resync(&self, force: bool) -> Result<Option<PullSummary>, SyncError> {
        let _guard = match SyncGuard::acquire(&self.sync_running) {
            Some(guard) => Some(guard),
            None if force => None,
            None => return Ok(None),
        };

        if force {
            self.validate_local_state();
        } else {
            let interval = self.config.read().sync_interval_ms as i64;
            let last = self.core.lock().sync.last_sync_timestamp;
            if last.is_some_and(|at| self.clock.now().saturating_sub(at) < interval) {
                return Ok(None);
            }
        }

        self.pull_authoritative().await.map(Some)
    }

    /// Re-check in-memory counters before a forced resync.
    ///
    /// Pending actions are left alone: in-flight ones are legitimately
    /// Sending and must not be healed back to Queued.
    fn validate_local_state(&self) {
        let mut core = self.core.lock();
        let tier = core.quota.tier();
        let report = Validator::new(tier, core.quota.limits()).validate_local(core.quota.snapshot(), Vec::new());
        if !report.is_clean() {
            warn!(
                corrupt = report.corrupt.len(),
                healed = report.healed,
                "Local counters repaired before resync"
            );
            core.quota.load_counters(report.counters);
        }
    }

    fn record_pull_failure(&self, err: &SyncError) {
        metrics::record_sync("failure");
        warn!(error = %err, "Pull from remote failed");

        let mut core = self.core.lock();
        core.sync.last_sync_error = Some(err.to_string());
        match err {
            SyncError::Auth { .. } => {
                core.health = SyncHealth::AuthRequired;
                self.emit(SyncEvent::AuthRequired);
            }
            SyncError::Cancelled { .. } => {}
            _ => core.health = SyncHealth::Degraded,
        }
        self.publish_status(&core);
    }
}
