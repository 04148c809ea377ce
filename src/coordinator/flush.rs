// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch flushing and state persistence.

use std::time::Instant;
use tracing::{debug, warn};

use crate::action::ActionType;
use crate::batching::action_queue::FlushReason;
use crate::batching::processor::{deliver, BatchOutcome, BeginFlush, FlushReport};
use crate::error::SyncError;
use crate::metrics;
use crate::persistence::{encode, PersistedState};

use super::{FlushOutcome, LocalState, SyncEngine, SyncEvent, SyncHealth};

impl SyncEngine {
    /// Flush one batch of `action_type`.
    ///
    /// The batch is taken under the lock, submitted without it, and the
    /// result applied under the lock again. A second flush of the same type
    /// while one is in flight returns [`FlushOutcome::Deferred`].
    #[tracing::instrument(skip_all, fields(action_type = %action_type, reason = reason.as_str()))]
    pub async fn flush(&self, action_type: ActionType, reason: FlushReason) -> FlushOutcome {
        let batch = {
            let mut core = self.core.lock();
            let begun = core.batches.begin_flush(action_type, reason);
            core.refresh_in_flight();
            match begun {
                BeginFlush::Empty => return FlushOutcome::Empty,
                BeginFlush::Deferred { in_flight } => return FlushOutcome::Deferred { in_flight },
                BeginFlush::Ready(batch) => batch,
            }
        };

        let started = Instant::now();
        let user_id = self.user.read().user_id.clone();
        let result = {
            let _timer = metrics::LatencyTimer::new("submit_batch");
            deliver(self.remote.as_ref(), &self.retry, &self.cancel, &user_id, &batch).await
        };

        let report = {
            let now = self.clock.now();
            let mut core = self.core.lock();
            let LocalState { quota, batches, .. } = &mut *core;
            let report = batches.complete_flush(batch, result, quota, now);
            core.refresh_in_flight();
            self.apply_report(&mut core, &report);
            self.publish_status(&core);
            report
        };
        metrics::record_flush_duration(started.elapsed());

        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist state after flush");
        }
        FlushOutcome::Completed(report)
    }

    /// Flush every type whose count or age threshold is met.
    pub async fn flush_due(&self) -> Vec<FlushOutcome> {
        let due = {
            let now = self.clock.now();
            self.core.lock().batches.due_flushes(now)
        };
        let mut outcomes = Vec::with_capacity(due.len());
        for (action_type, reason) in due {
            outcomes.push(self.flush(action_type, reason).await);
        }
        outcomes
    }

    /// Flush one batch of every type that has queued actions.
    pub async fn flush_all(&self, reason: FlushReason) -> Vec<FlushOutcome> {
        let types = self.core.lock().batches.queued_types();
        let mut outcomes = Vec::with_capacity(types.len());
        for action_type in types {
            outcomes.push(self.flush(action_type, reason).await);
        }
        outcomes
    }

    /// Write counters, pending queues, limits and last sync time to the
    /// state store. A no-op without one.
    pub async fn persist(&self) -> Result<(), SyncError> {
        let Some(store) = self.state_store() else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;

        let user = self.user.read().clone();
        let blob = {
            let core = self.core.lock();
            let mut state = PersistedState::new(user.user_id.as_str(), user.tier, self.clock.now());
            state.counters = core.quota.snapshot();
            state.pending = core.batches.pending_snapshot();
            state.tier_limits = core.quota.limits().clone();
            state.last_sync_at = core.sync.last_sync_timestamp;
            encode(&state)?
        };

        match store.save(&user.user_id, &blob).await {
            Ok(()) => {
                metrics::record_persist("success");
                debug!(user_id = %user.user_id, bytes = blob.blob.len(), "State persisted");
                Ok(())
            }
            Err(e) => {
                metrics::record_persist("failure");
                Err(e)
            }
        }
    }

    /// Turn a flush report into health, events and error bookkeeping.
    fn apply_report(&self, core: &mut LocalState, report: &FlushReport) {
        match report.outcome {
            BatchOutcome::Delivered => {
                if core.health == SyncHealth::Degraded {
                    core.health = SyncHealth::Healthy;
                }
            }
            BatchOutcome::Exhausted { .. } | BatchOutcome::Failed => {
                core.health = SyncHealth::Degraded;
            }
            BatchOutcome::AuthRequired => {
                core.health = SyncHealth::AuthRequired;
                self.emit(SyncEvent::AuthRequired);
            }
            BatchOutcome::Invalid | BatchOutcome::Cancelled => {}
        }
        if let Some(err) = &report.error {
            core.sync.last_sync_error = Some(err.to_string());
        }

        for dropped in &report.dropped {
            self.emit(SyncEvent::ActionDropped {
                id: dropped.id,
                action_type: dropped.action_type,
                reason: dropped.reason.clone(),
                rolled_back: dropped.rolled_back,
            });
        }
        if report.dropped.iter().any(|d| d.rolled_back) {
            self.emit(SyncEvent::CountersChanged {
                action_types: vec![report.action_type],
            });
        }
    }
}
