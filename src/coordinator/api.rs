// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! UI-facing API: reservations, enqueue, reads and session changes.
//!
//! Every call here is synchronous and takes the engine lock once.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::action::{ActionType, PendingAction};
use crate::batching::processor::EnqueueOutcome;
use crate::metrics;
use crate::quota::{DenyReason, MembershipTier, Reservation, ReserveOutcome, UsageCounter};

use super::{RecordOutcome, SyncEngine, SyncEvent, SyncHealth};

impl SyncEngine {
    /// Reserve quota for an action and queue it for delivery.
    ///
    /// Check, increment and enqueue happen under one lock, so concurrent
    /// callers can never oversubscribe a window. Once shutdown has begun
    /// every call is denied with [`DenyReason::EngineStopped`].
    pub fn record_action(&self, action_type: ActionType, payload: Value) -> RecordOutcome {
        if let Some(reason) = self.closed_reason(action_type) {
            return RecordOutcome::Denied(reason);
        }
        let now = self.clock.now();
        let mut core = self.core.lock();

        let reservation = match core.quota.check_and_reserve(action_type, now) {
            ReserveOutcome::Allowed(reservation) => reservation,
            ReserveOutcome::Denied(reason) => {
                metrics::record_reservation(action_type.as_str(), "denied");
                debug!(%action_type, %reason, "Action denied");
                return RecordOutcome::Denied(reason);
            }
        };
        metrics::record_reservation(action_type.as_str(), "allowed");
        metrics::set_remaining(action_type.as_str(), reservation.remaining());

        let action = PendingAction::new(action_type, payload, now).with_reserved_window(reservation.window_start);
        let id = action.id;
        if let EnqueueOutcome::Queued { flush: Some(reason) } = core.batches.enqueue(action) {
            debug!(%action_type, reason = reason.as_str(), "Queue full, waking flusher");
            self.flush_notify.notify_one();
        }
        self.publish_status(&core);

        RecordOutcome::Recorded {
            id,
            remaining: reservation.remaining(),
        }
    }

    /// Reserve without enqueueing, for callers that build the action later.
    ///
    /// Pair with [`enqueue`](Self::enqueue), or release with
    /// [`rollback`](Self::rollback) if the action is abandoned.
    pub fn check_and_reserve(&self, action_type: ActionType) -> ReserveOutcome {
        if let Some(reason) = self.closed_reason(action_type) {
            return ReserveOutcome::Denied(reason);
        }
        let now = self.clock.now();
        let outcome = self.core.lock().quota.check_and_reserve(action_type, now);
        let label = if outcome.is_allowed() { "allowed" } else { "denied" };
        metrics::record_reservation(action_type.as_str(), label);
        outcome
    }

    /// Queue an action that already holds a reservation.
    ///
    /// Re-enqueueing a queued or recently settled id is a no-op. After
    /// shutdown begins this returns [`EnqueueOutcome::Closed`] and the caller
    /// still owns the reservation.
    pub fn enqueue(&self, action: PendingAction) -> EnqueueOutcome {
        if !self.state().accepts_actions() {
            warn!(action_type = %action.action_type, id = %action.id, "Engine stopped, action not queued");
            return EnqueueOutcome::Closed;
        }
        let mut core = self.core.lock();
        let outcome = core.batches.enqueue(action);
        if let EnqueueOutcome::Queued { flush: Some(_) } = outcome {
            self.flush_notify.notify_one();
        }
        self.publish_status(&core);
        outcome
    }

    fn closed_reason(&self, action_type: ActionType) -> Option<DenyReason> {
        let state = self.state();
        if state.accepts_actions() {
            return None;
        }
        metrics::record_reservation(action_type.as_str(), "denied");
        debug!(%action_type, %state, "Engine stopped, action denied");
        Some(DenyReason::EngineStopped)
    }

    /// Release a reservation whose action will never be enqueued.
    pub fn rollback(&self, reservation: &Reservation) -> bool {
        let now = self.clock.now();
        self.core
            .lock()
            .quota
            .rollback(reservation.action_type, Some(reservation.window_start), now)
    }

    /// Current counter for display, as of now. Never mutates.
    #[must_use]
    pub fn get_state(&self, action_type: ActionType) -> Option<UsageCounter> {
        let now = self.clock.now();
        self.core.lock().quota.get_state(action_type, now)
    }

    /// All known counters, as of now.
    #[must_use]
    pub fn counters(&self) -> Vec<UsageCounter> {
        let now = self.clock.now();
        let core = self.core.lock();
        ActionType::ALL
            .iter()
            .filter_map(|t| core.quota.get_state(*t, now))
            .collect()
    }

    /// Switch the user's membership tier and re-apply limits.
    pub fn set_tier(&self, tier: MembershipTier) {
        self.user.write().tier = tier;
        let mut core = self.core.lock();
        if core.quota.tier() == tier {
            return;
        }
        core.quota.set_tier(tier);
        info!(%tier, "Membership tier changed");
        self.emit(SyncEvent::CountersChanged {
            action_types: ActionType::ALL.to_vec(),
        });
        self.publish_status(&core);
    }

    /// The host re-authenticated: release parked batches and flush them.
    pub fn credentials_refreshed(&self) {
        let mut core = self.core.lock();
        let released = core.batches.release_holds();
        if core.health == SyncHealth::AuthRequired {
            core.health = SyncHealth::Healthy;
        }
        info!(released, "Credentials refreshed, held actions requeued");
        self.publish_status(&core);
        drop(core);

        if released > 0 {
            self.flush_notify.notify_one();
        }
    }
}
