// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local quota cache.
//!
//! [`QuotaCache`] answers "may this action proceed?" and keeps the
//! optimistic count of reservations that have not been acknowledged yet.
//! It takes `&mut self` for every mutation: the engine keeps it behind its
//! single serialization lock, so a check and its increment always land in
//! one critical section.
//!
//! # Example
//!
//! ```
//! use quota_sync::{ActionType, MembershipTier, TierLimits};
//! use quota_sync::quota::{QuotaCache, ReserveOutcome, DenyReason};
//!
//! let limits = TierLimits::new(0).with_limit(MembershipTier::Free, ActionType::Swipe, 2);
//! let mut cache = QuotaCache::new(MembershipTier::Free, limits, 86_400_000);
//!
//! assert!(cache.check_and_reserve(ActionType::Swipe, 1_000).is_allowed());
//! assert!(cache.check_and_reserve(ActionType::Swipe, 1_001).is_allowed());
//! assert!(matches!(
//!     cache.check_and_reserve(ActionType::Swipe, 1_002),
//!     ReserveOutcome::Denied(DenyReason::LimitExceeded { limit: 2, .. })
//! ));
//!
//! // No limit configured for messages on this tier
//! assert!(matches!(
//!     cache.check_and_reserve(ActionType::Message, 1_003),
//!     ReserveOutcome::Denied(DenyReason::WindowUnknown)
//! ));
//! ```

use std::collections::BTreeMap;
use tracing::debug;

use super::counter::UsageCounter;
use super::tiers::{MembershipTier, TierLimits};
use crate::action::ActionType;
use crate::clock::Timestamp;
use crate::metrics;

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The current window is used up
    LimitExceeded { limit: u32, reset_at: Timestamp },
    /// No counter and no tier limit for this action type yet
    WindowUnknown,
    /// The engine is shutting down or stopped
    EngineStopped,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LimitExceeded { limit, reset_at } => {
                write!(f, "limit of {limit} reached, resets at {reset_at}")
            }
            Self::WindowUnknown => write!(f, "quota window unknown"),
            Self::EngineStopped => write!(f, "engine is shutting down"),
        }
    }
}

/// A granted reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub action_type: ActionType,
    /// Window the reservation was charged to
    pub window_start: Timestamp,
    /// Count after this reservation
    pub count_after: u32,
    pub limit: u32,
}

impl Reservation {
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count_after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Allowed(Reservation),
    Denied(DenyReason),
}

impl ReserveOutcome {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// Per-action-type usage counters checked against the current tier's limits.
#[derive(Debug, Clone)]
pub struct QuotaCache {
    counters: BTreeMap<ActionType, UsageCounter>,
    limits: TierLimits,
    tier: MembershipTier,
    window_ms: i64,
}

impl QuotaCache {
    pub fn new(tier: MembershipTier, limits: TierLimits, window_ms: i64) -> Self {
        Self {
            counters: BTreeMap::new(),
            limits,
            tier,
            window_ms: window_ms.max(1),
        }
    }

    #[must_use]
    pub fn tier(&self) -> MembershipTier {
        self.tier
    }

    #[must_use]
    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    /// Window length used for counters opened from now on.
    pub fn set_window_ms(&mut self, window_ms: i64) {
        self.window_ms = window_ms.max(1);
    }

    /// Check the quota and, if there is room, count the action.
    ///
    /// An expired window is rolled forward before the comparison. Both steps
    /// happen under the same `&mut self` borrow.
    pub fn check_and_reserve(&mut self, action_type: ActionType, now: Timestamp) -> ReserveOutcome {
        if !self.counters.contains_key(&action_type) {
            let Some(limit) = self.limits.limit_for(self.tier, action_type) else {
                return ReserveOutcome::Denied(DenyReason::WindowUnknown);
            };
            self.counters
                .insert(action_type, UsageCounter::new(action_type, limit, now, self.window_ms));
        }
        let Some(counter) = self.counters.get_mut(&action_type) else {
            return ReserveOutcome::Denied(DenyReason::WindowUnknown);
        };

        if counter.roll_window(now) {
            debug!(%action_type, window_start = counter.window_start, "Quota window reset");
            metrics::record_window_reset(action_type.as_str());
        }

        if counter.current_count >= counter.limit {
            return ReserveOutcome::Denied(DenyReason::LimitExceeded {
                limit: counter.limit,
                reset_at: counter.reset_timestamp,
            });
        }

        counter.current_count += 1;
        counter.last_action_timestamp = now;
        ReserveOutcome::Allowed(Reservation {
            action_type,
            window_start: counter.window_start,
            count_after: counter.current_count,
            limit: counter.limit,
        })
    }

    /// Acknowledged by the remote. The reservation is already counted.
    pub fn commit(&mut self, action_type: ActionType) {
        metrics::record_commit(action_type.as_str());
    }

    /// Release one reservation.
    ///
    /// `reserved_window` is the window the reservation was charged to. If that
    /// window has since expired the new window never saw the reservation, so
    /// nothing is subtracted. `None` releases unconditionally. Returns `true`
    /// if the count changed.
    pub fn rollback(
        &mut self,
        action_type: ActionType,
        reserved_window: Option<Timestamp>,
        now: Timestamp,
    ) -> bool {
        let Some(counter) = self.counters.get_mut(&action_type) else {
            return false;
        };
        counter.roll_window(now);
        if let Some(window) = reserved_window {
            if window != counter.window_start {
                debug!(%action_type, window, current = counter.window_start, "Rollback skipped for expired window");
                return false;
            }
        }
        if counter.current_count == 0 {
            return false;
        }
        counter.current_count -= 1;
        metrics::record_rollback(action_type.as_str());
        true
    }

    /// Read-only view of a counter as of `now`.
    ///
    /// An expired window shows as reset without being mutated; a type with a
    /// known limit but no activity yet shows an empty window.
    #[must_use]
    pub fn get_state(&self, action_type: ActionType, now: Timestamp) -> Option<UsageCounter> {
        match self.counters.get(&action_type) {
            Some(counter) => Some(counter.as_of(now)),
            None => self
                .limits
                .limit_for(self.tier, action_type)
                .map(|limit| UsageCounter::new(action_type, limit, now, self.window_ms)),
        }
    }

    #[must_use]
    pub fn counter(&self, action_type: ActionType) -> Option<&UsageCounter> {
        self.counters.get(&action_type)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<UsageCounter> {
        self.counters.values().cloned().collect()
    }

    /// Overwrite a counter with an authoritative one.
    pub fn replace_counter(&mut self, counter: UsageCounter) {
        self.counters.insert(counter.action_type, counter);
    }

    /// Replace all counters, e.g. after loading validated state.
    pub fn load_counters(&mut self, counters: impl IntoIterator<Item = UsageCounter>) {
        self.counters = counters.into_iter().map(|c| (c.action_type, c)).collect();
    }

    /// Switch tier and re-apply its limits to every counter.
    pub fn set_tier(&mut self, tier: MembershipTier) {
        self.tier = tier;
        self.reapply_limits();
    }

    /// Replace the limit table and re-apply it to every counter.
    pub fn apply_limits(&mut self, limits: TierLimits) {
        self.limits = limits;
        self.reapply_limits();
    }

    fn reapply_limits(&mut self) {
        for counter in self.counters.values_mut() {
            if let Some(limit) = self.limits.limit_for(self.tier, counter.action_type) {
                counter.limit = limit;
            }
        }
    }
}
