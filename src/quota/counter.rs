// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-action-type usage counter with a rolling reset window.

use serde::{Deserialize, Serialize};

use crate::action::ActionType;
use crate::clock::Timestamp;

/// Usage of one action type inside the current quota window.
///
/// `current_count` never exceeds `limit` through a local reservation; it
/// may briefly do so after the remote store hands back a higher count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub action_type: ActionType,
    pub current_count: u32,
    pub limit: u32,
    pub window_start: Timestamp,
    pub reset_timestamp: Timestamp,
    pub last_action_timestamp: Timestamp,
}

impl UsageCounter {
    /// Open an empty window of `window_ms` starting at `window_start`.
    pub fn new(action_type: ActionType, limit: u32, window_start: Timestamp, window_ms: i64) -> Self {
        Self {
            action_type,
            current_count: 0,
            limit,
            window_start,
            reset_timestamp: window_start.saturating_add(window_ms.max(1)),
            last_action_timestamp: 0,
        }
    }

    #[must_use]
    pub fn window_len(&self) -> i64 {
        self.reset_timestamp.saturating_sub(self.window_start)
    }

    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.reset_timestamp
    }

    /// Reset the count and move to the window containing `now`.
    ///
    /// Returns `true` if a reset happened. The window length is preserved,
    /// so a device that was offline for several windows lands on the
    /// current one instead of replaying each boundary.
    pub fn roll_window(&mut self, now: Timestamp) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        let len = self.window_len().max(1);
        let elapsed = now.saturating_sub(self.window_start);
        let windows = elapsed / len;
        self.window_start = self.window_start.saturating_add(windows.saturating_mul(len));
        self.reset_timestamp = self.window_start.saturating_add(len);
        self.current_count = 0;
        true
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.current_count)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.current_count >= self.limit
    }

    /// View of this counter as it would look at `now`, without mutating.
    #[must_use]
    pub fn as_of(&self, now: Timestamp) -> Self {
        let mut view = self.clone();
        view.roll_window(now);
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_new_counter_window() {
        let c = UsageCounter::new(ActionType::Swipe, 10, 1_000, DAY);
        assert_eq!(c.current_count, 0);
        assert_eq!(c.window_len(), DAY);
        assert_eq!(c.reset_timestamp, 1_000 + DAY);
        assert_eq!(c.remaining(), 10);
    }

    #[test]
    fn test_roll_window_before_boundary_is_noop() {
        let mut c = UsageCounter::new(ActionType::Swipe, 10, 0, DAY);
        c.current_count = 4;
        assert!(!c.roll_window(DAY - 1));
        assert_eq!(c.current_count, 4);
    }

    #[test]
    fn test_roll_window_at_boundary() {
        let mut c = UsageCounter::new(ActionType::Swipe, 10, 0, DAY);
        c.current_count = 10;
        assert!(c.roll_window(DAY));
        assert_eq!(c.current_count, 0);
        assert_eq!(c.window_start, DAY);
        assert_eq!(c.reset_timestamp, 2 * DAY);
        // Second call in the same window does nothing
        c.current_count = 1;
        assert!(!c.roll_window(DAY + 5));
        assert_eq!(c.current_count, 1);
    }

    #[test]
    fn test_roll_window_skips_missed_windows() {
        let mut c = UsageCounter::new(ActionType::Message, 5, 0, 1_000);
        c.current_count = 5;
        assert!(c.roll_window(3_500));
        assert_eq!(c.window_start, 3_000);
        assert_eq!(c.reset_timestamp, 4_000);
        assert_eq!(c.current_count, 0);
    }

    #[test]
    fn test_as_of_does_not_mutate() {
        let mut c = UsageCounter::new(ActionType::Match, 3, 0, 100);
        c.current_count = 3;
        let view = c.as_of(150);
        assert_eq!(view.current_count, 0);
        assert_eq!(c.current_count, 3);
    }

    #[test]
    fn test_remaining_saturates_when_over_limit() {
        let mut c = UsageCounter::new(ActionType::Swipe, 2, 0, 100);
        c.current_count = 5;
        assert_eq!(c.remaining(), 0);
        assert!(c.is_exhausted());
    }
}
