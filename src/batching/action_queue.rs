// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-action-type FIFO of pending actions.
//!
//! An [`ActionQueue`] keeps every unresolved action of one type in arrival
//! order. Actions stay in place while they are being sent, retried or held,
//! so a retried action keeps its position ahead of anything enqueued after
//! it. A flush is due when the queued count reaches the threshold or the
//! oldest queued action has waited longer than the flush interval,
//! whichever comes first. After a failed delivery the queue sits out one
//! full flush interval before either trigger fires again.
//!
//! # Example
//!
//! ```
//! use quota_sync::batching::action_queue::{ActionQueue, QueueConfig};
//! use quota_sync::{ActionType, PendingAction, FlushReason};
//! use serde_json::json;
//!
//! let mut queue = ActionQueue::new(ActionType::Swipe, QueueConfig { flush_ms: 5_000, flush_count: 2 });
//! assert!(queue.push(PendingAction::new(ActionType::Swipe, json!({}), 0)).is_none());
//! assert_eq!(
//!     queue.push(PendingAction::new(ActionType::Swipe, json!({}), 1)),
//!     Some(FlushReason::Count)
//! );
//! ```

use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::action::{ActionId, ActionStatus, ActionType, PendingAction};
use crate::clock::Timestamp;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Oldest queued action waited a full interval
    Time,
    /// Queued count reached the batch size
    Count,
    /// Manual flush requested
    Manual,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Thresholds for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Flush once the oldest queued action is this old
    pub flush_ms: u64,
    /// Flush at this many queued actions
    pub flush_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_ms: 5_000,
            flush_count: 20,
        }
    }
}

/// Unresolved actions of one type, oldest first.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    action_type: ActionType,
    config: QueueConfig,
    entries: VecDeque<PendingAction>,
    ids: HashSet<ActionId>,
    /// No automatic flush before this time (set by a charged requeue)
    retry_not_before: Option<Timestamp>,
}

impl ActionQueue {
    pub fn new(action_type: ActionType, config: QueueConfig) -> Self {
        Self {
            action_type,
            config,
            entries: VecDeque::new(),
            ids: HashSet::new(),
            retry_not_before: None,
        }
    }

    #[must_use]
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn set_config(&mut self, config: QueueConfig) {
        self.config = config;
    }

    #[must_use]
    pub fn contains(&self, id: &ActionId) -> bool {
        self.ids.contains(id)
    }

    /// Append an action, returns flush reason if the count threshold is hit.
    ///
    /// Duplicates are ignored; callers check [`contains`](Self::contains)
    /// when they need to know.
    pub fn push(&mut self, action: PendingAction) -> Option<FlushReason> {
        if !self.ids.insert(action.id) {
            debug!(id = %action.id, "Duplicate action ignored");
            return None;
        }
        self.entries.push_back(action);

        if self.queued_len() >= self.config.flush_count {
            Some(FlushReason::Count)
        } else {
            None
        }
    }

    /// Check if time threshold exceeded
    #[must_use]
    pub fn should_flush_time(&self, now: Timestamp) -> bool {
        self.oldest_queued_at()
            .is_some_and(|at| now.saturating_sub(at) >= self.config.flush_ms as i64)
    }

    /// Reason a flush is due now, if any. Count is checked first.
    ///
    /// Nothing is due while the queue is backing off from a failed
    /// delivery; manual and shutdown flushes don't go through here.
    #[must_use]
    pub fn due(&self, now: Timestamp) -> Option<FlushReason> {
        if self.is_backing_off(now) {
            None
        } else if self.queued_len() >= self.config.flush_count {
            Some(FlushReason::Count)
        } else if self.should_flush_time(now) {
            Some(FlushReason::Time)
        } else {
            None
        }
    }

    /// Mark up to `max` oldest queued actions as Sending and return copies.
    pub fn take_batch(&mut self, max: usize) -> Vec<PendingAction> {
        let mut batch = Vec::new();
        for action in self.entries.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if action.status == ActionStatus::Queued {
                action.status = ActionStatus::Sending;
                batch.push(action.clone());
            }
        }
        debug!(action_type = %self.action_type, count = batch.len(), "Batch taken for flush");
        batch
    }

    /// Remove an action for good (acked or dropped).
    pub fn remove(&mut self, id: &ActionId) -> Option<PendingAction> {
        if !self.ids.remove(id) {
            return None;
        }
        let pos = self.entries.iter().position(|a| a.id == *id)?;
        self.entries.remove(pos)
    }

    /// Put an action back in line at `now`, optionally charging a retry.
    /// Returns the new retry count.
    ///
    /// A charged requeue also holds off automatic flushes of the whole
    /// queue for one flush interval.
    pub fn requeue(&mut self, id: &ActionId, charge_retry: bool, now: Timestamp) -> Option<u32> {
        let flush_ms = self.config.flush_ms as i64;
        let action = self.get_mut(id)?;
        action.status = ActionStatus::Queued;
        action.queued_at = Some(now);
        if charge_retry {
            action.retry_count += 1;
        }
        let retry_count = action.retry_count;
        if charge_retry {
            self.retry_not_before = Some(now.saturating_add(flush_ms));
        }
        Some(retry_count)
    }

    /// Whether a failed delivery still blocks automatic flushes.
    #[must_use]
    pub fn is_backing_off(&self, now: Timestamp) -> bool {
        self.retry_not_before.is_some_and(|at| now < at)
    }

    /// Park an action until credentials are refreshed.
    pub fn hold(&mut self, id: &ActionId) -> bool {
        match self.get_mut(id) {
            Some(action) => {
                action.status = ActionStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Move every held action back to Queued. Returns how many moved.
    pub fn release_holds(&mut self) -> usize {
        let mut released = 0;
        for action in self.entries.iter_mut().filter(|a| a.status == ActionStatus::Failed) {
            action.status = ActionStatus::Queued;
            released += 1;
        }
        released
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.count_status(ActionStatus::Queued)
    }

    #[must_use]
    pub fn held_len(&self) -> usize {
        self.count_status(ActionStatus::Failed)
    }

    /// All unresolved actions (queued, sending or held)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.entries.iter()
    }

    fn get_mut(&mut self, id: &ActionId) -> Option<&mut PendingAction> {
        self.entries.iter_mut().find(|a| a.id == *id)
    }

    fn oldest_queued_at(&self) -> Option<Timestamp> {
        self.entries
            .iter()
            .filter(|a| a.status == ActionStatus::Queued)
            .map(PendingAction::waiting_since)
            .min()
    }

    fn count_status(&self, status: ActionStatus) -> usize {
        self.entries.iter().filter(|a| a.status == status).count()
    }
}
