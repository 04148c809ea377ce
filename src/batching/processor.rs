// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch processor: per-type queues, in-flight tracking and delivery
//! bookkeeping.
//!
//! A flush is split in three steps so the network call can run without
//! holding the engine lock:
//!
//! 1. [`BatchProcessor::begin_flush`] (locked) picks the oldest queued
//!    actions, marks them Sending and registers the batch as in flight.
//! 2. [`deliver`] (unlocked) submits the batch through the
//!    [`RetryCoordinator`].
//! 3. [`BatchProcessor::complete_flush`] (locked) applies the result to the
//!    queue and the [`QuotaCache`].
//!
//! ```text
//! Queued → Sending → Acked            commit, removed
//!                  → Queued           retry_count + 1 (up to max_retries)
//!                  → Dropped          rollback, removed
//!                  → Failed → Queued  auth hold, released on refresh
//! ```

use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::action_queue::{ActionQueue, FlushReason, QueueConfig};
use crate::action::{ActionId, ActionStatus, ActionType, PendingAction};
use crate::clock::Timestamp;
use crate::error::SyncError;
use crate::metrics;
use crate::quota::QuotaCache;
use crate::remote::{AckStatus, RemoteStore, SubmitRequest, SubmitResponse};
use crate::resilience::retry::{CancelFlag, RetryCoordinator, RetryError};

/// Batching knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Max actions per submitted batch, also the count flush threshold
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Failed deliveries an action survives before it is dropped
    pub max_retries: u32,
    /// How many acked/dropped ids are remembered for dedupe
    pub settled_id_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval_ms: 5_000,
            max_retries: 3,
            settled_id_capacity: 1024,
        }
    }
}

impl BatchConfig {
    fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            flush_ms: self.flush_interval_ms,
            flush_count: self.batch_size.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Added; `flush` is set when the queue reached the batch size
    Queued { flush: Option<FlushReason> },
    /// Same id already queued or recently settled
    Duplicate,
    /// The engine no longer accepts actions
    Closed,
}

/// A batch handed out by [`BatchProcessor::begin_flush`].
#[derive(Debug, Clone)]
pub struct InFlightBatch {
    pub batch_id: Uuid,
    pub action_type: ActionType,
    pub reason: FlushReason,
    pub actions: Vec<PendingAction>,
}

impl InFlightBatch {
    #[must_use]
    pub fn request(&self, user_id: &str) -> SubmitRequest {
        SubmitRequest {
            batch_id: self.batch_id,
            user_id: user_id.to_string(),
            actions: self.actions.iter().map(PendingAction::envelope).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, id: &ActionId) -> bool {
        self.actions.iter().any(|a| a.id == *id)
    }
}

#[derive(Debug, Clone)]
pub enum BeginFlush {
    /// Nothing queued for this type
    Empty,
    /// Another batch of this type is still in flight
    Deferred { in_flight: Uuid },
    Ready(InFlightBatch),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The remote store refused this action
    Rejected(String),
    /// Failed more than `max_retries` deliveries
    RetriesExhausted,
    /// Malformed request
    Invalid(String),
}

impl DropReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Invalid(_) => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedAction {
    pub id: ActionId,
    pub action_type: ActionType,
    pub reason: DropReason,
    /// Whether the quota reservation was released
    pub rolled_back: bool,
}

/// How a batch as a whole ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Submit call succeeded; individual actions may still be rejected
    Delivered,
    Exhausted { attempts: u32 },
    /// Remote refused the request as malformed
    Invalid,
    AuthRequired,
    Cancelled,
    /// Any other fatal error
    Failed,
}

impl BatchOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Exhausted { .. } => "exhausted",
            Self::Invalid => "invalid",
            Self::AuthRequired => "auth_required",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// What a completed flush did to each action.
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub batch_id: Uuid,
    pub action_type: ActionType,
    pub reason: FlushReason,
    pub outcome: BatchOutcome,
    pub acked: Vec<ActionId>,
    pub requeued: Vec<ActionId>,
    pub dropped: Vec<DroppedAction>,
    pub held: Vec<ActionId>,
    pub error: Option<SyncError>,
}

impl FlushReport {
    fn new(batch: &InFlightBatch, outcome: BatchOutcome) -> Self {
        Self {
            batch_id: batch.batch_id,
            action_type: batch.action_type,
            reason: batch.reason,
            outcome,
            acked: Vec::new(),
            requeued: Vec::new(),
            dropped: Vec::new(),
            held: Vec::new(),
            error: None,
        }
    }
}

/// Result of [`deliver`].
pub type DeliveryResult = Result<SubmitResponse, RetryError<SyncError>>;

/// Submit a batch through the retry coordinator. Runs without any lock held.
pub async fn deliver(
    remote: &dyn RemoteStore,
    retry: &RetryCoordinator,
    cancel: &CancelFlag,
    user_id: &str,
    batch: &InFlightBatch,
) -> DeliveryResult {
    let request = batch.request(user_id);
    let request = &request;
    retry
        .with_retry("submit_batch", cancel, move || remote.submit_batch(request))
        .await
}

/// Bounded memory of acked and dropped ids.
#[derive(Debug, Clone)]
struct SettledIds {
    ids: HashSet<ActionId>,
    order: VecDeque<ActionId>,
    capacity: usize,
}

impl SettledIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: ActionId) {
        if self.capacity == 0 || !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &ActionId) -> bool {
        self.ids.contains(id)
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

/// Per-type queues plus the one-in-flight-batch-per-type rule.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    config: BatchConfig,
    queues: BTreeMap<ActionType, ActionQueue>,
    in_flight: BTreeMap<ActionType, Uuid>,
    settled: SettledIds,
    /// Bumped whenever an action of the type is acked or dropped
    settle_generation: BTreeMap<ActionType, u64>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            queues: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            settled: SettledIds::new(config.settled_id_capacity),
            settle_generation: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: BatchConfig) {
        self.config = config;
        self.settled.set_capacity(config.settled_id_capacity);
        for queue in self.queues.values_mut() {
            queue.set_config(config.queue_config());
        }
    }

    /// Add an action to its type's queue.
    ///
    /// The action is stored as Queued whatever status it came with.
    pub fn enqueue(&mut self, mut action: PendingAction) -> EnqueueOutcome {
        let action_type = action.action_type;
        if self.settled.contains(&action.id) || self.queues.values().any(|q| q.contains(&action.id)) {
            debug!(id = %action.id, %action_type, "Duplicate enqueue ignored");
            metrics::record_enqueue(action_type.as_str(), "duplicate");
            return EnqueueOutcome::Duplicate;
        }

        action.status = ActionStatus::Queued;
        let queue_config = self.config.queue_config();
        let queue = self
            .queues
            .entry(action_type)
            .or_insert_with(|| ActionQueue::new(action_type, queue_config));
        let flush = queue.push(action);
        metrics::record_enqueue(action_type.as_str(), "queued");
        metrics::set_pending(action_type.as_str(), queue.len());
        EnqueueOutcome::Queued { flush }
    }

    /// Pick the next batch for `action_type` and mark it in flight.
    pub fn begin_flush(&mut self, action_type: ActionType, reason: FlushReason) -> BeginFlush {
        if let Some(batch_id) = self.in_flight.get(&action_type) {
            debug!(%action_type, %batch_id, "Flush deferred, batch in flight");
            return BeginFlush::Deferred { in_flight: *batch_id };
        }
        let Some(queue) = self.queues.get_mut(&action_type) else {
            return BeginFlush::Empty;
        };
        let actions = queue.take_batch(self.config.batch_size.max(1));
        if actions.is_empty() {
            return BeginFlush::Empty;
        }

        let batch_id = Uuid::new_v4();
        self.in_flight.insert(action_type, batch_id);
        metrics::record_batch_size(action_type.as_str(), actions.len());
        debug!(%action_type, %batch_id, count = actions.len(), reason = reason.as_str(), "Batch in flight");

        BeginFlush::Ready(InFlightBatch {
            batch_id,
            action_type,
            reason,
            actions,
        })
    }

    /// Apply a delivery result to the queue and the quota cache.
    pub fn complete_flush(
        &mut self,
        batch: InFlightBatch,
        result: DeliveryResult,
        quota: &mut QuotaCache,
        now: Timestamp,
    ) -> FlushReport {
        if self.in_flight.get(&batch.action_type) == Some(&batch.batch_id) {
            self.in_flight.remove(&batch.action_type);
        }

        let report = match result {
            Ok(response) => {
                let mut report = FlushReport::new(&batch, BatchOutcome::Delivered);
                for action in &batch.actions {
                    match response.results.get(&action.id) {
                        Some(AckStatus::Acked) => self.ack(action.action_type, &action.id, quota, &mut report),
                        Some(AckStatus::Rejected { reason }) => {
                            let reason = DropReason::Rejected(reason.clone());
                            self.drop_action(action.action_type, &action.id, reason, quota, now, &mut report);
                        }
                        // Missing from the response: not known to be applied
                        None => self.charge_retry(action.action_type, &action.id, quota, now, &mut report),
                    }
                }
                report
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let mut report = FlushReport::new(&batch, BatchOutcome::Exhausted { attempts });
                for action in &batch.actions {
                    self.charge_retry(action.action_type, &action.id, quota, now, &mut report);
                }
                report.error = Some(last);
                report
            }
            Err(RetryError::Cancelled { .. }) => {
                let mut report = FlushReport::new(&batch, BatchOutcome::Cancelled);
                for action in &batch.actions {
                    self.requeue_free(action.action_type, &action.id, now, &mut report);
                }
                report
            }
            Err(RetryError::Fatal(err)) => {
                let mut report = self.apply_fatal(&batch, &err, quota, now);
                report.error = Some(err);
                report
            }
        };

        let type_label = batch.action_type.as_str();
        metrics::record_flush(type_label, report.outcome.as_str());
        if let Some(queue) = self.queues.get(&batch.action_type) {
            metrics::set_pending(type_label, queue.len());
        }
        info!(
            action_type = type_label,
            batch_id = %report.batch_id,
            outcome = report.outcome.as_str(),
            acked = report.acked.len(),
            requeued = report.requeued.len(),
            dropped = report.dropped.len(),
            held = report.held.len(),
            "Batch completed"
        );
        report
    }

    fn apply_fatal(
        &mut self,
        batch: &InFlightBatch,
        err: &SyncError,
        quota: &mut QuotaCache,
        now: Timestamp,
    ) -> FlushReport {
        match err {
            SyncError::Validation {
                action_id: Some(bad),
                reason,
            } if batch.contains(bad) => {
                let mut report = FlushReport::new(batch, BatchOutcome::Invalid);
                for action in &batch.actions {
                    if action.id == *bad {
                        let reason = DropReason::Invalid(reason.clone());
                        self.drop_action(action.action_type, &action.id, reason, quota, now, &mut report);
                    } else {
                        self.requeue_free(action.action_type, &action.id, now, &mut report);
                    }
                }
                report
            }
            SyncError::Validation { reason, .. } => {
                let mut report = FlushReport::new(batch, BatchOutcome::Invalid);
                for action in &batch.actions {
                    let reason = DropReason::Invalid(reason.clone());
                    self.drop_action(action.action_type, &action.id, reason, quota, now, &mut report);
                }
                report
            }
            SyncError::Auth { .. } => {
                let mut report = FlushReport::new(batch, BatchOutcome::AuthRequired);
                if let Some(queue) = self.queues.get_mut(&batch.action_type) {
                    for action in &batch.actions {
                        if queue.hold(&action.id) {
                            report.held.push(action.id);
                        }
                    }
                }
                warn!(action_type = %batch.action_type, held = report.held.len(), "Batch held until credentials refresh");
                report
            }
            _ => {
                let mut report = FlushReport::new(batch, BatchOutcome::Failed);
                for action in &batch.actions {
                    self.charge_retry(action.action_type, &action.id, quota, now, &mut report);
                }
                report
            }
        }
    }

    fn ack(&mut self, action_type: ActionType, id: &ActionId, quota: &mut QuotaCache, report: &mut FlushReport) {
        let Some(queue) = self.queues.get_mut(&action_type) else {
            return;
        };
        if queue.remove(id).is_some() {
            quota.commit(action_type);
            self.settled.insert(*id);
            self.bump_settle_generation(action_type);
            report.acked.push(*id);
        }
    }

    fn drop_action(
        &mut self,
        action_type: ActionType,
        id: &ActionId,
        reason: DropReason,
        quota: &mut QuotaCache,
        now: Timestamp,
        report: &mut FlushReport,
    ) {
        let Some(action) = self.queues.get_mut(&action_type).and_then(|q| q.remove(id)) else {
            return;
        };
        let rolled_back = quota.rollback(action_type, action.reserved_window, now);
        self.settled.insert(*id);
        self.bump_settle_generation(action_type);
        metrics::record_dropped(action_type.as_str(), reason.as_str());
        warn!(%id, %action_type, reason = reason.as_str(), rolled_back, "Action dropped");
        report.dropped.push(DroppedAction {
            id: *id,
            action_type,
            reason,
            rolled_back,
        });
    }

    fn charge_retry(
        &mut self,
        action_type: ActionType,
        id: &ActionId,
        quota: &mut QuotaCache,
        now: Timestamp,
        report: &mut FlushReport,
    ) {
        let max_retries = self.config.max_retries;
        let Some(retry_count) = self.queues.get_mut(&action_type).and_then(|q| q.requeue(id, true, now)) else {
            return;
        };
        if retry_count > max_retries {
            self.drop_action(action_type, id, DropReason::RetriesExhausted, quota, now, report);
        } else {
            report.requeued.push(*id);
        }
    }

    fn bump_settle_generation(&mut self, action_type: ActionType) {
        *self.settle_generation.entry(action_type).or_insert(0) += 1;
    }

    /// Settle generation per type, for spotting acks and drops that
    /// happened while a pull was in flight.
    #[must_use]
    pub fn settle_generations(&self) -> BTreeMap<ActionType, u64> {
        self.settle_generation.clone()
    }

    /// Whether `action_type` settled anything since `generations` was taken.
    #[must_use]
    pub fn settled_since(&self, action_type: ActionType, generations: &BTreeMap<ActionType, u64>) -> bool {
        let now = self.settle_generation.get(&action_type).copied().unwrap_or(0);
        let then = generations.get(&action_type).copied().unwrap_or(0);
        now != then
    }

    fn requeue_free(&mut self, action_type: ActionType, id: &ActionId, now: Timestamp, report: &mut FlushReport) {
        if let Some(queue) = self.queues.get_mut(&action_type) {
            if queue.requeue(id, false, now).is_some() {
                report.requeued.push(*id);
            }
        }
    }

    /// Types whose flush threshold is met and that have no batch in flight.
    #[must_use]
    pub fn due_flushes(&self, now: Timestamp) -> Vec<(ActionType, FlushReason)> {
        self.queues
            .iter()
            .filter(|(t, _)| !self.in_flight.contains_key(t))
            .filter_map(|(t, q)| q.due(now).map(|reason| (*t, reason)))
            .collect()
    }

    /// Types with at least one Queued action.
    #[must_use]
    pub fn queued_types(&self) -> Vec<ActionType> {
        self.queues
            .iter()
            .filter(|(_, q)| q.queued_len() > 0)
            .map(|(t, _)| *t)
            .collect()
    }

    /// Whether `action_type` has queued, in-flight or held actions.
    #[must_use]
    pub fn has_unresolved(&self, action_type: ActionType) -> bool {
        self.in_flight.contains_key(&action_type)
            || self.queues.get(&action_type).is_some_and(|q| !q.is_empty())
    }

    /// Release auth-held actions in every queue.
    pub fn release_holds(&mut self) -> usize {
        self.queues.values_mut().map(ActionQueue::release_holds).sum()
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.queues.values().map(ActionQueue::held_len).sum()
    }

    /// Unresolved actions per type.
    #[must_use]
    pub fn pending_counts(&self) -> BTreeMap<ActionType, usize> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(t, q)| (*t, q.len()))
            .collect()
    }

    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.queues.values().map(ActionQueue::len).sum()
    }

    #[must_use]
    pub fn queue(&self, action_type: ActionType) -> Option<&ActionQueue> {
        self.queues.get(&action_type)
    }

    #[must_use]
    pub fn in_flight(&self) -> &BTreeMap<ActionType, Uuid> {
        &self.in_flight
    }

    #[must_use]
    pub fn is_settled(&self, id: &ActionId) -> bool {
        self.settled.contains(id)
    }

    /// Every unresolved action, per type in FIFO order.
    #[must_use]
    pub fn pending_snapshot(&self) -> Vec<PendingAction> {
        self.queues.values().flat_map(|q| q.iter().cloned()).collect()
    }

    /// Load actions recovered from persistence.
    pub fn restore(&mut self, pending: Vec<PendingAction>) -> usize {
        pending
            .into_iter()
            .filter(|a| matches!(self.enqueue(a.clone()), EnqueueOutcome::Queued { .. }))
            .count()
    }
}
