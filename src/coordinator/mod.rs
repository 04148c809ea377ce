// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties the components together:
//! - [`QuotaCache`] for allow/deny decisions
//! - [`BatchProcessor`] for per-type pending queues
//! - [`RetryCoordinator`] around every remote call
//! - [`Validator`](crate::validation::Validator) for loaded and pulled state
//! - an optional [`StateStore`] for persistence across sessions
//!
//! Quota cache, batch processor and sync bookkeeping live behind one
//! `parking_lot::Mutex`, the engine's single serialization point. It is
//! never held across an `.await`.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Loading → Ready → Running ⇄ Suspended → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quota_sync::{SyncEngine, QuotaSyncConfig, EngineState, ActionType, MembershipTier, TierLimits};
//! use quota_sync::remote::{InMemoryRemote, UserIdentity};
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = QuotaSyncConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let limits = TierLimits::new(0).with_limit(MembershipTier::Free, ActionType::Swipe, 100);
//! let remote = Arc::new(InMemoryRemote::new(limits, config.window_ms));
//! let engine = Arc::new(SyncEngine::new(config, rx, UserIdentity::new("u1", MembershipTier::Free), remote));
//!
//! assert_eq!(engine.state(), EngineState::Created);
//! engine.start().await.expect("start failed");
//!
//! let outcome = engine.record_action(ActionType::Swipe, json!({"target": "u2"}));
//! assert!(outcome.is_recorded());
//!
//! engine.shutdown().await;
//! # }
//! ```

mod types;
mod api;
mod flush;
mod lifecycle;
mod reconcile;

pub use types::{
    EngineState, FlushOutcome, HealthCheck, PullSummary, RecordOutcome, SyncEvent, SyncHealth,
    SyncState, SyncStatus,
};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::batching::processor::BatchProcessor;
use crate::clock::{Clock, SystemClock};
use crate::config::QuotaSyncConfig;
use crate::metrics;
use crate::persistence::StateStore;
use crate::quota::{QuotaCache, TierLimits};
use crate::remote::{RemoteStore, UserIdentity};
use crate::resilience::retry::{CancelFlag, RetryCoordinator};

const EVENT_CAPACITY: usize = 64;

/// Everything guarded by the engine lock.
pub(super) struct LocalState {
    pub(super) quota: QuotaCache,
    pub(super) batches: BatchProcessor,
    pub(super) sync: SyncState,
    pub(super) health: SyncHealth,
}

impl LocalState {
    /// Copy the processor's in-flight table into the sync bookkeeping.
    pub(super) fn refresh_in_flight(&mut self) {
        self.sync.in_flight_batches = self.batches.in_flight().clone();
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            health: self.health,
            pending: self.batches.pending_total(),
            held: self.batches.held_count(),
            last_sync_at: self.sync.last_sync_timestamp,
            last_error: self.sync.last_sync_error.clone(),
        }
    }
}

/// Quota cache and batched sync engine for one signed-in user.
///
/// Build it once per session, share it through an `Arc`, and drive it with
/// [`init`](Self::init) / [`start`](Self::start) /
/// [`suspend`](Self::suspend) / [`resume`](Self::resume) /
/// [`shutdown`](Self::shutdown).
pub struct SyncEngine {
    /// Configuration (can be updated at runtime via watch channel)
    pub(super) config: RwLock<QuotaSyncConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: tokio::sync::Mutex<watch::Receiver<QuotaSyncConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Quota cache, batch processor and sync bookkeeping
    pub(super) core: Mutex<LocalState>,

    pub(super) user: RwLock<UserIdentity>,
    pub(super) remote: Arc<dyn RemoteStore>,
    pub(super) store: RwLock<Option<Arc<dyn StateStore>>>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) retry: RetryCoordinator,

    /// Cancels retries in flight (suspend, shutdown)
    pub(super) cancel: CancelFlag,
    /// Stops the run loop
    pub(super) stop: CancelFlag,

    pub(super) status: watch::Sender<SyncStatus>,
    pub(super) events: broadcast::Sender<SyncEvent>,

    /// Wakes the run loop when a queue hits the batch size
    pub(super) flush_notify: Notify,
    pub(super) sync_running: AtomicBool,
    /// Serializes snapshot + save so an older snapshot never overwrites a newer one
    pub(super) persist_lock: tokio::sync::Mutex<()>,
    pub(super) task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create a new sync engine.
    ///
    /// The engine starts in `Created` state with no tier limits. Call
    /// [`init()`](Self::init) or [`start()`](Self::start) to load persisted
    /// state and pull the authoritative counters.
    pub fn new(
        config: QuotaSyncConfig,
        config_rx: watch::Receiver<QuotaSyncConfig>,
        user: UserIdentity,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let core = LocalState {
            quota: QuotaCache::new(user.tier, TierLimits::default(), config.window_ms),
            batches: BatchProcessor::new(config.batch_config()),
            sync: SyncState::default(),
            health: SyncHealth::Healthy,
        };

        Self {
            retry: RetryCoordinator::new(config.retry_policy()),
            config: RwLock::new(config),
            config_rx: tokio::sync::Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            core: Mutex::new(core),
            user: RwLock::new(user),
            remote,
            store: RwLock::new(None),
            clock: Arc::new(SystemClock),
            cancel: CancelFlag::new(),
            stop: CancelFlag::new(),
            status: status_tx,
            events: events_tx,
            flush_notify: Notify::new(),
            sync_running: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /// Persist state through `store` instead of the configured SQLite file.
    #[must_use]
    pub fn with_state_store(self, store: Arc<dyn StateStore>) -> Self {
        *self.store.write() = Some(store);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed tier limits so reservations work before the first pull.
    #[must_use]
    pub fn with_tier_limits(self, limits: TierLimits) -> Self {
        self.core.lock().quota.apply_limits(limits);
        self
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Get a receiver to watch sync status changes.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to dropped-action, auth and counter-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Check if engine is ready to accept actions.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    #[must_use]
    pub fn user(&self) -> UserIdentity {
        self.user.read().clone()
    }

    #[must_use]
    pub fn config(&self) -> QuotaSyncConfig {
        self.config.read().clone()
    }

    /// Sync bookkeeping snapshot.
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.core.lock().sync.clone()
    }

    /// Collect cached state into a [`HealthCheck`]. No I/O.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = matches!(state, EngineState::Ready | EngineState::Running);
        let core = self.core.lock();

        HealthCheck {
            state,
            ready,
            sync_health: core.health,
            pending: core.batches.pending_counts(),
            held: core.batches.held_count(),
            in_flight: core.batches.in_flight().clone(),
            last_sync_at: core.sync.last_sync_timestamp,
            last_error: core.sync.last_sync_error.clone(),
            healthy: state == EngineState::Running && core.health == SyncHealth::Healthy,
        }
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Publish the status if it changed. Called with the lock held.
    pub(super) fn publish_status(&self, core: &LocalState) {
        let next = core.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Fire an event; nobody listening is fine.
    pub(super) fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub(super) fn state_store(&self) -> Option<Arc<dyn StateStore>> {
        self.store.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::quota::MembershipTier;
    use crate::remote::InMemoryRemote;

    fn engine() -> SyncEngine {
        let config = QuotaSyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        let remote = Arc::new(InMemoryRemote::new(TierLimits::new(0), config.window_ms));
        SyncEngine::new(config, rx, UserIdentity::new("u1", MembershipTier::Free), remote)
    }

    #[test]
    fn test_new_engine_is_created() {
        let engine = engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_ready());
        assert_eq!(engine.status(), SyncStatus::default());
    }

    #[test]
    fn test_health_check_on_idle_engine() {
        let engine = engine();
        let health = engine.health_check();
        assert_eq!(health.state, EngineState::Created);
        assert!(!health.ready);
        assert!(!health.healthy);
        assert!(health.pending.is_empty());
        assert!(health.in_flight.is_empty());
    }

    #[test]
    fn test_with_tier_limits_seeds_cache() {
        let limits = TierLimits::new(0).with_limit(MembershipTier::Free, ActionType::Swipe, 5);
        let engine = engine().with_tier_limits(limits);
        assert_eq!(engine.get_state(ActionType::Swipe).map(|c| c.limit), Some(5));
    }

    #[test]
    fn test_state_receiver_sees_transitions() {
        let engine = engine();
        let rx = engine.state_receiver();
        engine.set_state(EngineState::Loading);
        assert_eq!(*rx.borrow(), EngineState::Loading);
    }
}
