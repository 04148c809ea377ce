//! Engine lifecycle management: init, start, run loop, suspend, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batching::action_queue::FlushReason;
use crate::config::QuotaSyncConfig;
use crate::error::SyncError;
use crate::persistence::{decode, RawState, SqliteStateStore, StateStore};
use crate::validation::Validator;

use super::{EngineState, SyncEngine};

/// How often the run loop looks for queues past their flush age.
fn poll_period(flush_interval: Duration) -> Duration {
    (flush_interval / 4).max(Duration::from_millis(10))
}

fn ticker(period: Duration) -> Interval {
    let mut tick = interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

impl SyncEngine {
    /// Load persisted state and pull the authoritative counters.
    ///
    /// Startup flow:
    /// 1. Open the SQLite store if `state_path` is set and none was injected
    /// 2. Load the user's blob; a corrupt envelope means starting empty
    /// 3. Validate each record and restore counters and pending queues
    /// 4. Pull from the remote (failure is logged, the engine works offline)
    ///
    /// An invalid config fails with [`SyncError::Config`] before anything runs.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<(), SyncError> {
        self.validate_config()?;
        let init_start = Instant::now();
        info!("Initializing quota sync engine");
        self.set_state(EngineState::Loading);

        // ========== PHASE 1: State store ==========
        let phase_start = Instant::now();
        if let Err(e) = self.open_configured_store().await {
            error!(error = %e, "Failed to open state store, continuing without persistence");
        }
        crate::metrics::record_startup_phase("store_open", phase_start.elapsed());

        // ========== PHASE 2: Load + validate ==========
        let phase_start = Instant::now();
        if let Some(raw) = self.load_raw_state().await {
            self.restore(&raw);
        }
        crate::metrics::record_startup_phase("load", phase_start.elapsed());

        self.set_state(EngineState::Ready);

        // ========== PHASE 3: Pull ==========
        let phase_start = Instant::now();
        if let Err(e) = self.pull_authoritative().await {
            warn!(error = %e, "Initial pull failed, starting from local state");
        }
        crate::metrics::record_startup_phase("pull", phase_start.elapsed());

        {
            let core = self.core.lock();
            self.publish_status(&core);
        }
        info!(elapsed_ms = init_start.elapsed().as_millis() as u64, "Quota sync engine ready");
        Ok(())
    }

    /// Initialize if needed and spawn the background flush/sync loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        self.validate_config()?;
        match self.state() {
            EngineState::Created => self.init().await?,
            EngineState::Ready => {}
            EngineState::Running => return Ok(()),
            other => {
                return Err(SyncError::Config(format!("cannot start engine in state {other}")));
            }
        }
        self.spawn_run_loop();
        Ok(())
    }

    /// Stop background timers and persist state (app went to background).
    #[tracing::instrument(skip(self))]
    pub async fn suspend(&self) -> Result<(), SyncError> {
        if self.state() != EngineState::Running {
            return Ok(());
        }
        info!("Suspending quota sync engine");
        self.stop_run_loop().await;
        self.set_state(EngineState::Suspended);
        self.persist().await
    }

    /// Restart background timers and run one non-forced resync.
    #[tracing::instrument(skip(self))]
    pub async fn resume(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.state() != EngineState::Suspended {
            return Ok(());
        }
        info!("Resuming quota sync engine");
        self.spawn_run_loop();
        if let Err(e) = self.resync(false).await {
            warn!(error = %e, "Resync on resume failed");
        }
        Ok(())
    }

    /// Final flush and persist.
    ///
    /// Each non-empty type gets one delivery attempt; retries are cancelled
    /// so shutdown never waits on backoff. Whatever is not acknowledged stays
    /// queued in the persisted state for the next session.
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating quota sync engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        // Also cancels retries, so each type gets a single attempt below
        self.stop_run_loop().await;

        let outcomes = self.flush_all(FlushReason::Shutdown).await;
        debug!(batches = outcomes.len(), "Shutdown flush complete");

        if let Err(e) = self.persist().await {
            error!(error = %e, "Failed to persist state on shutdown");
        }
        if let Some(store) = self.state_store() {
            if let Err(e) = store.checkpoint().await {
                warn!(error = %e, "State store checkpoint failed");
            }
        }

        self.set_state(EngineState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Quota sync engine shutdown complete");
    }

    /// Main run loop. Returns when the stop flag is set.
    pub(super) async fn run(&self) {
        info!("Quota sync engine running");

        let (mut flush_tick, mut sync_tick) = self.tickers();

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,

                Ok(()) = async { self.config_rx.lock().await.changed().await } => {
                    let new_config = self.config_rx.lock().await.borrow_and_update().clone();
                    if self.apply_config(new_config) {
                        (flush_tick, sync_tick) = self.tickers();
                    }
                }

                _ = flush_tick.tick() => {
                    self.flush_due().await;
                }

                () = self.flush_notify.notified() => {
                    self.flush_due().await;
                }

                _ = sync_tick.tick() => {
                    if let Err(e) = self.resync(false).await {
                        debug!(error = %e, "Periodic resync failed");
                    }
                }
            }
        }
        debug!("Run loop stopped");
    }

    /// Swap in a new config. Returns whether the timers need rebuilding.
    fn validate_config(&self) -> Result<(), SyncError> {
        let result = self.config.read().validate();
        if let Err(e) = &result {
            error!(error = %e, "Refusing to start with invalid config");
        }
        result
    }

    pub(super) fn apply_config(&self, new_config: QuotaSyncConfig) -> bool {
        if let Err(e) = new_config.validate() {
            warn!(error = %e, "Ignoring invalid config update");
            return false;
        }
        info!(
            batch_size = new_config.batch_size,
            flush_interval_ms = new_config.flush_interval_ms,
            sync_interval_ms = new_config.sync_interval_ms,
            "Config updated"
        );

        self.retry.set_policy(new_config.retry_policy());
        {
            let mut core = self.core.lock();
            core.batches.set_config(new_config.batch_config());
            core.quota.set_window_ms(new_config.window_ms);
        }

        let mut config = self.config.write();
        let timers_changed = config.flush_interval_ms != new_config.flush_interval_ms
            || config.sync_interval_ms != new_config.sync_interval_ms;
        *config = new_config;
        timers_changed
    }

    fn tickers(&self) -> (Interval, Interval) {
        let config = self.config.read();
        (
            ticker(poll_period(config.flush_interval())),
            ticker(config.sync_interval()),
        )
    }

    fn spawn_run_loop(self: &Arc<Self>) {
        self.stop.reset();
        self.cancel.reset();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run().await });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        self.set_state(EngineState::Running);
    }

    async fn stop_run_loop(&self) {
        self.stop.cancel();
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Run loop task failed");
                }
            }
        }
    }

    async fn open_configured_store(&self) -> Result<(), SyncError> {
        if self.state_store().is_some() {
            return Ok(());
        }
        let path = self.config.read().state_path.clone();
        let Some(path) = path else {
            return Ok(());
        };
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&path).await?);
        *self.store.write() = Some(store);
        Ok(())
    }

    /// Read and decode the stored blob. Any failure means starting empty.
    async fn load_raw_state(&self) -> Option<RawState> {
        let store = self.state_store()?;
        let user_id = self.user.read().user_id.clone();

        let stored = match store.load(&user_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                info!(%user_id, "No persisted state, starting fresh");
                return None;
            }
            Err(e) => {
                warn!(%user_id, error = %e, "Failed to read persisted state, starting fresh");
                return None;
            }
        };

        match decode(&stored) {
            Ok(raw) if raw.user_id == user_id => Some(raw),
            Ok(raw) => {
                warn!(expected = %user_id, found = %raw.user_id, "Persisted state belongs to another user, ignoring");
                None
            }
            Err(e) => {
                crate::metrics::record_corrupt_record("blob");
                warn!(%user_id, error = %e, "Persisted state is corrupt, starting from an empty cache");
                None
            }
        }
    }

    /// Validate loaded records and put the survivors in place.
    fn restore(&self, raw: &RawState) {
        let mut core = self.core.lock();
        let tier = core.quota.tier();
        let limits = raw.tier_limits().unwrap_or_else(|| core.quota.limits().clone());

        let report = Validator::new(tier, &limits).validate(raw);
        let counters = report.counters.len();
        core.quota.apply_limits(limits);
        core.quota.load_counters(report.counters);
        let restored = core.batches.restore(report.pending);
        core.sync.last_sync_timestamp = raw.last_sync_at();

        info!(
            counters,
            restored,
            corrupt = report.corrupt.len(),
            healed = report.healed,
            discarded = report.discarded,
            "Persisted state restored"
        );
        self.publish_status(&core);
    }
}
