//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::watch;

use quota_sync::remote::{AuthoritativeState, InMemoryRemote, RemoteStore, SubmitRequest, SubmitResponse, UserIdentity};
use quota_sync::{ActionType, Clock, MembershipTier, QuotaSyncConfig, SyncEngine, SyncError, TierLimits};

pub const WINDOW: i64 = 86_400_000;
pub const USER: &str = "user-1";

// =============================================================================
// Failing Remote Wrapper - Precise Error Injection
// =============================================================================

/// When the injected error is raised relative to the real call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Nothing reaches the inner store
    BeforeApply,
    /// The inner store applies the batch, then the answer is "lost"
    AfterApply,
}

/// Wraps an [`InMemoryRemote`] and fails `submit_batch` at given call numbers.
pub struct FailingRemote {
    pub inner: Arc<InMemoryRemote>,
    submit_calls: AtomicU64,
    pull_calls: AtomicU64,
    /// Fail on these submit call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    fail_permanently: bool,
    fail_pulls: bool,
    error: SyncError,
    mode: FailMode,
}

impl FailingRemote {
    pub fn new(inner: Arc<InMemoryRemote>, fail_on_calls: Vec<u64>, error: SyncError) -> Self {
        Self {
            inner,
            submit_calls: AtomicU64::new(0),
            pull_calls: AtomicU64::new(0),
            fail_on_calls,
            fail_permanently: false,
            fail_pulls: false,
            error,
            mode: FailMode::BeforeApply,
        }
    }

    /// Every submit fails.
    pub fn always(inner: Arc<InMemoryRemote>, error: SyncError) -> Self {
        let mut remote = Self::new(inner, vec![], error);
        remote.fail_permanently = true;
        remote
    }

    /// Pulls fail too (same error).
    pub fn failing_pulls(mut self) -> Self {
        self.fail_pulls = true;
        self
    }

    pub fn with_mode(mut self, mode: FailMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> u64 {
        self.pull_calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        let count = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.fail_permanently || self.fail_on_calls.contains(&count)
    }
}

#[async_trait]
impl RemoteStore for FailingRemote {
    async fn submit_batch(&self, request: &SubmitRequest) -> Result<SubmitResponse, SyncError> {
        if !self.should_fail() {
            return self.inner.submit_batch(request).await;
        }
        if self.mode == FailMode::AfterApply {
            let _ = self.inner.submit_batch(request).await;
        }
        Err(self.error.clone())
    }

    async fn pull(&self, user: &UserIdentity) -> Result<AuthoritativeState, SyncError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pulls {
            return Err(self.error.clone());
        }
        self.inner.pull(user).await
    }
}

// =============================================================================
// Engine builders
// =============================================================================

pub fn limits() -> TierLimits {
    TierLimits::new(0)
        .with_limit(MembershipTier::Free, ActionType::Swipe, 10)
        .with_limit(MembershipTier::Free, ActionType::Match, 5)
        .with_limit(MembershipTier::Free, ActionType::Message, 10)
        .with_limit(MembershipTier::Premium, ActionType::Swipe, 100)
}

/// Fast retries so paused-time tests stay short.
pub fn config() -> QuotaSyncConfig {
    QuotaSyncConfig {
        base_delay_ms: 10,
        max_delay_ms: 100,
        window_ms: WINDOW,
        ..Default::default()
    }
}

pub fn remote_with_clock(clock: Arc<dyn Clock>) -> Arc<InMemoryRemote> {
    Arc::new(InMemoryRemote::with_clock(limits(), WINDOW, clock))
}

/// Engine seeded with [`limits`], not started.
pub fn engine(
    remote: Arc<dyn RemoteStore>,
    config: QuotaSyncConfig,
    clock: Arc<dyn Clock>,
) -> (SyncEngine, watch::Sender<QuotaSyncConfig>) {
    let (tx, rx) = watch::channel(config.clone());
    let engine = SyncEngine::new(config, rx, UserIdentity::new(USER, MembershipTier::Free), remote)
        .with_clock(clock)
        .with_tier_limits(limits());
    (engine, tx)
}
