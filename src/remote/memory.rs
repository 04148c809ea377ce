use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::traits::{AckStatus, AuthoritativeState, RemoteStore, SubmitRequest, SubmitResponse, UserIdentity};
use crate::action::{ActionId, ActionType};
use crate::clock::{Clock, SystemClock};
use crate::error::SyncError;
use crate::quota::{MembershipTier, TierLimits, UsageCounter};

/// In-process authoritative store.
///
/// Applies each action id at most once, keeps per-user counters with the
/// same lazy windows as the client, and rejects actions over the limit.
/// Action types without a limit for the user's tier are unmetered.
pub struct InMemoryRemote {
    clock: Arc<dyn Clock>,
    window_ms: i64,
    limits: RwLock<TierLimits>,
    tiers: DashMap<String, MembershipTier>,
    applied: DashMap<ActionId, ActionType>,
    counters: DashMap<(String, ActionType), UsageCounter>,
    rejections: DashMap<ActionId, String>,
    submit_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new(limits: TierLimits, window_ms: i64) -> Self {
        Self::with_clock(limits, window_ms, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: TierLimits, window_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            window_ms: window_ms.max(1),
            limits: RwLock::new(limits),
            tiers: DashMap::new(),
            applied: DashMap::new(),
            counters: DashMap::new(),
            rejections: DashMap::new(),
            submit_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_limits(&self, limits: TierLimits) {
        *self.limits.write() = limits;
    }

    pub fn set_user_tier(&self, user_id: &str, tier: MembershipTier) {
        self.tiers.insert(user_id.to_string(), tier);
    }

    /// Make every future submission of `id` come back rejected.
    pub fn reject_action(&self, id: ActionId, reason: impl Into<String>) {
        self.rejections.insert(id, reason.into());
    }

    /// Seed or overwrite a user's counter.
    pub fn set_counter(&self, user_id: &str, counter: UsageCounter) {
        self.counters.insert((user_id.to_string(), counter.action_type), counter);
    }

    #[must_use]
    pub fn counter(&self, user_id: &str, action_type: ActionType) -> Option<UsageCounter> {
        self.counters
            .get(&(user_id.to_string(), action_type))
            .map(|c| c.as_of(self.clock.now()))
    }

    #[must_use]
    pub fn was_applied(&self, id: &ActionId) -> bool {
        self.applied.contains_key(id)
    }

    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    #[must_use]
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    fn tier_of(&self, user_id: &str) -> MembershipTier {
        self.tiers.get(user_id).map_or(MembershipTier::Free, |t| *t)
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn submit_batch(&self, request: &SubmitRequest) -> Result<SubmitResponse, SyncError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();
        let tier = self.tier_of(&request.user_id);
        let limits = self.limits.read().clone();
        let mut response = SubmitResponse::default();

        for envelope in &request.actions {
            let status = match self.applied.entry(envelope.id) {
                Entry::Occupied(_) => AckStatus::Acked,
                Entry::Vacant(slot) => {
                    if let Some(reason) = self.rejections.get(&envelope.id) {
                        AckStatus::Rejected { reason: reason.clone() }
                    } else {
                        match limits.limit_for(tier, envelope.action_type) {
                            None => {
                                slot.insert(envelope.action_type);
                                AckStatus::Acked
                            }
                            Some(limit) => {
                                let mut counter = self
                                    .counters
                                    .entry((request.user_id.clone(), envelope.action_type))
                                    .or_insert_with(|| {
                                        UsageCounter::new(envelope.action_type, limit, now, self.window_ms)
                                    });
                                counter.roll_window(now);
                                counter.limit = limit;
                                if counter.current_count >= limit {
                                    AckStatus::Rejected {
                                        reason: "quota exceeded".into(),
                                    }
                                } else {
                                    counter.current_count += 1;
                                    counter.last_action_timestamp = now;
                                    slot.insert(envelope.action_type);
                                    AckStatus::Acked
                                }
                            }
                        }
                    }
                }
            };
            response.results.insert(envelope.id, status);
        }

        debug!(
            batch_id = %request.batch_id,
            count = request.actions.len(),
            "Remote applied batch"
        );
        Ok(response)
    }

    async fn pull(&self, user: &UserIdentity) -> Result<AuthoritativeState, SyncError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.tiers.insert(user.user_id.clone(), user.tier);
        let now = self.clock.now();
        let counters = self
            .counters
            .iter()
            .filter(|e| e.key().0 == user.user_id)
            .map(|e| e.value().as_of(now))
            .collect();
        Ok(AuthoritativeState {
            counters,
            tier_limits: self.limits.read().clone(),
        })
    }
}
