use std::collections::HashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{ActionEnvelope, ActionId};
use crate::error::SyncError;
use crate::quota::{MembershipTier, TierLimits, UsageCounter};

/// Who is asking. The tier is owned by the host app, not by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub tier: MembershipTier,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, tier: MembershipTier) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
        }
    }
}

/// One ordered batch of actions of a single type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub batch_id: Uuid,
    pub user_id: String,
    pub actions: Vec<ActionEnvelope>,
}

/// Per-action verdict from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckStatus {
    /// Applied now or earlier; resubmitting the same id lands here too
    Acked,
    /// Will never be applied
    Rejected { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub results: HashMap<ActionId, AckStatus>,
}

impl SubmitResponse {
    /// Everything in `request` acknowledged.
    #[must_use]
    pub fn all_acked(request: &SubmitRequest) -> Self {
        Self {
            results: request.actions.iter().map(|a| (a.id, AckStatus::Acked)).collect(),
        }
    }
}

/// Remote truth for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeState {
    pub counters: Vec<UsageCounter>,
    pub tier_limits: TierLimits,
}

/// The authoritative backend.
///
/// `submit_batch` must be idempotent by action id: resubmitting an id that
/// was already applied answers `Acked` again without applying it twice.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn submit_batch(&self, request: &SubmitRequest) -> Result<SubmitResponse, SyncError>;
    async fn pull(&self, user: &UserIdentity) -> Result<AuthoritativeState, SyncError>;
}
