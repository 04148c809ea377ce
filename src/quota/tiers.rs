// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Membership tiers and their per-action limits.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::action::ActionType;
use crate::clock::Timestamp;

/// Membership tier of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipTier {
    Free,
    Plus,
    Premium,
}

impl std::fmt::Display for MembershipTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Plus => write!(f, "plus"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// `tier → action type → limit`, as served by the remote config.
///
/// ```
/// use quota_sync::{ActionType, MembershipTier, TierLimits};
///
/// let limits = TierLimits::new(0)
///     .with_limit(MembershipTier::Free, ActionType::Swipe, 50)
///     .with_limit(MembershipTier::Premium, ActionType::Swipe, 500);
///
/// assert_eq!(limits.limit_for(MembershipTier::Free, ActionType::Swipe), Some(50));
/// assert_eq!(limits.limit_for(MembershipTier::Free, ActionType::Message), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    limits: BTreeMap<MembershipTier, BTreeMap<ActionType, u32>>,
    /// When this table was fetched from the remote config (epoch millis)
    pub fetched_at: Timestamp,
}

impl TierLimits {
    #[must_use]
    pub fn new(fetched_at: Timestamp) -> Self {
        Self {
            limits: BTreeMap::new(),
            fetched_at,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, tier: MembershipTier, action_type: ActionType, limit: u32) -> Self {
        self.set_limit(tier, action_type, limit);
        self
    }

    pub fn set_limit(&mut self, tier: MembershipTier, action_type: ActionType, limit: u32) {
        self.limits.entry(tier).or_default().insert(action_type, limit);
    }

    #[must_use]
    pub fn limit_for(&self, tier: MembershipTier, action_type: ActionType) -> Option<u32> {
        self.limits.get(&tier).and_then(|m| m.get(&action_type)).copied()
    }

    /// Action types with a limit for `tier`.
    pub fn action_types(&self, tier: MembershipTier) -> impl Iterator<Item = ActionType> + '_ {
        self.limits.get(&tier).into_iter().flat_map(|m| m.keys().copied())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limits.values().all(BTreeMap::is_empty)
    }
}
