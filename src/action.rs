// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Quota-gated user actions.
//!
//! A [`PendingAction`] is the unit that flows from the UI through the
//! batch queue to the remote store. Its [`ActionId`] is minted on the
//! device and never changes, so the remote side can apply it idempotently
//! no matter how many times a batch is resubmitted.
//!
//! # Example
//!
//! ```
//! use quota_sync::{ActionType, PendingAction, ActionStatus};
//! use serde_json::json;
//!
//! let action = PendingAction::new(ActionType::Swipe, json!({"target": "u-42", "dir": "right"}), 1_000);
//! assert_eq!(action.status, ActionStatus::Queued);
//! assert_eq!(action.retry_count, 0);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Timestamp;

/// Kinds of quota-gated actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Like/pass decision on a profile
    Swipe,
    /// Accepting a mutual like
    Match,
    /// Opening message to a match
    Message,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [ActionType::Swipe, ActionType::Match, ActionType::Message];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swipe => "swipe",
            Self::Match => "match",
            Self::Message => "message",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-generated idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Uuid);

impl ActionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ActionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery state of a pending action.
///
/// ```text
/// Queued → Sending → Acked            (terminal, removed)
///                  → Queued           (retry, retry_count += 1)
///                  → Dropped          (terminal, quota rolled back)
///                  → Failed → Queued  (auth hold until session refresh)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Queued,
    Sending,
    Acked,
    /// Parked after an authentication failure
    Failed,
    Dropped,
}

impl ActionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::Dropped)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Sending => write!(f, "Sending"),
            Self::Acked => write!(f, "Acked"),
            Self::Failed => write!(f, "Failed"),
            Self::Dropped => write!(f, "Dropped"),
        }
    }
}

/// A user action waiting for remote acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub action_type: ActionType,
    pub payload: Value,
    pub created_at: Timestamp,
    pub retry_count: u32,
    pub status: ActionStatus,
    /// `window_start` of the counter window this action was charged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_window: Option<Timestamp>,
    /// When the action last went back in line after a failed delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<Timestamp>,
}

impl PendingAction {
    pub fn new(action_type: ActionType, payload: Value, created_at: Timestamp) -> Self {
        Self {
            id: ActionId::new(),
            action_type,
            payload,
            created_at,
            retry_count: 0,
            status: ActionStatus::Queued,
            reserved_window: None,
            queued_at: None,
        }
    }

    /// Tie this action to the quota window its reservation was counted in.
    #[must_use]
    pub fn with_reserved_window(mut self, window_start: Timestamp) -> Self {
        self.reserved_window = Some(window_start);
        self
    }

    /// Start of the current wait in the queue.
    #[must_use]
    pub fn waiting_since(&self) -> Timestamp {
        self.queued_at.unwrap_or(self.created_at)
    }

    /// Wire form sent to the remote store.
    #[must_use]
    pub fn envelope(&self) -> ActionEnvelope {
        ActionEnvelope {
            id: self.id,
            action_type: self.action_type,
            payload: self.payload.clone(),
        }
    }
}

/// `{ id, actionType, payload }` as submitted in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub id: ActionId,
    pub action_type: ActionType,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_ids_are_unique() {
        let a = PendingAction::new(ActionType::Swipe, json!({}), 0);
        let b = PendingAction::new(ActionType::Swipe, json!({}), 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_action_type_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&ActionType::Message).unwrap(), "\"message\"");
        let parsed: ActionType = serde_json::from_str("\"swipe\"").unwrap();
        assert_eq!(parsed, ActionType::Swipe);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ActionStatus::Acked.is_terminal());
        assert!(ActionStatus::Dropped.is_terminal());
        assert!(!ActionStatus::Queued.is_terminal());
        assert!(!ActionStatus::Sending.is_terminal());
        assert!(!ActionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_pending_action_roundtrip_keeps_identity() {
        let action = PendingAction::new(ActionType::Match, json!({"match": "m-1"}), 42)
            .with_reserved_window(0);
        let bytes = serde_json::to_vec(&action).unwrap();
        let back: PendingAction = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_reserved_window_defaults_to_none() {
        let raw = json!({
            "id": Uuid::new_v4(),
            "action_type": "swipe",
            "payload": null,
            "created_at": 1,
            "retry_count": 0,
            "status": "queued"
        });
        let action: PendingAction = serde_json::from_value(raw).unwrap();
        assert!(action.reserved_window.is_none());
    }

    #[test]
    fn test_envelope_carries_id() {
        let action = PendingAction::new(ActionType::Message, json!({"text": "hi"}), 5);
        let env = action.envelope();
        assert_eq!(env.id, action.id);
        assert_eq!(env.payload, json!({"text": "hi"}));
    }
}
