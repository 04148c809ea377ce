//! Public types for the sync engine coordinator.

use std::collections::BTreeMap;
use serde::Serialize;
use uuid::Uuid;

use crate::action::{ActionId, ActionType};
use crate::batching::processor::{DropReason, FlushReport};
use crate::clock::Timestamp;
use crate::quota::DenyReason;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet initialized
    Created,
    /// Reading and validating persisted state
    Loading,
    /// Local state restored, background timers not running
    Ready,
    /// Background flush and sync timers running
    Running,
    /// Timers stopped (app in background), state persisted
    Suspended,
    /// Final flush in progress
    ShuttingDown,
    /// Shutdown complete
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Loading => write!(f, "Loading"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Suspended => write!(f, "Suspended"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl EngineState {
    /// Whether new actions may still be reserved and queued.
    #[must_use]
    pub fn accepts_actions(self) -> bool {
        !matches!(self, Self::ShuttingDown | Self::Stopped)
    }
}

/// Summarized delivery health shown to the app.
///
/// Transient failures never show up here; only exhausted retries do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SyncHealth {
    #[default]
    Healthy,
    /// Retries ran out on the last flush or pull
    Degraded,
    /// Batches are parked until credentials are refreshed
    AuthRequired,
}

impl std::fmt::Display for SyncHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Degraded => write!(f, "Degraded"),
            Self::AuthRequired => write!(f, "AuthRequired"),
        }
    }
}

/// Published on the status watch channel after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SyncStatus {
    pub health: SyncHealth,
    /// Unresolved actions across all types
    pub pending: usize,
    /// Actions parked by an auth failure
    pub held: usize,
    pub last_sync_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// One-off notifications for the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// An action will never be applied; its reservation was released
    ActionDropped {
        id: ActionId,
        action_type: ActionType,
        reason: DropReason,
        rolled_back: bool,
    },
    /// The remote refused our credentials
    AuthRequired,
    /// Counters changed for reasons other than a local reservation
    CountersChanged { action_types: Vec<ActionType> },
}

/// Sync bookkeeping guarded by the engine lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub last_sync_timestamp: Option<Timestamp>,
    pub last_sync_error: Option<String>,
    /// Mirrors the batch processor's in-flight table
    pub in_flight_batches: BTreeMap<ActionType, Uuid>,
}

/// Health snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Ready or Running
    pub ready: bool,
    pub sync_health: SyncHealth,
    pub pending: BTreeMap<ActionType, usize>,
    pub held: usize,
    pub in_flight: BTreeMap<ActionType, Uuid>,
    pub last_sync_at: Option<Timestamp>,
    pub last_error: Option<String>,
    /// Running and nothing degraded
    pub healthy: bool,
}

/// Result of a single flush call.
#[derive(Debug, Clone)]
pub enum FlushOutcome {
    /// Nothing queued for the type
    Empty,
    /// A batch of this type was already in flight
    Deferred { in_flight: Uuid },
    Completed(FlushReport),
}

impl FlushOutcome {
    #[must_use]
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// What a pull did to local counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Types that took the remote value
    pub replaced: Vec<ActionType>,
    /// Types that kept their local value because of unresolved or freshly settled actions
    pub kept_local: Vec<ActionType>,
    /// Remote records dropped by validation
    pub corrupt: usize,
    /// Remote records repaired by validation
    pub healed: usize,
}

/// Result of [`super::SyncEngine::record_action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Reserved and queued for delivery
    Recorded {
        id: ActionId,
        /// Allowance left in the current window
        remaining: u32,
    },
    Denied(DenyReason),
}

impl RecordOutcome {
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::Suspended), "Suspended");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_sync_health_default_is_healthy() {
        assert_eq!(SyncHealth::default(), SyncHealth::Healthy);
        assert_eq!(format!("{}", SyncHealth::AuthRequired), "AuthRequired");
        assert_eq!(SyncStatus::default().health, SyncHealth::Healthy);
    }

    #[test]
    fn test_record_outcome() {
        let recorded = RecordOutcome::Recorded { id: ActionId::new(), remaining: 3 };
        assert!(recorded.is_recorded());
        assert!(!RecordOutcome::Denied(DenyReason::WindowUnknown).is_recorded());
    }
}
