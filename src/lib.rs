//! # Quota Sync
//!
//! Local usage-quota cache and batched sync engine for a mobile client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         UI action                           │
//! │  • record_action(type, payload)                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QuotaCache                           │
//! │  • Per-type counters against tier limits                   │
//! │  • Lazy window resets, check + increment in one step       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                      (Allowed → enqueue)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BatchProcessor                         │
//! │  • Per-type FIFO queues, flush by count or age             │
//! │  • One in-flight batch per type                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                (Submit via RetryCoordinator)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RemoteStore                           │
//! │  • Idempotent by action id                                 │
//! │  • Ack → commit, reject/exhausted → rollback               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`SyncEngine`] owns all of the above behind one lock, periodically
//! pulls authoritative counters, and persists its state through a
//! [`StateStore`](persistence::StateStore).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quota_sync::{SyncEngine, QuotaSyncConfig, ActionType, MembershipTier, TierLimits, RecordOutcome};
//! use quota_sync::remote::{InMemoryRemote, UserIdentity};
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = QuotaSyncConfig {
//!         state_path: Some("quota_state.db".into()),
//!         ..Default::default()
//!     };
//!     let limits = TierLimits::new(0)
//!         .with_limit(MembershipTier::Free, ActionType::Swipe, 100)
//!         .with_limit(MembershipTier::Free, ActionType::Message, 5);
//!     let remote = Arc::new(InMemoryRemote::new(limits, config.window_ms));
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let user = UserIdentity::new("user-1", MembershipTier::Free);
//!     let engine = Arc::new(SyncEngine::new(config, rx, user, remote));
//!
//!     // Load persisted state, pull limits, start background flush/sync
//!     engine.start().await.expect("Failed to start");
//!
//!     match engine.record_action(ActionType::Swipe, json!({"target": "user-2"})) {
//!         RecordOutcome::Recorded { remaining, .. } => println!("{remaining} swipes left"),
//!         RecordOutcome::Denied(reason) => println!("denied: {reason}"),
//!     }
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`SyncEngine`] orchestrating all components
//! - [`quota`]: Usage counters, tier limits, the quota cache
//! - [`batching`]: Per-type action queues and the batch processor
//! - [`resilience`]: Retry with backoff, jitter and cancellation
//! - [`validation`]: Integrity checks for loaded and pulled state
//! - [`persistence`]: Versioned, checksummed state blobs (SQLite, memory)
//! - [`remote`]: The authoritative store interface

pub mod action;
pub mod batching;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod quota;
pub mod remote;
pub mod resilience;
pub mod validation;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use action::{ActionEnvelope, ActionId, ActionStatus, ActionType, PendingAction};
pub use batching::action_queue::FlushReason;
pub use batching::processor::{BatchConfig, DropReason, EnqueueOutcome, FlushReport};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::QuotaSyncConfig;
pub use coordinator::{
    EngineState, FlushOutcome, HealthCheck, PullSummary, RecordOutcome, SyncEngine, SyncEvent,
    SyncHealth, SyncState, SyncStatus,
};
pub use error::SyncError;
pub use metrics::LatencyTimer;
pub use quota::{DenyReason, MembershipTier, QuotaCache, Reservation, ReserveOutcome, TierLimits, UsageCounter};
pub use resilience::retry::{CancelFlag, RetryCoordinator, RetryError, RetryPolicy};
pub use validation::{ValidationReport, Validator};
