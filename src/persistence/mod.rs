// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted local state.
//!
//! One versioned, checksummed JSON blob per user holds the counters, the
//! pending queues, the cached tier limits and the last sync time. It is
//! written after each completed flush or sync (never per reservation) and
//! read once at startup.
//!
//! Loading is two-staged: [`decode`] checks the envelope (version and
//! SHA-256) and yields a [`RawState`] whose records are still untyped JSON;
//! the [`Validator`](crate::validation::Validator) then checks each record on
//! its own so a single bad entry doesn't cost the rest.
//!
//! # Example
//!
//! ```
//! use quota_sync::persistence::{decode, encode, PersistedState};
//! use quota_sync::MembershipTier;
//!
//! let state = PersistedState::new("user-1", MembershipTier::Free, 1_000);
//! let stored = encode(&state).unwrap();
//! let raw = decode(&stored).unwrap();
//! assert_eq!(raw.user_id, "user-1");
//! ```

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::action::PendingAction;
use crate::clock::Timestamp;
use crate::error::SyncError;
use crate::quota::{MembershipTier, TierLimits, UsageCounter};

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

/// Current blob layout. Blobs with any other version are not read.
pub const FORMAT_VERSION: u32 = 1;

/// Typed state as written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub format_version: u32,
    pub user_id: String,
    pub saved_at: Timestamp,
    pub tier: MembershipTier,
    pub counters: Vec<UsageCounter>,
    pub pending: Vec<PendingAction>,
    pub tier_limits: TierLimits,
    pub last_sync_at: Option<Timestamp>,
}

impl PersistedState {
    pub fn new(user_id: impl Into<String>, tier: MembershipTier, saved_at: Timestamp) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            user_id: user_id.into(),
            saved_at,
            tier,
            counters: Vec::new(),
            pending: Vec::new(),
            tier_limits: TierLimits::default(),
            last_sync_at: None,
        }
    }
}

/// State as read back, before validation.
///
/// Only the envelope is typed; counters and pending actions stay as JSON so
/// they can be checked one at a time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawState {
    #[serde(default)]
    pub format_version: u32,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub saved_at: Timestamp,
    #[serde(default)]
    pub tier: Option<Value>,
    #[serde(default)]
    pub counters: Vec<Value>,
    #[serde(default)]
    pub pending: Vec<Value>,
    #[serde(default)]
    pub tier_limits: Option<Value>,
    #[serde(default)]
    pub last_sync_at: Option<Value>,
}

impl RawState {
    /// Cached limit table, if present and readable.
    #[must_use]
    pub fn tier_limits(&self) -> Option<TierLimits> {
        self.tier_limits
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    #[must_use]
    pub fn last_sync_at(&self) -> Option<Timestamp> {
        self.last_sync_at.as_ref().and_then(Value::as_i64)
    }
}

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub format_version: u32,
    /// Hex SHA-256 of `blob`
    pub checksum: String,
    pub saved_at: Timestamp,
    pub blob: String,
}

pub fn checksum(blob: &str) -> String {
    hex::encode(Sha256::digest(blob.as_bytes()))
}

pub fn encode(state: &PersistedState) -> Result<StoredBlob, SyncError> {
    let blob = serde_json::to_string(state).map_err(|e| SyncError::Persistence(e.to_string()))?;
    Ok(StoredBlob {
        format_version: state.format_version,
        checksum: checksum(&blob),
        saved_at: state.saved_at,
        blob,
    })
}

/// Verify the envelope of a stored blob and parse it loosely.
///
/// Fails with [`SyncError::CorruptState`] on an unknown version, a checksum
/// mismatch or a blob that isn't a JSON object of the expected shape.
pub fn decode(stored: &StoredBlob) -> Result<RawState, SyncError> {
    if stored.format_version != FORMAT_VERSION {
        return Err(SyncError::corrupt(
            "state blob",
            format!("unsupported format version {}", stored.format_version),
        ));
    }
    let actual = checksum(&stored.blob);
    if actual != stored.checksum {
        return Err(SyncError::corrupt(
            "state blob",
            format!("checksum mismatch: expected {}, got {}", stored.checksum, actual),
        ));
    }
    Ok(serde_json::from_str::<RawState>(&stored.blob)?)
}

/// Durable home for [`StoredBlob`]s, keyed by user id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<StoredBlob>, SyncError>;
    async fn save(&self, user_id: &str, blob: &StoredBlob) -> Result<(), SyncError>;
    async fn clear(&self, user_id: &str) -> Result<(), SyncError>;

    /// Flush buffered writes before the process goes away.
    async fn checkpoint(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use serde_json::json;

    fn sample() -> PersistedState {
        let mut state = PersistedState::new("u1", MembershipTier::Plus, 500);
        state.counters.push(UsageCounter::new(ActionType::Swipe, 10, 0, 1_000));
        state.pending.push(PendingAction::new(ActionType::Swipe, json!({"to": "u2"}), 400));
        state.tier_limits = TierLimits::new(7).with_limit(MembershipTier::Plus, ActionType::Swipe, 10);
        state.last_sync_at = Some(450);
        state
    }

    #[test]
    fn test_decode_keeps_records_untyped() {
        let state = sample();
        let raw = decode(&encode(&state).unwrap()).unwrap();
        assert_eq!(raw.format_version, FORMAT_VERSION);
        assert_eq!(raw.counters.len(), 1);
        assert_eq!(raw.pending.len(), 1);
        assert_eq!(raw.tier_limits(), Some(state.tier_limits));
        assert_eq!(raw.last_sync_at(), Some(450));
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let mut stored = encode(&sample()).unwrap();
        stored.blob = stored.blob.replace("\"u2\"", "\"u3\"");
        let err = decode(&stored).unwrap_err();
        assert!(matches!(err, SyncError::CorruptState { .. }));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let mut stored = encode(&sample()).unwrap();
        stored.format_version = 99;
        assert!(matches!(decode(&stored), Err(SyncError::CorruptState { .. })));
    }

    #[test]
    fn test_garbage_blob_is_corrupt() {
        let blob = "not json at all".to_string();
        let stored = StoredBlob {
            format_version: FORMAT_VERSION,
            checksum: checksum(&blob),
            saved_at: 0,
            blob,
        };
        assert!(matches!(decode(&stored), Err(SyncError::CorruptState { .. })));
    }

    #[test]
    fn test_bad_record_does_not_fail_envelope() {
        let blob = json!({
            "format_version": 1,
            "user_id": "u1",
            "counters": [{"action_type": "swipe", "current_count": -3}],
            "pending": ["junk"],
            "tier_limits": "junk",
            "last_sync_at": "yesterday"
        })
        .to_string();
        let stored = StoredBlob {
            format_version: FORMAT_VERSION,
            checksum: checksum(&blob),
            saved_at: 0,
            blob,
        };
        let raw = decode(&stored).unwrap();
        assert_eq!(raw.counters.len(), 1);
        assert_eq!(raw.pending.len(), 1);
        assert!(raw.tier_limits().is_none());
        assert!(raw.last_sync_at().is_none());
    }
}
