use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use dashmap::DashMap;

use super::{StateStore, StoredBlob};
use crate::error::SyncError;

/// In-process state store for tests and sessions that don't outlive the
/// process.
pub struct MemoryStateStore {
    rows: DashMap<String, StoredBlob>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls so far
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Overwrite a row as-is, bypassing encoding.
    pub fn put_raw(&self, user_id: &str, blob: StoredBlob) {
        self.rows.insert(user_id.to_string(), blob);
    }

    #[must_use]
    pub fn get_raw(&self, user_id: &str) -> Option<StoredBlob> {
        self.rows.get(user_id).map(|r| r.value().clone())
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, user_id: &str) -> Result<Option<StoredBlob>, SyncError> {
        Ok(self.get_raw(user_id))
    }

    async fn save(&self, user_id: &str, blob: &StoredBlob) -> Result<(), SyncError> {
        self.rows.insert(user_id.to_string(), blob.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, user_id: &str) -> Result<(), SyncError> {
        self.rows.remove(user_id);
        Ok(())
    }
}
