//! SQLite-backed state store.
//!
//! One row per user:
//!
//! ```sql
//! CREATE TABLE quota_state (
//!     user_id TEXT PRIMARY KEY,
//!     format_version INTEGER NOT NULL,
//!     checksum TEXT NOT NULL,
//!     saved_at INTEGER NOT NULL,
//!     blob TEXT NOT NULL
//! )
//! ```

use std::path::Path;
use std::time::Duration;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use super::{StateStore, StoredBlob};
use crate::error::SyncError;

pub struct SqliteStateStore {
    pool: SqlitePool,
    /// Path to SQLite file (for display)
    path: String,
}

impl SqliteStateStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        info!(path = %path_str, "Opening quota state store");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await?;

        let store = Self { pool, path: path_str };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn enable_wal_mode(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL mode is safe with NORMAL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_state (
                user_id TEXT PRIMARY KEY,
                format_version INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                saved_at INTEGER NOT NULL,
                blob TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, user_id: &str) -> Result<Option<StoredBlob>, SyncError> {
        let row = sqlx::query(
            "SELECT format_version, checksum, saved_at, blob FROM quota_state WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("format_version")?;
        let format_version = u32::try_from(version)
            .map_err(|_| SyncError::corrupt("state row", format!("format_version {version} out of range")))?;

        Ok(Some(StoredBlob {
            format_version,
            checksum: row.try_get("checksum")?,
            saved_at: row.try_get("saved_at")?,
            blob: row.try_get("blob")?,
        }))
    }

    async fn save(&self, user_id: &str, blob: &StoredBlob) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO quota_state (user_id, format_version, checksum, saved_at, blob)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                format_version = excluded.format_version,
                checksum = excluded.checksum,
                saved_at = excluded.saved_at,
                blob = excluded.blob",
        )
        .bind(user_id)
        .bind(i64::from(blob.format_version))
        .bind(blob.checksum.as_str())
        .bind(blob.saved_at)
        .bind(blob.blob.as_str())
        .execute(&self.pool)
        .await?;

        debug!(user_id, bytes = blob.blob.len(), "Quota state saved");
        Ok(())
    }

    async fn clear(&self, user_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM quota_state WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Truncate the SQLite WAL file so it doesn't grow across sessions.
    async fn checkpoint(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(format!("WAL checkpoint failed: {}", e)))?;

        debug!(path = %self.path, "WAL checkpoint completed");
        Ok(())
    }
}
