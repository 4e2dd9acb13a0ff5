//! Durable per-user storage.
//!
//! One JSON document per user under the configured data directory, with
//! whole-document atomic replace (write to a temp file, then rename). A
//! per-user async lock serializes read-modify-write cycles so a command
//! mutation and an orchestrator write-back never interleave partially.
//! Missing or unreadable documents are replaced with defaults, so a corrupt
//! file degrades one user's history rather than wedging the fleet.

pub mod user;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

pub use user::{NotificationRecord, SeenEntry, UserContext};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode user document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-user JSON document store.
pub struct UserStore {
    data_dir: PathBuf,
    /// One lock per user, created lazily
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserStore {
    /// Open (and create if needed) the data directory.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.data_dir.join(format!("user_{user_id}.json"))
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load a user's document, or a fresh default when the file is missing.
    /// An unreadable document is logged and replaced with defaults.
    pub async fn load(&self, user_id: &str) -> Result<UserContext, StoreError> {
        let path = self.path_for(user_id);
        if !path.exists() {
            return Ok(UserContext::new(user_id));
        }
        let contents = fs::read_to_string(&path)?;
        match serde_json::from_str(&contents) {
            Ok(ctx) => Ok(ctx),
            Err(error) => {
                tracing::warn!(
                    user = %user_id,
                    path = %path.display(),
                    %error,
                    "Unreadable user document, starting fresh"
                );
                Ok(UserContext::new(user_id))
            }
        }
    }

    /// Atomically replace a user's document.
    async fn write(&self, ctx: &UserContext) -> Result<(), StoreError> {
        let path = self.path_for(&ctx.user_id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(ctx)?;
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read-modify-write under this user's lock. The closure sees the current
    /// document and its return value is handed back to the caller.
    pub async fn update<F, T>(&self, user_id: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut UserContext) -> T,
    {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let mut ctx = self.load(user_id).await?;
        let result = f(&mut ctx);
        self.write(&ctx).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = UserStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_missing_user_returns_default() {
        let (_dir, store) = store();
        let ctx = store.load("77").await.unwrap();
        assert_eq!(ctx.user_id, "77");
        assert!(ctx.monitor_urls.is_empty());
        assert!(ctx.pincodes.is_empty());
        assert!(ctx.last_check.is_none());
    }

    #[tokio::test]
    async fn test_update_round_trips_document() {
        let (_dir, store) = store();
        store
            .update("77", |ctx| {
                ctx.monitor_urls.push("https://shop.example.in/c/verse".to_string());
                ctx.pincodes.insert("110001".to_string());
                ctx.last_check = Some(Utc::now());
            })
            .await
            .unwrap();

        let ctx = store.load("77").await.unwrap();
        assert_eq!(ctx.monitor_urls.len(), 1);
        assert!(ctx.pincodes.contains("110001"));
        assert!(ctx.last_check.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_document_starts_fresh() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("user_77.json"), "{ not json").unwrap();
        let ctx = store.load("77").await.unwrap();
        assert!(ctx.monitor_urls.is_empty());
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let (_dir, store) = store();
        store
            .update("a", |ctx| ctx.pincodes.insert("110001".to_string()))
            .await
            .unwrap();
        let other = store.load("b").await.unwrap();
        assert!(other.pincodes.is_empty());
    }

    #[tokio::test]
    async fn test_update_returns_closure_value() {
        let (_dir, store) = store();
        let added = store
            .update("77", |ctx| ctx.pincodes.insert("110001".to_string()))
            .await
            .unwrap();
        assert!(added);
        let added_again = store
            .update("77", |ctx| ctx.pincodes.insert("110001".to_string()))
            .await
            .unwrap();
        assert!(!added_again);
    }
}
