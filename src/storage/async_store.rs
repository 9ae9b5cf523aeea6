//! Non-blocking access to the SQLite store
//!
//! Every call runs the blocking engine on tokio's blocking pool, so both
//! surfaces share one implementation.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::feedback::{Feedback, FeedbackStats};
use crate::memory::{MemoryItem, MemoryType};
use crate::message::Conversation;

use super::sqlite::{SqliteStorage, StorageStats};

/// Async adapter over [`SqliteStorage`]
#[derive(Clone)]
pub struct AsyncSqliteStorage {
    inner: Arc<SqliteStorage>,
}

impl AsyncSqliteStorage {
    /// Open (creating and migrating as needed) the store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let storage = tokio::task::spawn_blocking(move || SqliteStorage::open(path))
            .await
            .map_err(|e| Error::storage(format!("Storage task failed: {}", e)))??;
        Ok(Self::from_blocking(storage))
    }

    pub async fn in_memory() -> Result<Self> {
        let storage = tokio::task::spawn_blocking(SqliteStorage::in_memory)
            .await
            .map_err(|e| Error::storage(format!("Storage task failed: {}", e)))??;
        Ok(Self::from_blocking(storage))
    }

    /// Wrap an already opened blocking store
    pub fn from_blocking(storage: SqliteStorage) -> Self {
        Self {
            inner: Arc::new(storage),
        }
    }

    /// The blocking engine behind this adapter
    pub fn blocking(&self) -> &SqliteStorage {
        &self.inner
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::storage(format!("Storage task failed: {}", e)))?
    }

    pub async fn save(&self, item: MemoryItem) -> Result<String> {
        self.run(move |s| s.save(&item)).await
    }

    pub async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        let id = id.to_string();
        self.run(move |s| s.retrieve(&id)).await
    }

    pub async fn search(
        &self,
        query: &str,
        memory_type: Option<MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let query = query.to_string();
        self.run(move |s| s.search(&query, memory_type, limit)).await
    }

    pub async fn update(&self, item: MemoryItem) -> Result<bool> {
        self.run(move |s| s.update(&item)).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |s| s.delete(&id)).await
    }

    pub async fn recent(&self, memory_type: Option<MemoryType>, limit: usize) -> Result<Vec<MemoryItem>> {
        self.run(move |s| s.recent(memory_type, limit)).await
    }

    pub async fn count(&self, memory_type: Option<MemoryType>) -> Result<usize> {
        self.run(move |s| s.count(memory_type)).await
    }

    pub async fn oldest_ids(&self, limit: usize) -> Result<Vec<String>> {
        self.run(move |s| s.oldest_ids(limit)).await
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        self.run(|s| s.stats()).await
    }

    pub async fn save_conversation(&self, conversation: Conversation) -> Result<()> {
        self.run(move |s| s.save_conversation(&conversation)).await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.run(move |s| s.get_conversation(&id)).await
    }

    pub async fn save_feedback(&self, feedback: Feedback) -> Result<String> {
        self.run(move |s| s.save_feedback(&feedback)).await
    }

    pub async fn get_feedback(&self, message_id: Option<&str>, limit: usize) -> Result<Vec<Feedback>> {
        let message_id = message_id.map(str::to_string);
        self.run(move |s| s.get_feedback(message_id.as_deref(), limit)).await
    }

    pub async fn feedback_stats(&self, user_id: Option<&str>) -> Result<FeedbackStats> {
        let user_id = user_id.map(str::to_string);
        self.run(move |s| s.feedback_stats(user_id.as_deref())).await
    }
}
