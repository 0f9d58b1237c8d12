//! Process-local memory service

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::{newest_first, AutoMemory, MemoryService};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::memory::{generate_memory_id, match_memory_entry, MemoryEntry, MemoryKey, UserKey};
use crate::session::Session;
use crate::worker::{AutoMemoryWorker, MemoryOperator};

struct InMemoryStore {
    memories: RwLock<HashMap<UserKey, HashMap<String, MemoryEntry>>>,
    memory_limit: usize,
}

#[async_trait]
impl MemoryOperator for InMemoryStore {
    async fn read_memories(&self, user_key: &UserKey, limit: usize) -> Result<Vec<MemoryEntry>> {
        let entries = self
            .memories
            .read()
            .get(user_key)
            .map(|user| user.values().cloned().collect())
            .unwrap_or_default();
        Ok(newest_first(entries, limit))
    }

    async fn add_memory(&self, user_key: &UserKey, memory: &str, topics: &[String]) -> Result<()> {
        let id = generate_memory_id(memory, topics, user_key);
        let mut memories = self.memories.write();
        let user = memories.entry(user_key.clone()).or_default();

        if let Some(existing) = user.get_mut(&id) {
            existing.rewrite(memory, topics.to_vec());
            return Ok(());
        }
        if self.memory_limit > 0 && user.len() >= self.memory_limit {
            return Err(Error::MemoryLimitExceeded {
                user: user_key.to_string(),
                limit: self.memory_limit,
                current: user.len(),
            });
        }

        user.insert(id, MemoryEntry::new(user_key, memory, topics.to_vec()));
        Ok(())
    }

    async fn update_memory(&self, key: &MemoryKey, memory: &str, topics: &[String]) -> Result<()> {
        let mut memories = self.memories.write();
        let entry = memories
            .get_mut(&key.user_key())
            .and_then(|user| user.get_mut(&key.memory_id))
            .ok_or_else(|| Error::not_found(key.memory_id.clone()))?;
        entry.rewrite(memory, topics.to_vec());
        Ok(())
    }

    async fn delete_memory(&self, key: &MemoryKey) -> Result<()> {
        if let Some(user) = self.memories.write().get_mut(&key.user_key()) {
            user.remove(&key.memory_id);
        }
        Ok(())
    }

    async fn clear_memories(&self, user_key: &UserKey) -> Result<()> {
        self.memories.write().remove(user_key);
        Ok(())
    }
}

/// Memory service that keeps everything in process memory.
///
/// Memories are lost on drop. Useful for tests and short-lived agents.
pub struct InMemoryMemoryService {
    store: Arc<InMemoryStore>,
    auto: AutoMemory,
}

impl InMemoryMemoryService {
    /// Create the service, starting automatic extraction if configured
    pub async fn new(config: ServiceConfig) -> Self {
        let store = Arc::new(InMemoryStore {
            memories: RwLock::default(),
            memory_limit: config.memory_limit,
        });
        let auto = AutoMemory::start(&config, store.clone()).await;
        Self { store, auto }
    }

    pub fn auto_memory_worker(&self) -> Option<&AutoMemoryWorker> {
        self.auto.worker()
    }
}

#[async_trait]
impl MemoryOperator for InMemoryMemoryService {
    async fn read_memories(&self, user_key: &UserKey, limit: usize) -> Result<Vec<MemoryEntry>> {
        self.store.read_memories(user_key, limit).await
    }

    async fn add_memory(&self, user_key: &UserKey, memory: &str, topics: &[String]) -> Result<()> {
        self.store.add_memory(user_key, memory, topics).await
    }

    async fn update_memory(&self, key: &MemoryKey, memory: &str, topics: &[String]) -> Result<()> {
        self.store.update_memory(key, memory, topics).await
    }

    async fn delete_memory(&self, key: &MemoryKey) -> Result<()> {
        self.store.delete_memory(key).await
    }

    async fn clear_memories(&self, user_key: &UserKey) -> Result<()> {
        self.store.clear_memories(user_key).await
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn search_memories(&self, user_key: &UserKey, query: &str) -> Result<Vec<MemoryEntry>> {
        let hits = self
            .store
            .memories
            .read()
            .get(user_key)
            .map(|user| {
                user.values()
                    .filter(|entry| match_memory_entry(entry, query))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(newest_first(hits, 0))
    }

    fn tools(&self) -> Vec<&'static str> {
        self.auto.tools()
    }

    async fn enqueue_auto_memory_job(&self, cancel: &CancellationToken, session: Arc<Session>) -> Result<()> {
        self.auto.enqueue(cancel, session).await
    }

    async fn close(&self) {
        self.auto.close().await;
    }
}
