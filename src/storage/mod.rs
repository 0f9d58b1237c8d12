//! Memory service backends for agent-memory

mod inmemory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::memory::{MemoryEntry, UserKey};
use crate::session::Session;
use crate::tools::EnabledTools;
use crate::worker::{AutoMemoryWorker, MemoryOperator};

pub use inmemory::InMemoryMemoryService;
pub use sqlite::SqliteMemoryService;

/// A memory store that agents talk to directly and that can run
/// automatic extraction in the background.
#[async_trait]
pub trait MemoryService: MemoryOperator {
    /// Memories matching `query`, newest first
    async fn search_memories(&self, user_key: &UserKey, query: &str) -> Result<Vec<MemoryEntry>>;

    /// Tool names to hand to an agent
    fn tools(&self) -> Vec<&'static str>;

    /// Feed a finished turn to automatic extraction; a no-op without an
    /// extractor.
    async fn enqueue_auto_memory_job(&self, cancel: &CancellationToken, session: Arc<Session>) -> Result<()>;

    /// Stop background extraction, letting queued jobs finish
    async fn close(&self);
}

/// The parts every backend shares: tool policy and the optional worker
pub(crate) struct AutoMemory {
    tools: EnabledTools,
    worker: Option<AutoMemoryWorker>,
}

impl AutoMemory {
    /// Start a worker over `operator` when the config carries an extractor
    pub(crate) async fn start(config: &ServiceConfig, operator: Arc<dyn MemoryOperator>) -> Self {
        let tools = config.resolved_tools();
        let worker = match config.auto_memory.extractor {
            Some(_) => {
                let mut auto_config = config.auto_memory.clone();
                auto_config.enabled_tools = tools.clone();
                let worker = AutoMemoryWorker::new(auto_config, operator);
                worker.start().await;
                Some(worker)
            }
            None => None,
        };
        Self { tools, worker }
    }

    pub(crate) fn tools(&self) -> Vec<&'static str> {
        self.tools.exposed_tools(self.worker.is_some())
    }

    pub(crate) fn worker(&self) -> Option<&AutoMemoryWorker> {
        self.worker.as_ref()
    }

    pub(crate) async fn enqueue(&self, cancel: &CancellationToken, session: Arc<Session>) -> Result<()> {
        match &self.worker {
            Some(worker) => worker.enqueue_job(cancel, session).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn close(&self) {
        if let Some(worker) = &self.worker {
            worker.stop().await;
        }
    }
}

/// Newest first, then truncated when `limit > 0`
pub(crate) fn newest_first(mut entries: Vec<MemoryEntry>, limit: usize) -> Vec<MemoryEntry> {
    entries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    if limit > 0 {
        entries.truncate(limit);
    }
    entries
}
