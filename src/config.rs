//! Configuration for agent-memory

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::extractor::MemoryExtractor;
use crate::tools::EnabledTools;

/// Default number of consumer tasks (one queue each)
pub const DEFAULT_SHARD_COUNT: usize = 1;

/// Default depth of each job queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Default deadline for one extraction job
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of memories kept per user
pub const DEFAULT_MEMORY_LIMIT: usize = 1000;

/// Configuration for the automatic memory worker
#[derive(Clone, Default)]
pub struct AutoMemoryConfig {
    /// Extractor that turns conversation into memory operations.
    /// Without one, automatic extraction is disabled entirely.
    pub extractor: Option<Arc<dyn MemoryExtractor>>,

    /// Number of queues and consumer tasks; 0 means the default
    pub shard_count: usize,

    /// Capacity of each queue; 0 means the default
    pub queue_capacity: usize,

    /// Deadline per job; zero means the default
    pub job_timeout: Duration,

    /// Which memory operations the worker may execute
    pub enabled_tools: EnabledTools,
}

impl std::fmt::Debug for AutoMemoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoMemoryConfig")
            .field("extractor", &self.extractor.as_ref().map(|_| "<extractor>"))
            .field("shard_count", &self.shard_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("job_timeout", &self.job_timeout)
            .field("enabled_tools", &self.enabled_tools)
            .finish()
    }
}

impl AutoMemoryConfig {
    /// Create a config with the given extractor and default tuning
    pub fn with_extractor(extractor: Arc<dyn MemoryExtractor>) -> Self {
        Self {
            extractor: Some(extractor),
            ..Default::default()
        }
    }

    pub fn shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn enabled_tools(mut self, enabled_tools: EnabledTools) -> Self {
        self.enabled_tools = enabled_tools;
        self
    }

    pub fn effective_shard_count(&self) -> usize {
        if self.shard_count == 0 {
            DEFAULT_SHARD_COUNT
        } else {
            self.shard_count
        }
    }

    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            self.queue_capacity
        }
    }

    pub fn effective_job_timeout(&self) -> Duration {
        if self.job_timeout.is_zero() {
            DEFAULT_JOB_TIMEOUT
        } else {
            self.job_timeout
        }
    }
}

/// Configuration for a memory service backend
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base directory for on-disk backends
    pub data_dir: PathBuf,

    /// Maximum memories per user; 0 disables the limit
    pub memory_limit: usize,

    /// Enabled tools before auto-mode defaults are applied
    pub enabled_tools: EnabledTools,

    /// Tools the caller switched on or off explicitly; these win over
    /// auto-mode defaults
    pub explicit_tools: HashMap<String, bool>,

    /// Automatic extraction settings
    pub auto_memory: AutoMemoryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-memory");

        Self {
            data_dir,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            enabled_tools: EnabledTools::service_defaults(),
            explicit_tools: HashMap::new(),
            auto_memory: AutoMemoryConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn MemoryExtractor>) -> Self {
        self.auto_memory.extractor = Some(extractor);
        self
    }

    pub fn auto_memory(mut self, auto_memory: AutoMemoryConfig) -> Self {
        self.auto_memory = auto_memory;
        self
    }

    /// Explicitly enable or disable a tool
    pub fn tool_enabled(mut self, name: impl Into<String>, enabled: bool) -> Self {
        let name = name.into();
        if enabled {
            self.enabled_tools.insert(name.clone());
        } else {
            self.enabled_tools.remove(&name);
        }
        self.explicit_tools.insert(name, enabled);
        self
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memories.db")
    }

    /// Ensure the data directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    /// Enabled tools with auto-mode defaults applied when an extractor is set
    pub fn resolved_tools(&self) -> EnabledTools {
        let mut tools = self.enabled_tools.clone();
        if self.auto_memory.extractor.is_some() {
            tools.apply_auto_mode_defaults(&self.explicit_tools);
        }
        tools
    }
}
