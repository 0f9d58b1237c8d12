//! # Agent Memory
//!
//! Long-term memory for conversational agents, with automatic extraction.
//!
//! ## Architecture
//!
//! - **Sessions** - append-only event logs that carry the extraction watermark
//! - **Extractors** - turn new conversation into add/update/delete/clear operations
//! - **Worker** - per-user pending buffers, hash-sharded job queues, inline fallback
//! - **Services** - in-memory and SQLite memory stores the worker writes into
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_memory::{LlmExtractor, MemoryService, ServiceConfig, SqliteMemoryService};
//!
//! let extractor = Arc::new(LlmExtractor::new(model));
//! let service = SqliteMemoryService::new(ServiceConfig::default().extractor(extractor)).await?;
//!
//! // after every agent turn
//! service.enqueue_auto_memory_job(&request_token, session.clone()).await?;
//!
//! // answer with what we know
//! let memories = service.search_memories(&session.user_key(), "coffee").await?;
//!
//! service.close().await;
//! ```

pub mod config;
pub mod error;
pub mod extractor;
pub mod memory;
pub mod message;
pub mod model;
pub mod session;
pub mod storage;
pub mod tools;
pub mod worker;

pub use config::{AutoMemoryConfig, ServiceConfig};
pub use error::{Error, Result};
pub use extractor::{ExtractionContext, LlmExtractor, MemoryExtractor, Operation};
pub use memory::{MemoryEntry, MemoryKey, MemoryRecord, UserKey};
pub use message::{Message, Role};
pub use model::{Model, ModelCallbacks};
pub use session::{Event, Session};
pub use storage::{InMemoryMemoryService, MemoryService, SqliteMemoryService};
pub use tools::EnabledTools;
pub use worker::{AutoMemoryWorker, MemoryOperator};
