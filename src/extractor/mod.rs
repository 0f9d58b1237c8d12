//! Memory extraction: operations, the extractor seam, and trigger checkers

mod checker;
mod llm;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{MemoryEntry, UserKey};
use crate::message::Message;
use crate::model::Model;
use crate::tools::{self, EnabledTools};

pub use checker::{
    check_message_threshold, check_time_interval, check_turn_interval, checks_all, checks_any,
    Checker,
};
pub use llm::{memory_tool_declarations, LlmExtractor, DEFAULT_PROMPT};

/// A change to a user's memories, as decided by an extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Add {
        memory: String,
        #[serde(default)]
        topics: Vec<String>,
    },
    Update {
        memory_id: String,
        memory: String,
        #[serde(default)]
        topics: Vec<String>,
    },
    Delete {
        memory_id: String,
    },
    Clear,
    /// Anything this version does not understand; logged and skipped
    #[serde(other)]
    Unknown,
}

impl Operation {
    pub fn add(memory: impl Into<String>, topics: Vec<String>) -> Self {
        Operation::Add {
            memory: memory.into(),
            topics,
        }
    }

    pub fn update(memory_id: impl Into<String>, memory: impl Into<String>, topics: Vec<String>) -> Self {
        Operation::Update {
            memory_id: memory_id.into(),
            memory: memory.into(),
            topics,
        }
    }

    pub fn delete(memory_id: impl Into<String>) -> Self {
        Operation::Delete {
            memory_id: memory_id.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "add",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Clear => "clear",
            Operation::Unknown => "unknown",
        }
    }

    /// Tool whose enablement gates this operation
    pub fn tool_name(&self) -> Option<&'static str> {
        match self {
            Operation::Add { .. } => Some(tools::ADD_TOOL),
            Operation::Update { .. } => Some(tools::UPDATE_TOOL),
            Operation::Delete { .. } => Some(tools::DELETE_TOOL),
            Operation::Clear => Some(tools::CLEAR_TOOL),
            Operation::Unknown => None,
        }
    }
}

/// What an extractor sees when deciding whether to run
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext<'a> {
    pub user_key: &'a UserKey,

    /// Messages accumulated since the last extraction, oldest first
    pub messages: &'a [Message],

    /// When extraction last ran for this user, if ever
    pub last_extract_at: Option<DateTime<Utc>>,

    /// Turns seen for this user, including the current one
    pub total_turns: u64,
}

/// Turns conversation into memory operations.
///
/// Implementations own deduplication and add-versus-update decisions; the
/// worker executes operations in the order returned.
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(&self, messages: &[Message], existing: &[MemoryEntry]) -> Result<Vec<Operation>>;

    /// Whether enough has happened to be worth an extraction call
    fn should_extract(&self, ctx: &ExtractionContext<'_>) -> bool;

    fn set_prompt(&self, prompt: &str);

    fn set_model(&self, model: Arc<dyn Model>);

    fn metadata(&self) -> HashMap<String, serde_json::Value>;

    /// Receive the service's enabled tools so only permitted operations are
    /// produced. Extractors that cannot shape their output keep the default.
    fn set_enabled_tools(&self, _enabled: &EnabledTools) {}
}
