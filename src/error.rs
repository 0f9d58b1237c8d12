//! Error types for agent-memory

use std::time::Duration;

use thiserror::Error;

/// Result type alias for agent-memory operations
pub type Result<T> = std::result::Result<T, Error>;

const NOT_FOUND_PREFIX: &str = "memory with id ";
const NOT_FOUND_SUFFIX: &str = " not found";

/// Errors that can occur in agent-memory
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(String),

    #[error("auto_memory: extract failed: {0}")]
    Extraction(String),

    /// The wording is an interop contract with pluggable stores, see
    /// [`Error::is_memory_not_found`].
    #[error("memory with id {0} not found")]
    MemoryNotFound(String),

    #[error("memory limit exceeded for user {user}, limit: {limit}, current: {current}")]
    MemoryLimitExceeded {
        user: String,
        limit: usize,
        current: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(memory_id: impl Into<String>) -> Self {
        Self::MemoryNotFound(memory_id.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error means the targeted memory does not exist.
    ///
    /// Stores that report failures through [`Error::Storage`] are still
    /// recognised as long as the message reads
    /// `memory with id <id> not found`.
    pub fn is_memory_not_found(&self) -> bool {
        match self {
            Error::MemoryNotFound(_) => true,
            other => is_not_found_message(&other.to_string()),
        }
    }
}

fn is_not_found_message(msg: &str) -> bool {
    match msg.find(NOT_FOUND_PREFIX) {
        Some(start) => msg[start + NOT_FOUND_PREFIX.len()..].ends_with(NOT_FOUND_SUFFIX),
        None => false,
    }
}
