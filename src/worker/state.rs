//! Per-user extraction state

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::memory::UserKey;
use crate::message::Message;

/// What the worker remembers about one user between turns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionState {
    /// When extraction was last triggered for this user
    pub last_extract_at: Option<DateTime<Utc>>,

    /// Conversation collected since the last extraction, oldest first
    pub pending_messages: Vec<Message>,

    /// Turns seen; never decreases
    pub total_turns: u64,

    /// Newest event timestamp already moved into `pending_messages`, per session
    pub(crate) scanned_through: HashMap<String, DateTime<Utc>>,
}

impl ExtractionState {
    /// Record that a session was scanned up to `ts`
    pub(crate) fn mark_scanned(&mut self, session_id: &str, ts: DateTime<Utc>) {
        let entry = self.scanned_through.entry(session_id.to_string()).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
    }

    pub(crate) fn scanned_through(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.scanned_through.get(session_id).copied()
    }

    /// Put messages from a failed job back ahead of anything collected since
    pub(crate) fn restore_pending(&mut self, mut messages: Vec<Message>) {
        messages.append(&mut self.pending_messages);
        self.pending_messages = messages;
    }

    /// Stamp an extraction; the timestamp never moves backwards
    pub(crate) fn mark_extracted(&mut self, at: DateTime<Utc>) {
        self.last_extract_at = Some(self.last_extract_at.map_or(at, |prev| prev.max(at)));
    }
}

/// Lazily created extraction state, one entry per user.
///
/// Entries live for the lifetime of the store. Callers lock the returned
/// state for the duration of a read-modify-write.
#[derive(Debug, Default)]
pub struct ExtractionStateStore {
    states: RwLock<HashMap<UserKey, Arc<Mutex<ExtractionState>>>>,
}

impl ExtractionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, user_key: &UserKey) -> Arc<Mutex<ExtractionState>> {
        if let Some(state) = self.states.read().get(user_key) {
            return state.clone();
        }
        self.states
            .write()
            .entry(user_key.clone())
            .or_default()
            .clone()
    }

    pub fn get(&self, user_key: &UserKey) -> Option<Arc<Mutex<ExtractionState>>> {
        self.states.read().get(user_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}
