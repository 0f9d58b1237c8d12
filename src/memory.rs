//! Memory types: keys, entries and search matching

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies the owner of a set of memories
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserKey {
    pub app_name: String,
    pub user_id: String,
}

impl UserKey {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
        }
    }

    /// Both halves must be set for any memory operation to proceed
    pub fn is_complete(&self) -> bool {
        !self.app_name.is_empty() && !self.user_id.is_empty()
    }

    /// Address a single memory of this user
    pub fn memory(&self, memory_id: impl Into<String>) -> MemoryKey {
        MemoryKey {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            memory_id: memory_id.into(),
        }
    }
}

impl std::fmt::Display for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_name, self.user_id)
    }
}

/// Identifies a single memory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryKey {
    pub app_name: String,
    pub user_id: String,
    pub memory_id: String,
}

impl MemoryKey {
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.app_name.clone(), self.user_id.clone())
    }
}

/// The remembered fact and its topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// The memory content - a short third-person statement
    pub memory: String,

    /// Topics for categorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,

    /// When the content last changed
    pub last_updated: DateTime<Utc>,
}

/// A stored memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Memory ID, stable for identical content, see [`generate_memory_id`]
    pub id: String,

    pub app_name: String,

    pub user_id: String,

    pub memory: MemoryRecord,

    /// When the memory was created
    pub created_at: DateTime<Utc>,

    /// When the memory was last written
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// Create a new entry with a content-derived ID
    pub fn new(user_key: &UserKey, memory: impl Into<String>, topics: Vec<String>) -> Self {
        let now = Utc::now();
        let memory = memory.into();
        let id = generate_memory_id(&memory, &topics, user_key);
        Self {
            id,
            app_name: user_key.app_name.clone(),
            user_id: user_key.user_id.clone(),
            memory: MemoryRecord {
                memory,
                topics,
                last_updated: now,
            },
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.app_name.clone(), self.user_id.clone())
    }

    /// Replace content and topics, bumping timestamps
    pub fn rewrite(&mut self, memory: impl Into<String>, topics: Vec<String>) {
        let now = Utc::now();
        self.memory.memory = memory.into();
        self.memory.topics = topics;
        self.memory.last_updated = now;
        self.updated_at = now;
    }
}

/// Derive a memory ID from content, topics and owner.
///
/// Topic order does not matter; the same content for two different users
/// gets two different IDs.
pub fn generate_memory_id(memory: &str, topics: &[String], user_key: &UserKey) -> String {
    let mut key = String::from("memory:");
    key.push_str(memory);

    if !topics.is_empty() {
        let mut sorted = topics.to_vec();
        sorted.sort();
        key.push_str("|topics:");
        key.push_str(&sorted.join(","));
    }

    key.push_str("|app:");
    key.push_str(&user_key.app_name);
    key.push_str("|user:");
    key.push_str(&user_key.user_id);

    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

const MIN_TOKEN_LEN: usize = 2;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "of", "in", "on", "to", "for", "with", "is", "are", "am", "be",
];

/// Tokenize a search query.
///
/// Text containing Han characters is split into character bigrams; anything
/// else is split on non-alphanumerics with short tokens and stopwords removed.
pub fn build_search_tokens(query: &str) -> Vec<String> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return Vec::new();
    }

    if q.chars().any(is_han) {
        let chars: Vec<char> = q
            .chars()
            .filter(|c| !c.is_whitespace() && !is_punct(*c))
            .collect();
        return match chars.len() {
            0 => Vec::new(),
            1 => vec![chars[0].to_string()],
            _ => dedup(chars.windows(2).map(|w| w.iter().collect::<String>())),
        };
    }

    dedup(
        q.split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
            .filter(|t| !STOPWORDS.contains(t))
            .map(str::to_string),
    )
}

/// Whether an entry matches a search query (any token, content or topics).
pub fn match_memory_entry(entry: &MemoryEntry, query: &str) -> bool {
    let query = query.trim();
    if query.is_empty() {
        return false;
    }

    let content = entry.memory.memory.to_lowercase();
    let topics: Vec<String> = entry.memory.topics.iter().map(|t| t.to_lowercase()).collect();
    let hit = |needle: &str| content.contains(needle) || topics.iter().any(|t| t.contains(needle));

    let tokens = build_search_tokens(query);
    if tokens.is_empty() {
        return hit(&query.to_lowercase());
    }
    tokens.iter().any(|t| hit(t))
}

fn is_han(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xF900..=0xFAFF
        | 0x20000..=0x2A6DF
        | 0x2A700..=0x2EBEF
        | 0x30000..=0x3134F)
        || c == '\u{3007}'
}

fn is_punct(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}

fn dedup(tokens: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens
        .into_iter()
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}
