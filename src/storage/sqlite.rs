//! SQLite-backed memory service

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use super::{newest_first, AutoMemory, MemoryService};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::memory::{
    generate_memory_id, match_memory_entry, MemoryEntry, MemoryKey, MemoryRecord, UserKey,
};
use crate::session::{format_timestamp, Session};
use crate::worker::{AutoMemoryWorker, MemoryOperator};

struct SqliteStore {
    conn: Mutex<Connection>,
    memory_limit: usize,
}

impl SqliteStore {
    fn open(path: &Path, memory_limit: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Mutex::new(conn),
            memory_limit,
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    fn load_user(&self, user_key: &UserKey) -> Result<Vec<MemoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT app_name, user_id, id, memory, topics, last_updated, created_at, updated_at
            FROM memories WHERE app_name = ?1 AND user_id = ?2
            "#,
        )?;

        let rows = stmt.query_map(params![user_key.app_name, user_key.user_id], |row| {
            Ok(MemoryRow {
                app_name: row.get(0)?,
                user_id: row.get(1)?,
                id: row.get(2)?,
                memory: row.get(3)?,
                topics: row.get(4)?,
                last_updated: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl MemoryOperator for SqliteStore {
    async fn read_memories(&self, user_key: &UserKey, limit: usize) -> Result<Vec<MemoryEntry>> {
        Ok(newest_first(self.load_user(user_key)?, limit))
    }

    async fn add_memory(&self, user_key: &UserKey, memory: &str, topics: &[String]) -> Result<()> {
        let id = generate_memory_id(memory, topics, user_key);
        let now = format_timestamp(Utc::now());
        let topics_json = serde_json::to_string(topics)?;
        let conn = self.conn()?;

        let exists = conn
            .query_row(
                "SELECT 1 FROM memories WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![user_key.app_name, user_key.user_id, id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if !exists && self.memory_limit > 0 {
            let current: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE app_name = ?1 AND user_id = ?2",
                params![user_key.app_name, user_key.user_id],
                |row| row.get(0),
            )?;
            let current = usize::try_from(current).unwrap_or(usize::MAX);
            if current >= self.memory_limit {
                return Err(Error::MemoryLimitExceeded {
                    user: user_key.to_string(),
                    limit: self.memory_limit,
                    current,
                });
            }
        }

        conn.execute(
            r#"
            INSERT INTO memories (
                app_name, user_id, id, memory, topics, last_updated, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
            ON CONFLICT(app_name, user_id, id) DO UPDATE SET
                memory = excluded.memory,
                topics = excluded.topics,
                last_updated = excluded.last_updated,
                updated_at = excluded.updated_at
            "#,
            params![user_key.app_name, user_key.user_id, id, memory, topics_json, now],
        )?;
        Ok(())
    }

    async fn update_memory(&self, key: &MemoryKey, memory: &str, topics: &[String]) -> Result<()> {
        let now = format_timestamp(Utc::now());
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE memories
            SET memory = ?1, topics = ?2, last_updated = ?3, updated_at = ?3
            WHERE app_name = ?4 AND user_id = ?5 AND id = ?6
            "#,
            params![
                memory,
                serde_json::to_string(topics)?,
                now,
                key.app_name,
                key.user_id,
                key.memory_id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found(key.memory_id.clone()));
        }
        Ok(())
    }

    async fn delete_memory(&self, key: &MemoryKey) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM memories WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
            params![key.app_name, key.user_id, key.memory_id],
        )?;
        Ok(())
    }

    async fn clear_memories(&self, user_key: &UserKey) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM memories WHERE app_name = ?1 AND user_id = ?2",
            params![user_key.app_name, user_key.user_id],
        )?;
        Ok(())
    }
}

/// Intermediate struct for reading from SQLite
struct MemoryRow {
    app_name: String,
    user_id: String,
    id: String,
    memory: String,
    topics: String,
    last_updated: String,
    created_at: String,
    updated_at: String,
}

impl MemoryRow {
    fn into_entry(self) -> Result<MemoryEntry> {
        Ok(MemoryEntry {
            id: self.id,
            app_name: self.app_name,
            user_id: self.user_id,
            memory: MemoryRecord {
                memory: self.memory,
                topics: serde_json::from_str(&self.topics)?,
                last_updated: parse_timestamp(&self.last_updated)?,
            },
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("bad timestamp {raw:?}: {e}")))
}

/// Memory service persisted in a single SQLite file.
pub struct SqliteMemoryService {
    store: Arc<SqliteStore>,
    auto: AutoMemory,
}

impl SqliteMemoryService {
    /// Open `memories.db` under the configured data directory
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let path = config.sqlite_path();
        Self::open(path, config).await
    }

    /// Open a database at an explicit path
    pub async fn open(path: impl AsRef<Path>, config: ServiceConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(path.as_ref(), config.memory_limit)?);
        tracing::info!("Opened memory database at {}", path.as_ref().display());

        let auto = AutoMemory::start(&config, store.clone()).await;
        Ok(Self { store, auto })
    }

    pub fn auto_memory_worker(&self) -> Option<&AutoMemoryWorker> {
        self.auto.worker()
    }
}

#[async_trait]
impl MemoryOperator for SqliteMemoryService {
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
impl MemoryService for SqliteMemoryService {
    async fn search_memories(&self, user_key: &UserKey, query: &str) -> Result<Vec<MemoryEntry>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let hits = self
            .store
            .load_user(user_key)?
            .into_iter()
            .filter(|entry| match_memory_entry(entry, query))
            .collect();
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
