// Durable store
// SQLite-backed persistence for agent state, memories, skills, evolution
// history, and the event outbox. Single writer behind an async mutex; WAL
// journaling so readers stay concurrent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use foreman_types::OutboxEvent;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One stored memory item. `memory_type` is one of `episodic`, `semantic`,
/// `procedural`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub memory_type: String,
    pub content: String,
    pub metadata: Value,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRecord {
    pub name: String,
    pub code: String,
    pub description: String,
    pub success_rate: f64,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEntry {
    pub id: i64,
    pub generation: i64,
    pub changes: Value,
    pub metrics: Value,
    pub created_at: DateTime<Utc>,
}

/// Connection manager for the embedded store.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Store {
    /// Open (or create) the store and run the idempotent schema setup.
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // PRAGMA journal_mode returns a row, so query_row and ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema().await?;
        tracing::info!(path = %store.db_path.display(), "store initialized");
        Ok(store)
    }

    /// Open an in-memory store, used by tests and ephemeral runs.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                importance REAL NOT NULL DEFAULT 0.5,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_type_importance
             ON memories(type, importance DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS skills (
                name TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                description TEXT,
                success_rate REAL NOT NULL DEFAULT 0.0,
                usage_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS evolution_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                generation INTEGER NOT NULL,
                changes TEXT NOT NULL,
                metrics TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbox (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                delivered_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outbox_undelivered
             ON outbox(delivered_at) WHERE delivered_at IS NULL",
            [],
        )?;

        Ok(())
    }

    // --- agent state ---

    pub async fn save_state(&self, key: &str, value: &Value) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, serde_json::to_string(value)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn load_state(&self, key: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // --- memories ---

    pub async fn store_memory(&self, record: &MemoryRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO memories (id, type, content, metadata, importance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.memory_type,
                record.content,
                serde_json::to_string(&record.metadata)?,
                record.importance,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Top memories of one type, ordered by importance. Relies on the
    /// `(type, importance DESC)` index.
    pub async fn top_memories(&self, memory_type: &str, limit: usize) -> StoreResult<Vec<MemoryRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, type, content, metadata, importance, created_at
             FROM memories WHERE type = ?1
             ORDER BY importance DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![memory_type, limit as i64], row_to_memory)?;
        collect_rows(rows)
    }

    pub async fn recent_memories(&self, memory_type: &str, limit: usize) -> StoreResult<Vec<MemoryRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, type, content, metadata, importance, created_at
             FROM memories WHERE type = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![memory_type, limit as i64], row_to_memory)?;
        collect_rows(rows)
    }

    pub async fn get_memory(&self, id: &str) -> StoreResult<Option<MemoryRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, type, content, metadata, importance, created_at
                 FROM memories WHERE id = ?1",
                params![id],
                row_to_memory,
            )
            .optional()?;
        Ok(record)
    }

    // --- skills ---

    pub async fn store_skill(&self, name: &str, code: &str, description: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO skills (name, code, description, success_rate, usage_count, created_at)
             VALUES (?1, ?2, ?3,
                     COALESCE((SELECT success_rate FROM skills WHERE name = ?1), 0.0),
                     COALESCE((SELECT usage_count FROM skills WHERE name = ?1), 0),
                     COALESCE((SELECT created_at FROM skills WHERE name = ?1), ?4))",
            params![name, code, description, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn list_skills(&self) -> StoreResult<Vec<SkillRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, code, description, success_rate, usage_count, created_at
             FROM skills ORDER BY usage_count DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SkillRecord {
                name: row.get(0)?,
                code: row.get(1)?,
                description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                success_rate: row.get(3)?,
                usage_count: row.get(4)?,
                created_at: parse_timestamp(row.get::<_, String>(5)?),
            })
        })?;
        collect_rows(rows)
    }

    pub async fn record_skill_use(&self, name: &str, success: bool) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE skills SET
                usage_count = usage_count + 1,
                success_rate = ((success_rate * usage_count) + ?2) / (usage_count + 1)
             WHERE name = ?1",
            params![name, if success { 1.0 } else { 0.0 }],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("skill `{name}`")));
        }
        Ok(())
    }

    // --- evolution history ---

    pub async fn log_evolution(&self, generation: i64, changes: &Value, metrics: &Value) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO evolution_history (generation, changes, metrics, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                generation,
                serde_json::to_string(changes)?,
                serde_json::to_string(metrics)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn evolution_history(&self, limit: usize) -> StoreResult<Vec<EvolutionEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, generation, changes, metrics, created_at
             FROM evolution_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(EvolutionEntry {
                id: row.get(0)?,
                generation: row.get(1)?,
                changes: parse_json(row.get::<_, String>(2)?),
                metrics: parse_json(row.get::<_, String>(3)?),
                created_at: parse_timestamp(row.get::<_, String>(4)?),
            })
        })?;
        collect_rows(rows)
    }

    // --- outbox ---

    /// Append an event row with `delivered_at = NULL`. This must happen
    /// before the in-process dispatch.
    pub async fn append_outbox(&self, event: &OutboxEvent) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO outbox (id, type, payload, source, created_at, delivered_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0)",
            params![
                event.id,
                event.event_type,
                serde_json::to_string(&event.payload)?,
                event.source,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn mark_delivered(&self, event_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE outbox SET delivered_at = ?2 WHERE id = ?1",
            params![event_id, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("outbox event `{event_id}`")));
        }
        Ok(())
    }

    pub async fn increment_retry(&self, event_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE outbox SET retry_count = retry_count + 1 WHERE id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    pub async fn undelivered_events(&self, limit: usize) -> StoreResult<Vec<OutboxEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, type, payload, source, created_at, delivered_at, retry_count
             FROM outbox WHERE delivered_at IS NULL
             ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_outbox)?;
        collect_rows(rows)
    }

    pub async fn purge_delivered(&self, older_than: chrono::Duration) -> StoreResult<usize> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM outbox WHERE delivered_at IS NOT NULL AND delivered_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        memory_type: row.get(1)?,
        content: row.get(2)?,
        metadata: row
            .get::<_, Option<String>>(3)?
            .map(parse_json)
            .unwrap_or(Value::Null),
        importance: row.get(4)?,
        created_at: parse_timestamp(row.get::<_, String>(5)?),
    })
}

fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEvent> {
    Ok(OutboxEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: parse_json(row.get::<_, String>(2)?),
        source: row.get(3)?,
        created_at: parse_timestamp(row.get::<_, String>(4)?),
        delivered_at: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_timestamp(raw)),
        retry_count: row.get::<_, i64>(6)? as u32,
    })
}

fn parse_json(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::Null)
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
