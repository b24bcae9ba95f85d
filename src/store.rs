//! Session state store: the last completed-stage boundary of each session.
//!
//! `MemorySessionStore` serves a single process. `SqliteSessionStore` keeps
//! records on disk so another process can resume or archive them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::pipeline::controller::Phase;
use crate::pipeline::state::PipelineState;

/// Session key used when the caller does not pick one.
pub const DEFAULT_SESSION_ID: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub state: PipelineState,
    /// Phase to run next when the session is resumed.
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, question: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            state: PipelineState::new(question),
            phase: Phase::Generating,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    /// All records, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    records: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut guard = self.records.write().map_err(|_| StoreError::Poisoned)?;
        guard.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let guard = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(session_id).cloned())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let guard = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut records: Vec<SessionRecord> = guard.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }
}

// =============================================================================
// SQLite store
// =============================================================================

#[derive(Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS sessions (\
               session_id TEXT PRIMARY KEY,\
               question TEXT NOT NULL,\
               phase TEXT NOT NULL,\
               retry_count INTEGER NOT NULL,\
               escalate INTEGER NOT NULL,\
               state_json TEXT NOT NULL,\
               created_at TEXT NOT NULL,\
               updated_at TEXT NOT NULL\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".nl2sql_sessions.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    /// Write every record as one JSON line, most recent first.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        use std::io::Write;

        let records = self.list().await?;
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            for record in &records {
                let line =
                    serde_json::to_string(record).map_err(|e| StoreError::Serde(e.to_string()))?;
                writeln!(file, "{line}")?;
            }
            file.flush()?;
            Ok(records.len())
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let session_id: String = row.get(0)?;
    let phase: String = row.get(1)?;
    let state_json: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    let state: PipelineState =
        serde_json::from_str(&state_json).map_err(|e| StoreError::Serde(e.to_string()))?;
    let phase: Phase = serde_json::from_value(serde_json::Value::String(phase))
        .map_err(|e| StoreError::Serde(e.to_string()))?;

    Ok(SessionRecord {
        session_id,
        state,
        phase,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Fixed-width RFC 3339 so `ORDER BY updated_at` sorts chronologically.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serde(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let state_json =
                serde_json::to_string(&record.state).map_err(|e| StoreError::Serde(e.to_string()))?;
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sessions (\
                        session_id, question, phase, retry_count, escalate, state_json,\
                        created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(session_id) DO UPDATE SET \
                        question = excluded.question,\
                        phase = excluded.phase,\
                        retry_count = excluded.retry_count,\
                        escalate = excluded.escalate,\
                        state_json = excluded.state_json,\
                        created_at = excluded.created_at,\
                        updated_at = excluded.updated_at",
                    params![
                        record.session_id,
                        record.state.question,
                        record.phase.as_str(),
                        record.state.retry_count as i64,
                        if record.state.escalate { 1 } else { 0 },
                        state_json,
                        timestamp(&record.created_at),
                        timestamp(&record.updated_at),
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, phase, state_json, created_at, updated_at \
                     FROM sessions WHERE session_id = ?1",
                )?;
                let row = stmt
                    .query_row(params![session_id], |row| {
                        Ok(record_from_row(row))
                    })
                    .optional()?;
                row.transpose()
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, phase, state_json, created_at, updated_at \
                     FROM sessions ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    records.push(record_from_row(row)?);
                }
                Ok(records)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_and_overwrites() {
        let store = MemorySessionStore::new();
        assert!(store.get("1").await.unwrap().is_none());

        let mut record = SessionRecord::new("1", "q");
        store.put(&record).await.unwrap();

        record.state.record_generation("SELECT 1".into());
        record.phase = Phase::Describing;
        store.put(&record).await.unwrap();

        let loaded = store.get("1").await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Describing);
        assert_eq!(loaded.state.retry_count, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[test]
    fn sqlite_store_reports_unusable_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        match SqliteSessionStore::new(blocker.join("sessions.sqlite")) {
            Err(StoreError::Io(_)) => {}
            Err(other) => panic!("expected Io error, got {other}"),
            Ok(_) => panic!("expected Io error, got a store"),
        }
    }
}
