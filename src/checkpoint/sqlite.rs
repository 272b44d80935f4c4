//! SQLite checkpoint backend

use super::traits::{
    CheckpointError, CheckpointMeta, CheckpointResult, CheckpointStore, OpenCheckpointStore,
};
use crate::chunk::WorkflowState;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Default number of checkpoints kept per session.
pub const DEFAULT_MAX_HISTORY: usize = 20;

/// SQLite-backed checkpoint store
///
/// One table, one row per checkpoint. Thread-safe via internal mutex on the
/// connection; WAL mode lets a poller read while a run writes.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
    max_history: usize,
}

impl SqliteCheckpointStore {
    fn init_schema(conn: &Connection) -> CheckpointResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_created
                ON checkpoints(created_at);

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> CheckpointResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_history: DEFAULT_MAX_HISTORY,
        })
    }

    /// Keep at most `max_history` checkpoints per session (minimum 1).
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    fn lock(&self) -> CheckpointResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CheckpointError::LockPoisoned)
    }

    fn parse_time(raw: &str) -> CheckpointResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CheckpointError::DateParse(format!("{}: {}", raw, e)))
    }
}

impl OpenCheckpointStore for SqliteCheckpointStore {
    fn open(path: impl AsRef<Path>) -> CheckpointResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> CheckpointResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, state: &WorkflowState) -> CheckpointResult<()> {
        let state_json = serde_json::to_string(state)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE session_id = ?1",
            params![state.session_id()],
            |row| row.get(0),
        )?;
        tx.execute(
            r#"
            INSERT INTO checkpoints (session_id, seq, created_at, chunk_count, error_count, state_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                state.session_id(),
                next_seq,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                state.chunks.len() as i64,
                state.errors.len() as i64,
                state_json,
            ],
        )?;
        tx.execute(
            "DELETE FROM checkpoints WHERE session_id = ?1 AND seq <= ?2",
            params![state.session_id(), next_seq - self.max_history as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> CheckpointResult<Option<WorkflowState>> {
        let conn = self.lock()?;
        let state_json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM checkpoints WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        match state_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn delete_session(&self, session_id: &str) -> CheckpointResult<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM checkpoints WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(deleted > 0)
    }

    fn list_sessions(&self) -> CheckpointResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_id FROM checkpoints GROUP BY session_id ORDER BY MAX(created_at) DESC, session_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn history(&self, session_id: &str) -> CheckpointResult<Vec<CheckpointMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, created_at, chunk_count, error_count
             FROM checkpoints WHERE session_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, created_at, chunk_count, error_count)| {
                Ok(CheckpointMeta {
                    session_id: session_id.to_string(),
                    seq: seq as u64,
                    created_at: Self::parse_time(&created_at)?,
                    chunk_count: chunk_count as usize,
                    error_count: error_count as usize,
                })
            })
            .collect()
    }
}
