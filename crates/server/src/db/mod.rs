//! SQLite-backed repository. One connection behind a mutex serializes
//! writers; every multi-row mutation runs inside an explicit transaction.

pub mod entries;
pub mod feedback;
pub mod files;
pub mod jobs;
pub mod memories;
pub mod rules;
pub mod users;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ── Status enums ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(FileStatus::Pending),
            "processing" => Some(FileStatus::Processing),
            "completed" => Some(FileStatus::Completed),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcaStatus {
    None,
    Pending,
    Running,
    Completed,
    Failed,
}

impl RcaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RcaStatus::None => "none",
            RcaStatus::Pending => "pending",
            RcaStatus::Running => "running",
            RcaStatus::Completed => "completed",
            RcaStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(RcaStatus::None),
            "pending" => Some(RcaStatus::Pending),
            "running" => Some(RcaStatus::Running),
            "completed" => Some(RcaStatus::Completed),
            "failed" => Some(RcaStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never revert.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

// ── Database handle ─────────────────────────────────────────────

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Conflict(format!("cannot create database directory: {}", e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read or single-statement write under the connection lock.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a multi-statement mutation inside one transaction.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            password_hash   TEXT NOT NULL,
            salt            TEXT NOT NULL,
            llm_endpoint    TEXT,
            llm_model       TEXT,
            embedding_model TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS auth_tokens (
            token_hash TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_user ON auth_tokens(user_id);

        CREATE TABLE IF NOT EXISTS log_files (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL,
            filename          TEXT NOT NULL,
            size_bytes        INTEGER NOT NULL DEFAULT 0,
            status            TEXT NOT NULL DEFAULT 'pending',
            entry_count       INTEGER NOT NULL DEFAULT 0,
            error_count       INTEGER NOT NULL DEFAULT 0,
            warning_count     INTEGER NOT NULL DEFAULT 0,
            rca_status        TEXT NOT NULL DEFAULT 'none',
            active_rca_job_id TEXT,
            rca_possible      INTEGER,
            rca_reason        TEXT,
            parse_errors      TEXT,
            error_message     TEXT,
            stored_path       TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_files_user ON log_files(user_id, created_at);

        CREATE TABLE IF NOT EXISTS log_entries (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id    TEXT NOT NULL,
            ts         TEXT NOT NULL,
            level      TEXT NOT NULL,
            message    TEXT NOT NULL,
            metadata   TEXT,
            line_index INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_file ON log_entries(file_id, line_index);

        CREATE TABLE IF NOT EXISTS jobs (
            id            TEXT PRIMARY KEY,
            file_id       TEXT NOT NULL,
            job_type      TEXT NOT NULL DEFAULT 'rca_analysis',
            status        TEXT NOT NULL DEFAULT 'pending',
            progress      INTEGER NOT NULL DEFAULT 0,
            total_chunks  INTEGER NOT NULL DEFAULT 0,
            current_chunk INTEGER NOT NULL DEFAULT 0,
            failed_chunk  INTEGER,
            partials      TEXT,
            result        TEXT,
            error_message TEXT,
            timeout_secs  INTEGER NOT NULL DEFAULT 300,
            chunking      INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL,
            started_at    TEXT,
            completed_at  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_file ON jobs(file_id, created_at);

        CREATE TABLE IF NOT EXISTS analysis_memories (
            id                  TEXT PRIMARY KEY,
            file_id             TEXT NOT NULL,
            summary             TEXT NOT NULL,
            root_cause          TEXT NOT NULL DEFAULT '',
            severity            TEXT NOT NULL DEFAULT 'low',
            recommendations     TEXT,
            error_analysis      TEXT,
            critical_errors     INTEGER NOT NULL DEFAULT 0,
            non_critical_errors INTEGER NOT NULL DEFAULT 0,
            embedding           TEXT,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memories_file ON analysis_memories(file_id, created_at);

        CREATE TABLE IF NOT EXISTS feedback (
            id                 TEXT PRIMARY KEY,
            memory_id          TEXT NOT NULL,
            user_id            TEXT,
            is_correct         INTEGER NOT NULL,
            correction         TEXT,
            feedback_type      TEXT NOT NULL,
            pattern_name       TEXT,
            root_cause_section TEXT,
            confidence_impact  REAL NOT NULL DEFAULT 0,
            processed          INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL,
            UNIQUE(memory_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_feedback_pattern ON feedback(pattern_name);

        CREATE TABLE IF NOT EXISTS parsing_rules (
            id               TEXT PRIMARY KEY,
            user_id          TEXT NOT NULL,
            name             TEXT NOT NULL,
            description      TEXT NOT NULL DEFAULT '',
            active           INTEGER NOT NULL DEFAULT 1,
            field_mappings   TEXT NOT NULL DEFAULT '[]',
            extract_patterns TEXT NOT NULL DEFAULT '[]',
            is_template      INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rules_user ON parsing_rules(user_id);",
    )
}

// ── Shared row helpers ──────────────────────────────────────────

pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes_in_memory() {
        let db = Database::open_in_memory().unwrap();
        db.with(|conn| {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )?;
            assert!(count >= 8);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::parse("bogus").is_none());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_file_status_round_trips() {
        for status in [
            FileStatus::Pending,
            FileStatus::Processing,
            FileStatus::Completed,
            FileStatus::Failed,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            RcaStatus::None,
            RcaStatus::Pending,
            RcaStatus::Running,
            RcaStatus::Completed,
            RcaStatus::Failed,
        ] {
            assert_eq!(RcaStatus::parse(status.as_str()), Some(status));
        }
    }
}
