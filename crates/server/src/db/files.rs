use chrono::{DateTime, Utc};
use pipeline::model::{LineError, ParseStats, RcaFeasibility};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::{now_str, parse_ts, Database, FileStatus, RcaStatus, StoreError, StoreResult};

#[derive(Debug, Clone, Serialize)]
pub struct LogFileRecord {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub status: FileStatus,
    pub entry_count: i64,
    pub error_count: i64,
    pub warning_count: i64,
    pub rca_status: RcaStatus,
    pub active_rca_job_id: Option<String>,
    pub rca_possible: Option<bool>,
    pub rca_reason: Option<String>,
    pub parse_errors: Vec<LineError>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub stored_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const FILE_COLUMNS: &str = "id, user_id, filename, size_bytes, status, entry_count, error_count, \
                            warning_count, rca_status, active_rca_job_id, rca_possible, rca_reason, \
                            parse_errors, error_message, stored_path, created_at, updated_at";

fn map_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogFileRecord> {
    let status: String = row.get(4)?;
    let rca_status: String = row.get(8)?;
    let parse_errors: Option<String> = row.get(12)?;
    Ok(LogFileRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        filename: row.get(2)?,
        size_bytes: row.get(3)?,
        status: FileStatus::parse(&status).unwrap_or(FileStatus::Failed),
        entry_count: row.get(5)?,
        error_count: row.get(6)?,
        warning_count: row.get(7)?,
        rca_status: RcaStatus::parse(&rca_status).unwrap_or(RcaStatus::None),
        active_rca_job_id: row.get(9)?,
        rca_possible: row.get(10)?,
        rca_reason: row.get(11)?,
        parse_errors: parse_errors
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        error_message: row.get(13)?,
        stored_path: row.get(14)?,
        created_at: parse_ts(&row.get::<_, String>(15)?),
        updated_at: parse_ts(&row.get::<_, String>(16)?),
    })
}

impl Database {
    pub fn insert_file(
        &self,
        user_id: &str,
        filename: &str,
        size_bytes: i64,
        stored_path: &str,
    ) -> StoreResult<LogFileRecord> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        self.with(|conn| {
            conn.execute(
                "INSERT INTO log_files (id, user_id, filename, size_bytes, status, stored_path,
                                        created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                params![id, user_id, filename, size_bytes, stored_path, now],
            )?;
            Ok(())
        })?;
        self.file_by_id(&id)
    }

    pub fn file_by_id(&self, id: &str) -> StoreResult<LogFileRecord> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM log_files WHERE id = ?1", FILE_COLUMNS),
                params![id],
                map_file,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    pub fn list_files(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<LogFileRecord>, i64)> {
        self.with(|conn| {
            let total: i64 = conn.query_row(
                "SELECT count(*) FROM log_files WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM log_files WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                FILE_COLUMNS
            ))?;
            let files = stmt
                .query_map(params![user_id, limit, offset], map_file)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((files, total))
        })
    }

    pub fn set_file_status(&self, id: &str, status: FileStatus) -> StoreResult<()> {
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE log_files SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn mark_file_failed(&self, id: &str, message: &str) -> StoreResult<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE log_files SET status = 'failed', error_message = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id, message, now_str()],
            )?;
            Ok(())
        })
    }

    /// Record the parse outcome: counts, feasibility, the error report, and
    /// the terminal status, in one statement.
    pub fn finish_parse(
        &self,
        id: &str,
        stats: &ParseStats,
        rca: &RcaFeasibility,
        parse_errors: &[LineError],
    ) -> StoreResult<()> {
        let report = serde_json::to_string(parse_errors)?;
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE log_files
                 SET status = 'completed', entry_count = ?2, error_count = ?3,
                     warning_count = ?4, rca_possible = ?5, rca_reason = ?6,
                     parse_errors = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    id,
                    stats.entry_count as i64,
                    stats.error_count as i64,
                    stats.warning_count as i64,
                    rca.possible,
                    rca.reason,
                    report,
                    now_str()
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn set_rca_state(
        &self,
        id: &str,
        rca_status: RcaStatus,
        active_job_id: Option<&str>,
    ) -> StoreResult<()> {
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE log_files SET rca_status = ?2, active_rca_job_id = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, rca_status.as_str(), active_job_id, now_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Delete a log file. A file in `processing`, or with a live analysis
    /// job, may not be deleted; the check and the cascade share one
    /// transaction.
    ///
    /// Soft delete removes jobs, entries, and the file row, keeping
    /// analyses and feedback. Hard delete cascades over everything in
    /// deterministic order: jobs → entries → feedback → memories → file.
    pub fn delete_file(&self, id: &str, hard: bool) -> StoreResult<()> {
        self.with_tx(|tx| {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM log_files WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let status = status.ok_or(StoreError::NotFound)?;
            if status == "processing" {
                return Err(StoreError::Conflict(
                    "log file is still being processed".to_string(),
                ));
            }

            let live_jobs: i64 = tx.query_row(
                "SELECT count(*) FROM jobs
                 WHERE file_id = ?1 AND status IN ('pending', 'running')",
                params![id],
                |row| row.get(0),
            )?;
            if live_jobs > 0 {
                return Err(StoreError::Conflict(
                    "an analysis job for this file is still active".to_string(),
                ));
            }

            tx.execute("DELETE FROM jobs WHERE file_id = ?1", params![id])?;
            tx.execute("DELETE FROM log_entries WHERE file_id = ?1", params![id])?;
            if hard {
                tx.execute(
                    "DELETE FROM feedback WHERE memory_id IN
                     (SELECT id FROM analysis_memories WHERE file_id = ?1)",
                    params![id],
                )?;
                tx.execute(
                    "DELETE FROM analysis_memories WHERE file_id = ?1",
                    params![id],
                )?;
            }
            tx.execute("DELETE FROM log_files WHERE id = ?1", params![id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_file(db: &Database) -> LogFileRecord {
        db.insert_file("user-1", "app.log", 1024, "/tmp/app.log").unwrap()
    }

    #[test]
    fn test_insert_and_fetch() {
        let db = Database::open_in_memory().unwrap();
        let file = seed_file(&db);
        assert_eq!(file.status, FileStatus::Pending);
        assert_eq!(file.rca_status, RcaStatus::None);
        assert_eq!(file.filename, "app.log");
        assert!(file.parse_errors.is_empty());
    }

    #[test]
    fn test_finish_parse_updates_counts() {
        let db = Database::open_in_memory().unwrap();
        let file = seed_file(&db);
        let stats = ParseStats {
            total_lines: 10,
            entry_count: 9,
            error_count: 2,
            warning_count: 1,
        };
        let rca = RcaFeasibility::from_error_count(2);
        let errors = vec![LineError {
            line_index: 3,
            reason: "no pattern matched".to_string(),
        }];
        db.finish_parse(&file.id, &stats, &rca, &errors).unwrap();

        let file = db.file_by_id(&file.id).unwrap();
        assert_eq!(file.status, FileStatus::Completed);
        assert_eq!(file.entry_count, 9);
        assert_eq!(file.error_count, 2);
        assert_eq!(file.rca_possible, Some(true));
        assert_eq!(file.parse_errors.len(), 1);
    }

    #[test]
    fn test_list_files_paginates() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            db.insert_file("user-1", &format!("f{}.log", i), 10, "/tmp/x").unwrap();
        }
        db.insert_file("user-2", "other.log", 10, "/tmp/y").unwrap();

        let (page, total) = db.list_files("user-1", 2, 0).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);

        let (rest, _) = db.list_files("user-1", 10, 4).unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_delete_blocked_while_processing() {
        let db = Database::open_in_memory().unwrap();
        let file = seed_file(&db);
        db.set_file_status(&file.id, FileStatus::Processing).unwrap();
        let err = db.delete_file(&file.id, false).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_soft_delete_keeps_memories() {
        let db = Database::open_in_memory().unwrap();
        let file = seed_file(&db);
        db.set_file_status(&file.id, FileStatus::Completed).unwrap();
        let memory = db
            .insert_memory(
                &file.id,
                &pipeline::prompt::FinalAnalysis::no_errors(3),
                None,
            )
            .unwrap();

        db.delete_file(&file.id, false).unwrap();
        assert!(matches!(db.file_by_id(&file.id), Err(StoreError::NotFound)));
        // The analysis memory survives soft delete
        assert!(db.memory_by_id(&memory.id).is_ok());
    }

    #[test]
    fn test_hard_delete_cascades() {
        let db = Database::open_in_memory().unwrap();
        let file = seed_file(&db);
        db.set_file_status(&file.id, FileStatus::Completed).unwrap();
        let memory = db
            .insert_memory(
                &file.id,
                &pipeline::prompt::FinalAnalysis::no_errors(3),
                None,
            )
            .unwrap();

        db.delete_file(&file.id, true).unwrap();
        assert!(matches!(db.memory_by_id(&memory.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_delete_missing_file() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.delete_file("nope", false).unwrap_err(),
            StoreError::NotFound
        ));
    }
}
