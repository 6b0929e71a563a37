//! Job rows and their durable state machine. Every transition is guarded
//! by the expected prior status in SQL, so terminal states are sticky and
//! progress stays monotonic even with concurrent observers.

use chrono::{DateTime, Utc};
use pipeline::prompt::{ChunkAnalysis, FinalAnalysis};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::{now_str, parse_ts, parse_ts_opt, Database, JobStatus, StoreError, StoreResult};

pub const JOB_TYPE_RCA: &str = "rca_analysis";

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub file_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub progress: i64,
    pub total_chunks: i64,
    pub current_chunk: i64,
    pub failed_chunk: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalAnalysis>,
    pub error_message: Option<String>,
    pub timeout_secs: i64,
    pub chunking: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub partials: Vec<ChunkAnalysis>,
}

const JOB_COLUMNS: &str = "id, file_id, job_type, status, progress, total_chunks, current_chunk, \
                           failed_chunk, partials, result, error_message, timeout_secs, chunking, \
                           created_at, started_at, completed_at";

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let status: String = row.get(3)?;
    let partials: Option<String> = row.get(8)?;
    let result: Option<String> = row.get(9)?;
    Ok(JobRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        job_type: row.get(2)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        progress: row.get(4)?,
        total_chunks: row.get(5)?,
        current_chunk: row.get(6)?,
        failed_chunk: row.get(7)?,
        partials: partials
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        result: result.and_then(|raw| serde_json::from_str(&raw).ok()),
        error_message: row.get(10)?,
        timeout_secs: row.get(11)?,
        chunking: row.get(12)?,
        created_at: parse_ts(&row.get::<_, String>(13)?),
        started_at: parse_ts_opt(row.get(14)?),
        completed_at: parse_ts_opt(row.get(15)?),
    })
}

impl Database {
    /// Create an analysis job for a file. The duplicate-job guard and the
    /// insert share one transaction, so two near-simultaneous requests
    /// produce at most one live job.
    pub fn create_rca_job(
        &self,
        file_id: &str,
        timeout_secs: i64,
        chunking: bool,
    ) -> StoreResult<JobRecord> {
        let id = Uuid::new_v4().to_string();
        self.with_tx(|tx| {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM log_files WHERE id = ?1",
                    params![file_id],
                    |row| row.get(0),
                )
                .optional()?;
            let status = status.ok_or(StoreError::NotFound)?;
            if status == "processing" || status == "pending" {
                return Err(StoreError::Conflict(
                    "log file has not finished processing".to_string(),
                ));
            }

            let live: i64 = tx.query_row(
                "SELECT count(*) FROM jobs
                 WHERE file_id = ?1 AND status IN ('pending', 'running')",
                params![file_id],
                |row| row.get(0),
            )?;
            if live > 0 {
                return Err(StoreError::Conflict(
                    "an analysis job for this file is already pending or running".to_string(),
                ));
            }

            tx.execute(
                "INSERT INTO jobs (id, file_id, job_type, status, timeout_secs, chunking, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
                params![id, file_id, JOB_TYPE_RCA, timeout_secs, chunking, now_str()],
            )?;
            tx.execute(
                "UPDATE log_files SET rca_status = 'pending', active_rca_job_id = ?2,
                                      updated_at = ?3
                 WHERE id = ?1",
                params![file_id, id, now_str()],
            )?;
            Ok(())
        })?;
        self.job_by_id(&id)
    }

    pub fn job_by_id(&self, id: &str) -> StoreResult<JobRecord> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                map_job,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    pub fn jobs_for_file(&self, file_id: &str) -> StoreResult<Vec<JobRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE file_id = ?1 ORDER BY created_at DESC, id DESC",
                JOB_COLUMNS
            ))?;
            let jobs = stmt
                .query_map(params![file_id], map_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
    }

    /// pending → running. Returns Conflict when the job is no longer
    /// pending (e.g. cancelled before a worker picked it up).
    pub fn mark_job_running(&self, id: &str) -> StoreResult<()> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE jobs SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict("job is not pending".to_string()));
            }
            tx.execute(
                "UPDATE log_files SET rca_status = 'running', updated_at = ?2
                 WHERE id = (SELECT file_id FROM jobs WHERE id = ?1)",
                params![id, now_str()],
            )?;
            Ok(())
        })
    }

    pub fn set_job_total_chunks(&self, id: &str, total: i64) -> StoreResult<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET total_chunks = ?2 WHERE id = ?1 AND status = 'running'",
                params![id, total],
            )?;
            Ok(())
        })
    }

    /// Monotonic progress update; regressions are ignored rather than
    /// written.
    pub fn update_job_progress(&self, id: &str, current_chunk: i64, progress: i64) -> StoreResult<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET current_chunk = max(current_chunk, ?2),
                                 progress = max(progress, ?3)
                 WHERE id = ?1 AND status = 'running'",
                params![id, current_chunk, progress],
            )?;
            Ok(())
        })
    }

    /// Persist map-phase partials so a failed job can resume at the failed
    /// chunk without re-running completed ones.
    pub fn save_job_partials(&self, id: &str, partials: &[ChunkAnalysis]) -> StoreResult<()> {
        let raw = serde_json::to_string(partials)?;
        self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET partials = ?2 WHERE id = ?1 AND status = 'running'",
                params![id, raw],
            )?;
            Ok(())
        })
    }

    pub fn mark_job_failed(
        &self,
        id: &str,
        error: &str,
        failed_chunk: Option<i64>,
    ) -> StoreResult<()> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE jobs SET status = 'failed', error_message = ?2, failed_chunk = ?3,
                                 completed_at = ?4
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, error, failed_chunk, now_str()],
            )?;
            if changed == 0 {
                // Already terminal; sticky
                return Ok(());
            }
            tx.execute(
                "UPDATE log_files SET rca_status = 'failed', active_rca_job_id = NULL,
                                      updated_at = ?2
                 WHERE id = (SELECT file_id FROM jobs WHERE id = ?1)",
                params![id, now_str()],
            )?;
            Ok(())
        })
    }

    /// Cooperative cancellation observed at a chunk boundary (or while the
    /// job still sits in the queue). Partial state is preserved.
    pub fn mark_job_cancelled(&self, id: &str) -> StoreResult<bool> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE jobs SET status = 'cancelled', completed_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, now_str()],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tx.execute(
                "UPDATE log_files SET rca_status = 'none', active_rca_job_id = NULL,
                                      updated_at = ?2
                 WHERE id = (SELECT file_id FROM jobs WHERE id = ?1)",
                params![id, now_str()],
            )?;
            Ok(true)
        })
    }

    pub fn mark_job_completed(&self, id: &str, result: &FinalAnalysis) -> StoreResult<()> {
        let raw = serde_json::to_string(result)?;
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE jobs SET status = 'completed', progress = 100, result = ?2,
                                 completed_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, raw, now_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict("job is not running".to_string()));
            }
            tx.execute(
                "UPDATE log_files SET rca_status = 'completed', active_rca_job_id = NULL,
                                      updated_at = ?2
                 WHERE id = (SELECT file_id FROM jobs WHERE id = ?1)",
                params![id, now_str()],
            )?;
            Ok(())
        })
    }

    /// Re-queue a failed job for resumption. Keeps partials and failed
    /// chunk so the orchestrator can skip completed work.
    pub fn mark_job_retrying(&self, id: &str) -> StoreResult<JobRecord> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE jobs SET status = 'pending', error_message = NULL, completed_at = NULL
                 WHERE id = ?1 AND status = 'failed'",
                params![id],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(
                    "only failed jobs can be retried".to_string(),
                ));
            }
            tx.execute(
                "UPDATE log_files SET rca_status = 'pending', active_rca_job_id = ?1,
                                      updated_at = ?2
                 WHERE id = (SELECT file_id FROM jobs WHERE id = ?1)",
                params![id, now_str()],
            )?;
            Ok(())
        })?;
        self.job_by_id(id)
    }

    /// Shutdown path: every still-live job fails with the drain reason.
    pub fn fail_inflight_jobs(&self, reason: &str) -> StoreResult<usize> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs WHERE status IN ('pending', 'running')",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            for id in &ids {
                tx.execute(
                    "UPDATE jobs SET status = 'failed', error_message = ?2, completed_at = ?3
                     WHERE id = ?1",
                    params![id, reason, now_str()],
                )?;
                tx.execute(
                    "UPDATE log_files SET rca_status = 'failed', active_rca_job_id = NULL,
                                          updated_at = ?2
                     WHERE id = (SELECT file_id FROM jobs WHERE id = ?1)",
                    params![id, now_str()],
                )?;
            }
            Ok(ids.len())
        })
    }
}
