use chrono::{DateTime, Utc};
use pipeline::prompt::{ErrorPatternAnalysis, FinalAnalysis, Severity};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::{now_str, parse_ts, Database, StoreError, StoreResult};

/// Persisted outcome of a completed analysis. Immutable once written
/// (the embedding is attached right after insertion, then never changed).
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub file_id: String,
    pub summary: String,
    pub root_cause: String,
    pub severity: Severity,
    pub recommendations: Vec<String>,
    pub error_analysis: Vec<ErrorPatternAnalysis>,
    pub critical_errors: i64,
    pub non_critical_errors: i64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

const MEMORY_COLUMNS: &str = "id, file_id, summary, root_cause, severity, recommendations, \
                              error_analysis, critical_errors, non_critical_errors, embedding, \
                              created_at";

fn severity_from_str(raw: &str) -> Severity {
    match raw {
        "medium" => Severity::Medium,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        _ => Severity::Low,
    }
}

fn map_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let severity: String = row.get(4)?;
    let recommendations: Option<String> = row.get(5)?;
    let error_analysis: Option<String> = row.get(6)?;
    let embedding: Option<String> = row.get(9)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        summary: row.get(2)?,
        root_cause: row.get(3)?,
        severity: severity_from_str(&severity),
        recommendations: recommendations
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        error_analysis: error_analysis
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        critical_errors: row.get(7)?,
        non_critical_errors: row.get(8)?,
        embedding: embedding.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

impl Database {
    pub fn insert_memory(
        &self,
        file_id: &str,
        analysis: &FinalAnalysis,
        embedding: Option<&[f32]>,
    ) -> StoreResult<MemoryRecord> {
        let id = Uuid::new_v4().to_string();
        let recommendations = serde_json::to_string(&analysis.recommendations)?;
        let error_analysis = serde_json::to_string(&analysis.error_analysis)?;
        let embedding_raw = embedding.map(serde_json::to_string).transpose()?;
        self.with(|conn| {
            conn.execute(
                "INSERT INTO analysis_memories
                     (id, file_id, summary, root_cause, severity, recommendations,
                      error_analysis, critical_errors, non_critical_errors, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id,
                    file_id,
                    analysis.summary,
                    analysis.root_cause,
                    analysis.severity.as_str(),
                    recommendations,
                    error_analysis,
                    analysis.critical_errors as i64,
                    analysis.non_critical_errors as i64,
                    embedding_raw,
                    now_str()
                ],
            )?;
            Ok(())
        })?;
        self.memory_by_id(&id)
    }

    /// Attach the summary embedding produced right after the insert.
    pub fn set_memory_embedding(&self, id: &str, embedding: &[f32]) -> StoreResult<()> {
        let raw = serde_json::to_string(embedding)?;
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE analysis_memories SET embedding = ?2 WHERE id = ?1",
                params![id, raw],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn memory_by_id(&self, id: &str) -> StoreResult<MemoryRecord> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM analysis_memories WHERE id = ?1", MEMORY_COLUMNS),
                params![id],
                map_memory,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    pub fn memories_for_file(&self, file_id: &str) -> StoreResult<Vec<MemoryRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM analysis_memories WHERE file_id = ?1
                 ORDER BY created_at DESC, id DESC",
                MEMORY_COLUMNS
            ))?;
            let memories = stmt
                .query_map(params![file_id], map_memory)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(memories)
        })
    }

    pub fn latest_memory_for_file(&self, file_id: &str) -> StoreResult<MemoryRecord> {
        self.memories_for_file(file_id)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    /// Every memory that carries an embedding, for similarity ranking over
    /// the owner's past incidents.
    pub fn memories_with_embeddings(&self, user_id: &str) -> StoreResult<Vec<MemoryRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM analysis_memories m
                 WHERE m.embedding IS NOT NULL
                   AND m.file_id IN (SELECT id FROM log_files WHERE user_id = ?1)
                 ORDER BY m.created_at DESC",
                MEMORY_COLUMNS
                    .split(", ")
                    .map(|c| format!("m.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))?;
            let memories = stmt
                .query_map(params![user_id], map_memory)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(memories)
        })
    }
}
