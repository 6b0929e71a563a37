use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::{now_str, parse_ts, Database, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Confirmation,
    Correction,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Confirmation => "confirmation",
            FeedbackType::Correction => "correction",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "correction" {
            FeedbackType::Correction
        } else {
            FeedbackType::Confirmation
        }
    }
}

/// A user's review of one analysis memory. Never deleted while its memory
/// exists; survives job deletion through the weak memory reference.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub memory_id: String,
    pub user_id: Option<String>,
    pub is_correct: bool,
    pub correction: Option<String>,
    pub feedback_type: FeedbackType,
    pub pattern_name: Option<String>,
    pub root_cause_section: Option<String>,
    pub confidence_impact: f64,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

const FEEDBACK_COLUMNS: &str = "id, memory_id, user_id, is_correct, correction, feedback_type, \
                                pattern_name, root_cause_section, confidence_impact, processed, \
                                created_at";

fn map_feedback(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedbackRecord> {
    let feedback_type: String = row.get(5)?;
    Ok(FeedbackRecord {
        id: row.get(0)?,
        memory_id: row.get(1)?,
        user_id: row.get(2)?,
        is_correct: row.get(3)?,
        correction: row.get(4)?,
        feedback_type: FeedbackType::parse(&feedback_type),
        pattern_name: row.get(6)?,
        root_cause_section: row.get(7)?,
        confidence_impact: row.get(8)?,
        processed: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

pub struct NewFeedback<'a> {
    pub memory_id: &'a str,
    pub user_id: Option<&'a str>,
    pub is_correct: bool,
    pub correction: Option<&'a str>,
    pub feedback_type: FeedbackType,
    pub pattern_name: Option<&'a str>,
    pub root_cause_section: Option<&'a str>,
    pub confidence_impact: f64,
}

impl Database {
    /// One feedback row per user per memory; a second submission conflicts.
    pub fn insert_feedback(&self, new: &NewFeedback<'_>) -> StoreResult<FeedbackRecord> {
        let id = Uuid::new_v4().to_string();
        self.with(|conn| {
            if let Some(user_id) = new.user_id {
                let existing: i64 = conn.query_row(
                    "SELECT count(*) FROM feedback WHERE memory_id = ?1 AND user_id = ?2",
                    params![new.memory_id, user_id],
                    |row| row.get(0),
                )?;
                if existing > 0 {
                    return Err(StoreError::Conflict(
                        "feedback for this analysis was already submitted".to_string(),
                    ));
                }
            }
            conn.execute(
                "INSERT INTO feedback (id, memory_id, user_id, is_correct, correction,
                                       feedback_type, pattern_name, root_cause_section,
                                       confidence_impact, processed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
                params![
                    id,
                    new.memory_id,
                    new.user_id,
                    new.is_correct,
                    new.correction,
                    new.feedback_type.as_str(),
                    new.pattern_name,
                    new.root_cause_section,
                    new.confidence_impact,
                    now_str()
                ],
            )?;
            Ok(())
        })?;
        self.feedback_by_id(&id)
    }

    pub fn feedback_by_id(&self, id: &str) -> StoreResult<FeedbackRecord> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM feedback WHERE id = ?1", FEEDBACK_COLUMNS),
                params![id],
                map_feedback,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    /// Indexed lookup by pattern name, newest first.
    pub fn feedback_for_pattern(&self, pattern_name: &str) -> StoreResult<Vec<FeedbackRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM feedback WHERE pattern_name = ?1
                 ORDER BY created_at DESC, id DESC",
                FEEDBACK_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![pattern_name], map_feedback)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn all_feedback(&self) -> StoreResult<Vec<FeedbackRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM feedback ORDER BY created_at DESC, id DESC",
                FEEDBACK_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], map_feedback)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn mark_feedback_processed(&self, ids: &[String]) -> StoreResult<()> {
        self.with_tx(|tx| {
            for id in ids {
                tx.execute("UPDATE feedback SET processed = 1 WHERE id = ?1", params![id])?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_feedback<'a>(memory: &'a str, user: Option<&'a str>, correct: bool) -> NewFeedback<'a> {
        NewFeedback {
            memory_id: memory,
            user_id: user,
            is_correct: correct,
            correction: if correct { None } else { Some("actually a DNS failure") },
            feedback_type: if correct {
                FeedbackType::Confirmation
            } else {
                FeedbackType::Correction
            },
            pattern_name: Some("timeout"),
            root_cause_section: None,
            confidence_impact: if correct { 0.05 } else { -0.05 },
        }
    }

    #[test]
    fn test_insert_and_lookup_by_pattern() {
        let db = Database::open_in_memory().unwrap();
        db.insert_feedback(&new_feedback("mem-1", Some("user-1"), true)).unwrap();
        db.insert_feedback(&new_feedback("mem-2", Some("user-1"), false)).unwrap();

        let rows = db.feedback_for_pattern("timeout").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(db.feedback_for_pattern("deadlock").unwrap().is_empty());
    }

    #[test]
    fn test_one_per_user_per_memory() {
        let db = Database::open_in_memory().unwrap();
        db.insert_feedback(&new_feedback("mem-1", Some("user-1"), true)).unwrap();
        let err = db
            .insert_feedback(&new_feedback("mem-1", Some("user-1"), false))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A different user may still review the same memory
        db.insert_feedback(&new_feedback("mem-1", Some("user-2"), false)).unwrap();
    }

    #[test]
    fn test_derived_fields_persisted() {
        let db = Database::open_in_memory().unwrap();
        let record = db
            .insert_feedback(&new_feedback("mem-1", Some("user-1"), false))
            .unwrap();
        assert_eq!(record.feedback_type, FeedbackType::Correction);
        assert_eq!(record.pattern_name.as_deref(), Some("timeout"));
        assert!((record.confidence_impact + 0.05).abs() < f64::EPSILON);
        assert!(!record.processed);
    }

    #[test]
    fn test_mark_processed() {
        let db = Database::open_in_memory().unwrap();
        let record = db
            .insert_feedback(&new_feedback("mem-1", Some("user-1"), true))
            .unwrap();
        db.mark_feedback_processed(&[record.id.clone()]).unwrap();
        assert!(db.feedback_by_id(&record.id).unwrap().processed);
    }
}
