//! Feedback aggregation: pattern-level scoring from user corrections and
//! the deterministic prompt fragment fed back into analysis.

use chrono::{DateTime, Utc};
use pipeline::patterns::PatternCatalog;
use serde::Serialize;

use crate::db::feedback::{FeedbackRecord, FeedbackType};
use crate::db::memories::MemoryRecord;
use crate::db::{Database, StoreResult};

/// A confirmation or correction nudges pattern confidence by this much.
pub const CONFIDENCE_IMPACT: f64 = 0.05;

/// Confidence adjustment slope; caps the total swing at ±0.15.
const ADJUST_FACTOR: f64 = 0.3;

#[derive(Debug, Clone, Serialize)]
pub struct PatternInsight {
    pub pattern_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    pub positive: usize,
    pub negative: usize,
    pub corrections: Vec<String>,
    pub confidence_score: f64,
    pub last_updated: DateTime<Utc>,
}

/// Fields derived from a submitted review before it is persisted.
#[derive(Debug, Clone)]
pub struct DerivedFeedback {
    pub feedback_type: FeedbackType,
    pub pattern_name: Option<String>,
    pub root_cause_section: Option<String>,
    pub confidence_impact: f64,
}

#[derive(Clone)]
pub struct FeedbackService {
    db: Database,
}

impl FeedbackService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Indexed lookup of reviews touching one pattern.
    pub fn feedback_for(&self, pattern_name: &str) -> StoreResult<Vec<FeedbackRecord>> {
        self.db.feedback_for_pattern(pattern_name)
    }

    /// Recompute per-pattern aggregates on demand, ordered by pattern name
    /// for determinism.
    pub fn aggregate_insights(&self) -> StoreResult<Vec<PatternInsight>> {
        let all = self.db.all_feedback()?;

        let mut by_pattern: std::collections::BTreeMap<String, Vec<&FeedbackRecord>> =
            std::collections::BTreeMap::new();
        for record in &all {
            let Some(name) = record.pattern_name.as_deref() else {
                continue;
            };
            by_pattern.entry(name.to_string()).or_default().push(record);
        }

        let mut insights = Vec::with_capacity(by_pattern.len());
        for (pattern_name, records) in by_pattern {
            let positive = records.iter().filter(|r| r.is_correct).count();
            let negative = records.len() - positive;
            let corrections: Vec<String> = records
                .iter()
                .filter_map(|r| r.correction.clone())
                .take(3)
                .collect();
            let root_cause = records
                .iter()
                .find_map(|r| r.root_cause_section.clone());
            let last_updated = records
                .iter()
                .map(|r| r.created_at)
                .max()
                .unwrap_or_else(Utc::now);

            insights.push(PatternInsight {
                confidence_score: adjust(0.5, positive, negative),
                pattern_name,
                root_cause,
                positive,
                negative,
                corrections,
                last_updated,
            });
        }
        Ok(insights)
    }

    /// Nudge a base confidence by the pattern's feedback ratio. The swing
    /// is bounded to ±0.15 and the result clamped into [0, 1]. Lookup
    /// failures leave the base untouched.
    pub fn adjust_confidence(&self, pattern_name: &str, base_confidence: f64) -> f64 {
        match self.db.feedback_for_pattern(pattern_name) {
            Ok(records) => {
                let positive = records.iter().filter(|r| r.is_correct).count();
                let negative = records.len() - positive;
                adjust(base_confidence, positive, negative)
            }
            Err(e) => {
                tracing::warn!(pattern = pattern_name, error = %e, "feedback lookup failed");
                base_confidence
            }
        }
    }

    /// Deterministic prompt fragment: aggregate counts, recent
    /// corrections, and explicit warnings for net-negative patterns.
    pub fn feedback_context(
        &self,
        similar_incidents: &[MemoryRecord],
        pattern_names: &[String],
    ) -> String {
        let mut out = String::new();

        let mut pattern_lines = Vec::new();
        for name in pattern_names {
            let records = match self.db.feedback_for_pattern(name) {
                Ok(records) if !records.is_empty() => records,
                _ => continue,
            };
            let positive = records.iter().filter(|r| r.is_correct).count();
            let negative = records.len() - positive;
            let mut line = format!(
                "- pattern '{}': {} confirmed, {} corrected (confidence {:.2})",
                name,
                positive,
                negative,
                adjust(0.5, positive, negative)
            );
            for correction in records.iter().filter_map(|r| r.correction.as_deref()).take(3) {
                line.push_str(&format!("\n  correction: {}", correction));
            }
            if negative > positive {
                line.push_str(&format!(
                    "\n  WARNING: '{}' has more negative than positive feedback; \
                     weigh this pattern cautiously",
                    name
                ));
            }
            pattern_lines.push(line);
        }

        if !pattern_lines.is_empty() {
            out.push_str("Prior user feedback on detected patterns:\n");
            out.push_str(&pattern_lines.join("\n"));
            out.push('\n');
        }

        if !similar_incidents.is_empty() {
            out.push_str("Similar past incidents:\n");
            for memory in similar_incidents {
                out.push_str(&format!(
                    "- [{} severity] {}\n",
                    memory.severity.as_str(),
                    memory.summary
                ));
            }
        }

        out
    }

    /// Derive the stored classification fields from a submitted review.
    /// A correction naming a catalog pattern is attributed to it;
    /// otherwise the memory's strongest analyzed pattern is used.
    pub fn derive(
        memory: &MemoryRecord,
        is_correct: bool,
        correction: Option<&str>,
    ) -> DerivedFeedback {
        let feedback_type = if is_correct {
            FeedbackType::Confirmation
        } else {
            FeedbackType::Correction
        };

        let named_in_correction = correction.and_then(|text| {
            let lower = text.to_ascii_lowercase();
            PatternCatalog::names()
                .into_iter()
                .find(|name| lower.contains(*name))
                .map(|name| name.to_string())
        });
        let pattern_name = named_in_correction.or_else(|| {
            memory
                .error_analysis
                .first()
                .map(|analysis| analysis.pattern.clone())
        });

        let root_cause_section = if memory.root_cause.is_empty() {
            None
        } else {
            Some(memory.root_cause.clone())
        };

        DerivedFeedback {
            feedback_type,
            pattern_name,
            root_cause_section,
            confidence_impact: if is_correct {
                CONFIDENCE_IMPACT
            } else {
                -CONFIDENCE_IMPACT
            },
        }
    }
}

fn adjust(base: f64, positive: usize, negative: usize) -> f64 {
    let total = positive + negative;
    let ratio = if total == 0 {
        0.5
    } else {
        positive as f64 / total as f64
    };
    (base + (ratio - 0.5) * ADJUST_FACTOR).clamp(0.0, 1.0)
}
