//! Learning service: similar-incident retrieval over stored summary
//! embeddings and feedback-adjusted pattern matching.

use std::sync::Arc;
use std::time::Duration;

use pipeline::model::CanonicalEntry;
use pipeline::patterns::PatternCatalog;
use pipeline::rules::ParsingRule;
use regex::Regex;
use serde::Serialize;

use crate::db::memories::MemoryRecord;
use crate::db::Database;
use crate::llm::{CallContext, LlmGateway};
use crate::services::feedback::FeedbackService;

/// Memories below this cosine similarity are not considered related.
pub const SIMILARITY_THRESHOLD: f64 = 0.75;
/// How many related incidents feed the prompt.
pub const SIMILAR_TOP_K: usize = 5;
/// Confidence assigned to user-defined patterns before feedback adjustment.
const USER_PATTERN_BASE_CONFIDENCE: f64 = 0.5;

const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the owner's model calls go.
#[derive(Debug, Clone)]
pub struct LlmTarget {
    pub endpoint: String,
    pub model: String,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustedPatternMatch {
    pub pattern: String,
    pub base_confidence: f64,
    pub adjusted_confidence: f64,
    pub relevance: f64,
    pub matches: usize,
}

/// Everything the orchestrator gathers before prompting.
#[derive(Debug, Clone, Serialize)]
pub struct Insights {
    pub similar_incidents: Vec<MemoryRecord>,
    pub pattern_matches: Vec<AdjustedPatternMatch>,
    pub heuristic_hypotheses: Vec<String>,
}

pub struct LearningService {
    db: Database,
    gateway: Arc<LlmGateway>,
    feedback: FeedbackService,
    catalog: PatternCatalog,
}

impl LearningService {
    pub fn new(db: Database, gateway: Arc<LlmGateway>, feedback: FeedbackService) -> Self {
        Self {
            db,
            gateway,
            feedback,
            catalog: PatternCatalog::new(),
        }
    }

    /// Rank stored memories by cosine similarity between an embedding of
    /// the incoming error set's summary and their stored summary
    /// embeddings. Embedding failures degrade to an empty result.
    pub async fn similar_incidents(
        &self,
        user_id: &str,
        target: &LlmTarget,
        error_entries: &[&CanonicalEntry],
        ctx: &CallContext,
    ) -> Vec<MemoryRecord> {
        if error_entries.is_empty() {
            return Vec::new();
        }

        let summary = error_set_summary(error_entries);
        let query = match self
            .gateway
            .embed(&target.endpoint, &target.embedding_model, &summary, EMBED_TIMEOUT, ctx)
            .await
        {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(error = %e, "similarity embedding failed; skipping recall");
                return Vec::new();
            }
        };

        let candidates = match self.db.memories_with_embeddings(user_id) {
            Ok(memories) => memories,
            Err(e) => {
                tracing::warn!(error = %e, "memory lookup failed; skipping recall");
                return Vec::new();
            }
        };

        let mut scored: Vec<(f64, MemoryRecord)> = candidates
            .into_iter()
            .filter_map(|memory| {
                let embedding = memory.embedding.as_deref()?;
                let score = cosine_similarity(&query, embedding);
                (score >= SIMILARITY_THRESHOLD).then_some((score, memory))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(SIMILAR_TOP_K)
            .map(|(_, memory)| memory)
            .collect()
    }

    /// Built-in catalog plus the user's own extract patterns, confidences
    /// adjusted by accumulated feedback.
    pub fn pattern_matches(
        &self,
        error_entries: &[&CanonicalEntry],
        user_rules: &[ParsingRule],
    ) -> Vec<AdjustedPatternMatch> {
        let mut out: Vec<AdjustedPatternMatch> = self
            .catalog
            .match_entries(error_entries)
            .into_iter()
            .map(|m| AdjustedPatternMatch {
                adjusted_confidence: self.feedback.adjust_confidence(&m.pattern, m.base_confidence),
                pattern: m.pattern,
                base_confidence: m.base_confidence,
                relevance: m.relevance,
                matches: m.matches,
            })
            .collect();

        if error_entries.is_empty() {
            return out;
        }

        for rule in user_rules.iter().filter(|r| r.active) {
            for pattern in &rule.extract_patterns {
                let Ok(regex) = Regex::new(&pattern.pattern) else {
                    continue;
                };
                let hits = error_entries
                    .iter()
                    .filter(|e| regex.is_match(&e.message))
                    .count();
                if hits == 0 {
                    continue;
                }
                out.push(AdjustedPatternMatch {
                    adjusted_confidence: self
                        .feedback
                        .adjust_confidence(&pattern.name, USER_PATTERN_BASE_CONFIDENCE),
                    pattern: pattern.name.clone(),
                    base_confidence: USER_PATTERN_BASE_CONFIDENCE,
                    relevance: hits as f64 / error_entries.len() as f64,
                    matches: hits,
                });
            }
        }

        out.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    pub async fn insights(
        &self,
        user_id: &str,
        target: &LlmTarget,
        error_entries: &[&CanonicalEntry],
        user_rules: &[ParsingRule],
        ctx: &CallContext,
    ) -> Insights {
        let similar_incidents = self
            .similar_incidents(user_id, target, error_entries, ctx)
            .await;
        let pattern_matches = self.pattern_matches(error_entries, user_rules);
        let heuristic_hypotheses = self.catalog.hypotheses(error_entries, 3);

        Insights {
            similar_incidents,
            pattern_matches,
            heuristic_hypotheses,
        }
    }
}

/// Short deterministic digest of the error set for embedding.
fn error_set_summary(error_entries: &[&CanonicalEntry]) -> String {
    let mut out = String::new();
    for entry in error_entries.iter().take(50) {
        out.push_str(entry.level.as_str());
        out.push(' ');
        out.push_str(&entry.message);
        out.push('\n');
        if out.len() > 4000 {
            break;
        }
    }
    out
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::feedback::{FeedbackType, NewFeedback};
    use crate::llm::fake::FakeLlm;
    use crate::llm::CallRecorder;
    use chrono::{TimeZone, Utc};
    use pipeline::model::LogLevel;
    use pipeline::prompt::FinalAnalysis;
    use std::collections::BTreeMap;

    fn entry(message: &str) -> CanonicalEntry {
        CanonicalEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
            level: LogLevel::Error,
            message: message.to_string(),
            metadata: BTreeMap::new(),
            line_index: 0,
        }
    }

    fn target() -> LlmTarget {
        LlmTarget {
            endpoint: "http://fake/api".to_string(),
            model: "llama3.1".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
        }
    }

    fn service(fake: Arc<FakeLlm>) -> (LearningService, Database) {
        let db = Database::open_in_memory().unwrap();
        let gateway = Arc::new(LlmGateway::new(
            fake,
            Arc::new(CallRecorder::new(10)),
            Duration::from_secs(5),
        ));
        let feedback = FeedbackService::new(db.clone());
        (LearningService::new(db.clone(), gateway, feedback), db)
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_similar_incidents_threshold_and_ranking() {
        let fake = Arc::new(FakeLlm::new());
        fake.set_embedding(vec![1.0, 0.0, 0.0]);
        let (svc, db) = service(fake);

        let file = db.insert_file("user-1", "a.log", 1, "/tmp/a").unwrap();
        // Aligned embedding: similarity 1.0
        let near = db
            .insert_memory(&file.id, &FinalAnalysis::no_errors(1), Some(&[1.0, 0.0, 0.0]))
            .unwrap();
        // Orthogonal embedding: similarity 0.0, below threshold
        db.insert_memory(&file.id, &FinalAnalysis::no_errors(1), Some(&[0.0, 1.0, 0.0]))
            .unwrap();

        let entries = [entry("db timeout")];
        let refs: Vec<&CanonicalEntry> = entries.iter().collect();
        let similar = svc
            .similar_incidents("user-1", &target(), &refs, &CallContext::default())
            .await;
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].id, near.id);
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_gracefully() {
        let fake = Arc::new(FakeLlm::new());
        fake.fail_embeddings(true);
        let (svc, _db) = service(fake);

        let entries = [entry("db timeout")];
        let refs: Vec<&CanonicalEntry> = entries.iter().collect();
        let similar = svc
            .similar_incidents("user-1", &target(), &refs, &CallContext::default())
            .await;
        assert!(similar.is_empty());
    }

    #[tokio::test]
    async fn test_no_errors_no_embedding_call() {
        let fake = Arc::new(FakeLlm::new());
        let (svc, _db) = service(fake.clone());
        let similar = svc
            .similar_incidents("user-1", &target(), &[], &CallContext::default())
            .await;
        assert!(similar.is_empty());
        assert_eq!(fake.embed_calls(), 0);
    }

    #[test]
    fn test_pattern_matches_adjusted_by_feedback() {
        let fake = Arc::new(FakeLlm::new());
        let (svc, db) = service(fake);

        // Negative feedback on 'timeout' drags its confidence down
        for i in 0..4 {
            db.insert_feedback(&NewFeedback {
                memory_id: &format!("m{}", i),
                user_id: Some("user-1"),
                is_correct: false,
                correction: Some("not a timeout"),
                feedback_type: FeedbackType::Correction,
                pattern_name: Some("timeout"),
                root_cause_section: None,
                confidence_impact: -0.05,
            })
            .unwrap();
        }

        let entries = [entry("request timed out after 30s")];
        let refs: Vec<&CanonicalEntry> = entries.iter().collect();
        let matches = svc.pattern_matches(&refs, &[]);
        let timeout = matches.iter().find(|m| m.pattern == "timeout").unwrap();
        assert!((timeout.base_confidence - 0.70).abs() < 1e-9);
        assert!((timeout.adjusted_confidence - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_user_rule_patterns_participate() {
        let fake = Arc::new(FakeLlm::new());
        let (svc, _db) = service(fake);

        let rule = ParsingRule {
            name: "payments".to_string(),
            active: true,
            extract_patterns: vec![pipeline::rules::ExtractPattern {
                name: "payment-declined".to_string(),
                pattern: "payment .* declined".to_string(),
                priority: 0,
                description: String::new(),
            }],
            ..Default::default()
        };

        let entries = [entry("payment card declined by issuer")];
        let refs: Vec<&CanonicalEntry> = entries.iter().collect();
        let matches = svc.pattern_matches(&refs, &[rule]);
        let user = matches.iter().find(|m| m.pattern == "payment-declined").unwrap();
        assert!((user.base_confidence - 0.5).abs() < 1e-9);
        assert_eq!(user.matches, 1);
    }

    #[tokio::test]
    async fn test_insights_bundle() {
        let fake = Arc::new(FakeLlm::new());
        let (svc, _db) = service(fake);
        let entries = [entry("deadlock detected"), entry("lock wait timeout exceeded")];
        let refs: Vec<&CanonicalEntry> = entries.iter().collect();
        let insights = svc
            .insights("user-1", &target(), &refs, &[], &CallContext::default())
            .await;
        assert!(!insights.pattern_matches.is_empty());
        assert!(!insights.heuristic_hypotheses.is_empty());
        assert!(insights.similar_incidents.is_empty());
    }
}
