//! The analysis orchestrator: runs one persisted job end-to-end through
//! preflight, context gathering, the chunked map phase, the reduce phase,
//! and memory persistence. Every state change is written before further
//! work, so progress survives a crash and terminal states stay sticky.

use std::sync::Arc;
use std::time::Duration;

use pipeline::chunker::{self, Chunk, ChunkOptions};
use pipeline::model::CanonicalEntry;
use pipeline::prompt::{
    chunk_prompt, parse_llm_json, reduce_prompt, ChunkAnalysis, FinalAnalysis,
};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::jobs::JobRecord;
use crate::db::{Database, JobStatus};
use crate::llm::{CallContext, CallType, LlmGateway};
use crate::services::learning::{LearningService, LlmTarget};
use crate::services::FeedbackService;

const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RcaContext {
    pub db: Database,
    pub gateway: Arc<LlmGateway>,
    pub learning: Arc<LearningService>,
    pub feedback: FeedbackService,
    pub config: Arc<AppConfig>,
}

/// Entry point used by the worker pool. All failure paths are recorded on
/// the job row; this function never returns an error to the pool.
pub async fn run_rca_job(ctx: &RcaContext, job_id: &str, cancel: CancellationToken) {
    let job = match ctx.db.job_by_id(job_id) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job_id, error = %e, "dispatched job not found");
            return;
        }
    };

    if job.status != JobStatus::Pending {
        // Cancelled while queued, or a stale dispatch; nothing to do
        tracing::debug!(job_id, status = job.status.as_str(), "skipping non-pending job");
        return;
    }

    if ctx.db.mark_job_running(job_id).is_err() {
        return;
    }

    if let Err(reason) = execute(ctx, &job, &cancel).await {
        match reason {
            Outcome::Failed { message, failed_chunk } => {
                tracing::warn!(job_id, %message, ?failed_chunk, "analysis job failed");
                let _ = ctx.db.mark_job_failed(job_id, &message, failed_chunk);
            }
            Outcome::Cancelled => {
                tracing::info!(job_id, "analysis job cancelled");
                let _ = ctx.db.mark_job_cancelled(job_id);
            }
        }
    }
}

enum Outcome {
    Failed {
        message: String,
        failed_chunk: Option<i64>,
    },
    Cancelled,
}

fn failed(message: impl Into<String>) -> Outcome {
    Outcome::Failed {
        message: message.into(),
        failed_chunk: None,
    }
}

async fn execute(
    ctx: &RcaContext,
    job: &JobRecord,
    cancel: &CancellationToken,
) -> Result<(), Outcome> {
    let job_id = job.id.as_str();
    let file = ctx
        .db
        .file_by_id(&job.file_id)
        .map_err(|_| failed("log file no longer exists"))?;
    let user = ctx
        .db
        .user_by_id(&file.user_id)
        .map_err(|_| failed("file owner no longer exists"))?;

    let endpoint = user
        .llm_endpoint
        .clone()
        .or_else(|| ctx.config.llm.default_endpoint.clone())
        .ok_or_else(|| failed("no LLM endpoint configured for this account"))?;
    let target = LlmTarget {
        endpoint,
        model: user
            .llm_model
            .clone()
            .unwrap_or_else(|| ctx.config.llm.default_model.clone()),
        embedding_model: user
            .embedding_model
            .clone()
            .unwrap_or_else(|| ctx.config.llm.default_embedding_model.clone()),
    };
    let call_ctx = CallContext {
        log_file_id: Some(file.id.clone()),
        job_id: Some(job.id.to_string()),
    };

    let entries = ctx
        .db
        .entries_for_file(&file.id, None)
        .map_err(|e| failed(format!("could not load entries: {}", e)))?;
    let error_entries: Vec<&CanonicalEntry> =
        entries.iter().filter(|e| e.level.is_error()).collect();

    // Nothing to analyze: complete immediately with a no-error memory
    if error_entries.is_empty() {
        let analysis = FinalAnalysis::no_errors(entries.len());
        ctx.db
            .insert_memory(&file.id, &analysis, None)
            .map_err(|e| failed(format!("could not persist analysis: {}", e)))?;
        ctx.db
            .mark_job_completed(job_id, &analysis)
            .map_err(|e| failed(format!("could not complete job: {}", e)))?;
        return Ok(());
    }

    // Preflight: a dead endpoint fails the job with an actionable message
    // and is never retried automatically
    if let Err(e) = ctx.gateway.health(&target.endpoint).await {
        return Err(failed(format!(
            "LLM endpoint '{}' is not reachable ({}); verify the endpoint in settings and retry",
            target.endpoint, e
        )));
    }

    // Context gathering
    let user_rules = ctx.db.active_rules_for_user(&file.user_id).unwrap_or_default();
    let insights = ctx
        .learning
        .insights(&file.user_id, &target, &error_entries, &user_rules, &call_ctx)
        .await;
    let pattern_names: Vec<String> = insights
        .pattern_matches
        .iter()
        .map(|m| m.pattern.clone())
        .collect();
    let mut learning_context = ctx
        .feedback
        .feedback_context(&insights.similar_incidents, &pattern_names);
    if !insights.heuristic_hypotheses.is_empty() {
        learning_context.push_str("Heuristic hypotheses from pattern matching:\n");
        for hypothesis in &insights.heuristic_hypotheses {
            learning_context.push_str(&format!("- {}\n", hypothesis));
        }
    }

    // Chunking
    let chunks = build_chunks(&entries, job, ctx.config.llm.chunk_token_budget);
    let total_chunks = chunks.len() as i64;
    ctx.db
        .set_job_total_chunks(job_id, total_chunks)
        .map_err(|e| failed(format!("could not persist chunk count: {}", e)))?;

    let timeout = Duration::from_secs(
        ctx.config
            .clamp_call_timeout(Some(job.timeout_secs.max(0) as u64)),
    );

    // Resume support: completed chunks are never re-run
    let mut partials: Vec<ChunkAnalysis> = job.partials.clone();
    let start_chunk = partials.len().min(chunks.len());
    if start_chunk > 0 {
        tracing::info!(job_id, start_chunk, "resuming from persisted partials");
    }

    // Map phase: sequential per job, cancellation observed at boundaries
    for (i, chunk) in chunks.iter().enumerate().skip(start_chunk) {
        if cancel.is_cancelled() {
            return Err(Outcome::Cancelled);
        }

        let current = (i + 1) as i64;
        let progress = (100 * current) / (total_chunks + 1);
        ctx.db
            .update_job_progress(job_id, current, progress)
            .map_err(|e| failed(format!("could not persist progress: {}", e)))?;

        let prompt = chunk_prompt(chunk, &learning_context);
        let response = ctx
            .gateway
            .generate(
                &target.endpoint,
                &target.model,
                &prompt,
                timeout,
                CallType::RcaAnalysis,
                &call_ctx,
            )
            .await
            .map_err(|e| Outcome::Failed {
                message: format!("chunk {} failed: {}", i + 1, e),
                failed_chunk: Some(i as i64),
            })?;

        let analysis: ChunkAnalysis =
            parse_llm_json(&response).map_err(|e| Outcome::Failed {
                message: format!("chunk {} returned an unusable response: {}", i + 1, e),
                failed_chunk: Some(i as i64),
            })?;

        partials.push(analysis);
        ctx.db
            .save_job_partials(job_id, &partials)
            .map_err(|e| failed(format!("could not persist partials: {}", e)))?;
    }

    if cancel.is_cancelled() {
        return Err(Outcome::Cancelled);
    }

    // Reduce phase
    ctx.db
        .update_job_progress(job_id, total_chunks, 95)
        .map_err(|e| failed(format!("could not persist progress: {}", e)))?;

    let response = ctx
        .gateway
        .generate(
            &target.endpoint,
            &target.model,
            &reduce_prompt(&partials),
            timeout,
            CallType::RcaAggregation,
            &call_ctx,
        )
        .await
        .map_err(|e| failed(format!("aggregation failed: {}", e)))?;

    let mut analysis: FinalAnalysis = parse_llm_json(&response)
        .map_err(|e| failed(format!("aggregation returned an unusable response: {}", e)))?;

    // The model sometimes leaves the counters empty; fill them from what
    // we actually parsed
    if analysis.critical_errors == 0 && analysis.non_critical_errors == 0 {
        let fatal = error_entries
            .iter()
            .filter(|e| e.level == pipeline::model::LogLevel::Fatal)
            .count() as u32;
        analysis.critical_errors = fatal;
        analysis.non_critical_errors = error_entries.len() as u32 - fatal;
    }

    // Persist the memory, embed its summary, complete the job
    let memory = ctx
        .db
        .insert_memory(&file.id, &analysis, None)
        .map_err(|e| failed(format!("could not persist analysis: {}", e)))?;

    match ctx
        .gateway
        .embed(
            &target.endpoint,
            &target.embedding_model,
            &analysis.summary,
            EMBED_TIMEOUT,
            &call_ctx,
        )
        .await
    {
        Ok(vector) => {
            if let Err(e) = ctx.db.set_memory_embedding(&memory.id, &vector) {
                tracing::warn!(job_id, error = %e, "embedding not persisted");
            }
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "summary embedding failed; recall will skip this memory");
        }
    }

    ctx.db
        .mark_job_completed(job_id, &analysis)
        .map_err(|e| failed(format!("could not complete job: {}", e)))?;
    Ok(())
}

/// With chunking disabled the whole error set forms one batch.
fn build_chunks(entries: &[CanonicalEntry], job: &JobRecord, token_budget: usize) -> Vec<Chunk> {
    let opts = if job.chunking {
        ChunkOptions {
            token_budget,
            ..Default::default()
        }
    } else {
        ChunkOptions {
            token_budget: usize::MAX / 2,
            ..Default::default()
        }
    };
    chunker::split(entries, &opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FileStatus, JobStatus};
    use crate::llm::fake::{FakeLlm, FakeOutcome};
    use crate::llm::CallRecorder;
    use chrono::{TimeZone, Utc};
    use pipeline::model::LogLevel;
    use std::collections::BTreeMap;

    fn entry(level: LogLevel, message: &str, line_index: usize) -> CanonicalEntry {
        CanonicalEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
            level,
            message: message.to_string(),
            metadata: BTreeMap::new(),
            line_index,
        }
    }

    struct Harness {
        ctx: RcaContext,
        fake: Arc<FakeLlm>,
    }

    fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let fake = Arc::new(FakeLlm::new());
        let gateway = Arc::new(LlmGateway::new(
            fake.clone(),
            Arc::new(CallRecorder::new(100)),
            Duration::from_secs(5),
        ));
        let feedback = FeedbackService::new(db.clone());
        let learning = Arc::new(LearningService::new(
            db.clone(),
            gateway.clone(),
            feedback.clone(),
        ));
        Harness {
            ctx: RcaContext {
                db,
                gateway,
                learning,
                feedback,
                config: Arc::new(AppConfig::default()),
            },
            fake,
        }
    }

    fn seed_job(ctx: &RcaContext, entries: &[CanonicalEntry]) -> (String, String) {
        let user = ctx.ctx_user();
        let file = ctx.db.insert_file(&user, "app.log", 10, "/tmp/a").unwrap();
        ctx.db.set_file_status(&file.id, FileStatus::Completed).unwrap();
        ctx.db.insert_entries(&file.id, entries).unwrap();
        let job = ctx.db.create_rca_job(&file.id, 300, true).unwrap();
        (file.id, job.id)
    }

    impl RcaContext {
        fn ctx_user(&self) -> String {
            let user = self.db.create_user("owner", "hash", "salt").unwrap();
            self.db
                .update_llm_settings(
                    &user.id,
                    Some("http://fake/api"),
                    Some("llama3.1"),
                    Some("nomic-embed-text"),
                )
                .unwrap();
            user.id
        }
    }

    fn chunk_response(summary: &str) -> String {
        format!(
            r#"{{"summary":"{}","root_cause":"pool exhaustion","severity":"high",
                "patterns":[{{"pattern":"timeout","occurrences":2,"analysis":"queued"}}],
                "recommendations":["raise pool size"]}}"#,
            summary
        )
    }

    fn final_response() -> String {
        r#"{"summary":"db pool exhausted","root_cause":"connection pool too small",
            "severity":"high","recommendations":["raise pool size"],
            "error_analysis":[{"pattern":"timeout","occurrences":2,"analysis":"x"}],
            "critical_errors":1,"non_critical_errors":1}"#
            .to_string()
    }

    #[tokio::test]
    async fn test_happy_path_completes_job() {
        let h = harness();
        let entries = vec![
            entry(LogLevel::Info, "starting", 0),
            entry(LogLevel::Error, "db timeout", 1),
            entry(LogLevel::Fatal, "giving up", 2),
        ];
        let (file_id, job_id) = seed_job(&h.ctx, &entries);

        h.fake.push_generate(FakeOutcome::Ok(chunk_response("batch one")));
        h.fake.push_generate(FakeOutcome::Ok(final_response()));

        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());

        let file = h.ctx.db.file_by_id(&file_id).unwrap();
        assert_eq!(file.rca_status, crate::db::RcaStatus::Completed);

        let memory = h.ctx.db.latest_memory_for_file(&file_id).unwrap();
        assert_eq!(memory.summary, "db pool exhausted");
        // The summary embedding was attached
        assert!(memory.embedding.is_some());
    }

    #[tokio::test]
    async fn test_no_errors_completes_immediately() {
        let h = harness();
        let entries: Vec<CanonicalEntry> = (0..10)
            .map(|i| entry(LogLevel::Info, &format!("fine {}", i), i))
            .collect();
        let (file_id, job_id) = seed_job(&h.ctx, &entries);

        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // No model calls at all
        assert_eq!(h.fake.generate_calls(), 0);

        let memory = h.ctx.db.latest_memory_for_file(&file_id).unwrap();
        assert_eq!(memory.severity, pipeline::prompt::Severity::Low);
        assert_eq!(memory.critical_errors, 0);
        assert!(memory.summary.contains("no error"));
    }

    #[tokio::test]
    async fn test_preflight_failure_fails_job_without_generate() {
        let h = harness();
        let entries = vec![entry(LogLevel::Error, "boom", 0)];
        let (_file_id, job_id) = seed_job(&h.ctx, &entries);

        h.fake.set_healthy(false);
        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("not reachable"));
        assert_eq!(h.fake.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_chunk_failure_records_failed_chunk() {
        let h = harness();
        let entries = vec![entry(LogLevel::Error, "boom", 0)];
        let (_file_id, job_id) = seed_job(&h.ctx, &entries);

        h.fake.push_generate(FakeOutcome::Timeout);
        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_chunk, Some(0));
        assert!(job.error_message.unwrap().contains("chunk 1 failed"));
    }

    #[tokio::test]
    async fn test_malformed_response_fails_after_repair() {
        let h = harness();
        let entries = vec![entry(LogLevel::Error, "boom", 0)];
        let (_file_id, job_id) = seed_job(&h.ctx, &entries);

        h.fake
            .push_generate(FakeOutcome::Ok("not json at all, sorry".to_string()));
        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("unusable response"));
    }

    #[tokio::test]
    async fn test_repairable_response_survives() {
        let h = harness();
        let entries = vec![entry(LogLevel::Error, "boom", 0)];
        let (_file_id, job_id) = seed_job(&h.ctx, &entries);

        // Trailing brace missing: the single repair pass closes it
        h.fake.push_generate(FakeOutcome::Ok(
            r#"{"summary":"fixed","severity":"low""#.to_string(),
        ));
        h.fake.push_generate(FakeOutcome::Ok(final_response()));
        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancellation_at_chunk_boundary() {
        let h = harness();
        let entries = vec![entry(LogLevel::Error, "boom", 0)];
        let (file_id, job_id) = seed_job(&h.ctx, &entries);

        let cancel = CancellationToken::new();
        cancel.cancel();
        run_rca_job(&h.ctx, &job_id, cancel).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(h.fake.generate_calls(), 0);

        let file = h.ctx.db.file_by_id(&file_id).unwrap();
        assert_eq!(file.rca_status, crate::db::RcaStatus::None);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_chunks() {
        let h = harness();
        // Two errors far apart in token cost would normally share a chunk;
        // shrink the budget via config instead
        let mut config = AppConfig::default();
        config.llm.chunk_token_budget = 500;
        let mut h = h;
        h.ctx.config = Arc::new(config);

        let big = "x".repeat(4000);
        let entries = vec![
            entry(LogLevel::Error, &big, 0),
            entry(LogLevel::Error, &big, 1),
        ];
        let (_file_id, job_id) = seed_job(&h.ctx, &entries);

        // First run: chunk 1 succeeds, chunk 2 times out
        h.fake.push_generate(FakeOutcome::Ok(chunk_response("first")));
        h.fake.push_generate(FakeOutcome::Timeout);
        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_chunk, Some(1));
        assert_eq!(job.partials.len(), 1);
        let calls_after_first_run = h.fake.generate_calls();

        // Retry: only the failed chunk and the reduce call run
        h.ctx.db.mark_job_retrying(&job_id).unwrap();
        h.fake.push_generate(FakeOutcome::Ok(chunk_response("second")));
        h.fake.push_generate(FakeOutcome::Ok(final_response()));
        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.fake.generate_calls() - calls_after_first_run, 2);
    }

    #[tokio::test]
    async fn test_missing_endpoint_fails_fast() {
        let h = harness();
        let user = h.ctx.db.create_user("plain", "h", "s").unwrap();
        let file = h.ctx.db.insert_file(&user.id, "a.log", 1, "/tmp/a").unwrap();
        h.ctx.db.set_file_status(&file.id, FileStatus::Completed).unwrap();
        h.ctx
            .db
            .insert_entries(&file.id, &[entry(LogLevel::Error, "boom", 0)])
            .unwrap();
        let job = h.ctx.db.create_rca_job(&file.id, 300, true).unwrap();

        run_rca_job(&h.ctx, &job.id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("no LLM endpoint"));
    }

    #[tokio::test]
    async fn test_terminal_job_not_rerun() {
        let h = harness();
        let entries = vec![entry(LogLevel::Error, "boom", 0)];
        let (_file_id, job_id) = seed_job(&h.ctx, &entries);
        h.ctx.db.mark_job_cancelled(&job_id).unwrap();

        run_rca_job(&h.ctx, &job_id, CancellationToken::new()).await;

        let job = h.ctx.db.job_by_id(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(h.fake.generate_calls(), 0);
    }
}
