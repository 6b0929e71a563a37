//! Parse worker: read a stored upload, run the parsing pipeline, persist
//! entries and counts.

use std::sync::Arc;

use pipeline::parser::{LogPipeline, ParseOptions};
use pipeline::rules::CompiledRule;
use pipeline::ParseError;

use crate::db::{Database, FileStatus};

#[derive(Clone)]
pub struct IngestContext {
    pub db: Database,
    pub pipeline: Arc<LogPipeline>,
}

/// Drive one file from `pending` through parsing to `completed`/`failed`.
/// Parsing itself runs on a blocking thread; the async side only touches
/// the database.
pub async fn run_parse_job(ctx: &IngestContext, file_id: &str) {
    let file = match ctx.db.file_by_id(file_id) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(file_id, error = %e, "parse job for unknown file");
            return;
        }
    };

    if let Err(e) = ctx.db.set_file_status(file_id, FileStatus::Processing) {
        tracing::error!(file_id, error = %e, "could not mark file processing");
        return;
    }

    let Some(stored_path) = file.stored_path.clone() else {
        let _ = ctx.db.mark_file_failed(file_id, "uploaded content is missing");
        return;
    };

    let raw = match tokio::fs::read_to_string(&stored_path).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(file_id, error = %e, "failed to read upload");
            let _ = ctx
                .db
                .mark_file_failed(file_id, &format!("could not read upload: {}", e));
            return;
        }
    };

    // A bad user rule must not block ingestion; parse without rules instead.
    let rules = match ctx.db.active_rules_for_user(&file.user_id) {
        Ok(rules) => match CompiledRule::compile_all(&rules) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                tracing::warn!(file_id, error = %e, "active rule failed to compile; ignoring rules");
                None
            }
        },
        Err(e) => {
            tracing::warn!(file_id, error = %e, "rule lookup failed; parsing without rules");
            None
        }
    };

    let pipeline = ctx.pipeline.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        pipeline.parse_str(&raw, rules.as_ref(), &ParseOptions::default())
    })
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(file_id, error = %e, "parse task panicked");
            let _ = ctx.db.mark_file_failed(file_id, "internal parsing failure");
            return;
        }
    };

    match outcome {
        Ok(parsed) => {
            if let Err(e) = ctx.db.insert_entries(file_id, &parsed.entries) {
                tracing::error!(file_id, error = %e, "entry insert failed");
                let _ = ctx.db.mark_file_failed(file_id, "could not persist entries");
                return;
            }
            if let Err(e) = ctx
                .db
                .finish_parse(file_id, &parsed.stats, &parsed.rca, &parsed.line_errors)
            {
                tracing::error!(file_id, error = %e, "final status update failed");
                return;
            }
            tracing::info!(
                file_id,
                entries = parsed.stats.entry_count,
                errors = parsed.stats.error_count,
                mode = parsed.mode.as_str(),
                "file parsed"
            );
        }
        Err(ParseError::NoEntries) => {
            let _ = ctx
                .db
                .mark_file_failed(file_id, "no log entries could be produced");
        }
        Err(ParseError::Io(e)) => {
            let _ = ctx
                .db
                .mark_file_failed(file_id, &format!("I/O error while parsing: {}", e));
        }
    }
}
