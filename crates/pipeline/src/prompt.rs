//! Analysis prompt construction and the strict-JSON response schema.
//!
//! Every prompt carries four blocks in a stable order: instruction
//! preamble, required JSON schema, enumerated log entries, and the
//! feedback/learning context. The reducer prompt repeats the first two
//! blocks over the map-phase outputs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunker::Chunk;
use crate::model::CanonicalEntry;
use crate::repair::repair;

pub const CHUNK_INSTRUCTION: &str = "You are an experienced site reliability engineer performing \
root cause analysis on application logs. Analyze the error entries below together with their \
surrounding context. Identify what went wrong, be specific, and reference the entries your \
conclusions rest on.";

pub const REDUCE_INSTRUCTION: &str = "You are an experienced site reliability engineer. Below are \
partial analyses produced for consecutive batches of errors from one log file. Merge them into a \
single coherent root cause analysis, preferring conclusions supported by more evidence.";

pub const CHUNK_SCHEMA: &str = r#"{
  "summary": "one-paragraph summary of what these errors show",
  "root_cause": "most likely root cause for this batch",
  "severity": "low|medium|high|critical",
  "patterns": [{"pattern": "name", "occurrences": 0, "analysis": "what this pattern indicates"}],
  "recommendations": ["actionable next step"]
}"#;

pub const FINAL_SCHEMA: &str = r#"{
  "summary": "one-paragraph summary of the incident",
  "root_cause": "single most likely root cause",
  "severity": "low|medium|high|critical",
  "recommendations": ["actionable next step"],
  "error_analysis": [{"pattern": "name", "occurrences": 0, "analysis": "what this pattern indicates"}],
  "critical_errors": 0,
  "non_critical_errors": 0
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Low
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPatternAnalysis {
    pub pattern: String,
    #[serde(default)]
    pub occurrences: u32,
    #[serde(default)]
    pub analysis: String,
}

/// Map-phase output for one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkAnalysis {
    pub summary: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub patterns: Vec<ErrorPatternAnalysis>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Reduce-phase output: the persisted shape of a completed analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnalysis {
    pub summary: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub error_analysis: Vec<ErrorPatternAnalysis>,
    #[serde(default)]
    pub critical_errors: u32,
    #[serde(default)]
    pub non_critical_errors: u32,
}

impl FinalAnalysis {
    /// Analysis recorded when a file has nothing to analyze.
    pub fn no_errors(entry_count: usize) -> Self {
        Self {
            summary: format!(
                "Log file contains no error or fatal entries across {} records; \
                 no root cause analysis required.",
                entry_count
            ),
            root_cause: "no error conditions present".to_string(),
            severity: Severity::Low,
            recommendations: Vec::new(),
            error_analysis: Vec::new(),
            critical_errors: 0,
            non_critical_errors: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
}

/// Block (iii): enumerated entries, one line each, in source order.
pub fn render_entries(entries: &[&CanonicalEntry]) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        out.push_str(&format!(
            "[{}] {} {} {}",
            i,
            entry.timestamp.to_rfc3339(),
            entry.level,
            entry.message
        ));
        if !entry.metadata.is_empty() {
            if let Ok(meta) = serde_json::to_string(&entry.metadata) {
                out.push_str(" // ");
                out.push_str(&meta);
            }
        }
        out.push('\n');
    }
    out
}

fn assemble(instruction: &str, schema: &str, entries_block: &str, context_block: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(instruction);
    prompt.push_str("\n\nRespond with strict JSON matching exactly this schema, no prose outside \
the JSON object:\n");
    prompt.push_str(schema);
    if !entries_block.is_empty() {
        prompt.push_str("\n\nLog entries:\n");
        prompt.push_str(entries_block);
    }
    if !context_block.is_empty() {
        prompt.push_str("\nAnalysis context from prior incidents and user feedback:\n");
        prompt.push_str(context_block);
    }
    prompt
}

/// Map-phase prompt for one chunk. Context entries and error entries are
/// interleaved back into source order.
pub fn chunk_prompt(chunk: &Chunk, learning_context: &str) -> String {
    let mut merged: Vec<&CanonicalEntry> = chunk.errors.iter().chain(chunk.context.iter()).collect();
    merged.sort_by_key(|e| e.line_index);
    assemble(
        CHUNK_INSTRUCTION,
        CHUNK_SCHEMA,
        &render_entries(&merged),
        learning_context,
    )
}

/// Reduce-phase prompt over the map outputs.
pub fn reduce_prompt(partials: &[ChunkAnalysis]) -> String {
    let mut block = String::new();
    for (i, partial) in partials.iter().enumerate() {
        block.push_str(&format!("--- partial analysis {} ---\n", i + 1));
        block.push_str(&serde_json::to_string_pretty(partial).unwrap_or_default());
        block.push('\n');
    }
    let mut prompt = assemble(REDUCE_INSTRUCTION, FINAL_SCHEMA, "", "");
    prompt.push_str("\n\nPartial analyses:\n");
    prompt.push_str(&block);
    prompt
}

/// Parse a model response as strict JSON. Code fences and prose around the
/// JSON object are tolerated; a malformed body gets exactly one repair pass
/// before the call fails.
pub fn parse_llm_json<T: DeserializeOwned>(raw: &str) -> Result<T, PromptError> {
    let body = extract_json_body(raw);
    if let Ok(parsed) = serde_json::from_str::<T>(body) {
        return Ok(parsed);
    }
    let repaired = repair(body);
    serde_json::from_str::<T>(repaired.as_ref())
        .map_err(|e| PromptError::MalformedResponse(e.to_string()))
}

/// Strip markdown fences and any prose surrounding the outermost object.
fn extract_json_body(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{split, ChunkOptions};
    use crate::model::LogLevel;
    use chrono::{TimeZone, Utc};
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

    fn sample_chunk() -> Chunk {
        let entries = vec![
            entry(LogLevel::Info, "starting request", 0),
            entry(LogLevel::Error, "db timeout", 1),
            entry(LogLevel::Info, "request aborted", 2),
        ];
        split(&entries, &ChunkOptions::default()).remove(0)
    }

    #[test]
    fn test_chunk_prompt_block_order() {
        let prompt = chunk_prompt(&sample_chunk(), "feedback goes here");
        let instruction_pos = prompt.find(CHUNK_INSTRUCTION).unwrap();
        let schema_pos = prompt.find("\"summary\"").unwrap();
        let entries_pos = prompt.find("Log entries:").unwrap();
        let context_pos = prompt.find("feedback goes here").unwrap();
        assert!(instruction_pos < schema_pos);
        assert!(schema_pos < entries_pos);
        assert!(entries_pos < context_pos);
    }

    #[test]
    fn test_chunk_prompt_entries_in_source_order() {
        let prompt = chunk_prompt(&sample_chunk(), "");
        let start = prompt.find("starting request").unwrap();
        let middle = prompt.find("db timeout").unwrap();
        let end = prompt.find("request aborted").unwrap();
        assert!(start < middle && middle < end);
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let a = chunk_prompt(&sample_chunk(), "ctx");
        let b = chunk_prompt(&sample_chunk(), "ctx");
        assert_eq!(a, b);
    }

    #[test]
    fn test_reduce_prompt_carries_partials_and_schema() {
        let partials = vec![
            ChunkAnalysis {
                summary: "first batch summary".to_string(),
                ..Default::default()
            },
            ChunkAnalysis {
                summary: "second batch summary".to_string(),
                ..Default::default()
            },
        ];
        let prompt = reduce_prompt(&partials);
        assert!(prompt.contains(REDUCE_INSTRUCTION));
        assert!(prompt.contains("critical_errors"));
        assert!(prompt.contains("first batch summary"));
        assert!(prompt.contains("second batch summary"));
        assert!(prompt.contains("partial analysis 2"));
    }

    #[test]
    fn test_parse_strict_json() {
        let raw = r#"{"summary":"s","root_cause":"r","severity":"high","recommendations":["x"]}"#;
        let analysis: FinalAnalysis = parse_llm_json(raw).unwrap();
        assert_eq!(analysis.severity, Severity::High);
        assert_eq!(analysis.recommendations, vec!["x"]);
    }

    #[test]
    fn test_parse_tolerates_code_fences_and_prose() {
        let raw = "Here is the analysis you asked for:\n```json\n{\"summary\":\"s\"}\n```\nHope it helps!";
        let analysis: ChunkAnalysis = parse_llm_json(raw).unwrap();
        assert_eq!(analysis.summary, "s");
    }

    #[test]
    fn test_parse_repairs_single_quotes() {
        let raw = "{'summary':'fixed','severity':'medium'}";
        let analysis: ChunkAnalysis = parse_llm_json(raw).unwrap();
        assert_eq!(analysis.summary, "fixed");
        assert_eq!(analysis.severity, Severity::Medium);
    }

    #[test]
    fn test_parse_repairs_missing_brace() {
        let raw = r#"{"summary":"s","recommendations":["a","b"]"#;
        let analysis: ChunkAnalysis = parse_llm_json(raw).unwrap();
        assert_eq!(analysis.recommendations, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_fails_after_one_repair() {
        let raw = "utter nonsense with no json at all";
        let result: Result<ChunkAnalysis, _> = parse_llm_json(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_no_errors_analysis_shape() {
        let analysis = FinalAnalysis::no_errors(10);
        assert_eq!(analysis.severity, Severity::Low);
        assert_eq!(analysis.critical_errors, 0);
        assert!(analysis.summary.contains("no error"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_render_entries_includes_metadata() {
        let mut e = entry(LogLevel::Error, "boom", 0);
        e.metadata.insert(
            "request_id".to_string(),
            crate::model::RawValue::String("abc".to_string()),
        );
        let rendered = render_entries(&[&e]);
        assert!(rendered.contains("ERROR"));
        assert!(rendered.contains("boom"));
        assert!(rendered.contains("request_id"));
    }
}
