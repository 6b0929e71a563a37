//! Token-budgeted batching of error entries for the map phase of analysis.
//!
//! Token counts are estimated as serialized length / 4. Chunking is
//! deterministic for identical inputs and options.

use serde::{Deserialize, Serialize};

use crate::model::CanonicalEntry;

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Estimated token budget per chunk prompt.
    pub token_budget: usize,
    /// Non-error neighbours attached on each side of an error entry.
    pub context_radius: usize,
    pub chars_per_token: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            token_budget: 6000,
            context_radius: 2,
            chars_per_token: 4,
        }
    }
}

/// A bounded batch of error entries plus their surrounding context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub errors: Vec<CanonicalEntry>,
    pub context: Vec<CanonicalEntry>,
}

pub fn estimate_tokens(entry: &CanonicalEntry, chars_per_token: usize) -> usize {
    let chars = serde_json::to_string(entry)
        .map(|s| s.len())
        .unwrap_or(entry.message.len());
    chars / chars_per_token.max(1) + 1
}

/// Partition the ERROR/FATAL entries of `entries` into prompt-sized chunks.
/// An oversized single error still forms a singleton chunk.
pub fn split(entries: &[CanonicalEntry], opts: &ChunkOptions) -> Vec<Chunk> {
    let error_indices: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.level.is_error())
        .map(|(i, _)| i)
        .collect();

    if error_indices.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;

    for &i in &error_indices {
        let cost = entry_cost(entries, i, opts);
        if !current.is_empty() && current_tokens + cost > opts.token_budget {
            let index = chunks.len();
            chunks.push(build_chunk(entries, &current, index, opts));
            current.clear();
            current_tokens = 0;
        }
        current.push(i);
        current_tokens += cost;
    }

    if !current.is_empty() {
        let index = chunks.len();
        chunks.push(build_chunk(entries, &current, index, opts));
    }

    chunks
}

/// Cost of one error entry including its local context. Context shared
/// between adjacent errors may be counted twice, which only makes the
/// packing more conservative.
fn entry_cost(entries: &[CanonicalEntry], error_index: usize, opts: &ChunkOptions) -> usize {
    let mut cost = estimate_tokens(&entries[error_index], opts.chars_per_token);
    for i in neighbour_range(entries.len(), error_index, opts.context_radius) {
        if i != error_index && !entries[i].level.is_error() {
            cost += estimate_tokens(&entries[i], opts.chars_per_token);
        }
    }
    cost
}

fn neighbour_range(len: usize, center: usize, radius: usize) -> std::ops::Range<usize> {
    let start = center.saturating_sub(radius);
    let end = (center + radius + 1).min(len);
    start..end
}

fn build_chunk(
    entries: &[CanonicalEntry],
    error_indices: &[usize],
    index: usize,
    opts: &ChunkOptions,
) -> Chunk {
    let errors: Vec<CanonicalEntry> = error_indices
        .iter()
        .map(|&i| entries[i].clone())
        .collect();

    let mut context_indices: Vec<usize> = Vec::new();
    for &i in error_indices {
        for j in neighbour_range(entries.len(), i, opts.context_radius) {
            if !entries[j].level.is_error() && !context_indices.contains(&j) {
                context_indices.push(j);
            }
        }
    }
    context_indices.sort_unstable();

    let context: Vec<CanonicalEntry> = context_indices
        .into_iter()
        .map(|i| entries[i].clone())
        .collect();

    Chunk {
        index,
        errors,
        context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn mixed_entries(errors: usize, spacing: usize) -> Vec<CanonicalEntry> {
        let mut out = Vec::new();
        let mut line = 0;
        for e in 0..errors {
            for _ in 0..spacing {
                out.push(entry(LogLevel::Info, "context line", line));
                line += 1;
            }
            out.push(entry(LogLevel::Error, &format!("error {}", e), line));
            line += 1;
        }
        out
    }

    #[test]
    fn test_no_errors_no_chunks() {
        let entries = vec![entry(LogLevel::Info, "a", 0), entry(LogLevel::Warn, "b", 1)];
        assert!(split(&entries, &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn test_all_errors_fit_one_chunk() {
        let entries = mixed_entries(3, 2);
        let chunks = split(&entries, &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].errors.len(), 3);
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_budget_splits_chunks() {
        let entries = mixed_entries(10, 1);
        let opts = ChunkOptions {
            token_budget: 60,
            ..Default::default()
        };
        let chunks = split(&entries, &opts);
        assert!(chunks.len() > 1);
        let total_errors: usize = chunks.iter().map(|c| c.errors.len()).sum();
        assert_eq!(total_errors, 10);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn test_error_order_preserved_across_chunks() {
        let entries = mixed_entries(10, 1);
        let opts = ChunkOptions {
            token_budget: 60,
            ..Default::default()
        };
        let chunks = split(&entries, &opts);
        let messages: Vec<&str> = chunks
            .iter()
            .flat_map(|c| c.errors.iter().map(|e| e.message.as_str()))
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("error {}", i)).collect();
        assert_eq!(messages, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_context_attached() {
        let entries = vec![
            entry(LogLevel::Info, "before 1", 0),
            entry(LogLevel::Info, "before 2", 1),
            entry(LogLevel::Error, "the failure", 2),
            entry(LogLevel::Info, "after 1", 3),
            entry(LogLevel::Info, "after 2", 4),
            entry(LogLevel::Info, "far away", 5),
        ];
        let chunks = split(&entries, &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        let context: Vec<&str> = chunks[0].context.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(context, vec!["before 1", "before 2", "after 1", "after 2"]);
    }

    #[test]
    fn test_context_excludes_errors_and_deduplicates() {
        let entries = vec![
            entry(LogLevel::Info, "shared", 0),
            entry(LogLevel::Error, "e1", 1),
            entry(LogLevel::Error, "e2", 2),
            entry(LogLevel::Info, "tail", 3),
        ];
        let chunks = split(&entries, &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        let context: Vec<&str> = chunks[0].context.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(context, vec!["shared", "tail"]);
    }

    #[test]
    fn test_oversized_error_forms_singleton_chunk() {
        let big = "x".repeat(50_000);
        let entries = vec![
            entry(LogLevel::Error, &big, 0),
            entry(LogLevel::Error, "small", 1),
        ];
        let opts = ChunkOptions {
            token_budget: 100,
            ..Default::default()
        };
        let chunks = split(&entries, &opts);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].errors.len(), 1);
        assert_eq!(chunks[1].errors.len(), 1);
    }

    #[test]
    fn test_deterministic() {
        let entries = mixed_entries(20, 3);
        let opts = ChunkOptions {
            token_budget: 200,
            ..Default::default()
        };
        let a = split(&entries, &opts);
        let b = split(&entries, &opts);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
