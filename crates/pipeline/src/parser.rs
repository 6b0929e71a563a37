//! The end-to-end parsing pipeline: classify → per-line parse → multiline
//! coalescing → canonical entries plus a per-line error report.
//!
//! Per-line problems never abort the file; the file only fails on I/O
//! errors or when no entry could be produced at all.

use std::io::BufRead;

use chrono::{DateTime, Utc};

use crate::classify::classify_lines;
use crate::fields::{normalize_record, parse_timestamp_str};
use crate::model::{
    CanonicalEntry, LineError, LogLevel, ParseError, ParseMode, ParseOutcome, ParseStats,
    RawValue, RcaFeasibility,
};
use crate::multiline::{append_continuation, is_continuation, Feed, JsonAccumulator};
use crate::repair::repair_object;
use crate::rules::CompiledRule;
use crate::unstructured::RegexLibrary;
use crate::{CLASSIFY_SAMPLE_LINES, MAX_RECORD_SIZE};

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Raw lines inspected by the mode classifier.
    pub sample_lines: usize,
    /// Cap for one multi-line JSON record.
    pub max_record_bytes: usize,
    /// Ingestion time; defaults to wall clock. Injectable so parsing the
    /// same bytes twice yields identical records.
    pub now: Option<DateTime<Utc>>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            sample_lines: CLASSIFY_SAMPLE_LINES,
            max_record_bytes: MAX_RECORD_SIZE,
            now: None,
        }
    }
}

pub struct LogPipeline {
    library: RegexLibrary,
}

impl LogPipeline {
    pub fn new() -> Self {
        Self {
            library: RegexLibrary::new(),
        }
    }

    pub fn parse_reader<R: BufRead>(
        &self,
        reader: R,
        rules: Option<&CompiledRule>,
        opts: &ParseOptions,
    ) -> Result<ParseOutcome, ParseError> {
        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line?);
        }
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        self.parse_lines(&refs, rules, opts)
    }

    pub fn parse_str(
        &self,
        text: &str,
        rules: Option<&CompiledRule>,
        opts: &ParseOptions,
    ) -> Result<ParseOutcome, ParseError> {
        let lines: Vec<&str> = text.lines().collect();
        self.parse_lines(&lines, rules, opts)
    }

    fn parse_lines(
        &self,
        lines: &[&str],
        rules: Option<&CompiledRule>,
        opts: &ParseOptions,
    ) -> Result<ParseOutcome, ParseError> {
        let now = opts.now.unwrap_or_else(Utc::now);
        let report = classify_lines(lines, opts.sample_lines);
        tracing::debug!(
            mode = report.mode.as_str(),
            valid = report.valid,
            fixable = report.fixable,
            unstructured = report.unstructured,
            "format classification"
        );

        let mut entries: Vec<CanonicalEntry> = Vec::new();
        let mut line_errors: Vec<LineError> = Vec::new();

        match report.mode {
            ParseMode::Json => {
                self.run_json_mode(lines, rules, now, opts, &mut entries, &mut line_errors)
            }
            ParseMode::Unstructured => {
                self.run_unstructured_mode(lines, rules, now, &mut entries, &mut line_errors)
            }
        }

        if entries.is_empty() {
            return Err(ParseError::NoEntries);
        }

        let error_count = entries.iter().filter(|e| e.level.is_error()).count();
        let warning_count = entries
            .iter()
            .filter(|e| e.level == LogLevel::Warn)
            .count();

        Ok(ParseOutcome {
            stats: ParseStats {
                total_lines: lines.len(),
                entry_count: entries.len(),
                error_count,
                warning_count,
            },
            rca: RcaFeasibility::from_error_count(error_count),
            mode: report.mode,
            entries,
            line_errors,
        })
    }

    fn run_json_mode(
        &self,
        lines: &[&str],
        rules: Option<&CompiledRule>,
        now: DateTime<Utc>,
        opts: &ParseOptions,
        entries: &mut Vec<CanonicalEntry>,
        line_errors: &mut Vec<LineError>,
    ) {
        let mut acc = JsonAccumulator::new(opts.max_record_bytes);

        for (index, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() && !acc.is_open() {
                continue;
            }

            if acc.is_open() || trimmed.starts_with('{') {
                let start = if acc.is_open() { acc.start_index() } else { index };
                match acc.push(line, index) {
                    Feed::Complete(record) => {
                        self.emit_record(&record, start, rules, now, entries, line_errors);
                    }
                    Feed::Pending => {}
                    Feed::Overflow => {
                        line_errors.push(LineError {
                            line_index: start,
                            reason: "multi-line JSON record exceeded size cap; buffer discarded"
                                .to_string(),
                        });
                    }
                }
                continue;
            }

            // Mixed content is permitted within JSON mode
            self.emit_unstructured_line(line, index, rules, now, entries, line_errors);
        }

        // Unterminated record at end of input: the repair pass may still
        // close it, otherwise it surfaces as one unparsed entry.
        if let Some((buf, start)) = acc.drain() {
            self.emit_record(&buf, start, rules, now, entries, line_errors);
        }
    }

    fn run_unstructured_mode(
        &self,
        lines: &[&str],
        rules: Option<&CompiledRule>,
        now: DateTime<Utc>,
        entries: &mut Vec<CanonicalEntry>,
        line_errors: &mut Vec<LineError>,
    ) {
        for (index, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            // Mixed content: a self-contained JSON object line still parses
            // as a record
            if trimmed.starts_with('{') {
                if let Some(map) = repair_object(trimmed) {
                    entries.push(normalize_record(map, rules, index, now));
                    continue;
                }
            }

            // Continuation lines attach to the previous entry. A line that
            // carries its own level header starts a fresh entry even
            // without a timestamp.
            let continues = is_continuation(line)
                && (line.starts_with(' ')
                    || line.starts_with('\t')
                    || !self.library.has_level_token(line));
            if continues {
                if let Some(last) = entries.last_mut() {
                    if !append_continuation(&mut last.message, line) {
                        line_errors.push(LineError {
                            line_index: index,
                            reason: "entry exceeded per-entry size cap; continuation truncated"
                                .to_string(),
                        });
                    }
                    continue;
                }
            }

            self.emit_unstructured_line(line, index, rules, now, entries, line_errors);
        }
    }

    /// Parse one assembled JSON record (single- or multi-line).
    fn emit_record(
        &self,
        record: &str,
        start_index: usize,
        rules: Option<&CompiledRule>,
        now: DateTime<Utc>,
        entries: &mut Vec<CanonicalEntry>,
        line_errors: &mut Vec<LineError>,
    ) {
        match repair_object(record) {
            Some(map) => entries.push(normalize_record(map, rules, start_index, now)),
            None => {
                entries.push(CanonicalEntry::unparsed(record, start_index, now));
                line_errors.push(LineError {
                    line_index: start_index,
                    reason: "invalid JSON after repair".to_string(),
                });
            }
        }
    }

    /// Parse one free-form line: user extract patterns first, then the
    /// built-in library, then the unparsed fallback.
    fn emit_unstructured_line(
        &self,
        line: &str,
        index: usize,
        rules: Option<&CompiledRule>,
        now: DateTime<Utc>,
        entries: &mut Vec<CanonicalEntry>,
        line_errors: &mut Vec<LineError>,
    ) {
        if let Some(rules) = rules {
            if let Some(extraction) = rules.extract(line) {
                let timestamp = extraction
                    .timestamp
                    .as_deref()
                    .and_then(|s| parse_timestamp_str(s, now))
                    .unwrap_or(now);
                let level = extraction
                    .level
                    .as_deref()
                    .and_then(LogLevel::parse)
                    .unwrap_or(LogLevel::Info);
                let message = extraction.message.unwrap_or_else(|| line.to_string());
                let metadata = extraction
                    .metadata
                    .into_iter()
                    .map(|(k, v)| (k, RawValue::String(v)))
                    .collect();
                entries.push(CanonicalEntry {
                    timestamp,
                    level,
                    message,
                    metadata,
                    line_index: index,
                });
                return;
            }
        }

        if let Some(extracted) = self.library.parse_line(line, now) {
            entries.push(CanonicalEntry {
                timestamp: extracted.timestamp.unwrap_or(now),
                level: extracted.level.unwrap_or(LogLevel::Info),
                message: extracted.message,
                metadata: extracted.metadata,
                line_index: index,
            });
            return;
        }

        entries.push(CanonicalEntry::unparsed(line, index, now));
        line_errors.push(LineError {
            line_index: index,
            reason: "no pattern matched".to_string(),
        });
    }
}

impl Default for LogPipeline {
    fn default() -> Self {
        Self::new()
    }
}
