//! Format classification: decide between JSON mode and unstructured mode
//! by sampling the head of the file.
//!
//! The sample covers the first `CLASSIFY_SAMPLE_LINES` lines (or the whole
//! file when smaller). Multi-line JSON records are counted as single units
//! so a pretty-printed file still classifies as JSON.

use serde_json::Value;

use crate::model::ParseMode;
use crate::multiline::{Feed, JsonAccumulator};
use crate::repair::repair_object;
use crate::{JSON_MODE_THRESHOLD, MAX_RECORD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineShape {
    ValidObject,
    FixableObject,
    Unstructured,
}

/// Shape of a single complete line (or assembled record).
pub fn line_shape(line: &str) -> LineShape {
    if matches!(serde_json::from_str::<Value>(line), Ok(Value::Object(_))) {
        return LineShape::ValidObject;
    }
    if repair_object(line).is_some() {
        return LineShape::FixableObject;
    }
    LineShape::Unstructured
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyReport {
    pub mode: ParseMode,
    pub valid: usize,
    pub fixable: usize,
    pub unstructured: usize,
    /// Non-empty units inspected (multi-line records count once).
    pub sampled_units: usize,
}

/// Classify the head of the file. `sample_limit` bounds how many raw lines
/// are inspected.
pub fn classify_lines<S: AsRef<str>>(lines: &[S], sample_limit: usize) -> ClassifyReport {
    let mut valid = 0usize;
    let mut fixable = 0usize;
    let mut unstructured = 0usize;

    let mut acc = JsonAccumulator::new(MAX_RECORD_SIZE);

    for (index, line) in lines.iter().take(sample_limit).enumerate() {
        let line = line.as_ref();
        let trimmed = line.trim();
        if trimmed.is_empty() && !acc.is_open() {
            continue;
        }

        if acc.is_open() {
            match acc.push(line, index) {
                Feed::Complete(record) => match line_shape(&record) {
                    LineShape::ValidObject => valid += 1,
                    LineShape::FixableObject => fixable += 1,
                    LineShape::Unstructured => unstructured += 1,
                },
                Feed::Pending => {}
                Feed::Overflow => unstructured += 1,
            }
            continue;
        }

        if trimmed.starts_with('{') {
            match acc.push(line, index) {
                Feed::Complete(record) => match line_shape(&record) {
                    LineShape::ValidObject => valid += 1,
                    LineShape::FixableObject => fixable += 1,
                    LineShape::Unstructured => unstructured += 1,
                },
                Feed::Pending => {}
                Feed::Overflow => unstructured += 1,
            }
            continue;
        }

        match line_shape(trimmed) {
            LineShape::ValidObject => valid += 1,
            LineShape::FixableObject => fixable += 1,
            LineShape::Unstructured => unstructured += 1,
        }
    }

    // A record still open at the end of the sample: judge what we have,
    // counting it as fixable when the repair steps can finish it.
    if let Some((buf, _)) = acc.drain() {
        match line_shape(&buf) {
            LineShape::ValidObject => valid += 1,
            LineShape::FixableObject => fixable += 1,
            LineShape::Unstructured => unstructured += 1,
        }
    }

    let sampled_units = valid + fixable + unstructured;
    let mode = if sampled_units == 0 {
        ParseMode::Unstructured
    } else {
        let structured = (valid + fixable) as f64 / sampled_units as f64;
        if structured >= JSON_MODE_THRESHOLD {
            ParseMode::Json
        } else {
            ParseMode::Unstructured
        }
    };

    ClassifyReport {
        mode,
        valid,
        fixable,
        unstructured,
        sampled_units,
    }
}
