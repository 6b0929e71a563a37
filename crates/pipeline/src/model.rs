use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Normalize a source level token into the closed level set.
    ///
    /// Mapping: `WARNING→WARN`, `ERR→ERROR`, `CRIT|CRITICAL→FATAL`,
    /// `TRACE→DEBUG`. Unrecognized tokens yield `None` so the caller can
    /// apply the `INFO` default.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Some(LogLevel::Debug),
            "INFO" | "NOTICE" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" | "ERR" => Some(LogLevel::Error),
            "FATAL" | "CRIT" | "CRITICAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// ERROR and FATAL entries are what root cause analysis runs on.
    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Fatal)
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::parse(s).ok_or(())
    }
}

/// Tagged variant for decoded metadata values.
///
/// Objects use a `BTreeMap` so metadata key order is canonical: parsing the
/// same bytes twice yields byte-equal serialized records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<RawValue>),
    Object(BTreeMap<String, RawValue>),
}

impl RawValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, RawValue>> {
        match self {
            RawValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RawValue]> {
        match self {
            RawValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Render the value the way it should appear in a prompt or a message
    /// field: strings unquoted, everything else as compact JSON.
    pub fn display_string(&self) -> String {
        match self {
            RawValue::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(b),
            serde_json::Value::Number(n) => RawValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => RawValue::String(s),
            serde_json::Value::Array(items) => {
                RawValue::Array(items.into_iter().map(RawValue::from).collect())
            }
            serde_json::Value::Object(map) => RawValue::Object(
                map.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect(),
            ),
        }
    }
}

/// One canonical record per parsed line (or coalesced line group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    /// Event time in UTC; ingestion time when the source omits one.
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, RawValue>,
    /// Zero-based index of the first source line this entry came from.
    pub line_index: usize,
}

impl CanonicalEntry {
    pub fn unparsed(raw: &str, line_index: usize, ingested_at: DateTime<Utc>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("unparsed".to_string(), RawValue::Bool(true));
        Self {
            timestamp: ingested_at,
            level: LogLevel::Info,
            message: raw.to_string(),
            metadata,
            line_index,
        }
    }
}

/// Per-line parse failure. Never aborts the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineError {
    pub line_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Json,
    Unstructured,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Json => "json",
            ParseMode::Unstructured => "unstructured",
        }
    }
}

/// Whether root cause analysis can run on the parsed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcaFeasibility {
    pub possible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RcaFeasibility {
    pub fn from_error_count(error_count: usize) -> Self {
        if error_count == 0 {
            Self {
                possible: false,
                reason: Some("no errors detected".to_string()),
            }
        } else {
            Self {
                possible: true,
                reason: None,
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseStats {
    pub total_lines: usize,
    pub entry_count: usize,
    pub error_count: usize,
    pub warning_count: usize,
}

/// Everything the parsing pipeline produces for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub entries: Vec<CanonicalEntry>,
    pub line_errors: Vec<LineError>,
    pub stats: ParseStats,
    pub mode: ParseMode,
    pub rca: RcaFeasibility,
}

/// Whole-file failures. Per-line problems are reported as `LineError`s
/// instead; a file only fails when nothing at all could be produced.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error while reading log data: {0}")]
    Io(#[from] std::io::Error),

    #[error("no log entries could be produced")]
    NoEntries,
}
