//! Field normalization: synonym resolution into the canonical
//! `{timestamp, level, message, metadata}` schema and the cascaded
//! timestamp format list.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{CanonicalEntry, LogLevel, RawValue};
use crate::rules::CompiledRule;

pub const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts", "time", "date", "datetime", "@timestamp"];
pub const LEVEL_KEYS: &[&str] = &["level", "severity", "log_level", "lvl", "priority"];
pub const MESSAGE_KEYS: &[&str] = &["message", "msg", "log", "log_message", "text", "body"];

/// Epoch values above this are treated as milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 1_000_000_000_000;

/// Build a canonical entry from a parsed key-value record.
///
/// User rule mappings run first and strictly win; built-in synonyms only
/// fill whatever the rule left empty. Unconsumed keys become metadata.
pub fn normalize_record(
    mut record: Map<String, Value>,
    rules: Option<&CompiledRule>,
    line_index: usize,
    ingested_at: DateTime<Utc>,
) -> CanonicalEntry {
    let mut timestamp_value: Option<Value> = None;
    let mut level_value: Option<Value> = None;
    let mut message_value: Option<Value> = None;

    if let Some(rules) = rules {
        for mapping in rules.field_mappings() {
            if let Some(value) = record.remove(&mapping.source_field) {
                match mapping.target_field.as_str() {
                    "timestamp" => timestamp_value.get_or_insert(value),
                    "level" => level_value.get_or_insert(value),
                    "message" => message_value.get_or_insert(value),
                    other => {
                        // Rule renames into metadata space
                        record.entry(other.to_string()).or_insert(value);
                        continue;
                    }
                };
            }
        }
    }

    if timestamp_value.is_none() {
        timestamp_value = take_first(&mut record, TIMESTAMP_KEYS);
    }
    if level_value.is_none() {
        level_value = take_first(&mut record, LEVEL_KEYS);
    }
    if message_value.is_none() {
        message_value = take_first(&mut record, MESSAGE_KEYS);
    }

    let timestamp = timestamp_value
        .as_ref()
        .and_then(|v| parse_timestamp_value(v, ingested_at))
        .unwrap_or(ingested_at);

    let level = level_value
        .as_ref()
        .and_then(value_to_string)
        .as_deref()
        .and_then(LogLevel::parse)
        .unwrap_or(LogLevel::Info);

    let message = message_value
        .as_ref()
        .and_then(value_to_string)
        .unwrap_or_default();

    let metadata: BTreeMap<String, RawValue> = record
        .into_iter()
        .map(|(k, v)| (k, RawValue::from(v)))
        .collect();

    CanonicalEntry {
        timestamp,
        level,
        message,
        metadata,
        line_index,
    }
}

fn take_first(record: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    for key in keys {
        if record.contains_key(*key) {
            return record.remove(*key);
        }
    }
    None
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Timestamps arrive as RFC3339 strings, epoch numbers, or a handful of
/// conventional text formats. Anything unrecognized falls back to ingestion
/// time at the call site. `now` supplies the year for year-less formats.
pub fn parse_timestamp_value(value: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(epoch_to_datetime).or_else(|| {
            // Fractional epoch seconds
            n.as_f64()
                .and_then(|f| Utc.timestamp_opt(f as i64, ((f.fract()) * 1e9) as u32).single())
        }),
        Value::String(s) => parse_timestamp_str(s, now),
        _ => None,
    }
}

fn epoch_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    if ts <= 0 {
        return None;
    }
    if ts >= EPOCH_MILLIS_CUTOFF {
        DateTime::from_timestamp_millis(ts)
    } else {
        DateTime::from_timestamp(ts, 0)
    }
}

/// Cascaded format list. `now` supplies the year for year-less syslog
/// timestamps.
pub fn parse_timestamp_str(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    // RFC3339, with or without fractional seconds, with zone
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // ISO-like without zone: assume UTC
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    // Apache/Nginx access log clock: 15/Jan/2024:10:30:00 +0000
    if let Ok(dt) = DateTime::parse_from_str(s, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(dt.with_timezone(&Utc));
    }

    // Syslog: "Jan 15 10:30:00" (no year; borrow it from `now`)
    if let Some(dt) = parse_syslog_timestamp(s, now) {
        return Some(dt);
    }

    // Numeric epoch seconds or milliseconds as a string
    if let Ok(ts) = s.parse::<i64>() {
        return epoch_to_datetime(ts);
    }

    None
}

fn parse_syslog_timestamp(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // Collapse the double space in "Jan  5" so one format string suffices.
    let collapsed: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let with_year = format!("{} {}", now.year(), collapsed);
    let naive = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S").ok()?;
    // A December timestamp read in January belongs to the previous year.
    if naive.date() > now.date_naive() + chrono::Duration::days(1) {
        let prev = NaiveDate::from_ymd_opt(now.year() - 1, naive.month(), naive.day())?
            .and_time(naive.time());
        return Some(Utc.from_utc_datetime(&prev));
    }
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn record(json: &str) -> Map<String, Value> {
        serde_json::from_str(json).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_canonical_fields_resolved() {
        let entry = normalize_record(
            record(r#"{"timestamp":"2024-01-15T10:30:00Z","level":"ERROR","message":"db timeout"}"#),
            None,
            0,
            now(),
        );
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "db timeout");
        assert_eq!(entry.timestamp.hour(), 10);
        assert!(entry.metadata.is_empty());
    }

    #[test]
    fn test_synonyms_first_present_wins() {
        let entry = normalize_record(
            record(r#"{"ts":1705314600,"severity":"warning","msg":"low disk"}"#),
            None,
            0,
            now(),
        );
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "low disk");
        assert_eq!(entry.timestamp, Utc.timestamp_opt(1705314600, 0).unwrap());
    }

    #[test]
    fn test_missing_level_defaults_to_info() {
        let entry = normalize_record(record(r#"{"msg":"hi"}"#), None, 0, now());
        assert_eq!(entry.level, LogLevel::Info);
    }

    #[test]
    fn test_missing_timestamp_uses_ingestion_time() {
        let at = now();
        let entry = normalize_record(record(r#"{"msg":"hi"}"#), None, 0, at);
        assert_eq!(entry.timestamp, at);
    }

    #[test]
    fn test_unknown_keys_become_metadata() {
        let entry = normalize_record(
            record(r#"{"level":"info","msg":"hi","request_id":"abc","attempt":2}"#),
            None,
            0,
            now(),
        );
        assert_eq!(entry.metadata.get("request_id").unwrap().as_str(), Some("abc"));
        assert_eq!(entry.metadata.get("attempt").unwrap().as_f64(), Some(2.0));
        assert!(!entry.metadata.contains_key("level"));
        assert!(!entry.metadata.contains_key("msg"));
    }

    #[test]
    fn test_epoch_millis_detected() {
        let entry = normalize_record(
            record(r#"{"time":1705314600123,"msg":"x"}"#),
            None,
            0,
            now(),
        );
        assert_eq!(entry.timestamp.timestamp_millis(), 1705314600123);
    }

    #[test]
    fn test_numeric_level_priority_unknown_defaults_info() {
        // A numeric syslog-style priority is not in the closed level set
        let entry = normalize_record(record(r#"{"priority":3,"msg":"x"}"#), None, 0, now());
        assert_eq!(entry.level, LogLevel::Info);
    }

    #[test]
    fn test_rfc3339_variants() {
        let n = now();
        assert!(parse_timestamp_str("2024-01-15T10:30:00Z", n).is_some());
        assert!(parse_timestamp_str("2024-01-15T10:30:00.123Z", n).is_some());
        assert!(parse_timestamp_str("2024-01-15T10:30:00+02:00", n).is_some());
        assert!(parse_timestamp_str("2024-01-15T10:30:00", n).is_some());
        assert!(parse_timestamp_str("2024-01-15 10:30:00.500", n).is_some());
    }

    #[test]
    fn test_syslog_timestamp_gets_current_year() {
        let n = now();
        let dt = parse_timestamp_str("Jan 15 10:30:00", n).unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 15);
        assert_eq!(dt.hour(), 10);
    }

    #[test]
    fn test_syslog_single_digit_day() {
        let dt = parse_timestamp_str("Jan  5 10:30:00", now()).unwrap();
        assert_eq!(dt.day(), 5);
    }

    #[test]
    fn test_december_log_read_in_january_is_previous_year() {
        let january = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let dt = parse_timestamp_str("Dec 31 23:59:59", january).unwrap();
        assert_eq!(dt.year(), 2023);
    }

    #[test]
    fn test_apache_clock_format() {
        let dt = parse_timestamp_str("15/Jan/2024:10:30:00 +0000", now()).unwrap();
        assert_eq!(dt.hour(), 10);
        assert_eq!(dt.day(), 15);
    }

    #[test]
    fn test_unrecognized_timestamp_is_none() {
        assert!(parse_timestamp_str("yesterday-ish", now()).is_none());
        assert!(parse_timestamp_str("", now()).is_none());
    }

    #[test]
    fn test_epoch_string() {
        let dt = parse_timestamp_str("1705314600", now()).unwrap();
        assert_eq!(dt.timestamp(), 1705314600);
        let dt = parse_timestamp_str("1705314600123", now()).unwrap();
        assert_eq!(dt.timestamp_millis(), 1705314600123);
    }
}
