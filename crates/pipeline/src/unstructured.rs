//! Ordered regex library for free-form lines. The first matching pattern
//! wins; more specific formats sit earlier in the chain.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::fields::parse_timestamp_str;
use crate::model::{LogLevel, RawValue};

const LEVEL_ALTERNATION: &str =
    "DEBUG|TRACE|INFO|NOTICE|WARNING|WARN|ERROR|ERR|FATAL|CRITICAL|CRIT";

/// Fields extracted from one unstructured line.
#[derive(Debug, Clone)]
pub struct ExtractedLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<LogLevel>,
    pub message: String,
    pub metadata: BTreeMap<String, RawValue>,
    /// Library pattern that matched, for diagnostics.
    pub pattern: &'static str,
}

/// Compiled pattern chain: Apache/Nginx combined, syslog, Java stack-trace
/// header, ISO `timestamp level message`, generic `timestamp level message`,
/// catch-all level scan.
pub struct RegexLibrary {
    apache: Regex,
    syslog: Regex,
    java_exception: Regex,
    iso_level: Regex,
    generic: Regex,
    catch_all: Regex,
}

impl RegexLibrary {
    pub fn new() -> Self {
        let apache = Regex::new(
            r#"^(?P<ip>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<timestamp>[^\]]+)\] "(?P<method>\S+) (?P<path>\S+)(?: (?P<proto>[^"]*))?" (?P<status>\d{3}) (?P<size>\S+)(?: "(?P<referer>[^"]*)" "(?P<agent>[^"]*)")?"#,
        )
        .expect("built-in apache pattern");

        let syslog = Regex::new(
            r"^(?:<(?P<pri>\d{1,3})>)?(?P<timestamp>[A-Z][a-z]{2}\s{1,2}\d{1,2} \d{2}:\d{2}:\d{2}) (?P<host>\S+) (?P<tag>[A-Za-z0-9_\-./]+)(?:\[(?P<pid>\d+)\])?: (?P<message>.*)$",
        )
        .expect("built-in syslog pattern");

        let java_exception = Regex::new(
            r"^(?P<exception>(?:[A-Za-z_$][A-Za-z0-9_$]*\.)+[A-Za-z_$][A-Za-z0-9_$]*(?:Exception|Error))(?::\s*(?P<message>.*))?$",
        )
        .expect("built-in java exception pattern");

        let iso_level = Regex::new(&format!(
            r"^(?P<timestamp>\d{{4}}-\d{{2}}-\d{{2}}[T ]\d{{2}}:\d{{2}}:\d{{2}}(?:\.\d{{1,9}})?(?:Z|[+-]\d{{2}}:?\d{{2}})?)\s+\[?(?P<level>(?i:{lv}))\]?\s*[:\-]?\s*(?P<message>.*)$",
            lv = LEVEL_ALTERNATION
        ))
        .expect("built-in iso pattern");

        let generic = Regex::new(&format!(
            r"^(?P<timestamp>\d[\d:./\-]{{6,}}(?:[ T]\d{{2}}:\d{{2}}:\d{{2}}(?:[.,]\d+)?)?)\s+\[?(?P<level>(?i:{lv}))\]?\s*[:\-]?\s*(?P<message>.*)$",
            lv = LEVEL_ALTERNATION
        ))
        .expect("built-in generic pattern");

        let catch_all = Regex::new(&format!(
            r"\[?\b(?P<level>(?i:{lv}))\b\]?\s*[:\-]?\s*(?P<message>.*)$",
            lv = LEVEL_ALTERNATION
        ))
        .expect("built-in catch-all pattern");

        Self {
            apache,
            syslog,
            java_exception,
            iso_level,
            generic,
            catch_all,
        }
    }

    /// Run the chain over one line. `None` means nothing matched at all and
    /// the caller should emit an unparsed entry plus a parse error.
    pub fn parse_line(&self, line: &str, now: DateTime<Utc>) -> Option<ExtractedLine> {
        if let Some(caps) = self.apache.captures(line) {
            return Some(self.from_apache(&caps, now));
        }
        if let Some(caps) = self.syslog.captures(line) {
            return Some(self.from_syslog(&caps, now));
        }
        if let Some(caps) = self.java_exception.captures(line) {
            let exception = caps.name("exception").map(|m| m.as_str()).unwrap_or_default();
            let mut metadata = BTreeMap::new();
            metadata.insert(
                "exception".to_string(),
                RawValue::String(exception.to_string()),
            );
            return Some(ExtractedLine {
                timestamp: None,
                level: Some(LogLevel::Error),
                message: line.to_string(),
                metadata,
                pattern: "java_exception",
            });
        }
        for (regex, pattern) in [(&self.iso_level, "iso_level"), (&self.generic, "generic")] {
            if let Some(caps) = regex.captures(line) {
                let timestamp = caps
                    .name("timestamp")
                    .and_then(|m| parse_timestamp_str(m.as_str(), now));
                let level = caps.name("level").and_then(|m| LogLevel::parse(m.as_str()));
                let message = caps
                    .name("message")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                return Some(ExtractedLine {
                    timestamp,
                    level,
                    message,
                    metadata: BTreeMap::new(),
                    pattern,
                });
            }
        }
        if let Some(caps) = self.catch_all.captures(line) {
            let level = caps.name("level").and_then(|m| LogLevel::parse(m.as_str()));
            let rest = caps.name("message").map(|m| m.as_str()).unwrap_or("");
            let message = if rest.trim().is_empty() {
                line.to_string()
            } else {
                rest.to_string()
            };
            return Some(ExtractedLine {
                timestamp: None,
                level,
                message,
                metadata: BTreeMap::new(),
                pattern: "catch_all",
            });
        }
        None
    }

    /// Does the line carry a recognizable level keyword anywhere? Used by
    /// the continuation logic: such a line starts a fresh entry.
    pub fn has_level_token(&self, line: &str) -> bool {
        self.catch_all.is_match(line)
    }

    fn from_apache(&self, caps: &regex::Captures<'_>, now: DateTime<Utc>) -> ExtractedLine {
        let status: u16 = caps
            .name("status")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let level = if status >= 500 {
            LogLevel::Error
        } else if status >= 400 {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };

        let mut metadata = BTreeMap::new();
        if let Some(ip) = caps.name("ip") {
            metadata.insert(
                "remote_addr".to_string(),
                RawValue::String(ip.as_str().to_string()),
            );
        }
        metadata.insert("status".to_string(), RawValue::Number(f64::from(status)));
        if let Some(size) = caps.name("size") {
            if let Ok(bytes) = size.as_str().parse::<f64>() {
                metadata.insert("bytes".to_string(), RawValue::Number(bytes));
            }
        }
        if let Some(agent) = caps.name("agent") {
            metadata.insert(
                "user_agent".to_string(),
                RawValue::String(agent.as_str().to_string()),
            );
        }

        let message = format!(
            "{} {} {}",
            caps.name("method").map(|m| m.as_str()).unwrap_or("-"),
            caps.name("path").map(|m| m.as_str()).unwrap_or("-"),
            status
        );

        ExtractedLine {
            timestamp: caps
                .name("timestamp")
                .and_then(|m| parse_timestamp_str(m.as_str(), now)),
            level: Some(level),
            message,
            metadata,
            pattern: "apache_combined",
        }
    }

    fn from_syslog(&self, caps: &regex::Captures<'_>, now: DateTime<Utc>) -> ExtractedLine {
        let raw_message = caps.name("message").map(|m| m.as_str()).unwrap_or("");

        // Severity: explicit <PRI> header wins, then a leading level token
        // inside the message body.
        let pri_level = caps
            .name("pri")
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .map(|pri| match pri % 8 {
                0..=2 => LogLevel::Fatal,
                3 => LogLevel::Error,
                4 => LogLevel::Warn,
                7 => LogLevel::Debug,
                _ => LogLevel::Info,
            });

        let (token_level, message) = split_leading_level(raw_message);
        let level = pri_level.or(token_level);

        let mut metadata = BTreeMap::new();
        if let Some(host) = caps.name("host") {
            metadata.insert(
                "host".to_string(),
                RawValue::String(host.as_str().to_string()),
            );
        }
        if let Some(tag) = caps.name("tag") {
            metadata.insert(
                "app".to_string(),
                RawValue::String(tag.as_str().to_string()),
            );
        }
        if let Some(pid) = caps.name("pid") {
            if let Ok(pid) = pid.as_str().parse::<f64>() {
                metadata.insert("pid".to_string(), RawValue::Number(pid));
            }
        }

        ExtractedLine {
            timestamp: caps
                .name("timestamp")
                .and_then(|m| parse_timestamp_str(m.as_str(), now)),
            level,
            message,
            metadata,
            pattern: "syslog",
        }
    }
}

impl Default for RegexLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a leading level token (`ERROR connection refused` →
/// `(Error, "connection refused")`). Lines without one come back unchanged.
fn split_leading_level(message: &str) -> (Option<LogLevel>, String) {
    let trimmed = message.trim_start();
    let token_end = trimmed
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let token = &trimmed[..token_end];
    if let Some(level) = LogLevel::parse(token) {
        let rest = trimmed[token_end..].trim_start_matches([':', '-', ' ']);
        if !rest.is_empty() {
            return (Some(level), rest.to_string());
        }
        return (Some(level), trimmed.to_string());
    }
    (None, message.to_string())
}
