//! User-defined parsing rules: explicit field mappings applied to parsed
//! records, and prioritized regex extract patterns applied to raw text.
//!
//! Rules are validated eagerly at compile time so a bad pattern is rejected
//! when the rule is saved, not when a file is parsed.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPattern {
    pub name: String,
    pub pattern: String,
    /// Lower priority runs earlier.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
}

/// User-defined extraction configuration as stored and edited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsingRule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub extract_patterns: Vec<ExtractPattern>,
    #[serde(default)]
    pub is_template: bool,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid pattern '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: Box<regex::Error>,
    },
}

#[derive(Debug)]
struct CompiledPattern {
    spec: ExtractPattern,
    regex: Regex,
}

/// One or more rules compiled into an applicable set. Mappings keep rule
/// order; patterns across all rules run in ascending priority.
#[derive(Debug)]
pub struct CompiledRule {
    field_mappings: Vec<FieldMapping>,
    patterns: Vec<CompiledPattern>,
}

/// Raw-text extraction result. Field values stay strings here; the
/// normalizer converts them into canonical types.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub timestamp: Option<String>,
    pub level: Option<String>,
    pub message: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub matched_pattern: String,
}

/// Outcome of applying a rule to one raw line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleApplication {
    pub extracted_fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTestDetail {
    pub line_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    pub extracted_fields: BTreeMap<String, String>,
}

/// Dry-run report over a sample corpus; nothing is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTestReport {
    pub total_logs: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub details: Vec<RuleTestDetail>,
}

impl CompiledRule {
    pub fn compile(rule: &ParsingRule) -> Result<Self, RuleError> {
        Self::compile_all(std::slice::from_ref(rule))
    }

    /// Compile a set of rules (typically the owner's active rules) into one
    /// applicable unit.
    pub fn compile_all(rules: &[ParsingRule]) -> Result<Self, RuleError> {
        let mut field_mappings = Vec::new();
        let mut patterns = Vec::new();

        for rule in rules {
            field_mappings.extend(rule.field_mappings.iter().cloned());
            for spec in &rule.extract_patterns {
                let regex = Regex::new(&spec.pattern).map_err(|e| RuleError::InvalidPattern {
                    name: spec.name.clone(),
                    source: Box::new(e),
                })?;
                patterns.push(CompiledPattern {
                    spec: spec.clone(),
                    regex,
                });
            }
        }

        patterns.sort_by_key(|p| p.spec.priority);

        Ok(Self {
            field_mappings,
            patterns,
        })
    }

    pub fn field_mappings(&self) -> &[FieldMapping] {
        &self.field_mappings
    }

    pub fn has_patterns(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Run extract patterns in priority order; the first match wins. Named
    /// capture groups map directly onto canonical field names; any other
    /// group lands in metadata.
    pub fn extract(&self, raw: &str) -> Option<Extraction> {
        for compiled in &self.patterns {
            let caps = match compiled.regex.captures(raw) {
                Some(caps) => caps,
                None => continue,
            };

            let mut extraction = Extraction {
                timestamp: None,
                level: None,
                message: None,
                metadata: BTreeMap::new(),
                matched_pattern: compiled.spec.name.clone(),
            };

            for name in compiled.regex.capture_names().flatten() {
                let Some(m) = caps.name(name) else { continue };
                let value = m.as_str().to_string();
                match name {
                    "timestamp" => extraction.timestamp = Some(value),
                    "level" => extraction.level = Some(value),
                    "message" => extraction.message = Some(value),
                    other => {
                        extraction.metadata.insert(other.to_string(), value);
                    }
                }
            }

            return Some(extraction);
        }
        None
    }

    /// Single-line application, the Rule Engine surface used by the rule
    /// test endpoint.
    pub fn apply_line(&self, raw: &str) -> RuleApplication {
        match self.extract(raw) {
            Some(extraction) => {
                let mut fields = extraction.metadata;
                if let Some(ts) = extraction.timestamp {
                    fields.insert("timestamp".to_string(), ts);
                }
                if let Some(level) = extraction.level {
                    fields.insert("level".to_string(), level);
                }
                if let Some(message) = extraction.message {
                    fields.insert("message".to_string(), message);
                }
                RuleApplication {
                    extracted_fields: fields,
                    matched_pattern: Some(extraction.matched_pattern),
                    errors: Vec::new(),
                }
            }
            None => RuleApplication {
                extracted_fields: BTreeMap::new(),
                matched_pattern: None,
                errors: Vec::new(),
            },
        }
    }

    /// Run the rule against a sample corpus without writing anything.
    pub fn test_corpus<S: AsRef<str>>(&self, lines: &[S]) -> RuleTestReport {
        let mut details = Vec::with_capacity(lines.len());
        let mut success_count = 0usize;

        for (line_index, line) in lines.iter().enumerate() {
            let application = self.apply_line(line.as_ref());
            if application.matched_pattern.is_some() {
                success_count += 1;
            }
            details.push(RuleTestDetail {
                line_index,
                matched_pattern: application.matched_pattern,
                extracted_fields: application.extracted_fields,
            });
        }

        RuleTestReport {
            total_logs: lines.len(),
            success_count,
            failure_count: lines.len() - success_count,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_with_pattern(name: &str, pattern: &str, priority: i32) -> ParsingRule {
        ParsingRule {
            name: "test rule".to_string(),
            active: true,
            extract_patterns: vec![ExtractPattern {
                name: name.to_string(),
                pattern: pattern.to_string(),
                priority,
                description: String::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_pattern_rejected_at_compile() {
        let rule = rule_with_pattern("broken", "[unclosed", 0);
        let err = CompiledRule::compile(&rule).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_named_groups_map_to_canonical_fields() {
        let rule = rule_with_pattern(
            "custom",
            r"^(?P<timestamp>\S+) \[(?P<level>\w+)\] (?P<message>.*) worker=(?P<worker>\d+)$",
            0,
        );
        let compiled = CompiledRule::compile(&rule).unwrap();
        let extraction = compiled
            .extract("2024-01-15T10:30:00Z [ERROR] queue stalled worker=7")
            .unwrap();
        assert_eq!(extraction.matched_pattern, "custom");
        assert_eq!(extraction.timestamp.as_deref(), Some("2024-01-15T10:30:00Z"));
        assert_eq!(extraction.level.as_deref(), Some("ERROR"));
        assert_eq!(extraction.message.as_deref(), Some("queue stalled"));
        assert_eq!(extraction.metadata.get("worker").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_priority_order_first_match_wins() {
        let mut rule = rule_with_pattern("later", r"(?P<message>.+)", 10);
        rule.extract_patterns.push(ExtractPattern {
            name: "earlier".to_string(),
            pattern: r"^ERR (?P<message>.+)$".to_string(),
            priority: 1,
            description: String::new(),
        });
        let compiled = CompiledRule::compile(&rule).unwrap();

        let extraction = compiled.extract("ERR boom").unwrap();
        assert_eq!(extraction.matched_pattern, "earlier");

        let extraction = compiled.extract("something else").unwrap();
        assert_eq!(extraction.matched_pattern, "later");
    }

    #[test]
    fn test_apply_line_no_match() {
        let rule = rule_with_pattern("strict", r"^NEVER$", 0);
        let compiled = CompiledRule::compile(&rule).unwrap();
        let application = compiled.apply_line("does not match");
        assert!(application.matched_pattern.is_none());
        assert!(application.extracted_fields.is_empty());
        assert!(application.errors.is_empty());
    }

    #[test]
    fn test_test_corpus_counts() {
        let rule = rule_with_pattern("errors", r"^ERR (?P<message>.+)$", 0);
        let compiled = CompiledRule::compile(&rule).unwrap();
        let report = compiled.test_corpus(&["ERR one", "ok line", "ERR two"]);
        assert_eq!(report.total_logs, 3);
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.details.len(), 3);
        assert_eq!(report.details[0].matched_pattern.as_deref(), Some("errors"));
        assert!(report.details[1].matched_pattern.is_none());
    }

    #[test]
    fn test_compile_all_merges_rules() {
        let a = rule_with_pattern("a", r"^A (?P<message>.+)$", 5);
        let b = rule_with_pattern("b", r"^B (?P<message>.+)$", 1);
        let compiled = CompiledRule::compile_all(&[a, b]).unwrap();
        // Pattern "b" has the lower priority value and runs first, but
        // first-match still depends on the line
        assert_eq!(compiled.extract("A x").unwrap().matched_pattern, "a");
        assert_eq!(compiled.extract("B x").unwrap().matched_pattern, "b");
    }
}
