//! Built-in failure-pattern catalog. Matches run over error entries and
//! feed both the learning heuristics and feedback attribution.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::CanonicalEntry;

pub struct BuiltinPattern {
    pub name: &'static str,
    pub base_confidence: f64,
    pub hypothesis: &'static str,
    pattern: &'static str,
}

const CATALOG: &[BuiltinPattern] = &[
    BuiltinPattern {
        name: "timeout",
        base_confidence: 0.70,
        hypothesis: "operations are exceeding their deadline, pointing at a slow or overloaded dependency",
        pattern: r"(?i)\btim(?:ed|e)?[ -]?out\b|deadline exceeded|context deadline",
    },
    BuiltinPattern {
        name: "connection-reset",
        base_confidence: 0.70,
        hypothesis: "a peer is dropping connections, pointing at network instability or a crashing upstream",
        pattern: r"(?i)connection (?:reset|refused|closed|aborted)|broken pipe|ECONNRESET|ECONNREFUSED",
    },
    BuiltinPattern {
        name: "out-of-memory",
        base_confidence: 0.80,
        hypothesis: "the process is running out of memory, pointing at a leak or an undersized allocation",
        pattern: r"(?i)out of memory|oom[- ]?kill|cannot allocate memory|heap space|memory exhausted",
    },
    BuiltinPattern {
        name: "auth-failure",
        base_confidence: 0.65,
        hypothesis: "requests are failing authentication or authorization, pointing at expired or misconfigured credentials",
        pattern: r"(?i)auth(?:entication|orization)? fail|access denied|invalid credentials|permission denied|unauthorized|forbidden",
    },
    BuiltinPattern {
        name: "deadlock",
        base_confidence: 0.75,
        hypothesis: "transactions are blocking each other, pointing at conflicting lock ordering",
        pattern: r"(?i)deadlock|lock wait timeout",
    },
    BuiltinPattern {
        name: "http-5xx",
        base_confidence: 0.60,
        hypothesis: "an upstream service is returning server errors",
        pattern: r"(?i)(?:status|http|code)[ =:]*5\d{2}\b|\b50[0-4] (?:internal|bad gateway|service unavailable|gateway time)",
    },
    BuiltinPattern {
        name: "disk-full",
        base_confidence: 0.80,
        hypothesis: "the filesystem is out of space or quota",
        pattern: r"(?i)no space left|disk full|quota exceeded|ENOSPC",
    },
    BuiltinPattern {
        name: "dns-failure",
        base_confidence: 0.60,
        hypothesis: "hostname resolution is failing, pointing at DNS or service-discovery problems",
        pattern: r"(?i)name resolution|unknown host|getaddrinfo|no such host|dns (?:error|fail|lookup)",
    },
    BuiltinPattern {
        name: "tls-failure",
        base_confidence: 0.60,
        hypothesis: "TLS handshakes are failing, pointing at expired or untrusted certificates",
        pattern: r"(?i)certificate (?:expired|invalid|verify|unknown)|tls handshake|ssl (?:error|handshake)",
    },
    BuiltinPattern {
        name: "null-reference",
        base_confidence: 0.65,
        hypothesis: "code is dereferencing missing values, pointing at unvalidated input or a race on initialization",
        pattern: r"(?i)nullpointerexception|null reference|nil pointer|undefined is not|NoneType",
    },
];

/// A catalog pattern's hits against one error set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern: String,
    pub base_confidence: f64,
    pub matches: usize,
    /// Share of error entries that hit this pattern (0.0–1.0).
    pub relevance: f64,
    pub hypothesis: String,
}

pub struct PatternCatalog {
    compiled: Vec<(&'static BuiltinPattern, Regex)>,
}

impl PatternCatalog {
    pub fn new() -> Self {
        let compiled = CATALOG
            .iter()
            .map(|p| (p, Regex::new(p.pattern).expect("built-in catalog pattern")))
            .collect();
        Self { compiled }
    }

    pub fn names() -> Vec<&'static str> {
        CATALOG.iter().map(|p| p.name).collect()
    }

    pub fn contains(name: &str) -> bool {
        CATALOG.iter().any(|p| p.name == name)
    }

    /// Match error entries against the catalog, most relevant first.
    /// Relevance ties break on catalog order so output is deterministic.
    pub fn match_entries(&self, entries: &[&CanonicalEntry]) -> Vec<PatternMatch> {
        if entries.is_empty() {
            return Vec::new();
        }

        let mut matches: Vec<PatternMatch> = Vec::new();
        for (pattern, regex) in &self.compiled {
            let hits = entries
                .iter()
                .filter(|e| regex.is_match(&e.message))
                .count();
            if hits > 0 {
                matches.push(PatternMatch {
                    pattern: pattern.name.to_string(),
                    base_confidence: pattern.base_confidence,
                    matches: hits,
                    relevance: hits as f64 / entries.len() as f64,
                    hypothesis: pattern.hypothesis.to_string(),
                });
            }
        }

        matches.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches
    }

    /// Heuristic hypotheses for the strongest matches, used when the model
    /// needs a deterministic nudge and as a fallback analysis source.
    pub fn hypotheses(&self, entries: &[&CanonicalEntry], limit: usize) -> Vec<String> {
        self.match_entries(entries)
            .into_iter()
            .take(limit)
            .map(|m| format!("{}: {}", m.pattern, m.hypothesis))
            .collect()
    }
}

impl Default for PatternCatalog {
    fn default() -> Self {
        Self::new()
    }
}
