/// Log parsing and analysis-preparation library
///
/// This crate converts raw log bytes into canonical, normalized entries and
/// prepares error sets for downstream root cause analysis.
///
/// # Architecture
///
/// - `model.rs`: canonical entry schema, levels, tagged raw values
/// - `classify.rs`: JSON-vs-unstructured mode decision over a line sample
/// - `repair.rs`: bounded JSON auto-fix (also applied to LLM responses)
/// - `fields.rs`: synonym resolution into the canonical schema
/// - `unstructured.rs`: ordered regex library for free-form lines
/// - `multiline.rs`: continuation coalescing and multi-line JSON assembly
/// - `rules.rs`: user-defined field mappings and extract patterns
/// - `parser.rs`: the end-to-end parsing pipeline
/// - `chunker.rs`: token-budgeted error batching with local context
/// - `patterns.rs`: built-in failure-pattern catalog
/// - `prompt.rs`: analysis prompt builder and response schema
///
/// # Safety Guarantees
///
/// All parsers enforce:
/// - Bounded memory (per-line and per-record size caps)
/// - Per-line failure isolation (a bad line never aborts the file)
/// - Deterministic output for identical input and options

pub mod model;
pub mod classify;
pub mod repair;
pub mod fields;
pub mod unstructured;
pub mod multiline;
pub mod rules;
pub mod parser;
pub mod chunker;
pub mod patterns;
pub mod prompt;

// Re-export commonly used types
pub use model::{CanonicalEntry, LineError, LogLevel, ParseError, ParseMode, ParseOutcome, RawValue};
pub use parser::{LogPipeline, ParseOptions};
pub use rules::{CompiledRule, ParsingRule};

// Constants
pub const MAX_LINE_SIZE: usize = 1_048_576; // 1 MiB per entry message
pub const MAX_RECORD_SIZE: usize = 4 * 1_048_576; // 4 MiB per multi-line JSON record
pub const CLASSIFY_SAMPLE_LINES: usize = 500;
pub const JSON_MODE_THRESHOLD: f64 = 0.80;
