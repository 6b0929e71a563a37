//! Multi-line handling: continuation coalescing for unstructured runs and
//! brace-balanced assembly of multi-line JSON records.

use crate::{MAX_LINE_SIZE, MAX_RECORD_SIZE};

/// Result of feeding one line into the JSON accumulator.
#[derive(Debug, PartialEq)]
pub enum Feed {
    /// A balanced record is ready; carries the joined buffer.
    Complete(String),
    /// The record is still open.
    Pending,
    /// The buffer exceeded the record cap and was discarded.
    Overflow,
}

/// Assembles a JSON record that spans several lines.
///
/// Balance counting ignores braces inside string literals and escaped
/// quotes. The buffer is discarded with `Feed::Overflow` once it exceeds
/// the record cap.
pub struct JsonAccumulator {
    buf: String,
    depth: i32,
    in_string: bool,
    escaped: bool,
    start_index: usize,
    max_bytes: usize,
}

impl JsonAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: String::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            start_index: 0,
            max_bytes,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Line index where the open record started.
    pub fn start_index(&self) -> usize {
        self.start_index
    }

    pub fn push(&mut self, line: &str, line_index: usize) -> Feed {
        if self.buf.is_empty() {
            self.start_index = line_index;
        } else {
            self.buf.push('\n');
        }
        self.buf.push_str(line);
        self.scan(line);

        if self.buf.len() > self.max_bytes {
            self.reset();
            return Feed::Overflow;
        }

        if self.depth <= 0 {
            let complete = std::mem::take(&mut self.buf);
            self.reset();
            return Feed::Complete(complete);
        }

        Feed::Pending
    }

    /// Drain whatever is buffered at end of input (an unbalanced record).
    pub fn drain(&mut self) -> Option<(String, usize)> {
        if self.buf.is_empty() {
            return None;
        }
        let start = self.start_index;
        let buf = std::mem::take(&mut self.buf);
        self.reset();
        Some((buf, start))
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }

    fn scan(&mut self, line: &str) {
        for c in line.chars() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match c {
                '"' => self.in_string = true,
                '{' | '[' => self.depth += 1,
                '}' | ']' => self.depth -= 1,
                _ => {}
            }
        }
        // Escapes do not carry across a line break inside a record
        self.escaped = false;
    }
}

impl Default for JsonAccumulator {
    fn default() -> Self {
        Self::new(MAX_RECORD_SIZE)
    }
}

/// True when the line continues the previous unstructured entry: leading
/// whitespace, or no recognizable leading timestamp.
pub fn is_continuation(line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    if line.starts_with(' ') || line.starts_with('\t') {
        return true;
    }
    !starts_with_timestamp(line)
}

/// Append a continuation line to an entry message, enforcing the per-entry
/// cap. Returns false when the cap truncated the append.
pub fn append_continuation(message: &mut String, line: &str) -> bool {
    if message.len() >= MAX_LINE_SIZE {
        return false;
    }
    let remaining = MAX_LINE_SIZE - message.len();
    message.push('\n');
    if line.len() < remaining {
        message.push_str(line);
        true
    } else {
        // Truncate on a char boundary
        let mut cut = remaining.saturating_sub(1);
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        message.push_str(&line[..cut]);
        false
    }
}

const SYSLOG_MONTHS: &[&str] = &[
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Does the line open with something timestamp-shaped?
///
/// Recognizes ISO dates (`2024-01-15...`), bracketed variants, bare clock
/// times, syslog month prefixes (`Jan 15 10:30:00`), and syslog `<PRI>`
/// headers.
pub fn starts_with_timestamp(line: &str) -> bool {
    let bytes = line.as_bytes();
    if bytes.is_empty() {
        return false;
    }

    // Bracketed timestamp: [2024-01-15T10:30:00Z] ...
    let inner = if bytes[0] == b'[' { &bytes[1..] } else { bytes };

    // Syslog priority header <34>...
    if inner.first() == Some(&b'<') {
        let close = inner.iter().take(6).position(|&b| b == b'>');
        if let Some(idx) = close {
            if idx > 1 && inner[1..idx].iter().all(|b| b.is_ascii_digit()) {
                return true;
            }
        }
    }

    // Syslog month prefix: "Jan 15 10:30:00" / "Jan  5 10:30:00"
    if inner.len() >= 4 {
        let prefix = &line[if bytes[0] == b'[' { 1 } else { 0 }..];
        if SYSLOG_MONTHS.iter().any(|m| prefix.starts_with(m))
            && prefix.as_bytes().get(3) == Some(&b' ')
        {
            let rest = prefix[4..].trim_start();
            if rest.as_bytes().first().is_some_and(|b| b.is_ascii_digit()) {
                return true;
            }
        }
    }

    // Digit-led token with date/time separators, at least 8 chars long
    // (e.g. 2024-01-15, 10:30:00, 15/Jan/2024:10:30:00)
    if inner.first().is_some_and(|b| b.is_ascii_digit()) {
        let mut has_separator = false;
        let mut len = 0usize;
        for &b in inner {
            if b.is_ascii_whitespace() || b == b']' {
                break;
            }
            if matches!(b, b'-' | b':' | b'/' | b'T' | b'.') {
                has_separator = true;
            }
            len += 1;
        }
        if has_separator && len >= 8 {
            return true;
        }
    }

    false
}
