//! Source front-end: turns handler and schema regions into raw mutation targets.
//!
//! The analyzer only talks to [`HandlerFrontend`]; how a handler body is
//! represented is the front-end's business. The shipped [`TextFrontend`] works
//! on text with comments and string interiors masked out, so byte offsets into
//! the masked copy are byte offsets into the real file.

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mutant::{OperatorCategory, TargetDetail};
use crate::span::SourceSpan;

/// Surface syntax family of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Python,
    Rust,
    /// JavaScript, TypeScript and other brace languages.
    CLike,
}

impl Dialect {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py" | "pyi") => Dialect::Python,
            Some("rs") => Dialect::Rust,
            _ => Dialect::CLike,
        }
    }

    pub fn true_literal(self) -> &'static str {
        match self {
            Dialect::Python => "True",
            _ => "true",
        }
    }

    pub fn false_literal(self) -> &'static str {
        match self {
            Dialect::Python => "False",
            _ => "false",
        }
    }

    pub fn swap_logical(self, op: &str) -> Option<&'static str> {
        match (self, op) {
            (Dialect::Python, "and") => Some("or"),
            (Dialect::Python, "or") => Some("and"),
            (Dialect::Rust | Dialect::CLike, "&&") => Some("||"),
            (Dialect::Rust | Dialect::CLike, "||") => Some("&&"),
            _ => None,
        }
    }

    fn line_comment(self) -> &'static [u8] {
        match self {
            Dialect::Python => b"#",
            _ => b"//",
        }
    }

    fn block_comments(self) -> bool {
        !matches!(self, Dialect::Python)
    }

    fn stop_words(self) -> &'static [&'static str] {
        match self {
            Dialect::Python => &[
                "if", "elif", "while", "return", "and", "or", "not", "assert", "lambda", "in",
                "is", "yield", "else",
            ],
            Dialect::Rust => &["return", "if", "while", "else", "let", "match", "in", "mut"],
            Dialect::CLike => &[
                "return", "if", "while", "else", "let", "const", "var", "typeof", "await", "case",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    Plain,
    Triple,
    Template,
    Char,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLiteral {
    /// Span including the quotes.
    pub span: Range<usize>,
    pub kind: StringKind,
}

/// A source file with comments and string interiors blanked out.
#[derive(Debug, Clone)]
pub struct LexedSource {
    pub file: PathBuf,
    pub dialect: Dialect,
    pub code: String,

    /// Same length as `code`; comments and string contents replaced by spaces, newlines kept.
    pub masked: String,
    pub strings: Vec<StringLiteral>,

    /// Offset of the first string literal that never closes.
    pub unterminated: Option<usize>,
    line_starts: Vec<usize>,
}

impl LexedSource {
    pub fn new(file: impl Into<PathBuf>, code: String) -> Self {
        let file = file.into();
        let dialect = Dialect::for_path(&file);
        Self::with_dialect(file, code, dialect)
    }

    pub fn with_dialect(file: impl Into<PathBuf>, code: String, dialect: Dialect) -> Self {
        let (masked, strings, unterminated) = mask(&code, dialect);

        let mut line_starts = vec![0];
        for (idx, b) in code.bytes().enumerate() {
            if b == b'\n' && idx + 1 < code.len() {
                line_starts.push(idx + 1);
            }
        }

        Self {
            file: file.into(),
            dialect,
            code,
            masked,
            strings,
            unterminated,
            line_starts,
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Byte range covering the 1-based inclusive line range, or `None` when out of range.
    pub fn line_range(&self, start_line: usize, end_line: usize) -> Option<Range<usize>> {
        if start_line == 0 || start_line > end_line || end_line > self.line_count() {
            return None;
        }
        let start = self.line_starts[start_line - 1];
        let end = self
            .line_starts
            .get(end_line)
            .copied()
            .unwrap_or(self.code.len());
        Some(start..end)
    }

    /// 1-based line containing `offset`.
    pub fn line_of(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&s| s <= offset)
    }

    pub fn span(&self, range: Range<usize>) -> SourceSpan {
        SourceSpan::new(self.file.clone(), range)
    }

    /// True when every bracket opened inside `range` closes inside it, in order.
    pub fn delimiters_balanced(&self, range: Range<usize>) -> bool {
        let mut stack = Vec::new();
        for &b in &self.masked.as_bytes()[range] {
            match b {
                b'(' | b'[' | b'{' => stack.push(b),
                b')' | b']' | b'}' => {
                    let want = match b {
                        b')' => b'(',
                        b']' => b'[',
                        _ => b'{',
                    };
                    if stack.pop() != Some(want) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        stack.is_empty()
    }
}

fn mask(code: &str, dialect: Dialect) -> (String, Vec<StringLiteral>, Option<usize>) {
    let bytes = code.as_bytes();
    let mut masked = bytes.to_vec();
    let mut strings = Vec::new();
    let mut unterminated = None;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i..].starts_with(dialect.line_comment()) {
            let end = line_end(bytes, i);
            blank(&mut masked, i..end);
            i = end;
            continue;
        }

        if dialect.block_comments() && bytes[i..].starts_with(b"/*") {
            let end = find(bytes, i + 2, b"*/").map_or(bytes.len(), |p| p + 2);
            blank(&mut masked, i..end);
            i = end;
            continue;
        }

        if let Some((delim, kind)) = string_opening(bytes, i, dialect) {
            let body = i + delim.len();
            match string_end(bytes, body, delim, kind, dialect) {
                Some(end) => {
                    blank(&mut masked, body..end - delim.len());
                    strings.push(StringLiteral { span: i..end, kind });
                    i = end;
                }
                None => {
                    unterminated.get_or_insert(i);
                    let end = match kind {
                        StringKind::Plain if dialect != Dialect::Rust => line_end(bytes, i),
                        StringKind::Char => line_end(bytes, i),
                        _ => bytes.len(),
                    };
                    blank(&mut masked, body.min(end)..end);
                    i = end;
                }
            }
            continue;
        }

        i += 1;
    }

    // Only whole runs between ASCII delimiters were blanked, so this stays valid UTF-8.
    let masked = String::from_utf8(masked)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
    (masked, strings, unterminated)
}

fn string_opening(bytes: &[u8], i: usize, dialect: Dialect) -> Option<(&'static [u8], StringKind)> {
    let rest = &bytes[i..];
    match (dialect, bytes[i]) {
        (Dialect::Python, b'"') if rest.starts_with(b"\"\"\"") => Some((b"\"\"\"", StringKind::Triple)),
        (Dialect::Python, b'\'') if rest.starts_with(b"'''") => Some((b"'''", StringKind::Triple)),
        (_, b'"') => Some((b"\"", StringKind::Plain)),
        (Dialect::Python | Dialect::CLike, b'\'') => Some((b"'", StringKind::Plain)),
        (Dialect::CLike, b'`') => Some((b"`", StringKind::Template)),
        (Dialect::Rust, b'\'') => {
            // `'a'` and `'\n'` are char literals, `'a` is a lifetime.
            let is_char = bytes.get(i + 1) == Some(&b'\\') || bytes.get(i + 2) == Some(&b'\'');
            is_char.then_some((b"'", StringKind::Char))
        }
        _ => None,
    }
}

fn string_end(
    bytes: &[u8],
    mut j: usize,
    delim: &[u8],
    kind: StringKind,
    dialect: Dialect,
) -> Option<usize> {
    let single_line = match kind {
        StringKind::Char => true,
        StringKind::Plain => dialect != Dialect::Rust,
        StringKind::Triple | StringKind::Template => false,
    };

    while j < bytes.len() {
        if bytes[j] == b'\\' {
            j += 2;
            continue;
        }
        if bytes[j..].starts_with(delim) {
            return Some(j + delim.len());
        }
        if single_line && bytes[j] == b'\n' {
            return None;
        }
        j += 1;
    }
    None
}

fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| from + p)
}

fn find(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

fn blank(masked: &mut [u8], range: Range<usize>) {
    for b in &mut masked[range] {
        if *b != b'\n' {
            *b = b' ';
        }
    }
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// One extracted mutation point, before ownership is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTarget {
    pub span: Range<usize>,
    pub category: OperatorCategory,
    pub detail: TargetDetail,
}

/// A candidate the front-end could not rewrite safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    pub offset: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub targets: Vec<RawTarget>,
    pub ambiguous: Vec<Ambiguity>,
}

impl Extraction {
    pub fn merge(&mut self, other: Extraction) {
        self.targets.extend(other.targets);
        self.ambiguous.extend(other.ambiguous);
    }
}

/// Capability interface the analyzer uses to look into handler bodies.
pub trait HandlerFrontend {
    /// Comparable validation bounds (min/max/length checks).
    fn extract_constraints(&self, src: &LexedSource, region: Range<usize>) -> Extraction;

    /// Comparisons and boolean connectives in control flow.
    fn extract_branches(&self, src: &LexedSource, region: Range<usize>) -> Extraction;

    /// Status codes, booleans and strings returned by the handler.
    fn extract_literals(&self, src: &LexedSource, region: Range<usize>) -> Extraction;
}

/// Dialect-aware textual front-end.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFrontend;

static KEYWORD_BOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(ge|gt|le|lt|min|max|minimum|maximum|exclusive_minimum|exclusive_maximum|min_length|max_length|min_items|max_items|minLength|maxLength|minItems|maxItems)\s*[=:]\s*(-?\d+)",
    )
    .expect("keyword bound pattern")
});

static METHOD_BOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(min|max|gte|lte|gt|lt|length|minLength|maxLength)\(\s*(-?\d+)")
        .expect("method bound pattern")
});

static STATUS_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status(?:_?code)?|abort)\s*[=:(]\s*([1-5]\d\d)\b")
        .expect("status keyword pattern")
});

static STATUS_RETURN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\breturn\b[^\n;]*,\s*([1-5]\d\d)\b").expect("status return pattern")
});

static PY_BOOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(True|False)\b").expect("python bool pattern"));

static C_BOOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(true|false)\b").expect("bool pattern"));

impl HandlerFrontend for TextFrontend {
    fn extract_constraints(&self, src: &LexedSource, region: Range<usize>) -> Extraction {
        let masked = src.masked.as_bytes();
        let text = &src.masked[region.clone()];
        let mut out = Extraction::default();

        for caps in KEYWORD_BOUND.captures_iter(text) {
            let (Some(whole), Some(num)) = (caps.get(0), caps.get(2)) else {
                continue;
            };
            let value_span = region.start + num.start()..region.start + num.end();
            let clause = keyword_clause(masked, region.start + whole.start(), value_span.end, &region);
            push_bound(src, &mut out, value_span, clause);
        }

        for caps in METHOD_BOUND.captures_iter(text) {
            let (Some(whole), Some(num)) = (caps.get(0), caps.get(2)) else {
                continue;
            };
            let start = region.start + whole.start();
            let value_span = region.start + num.start()..region.start + num.end();

            // `.min(3)` or `.min(3, "message")`: the clause runs to the matching paren.
            let open = start + masked[start..].iter().position(|&b| b == b'(').unwrap_or(0);
            match matching_close(masked, open, region.end) {
                Some(close) => push_bound(src, &mut out, value_span, start..close + 1),
                None => out.ambiguous.push(Ambiguity {
                    offset: start,
                    reason: "validator call is not closed inside the region".to_string(),
                }),
            }
        }

        out
    }

    fn extract_branches(&self, src: &LexedSource, region: Range<usize>) -> Extraction {
        let m = src.masked.as_bytes();
        let mut out = Extraction::default();
        let mut i = region.start;

        while i < region.end {
            if let Some(op) = comparison_at(m, i, src.dialect) {
                let op_end = i + op.len();
                match comparison_extent(m, i, op_end, src.dialect, &region) {
                    Some(expr) => out.targets.push(RawTarget {
                        span: i..op_end,
                        category: OperatorCategory::Comparison,
                        detail: TargetDetail::Comparison {
                            op: op.to_string(),
                            expr: src.span(expr),
                        },
                    }),
                    None => out.ambiguous.push(Ambiguity {
                        offset: i,
                        reason: format!("cannot delimit the operands of `{op}`"),
                    }),
                }
                i = op_end;
                continue;
            }

            if let Some(op) = logical_at(m, i, src.dialect) {
                out.targets.push(RawTarget {
                    span: i..i + op.len(),
                    category: OperatorCategory::Logical,
                    detail: TargetDetail::Logical { op: op.to_string() },
                });
                i += op.len();
                continue;
            }

            i += 1;
        }

        out
    }

    fn extract_literals(&self, src: &LexedSource, region: Range<usize>) -> Extraction {
        let m = src.masked.as_bytes();
        let text = &src.masked[region.clone()];
        let mut out = Extraction::default();

        let mut statuses = BTreeSet::new();
        for caps in STATUS_KEYWORD.captures_iter(text) {
            if let Some(code) = caps.get(1) {
                statuses.insert((region.start + code.start(), region.start + code.end()));
            }
        }
        for caps in STATUS_RETURN.captures_iter(text) {
            if let Some(code) = caps.get(1) {
                let end = region.start + code.end();
                // Only a trailing tuple element counts: `return body, 201`.
                let mut rest = m[end..line_end(m, end)]
                    .iter()
                    .filter(|b| !b.is_ascii_whitespace());
                if rest.next().is_none_or(|&b| b == b')' || b == b';') {
                    statuses.insert((region.start + code.start(), end));
                }
            }
        }
        for (start, end) in statuses {
            let code: u16 = src.masked[start..end].parse().unwrap_or(0);
            if !(100..=599).contains(&code) {
                continue;
            }
            out.targets.push(RawTarget {
                span: start..end,
                category: OperatorCategory::StatusLiteral,
                detail: TargetDetail::Status { code },
            });
        }

        let bools: &Regex = match src.dialect {
            Dialect::Python => &*PY_BOOL,
            _ => &*C_BOOL,
        };
        for found in bools.find_iter(text) {
            let start = region.start + found.start();
            if start > 0 && m[start - 1] == b'.' {
                continue;
            }
            out.targets.push(RawTarget {
                span: start..region.start + found.end(),
                category: OperatorCategory::BooleanLiteral,
                detail: TargetDetail::Boolean {
                    value: found.as_str().eq_ignore_ascii_case("true"),
                },
            });
        }

        for s in &src.strings {
            if s.kind == StringKind::Plain
                && s.span.start >= region.start
                && s.span.end <= region.end
            {
                out.targets.push(RawTarget {
                    span: s.span.clone(),
                    category: OperatorCategory::StringLiteral,
                    detail: TargetDetail::Text,
                });
            }
        }

        out
    }
}

fn push_bound(src: &LexedSource, out: &mut Extraction, value_span: Range<usize>, clause: Range<usize>) {
    let m = src.masked.as_bytes();
    let next = m.get(value_span.end).copied();
    let after = m.get(value_span.end + 1).copied();

    if next == Some(b'.') && after.is_some_and(|b| b.is_ascii_digit()) {
        out.ambiguous.push(Ambiguity {
            offset: value_span.start,
            reason: "non-integer bound".to_string(),
        });
        return;
    }
    if next.is_some_and(is_ident) {
        out.ambiguous.push(Ambiguity {
            offset: value_span.start,
            reason: "unsupported numeric literal in bound".to_string(),
        });
        return;
    }

    match src.code[value_span.clone()].parse::<i64>() {
        Ok(value) => out.targets.push(RawTarget {
            span: value_span,
            category: OperatorCategory::Boundary,
            detail: TargetDetail::Bound {
                value,
                clause: src.span(clause),
            },
        }),
        Err(_) => out.ambiguous.push(Ambiguity {
            offset: value_span.start,
            reason: "bound does not fit in 64 bits".to_string(),
        }),
    }
}

/// Extent of `key=value` plus one adjoining separator, so removing it leaves a valid argument list.
fn keyword_clause(m: &[u8], start: usize, end: usize, region: &Range<usize>) -> Range<usize> {
    let is_blank = |b: u8| b == b' ' || b == b'\t';

    let mut j = end;
    while j < region.end && is_blank(m[j]) {
        j += 1;
    }
    if j < region.end && m[j] == b',' {
        j += 1;
        while j < region.end && is_blank(m[j]) {
            j += 1;
        }
        return start..j;
    }

    let mut k = start;
    while k > region.start && is_blank(m[k - 1]) {
        k -= 1;
    }
    if k > region.start && m[k - 1] == b',' {
        return k - 1..end;
    }

    start..end
}

fn matching_close(m: &[u8], open: usize, limit: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, &b) in m.iter().enumerate().take(limit).skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_op_char(b: u8) -> bool {
    matches!(b, b'<' | b'>' | b'=' | b'!')
}

fn comparison_at(m: &[u8], i: usize, dialect: Dialect) -> Option<&'static str> {
    let prev = if i > 0 { m[i - 1] } else { b' ' };
    let rest = &m[i..];

    if dialect == Dialect::CLike {
        for op in ["===", "!=="] {
            if rest.starts_with(op.as_bytes()) {
                let next = m.get(i + 3).copied();
                return (!is_op_char(prev) && next != Some(b'=')).then_some(op);
            }
        }
    }

    for op in ["==", "!=", "<=", ">="] {
        if rest.starts_with(op.as_bytes()) {
            let next = m.get(i + 2).copied();
            return (!is_op_char(prev) && next != Some(b'=')).then_some(op);
        }
    }

    // Bare `<` / `>` only with whitespace on both sides, so generics and shifts stay out.
    for op in ["<", ">"] {
        if rest.starts_with(op.as_bytes()) {
            let next = m.get(i + 1).copied();
            let spaced = prev.is_ascii_whitespace() && next.is_some_and(|b| b.is_ascii_whitespace());
            return spaced.then_some(op);
        }
    }

    None
}

fn logical_at(m: &[u8], i: usize, dialect: Dialect) -> Option<&'static str> {
    match dialect {
        Dialect::Python => ["and", "or"].into_iter().find(|w| {
            m[i..].starts_with(w.as_bytes())
                && (i == 0 || !is_ident(m[i - 1]))
                && !m.get(i + w.len()).copied().is_some_and(is_ident)
        }),
        Dialect::Rust | Dialect::CLike => {
            let op = ["&&", "||"].into_iter().find(|op| m[i..].starts_with(op.as_bytes()))?;
            if m.get(i + 2) == Some(&op.as_bytes()[0]) {
                return None;
            }
            // Closures (`|| x`) and double references (`&&x`) are not connectives.
            let prev = m[..i].iter().rev().find(|b| !b.is_ascii_whitespace()).copied()?;
            (is_ident(prev) || matches!(prev, b')' | b']' | b'"' | b'\'')).then_some(op)
        }
    }
}

fn is_assignment(m: &[u8], pos: usize) -> bool {
    let prev = if pos > 0 { m[pos - 1] } else { b' ' };
    let next = m.get(pos + 1).copied().unwrap_or(b' ');
    !is_op_char(prev) && next != b'=' && next != b'>'
}

fn is_stop_word(word: &[u8], dialect: Dialect) -> bool {
    dialect.stop_words().iter().any(|w| w.as_bytes() == word)
}

/// Byte range of the whole comparison around an operator, trimmed of whitespace.
fn comparison_extent(
    m: &[u8],
    op_start: usize,
    op_end: usize,
    dialect: Dialect,
    region: &Range<usize>,
) -> Option<Range<usize>> {
    let mut i = op_start;
    let mut depth = 0i32;
    while i > region.start {
        let c = m[i - 1];
        match c {
            b')' | b']' => depth += 1,
            b'(' | b'[' => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            b'{' | b'}' | b';' | b',' | b'\n' | b':' | b'?' if depth == 0 => break,
            b'=' if depth == 0 && (is_assignment(m, i - 1) || m.get(i) == Some(&b'>')) => break,
            b'>' if depth == 0 && i >= 2 && m[i - 2] == b'=' => break,
            b'&' | b'|' if depth == 0 && i >= 2 && m[i - 2] == c => break,
            _ if depth == 0 && is_ident(c) => {
                let mut ws = i - 1;
                while ws > region.start && is_ident(m[ws - 1]) {
                    ws -= 1;
                }
                if is_stop_word(&m[ws..i], dialect) {
                    break;
                }
                i = ws;
                continue;
            }
            _ => {}
        }
        i -= 1;
    }
    let mut left = i;
    while left < op_start && m[left].is_ascii_whitespace() {
        left += 1;
    }

    let mut j = op_end;
    depth = 0;
    while j < region.end {
        let c = m[j];
        match c {
            b'(' | b'[' => depth += 1,
            b')' | b']' => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            b'{' | b'}' | b';' | b',' | b'\n' | b':' | b'?' if depth == 0 => break,
            b'&' | b'|' if depth == 0 && m.get(j + 1) == Some(&c) => break,
            b'=' if depth == 0 && is_assignment(m, j) => break,
            _ if depth == 0 && is_ident(c) && (j == 0 || !is_ident(m[j - 1])) => {
                let mut we = j;
                while we < region.end && is_ident(m[we]) {
                    we += 1;
                }
                if is_stop_word(&m[j..we], dialect) {
                    break;
                }
                j = we;
                continue;
            }
            _ => {}
        }
        j += 1;
    }
    let mut right = j;
    while right > op_end && m[right - 1].is_ascii_whitespace() {
        right -= 1;
    }

    (left < op_start && right > op_end).then_some(left..right)
}
