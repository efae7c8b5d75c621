//! Placeholder tokenizer (spec.md §4.2, component C3).
//!
//! A single left-to-right scan over the SQL body, tracking lexer state
//! (plain code, single-quoted string, line comment, block comment) the
//! same way `bird::query::parser` tracks state while it walks the shell
//! query micro-language — no parser-combinator crate, just an explicit
//! index and a small state enum.
//!
//! Ordinary `{{...}}` occurrences inside a string or comment are inert
//! text (a user can write a literal `{{` in a WHERE-clause string).
//! The one exception is the sole string argument of a `parquet_scan(...)`
//! call: there, `{{...}}` is recognized and the **scan-path rule** is
//! enforced — the argument must be exactly one single-quoted literal
//! built only from `{{config|bind|path|ident ...}}` placeholders and
//! literal characters, with no `||` concatenation or other expression.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Param,
    Ident,
    Path,
    Bind,
    Mat,
    Import,
    Config,
    Secret,
}

impl PlaceholderKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "param" => Some(Self::Param),
            "ident" => Some(Self::Ident),
            "path" => Some(Self::Path),
            "bind" => Some(Self::Bind),
            "mat" => Some(Self::Mat),
            "import" => Some(Self::Import),
            "config" => Some(Self::Config),
            "secret" => Some(Self::Secret),
            _ => None,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Param => "param",
            Self::Ident => "ident",
            Self::Path => "path",
            Self::Bind => "bind",
            Self::Mat => "mat",
            Self::Import => "import",
            Self::Config => "config",
            Self::Secret => "secret",
        }
    }

    /// Kinds permitted inside a `parquet_scan(...)` argument (§4.2).
    fn allowed_in_scan_path(self) -> bool {
        matches!(self, Self::Config | Self::Bind | Self::Path | Self::Ident)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderSpan {
    pub start: usize,
    pub end: usize,
    pub kind: PlaceholderKind,
    pub name: String,
    /// True if this placeholder lies inside a `parquet_scan('...')` argument.
    pub in_scan_path: bool,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Validate `NAME` against `[A-Za-z_][A-Za-z0-9_]*`.
fn is_valid_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if is_name_start(c) => {}
        _ => return false,
    }
    chars.all(is_name_continue)
}

/// Parse one `{{...}}` occurrence starting at `start` (the index of the
/// first `{`). Returns the span and the index just past the closing `}}`.
fn parse_one(report_id: &str, sql: &str, start: usize, in_scan_path: bool) -> Result<(PlaceholderSpan, usize)> {
    let rest = &sql[start + 2..];
    let close = rest.find("}}").ok_or_else(|| Error::InvalidPlaceholder {
        report: report_id.to_string(),
        offset: start,
        detail: "unterminated '{{'".to_string(),
    })?;
    let body = &rest[..close];
    let end = start + 2 + close + 2;

    let mut parts = body.splitn(2, char::is_whitespace);
    let tag = parts.next().unwrap_or("").trim();
    let name = parts.next().unwrap_or("").trim();

    let kind = PlaceholderKind::from_tag(tag).ok_or_else(|| Error::InvalidPlaceholder {
        report: report_id.to_string(),
        offset: start,
        detail: format!("unknown placeholder kind {tag:?}"),
    })?;

    if name.is_empty() || !is_valid_name(name) {
        return Err(Error::InvalidPlaceholder {
            report: report_id.to_string(),
            offset: start,
            detail: format!("invalid placeholder name {name:?}"),
        });
    }

    if in_scan_path && !kind.allowed_in_scan_path() {
        return Err(Error::IllegalScanPath {
            report: report_id.to_string(),
            detail: format!(
                "{{{{{} {}}}}} is not allowed inside a parquet_scan path (only config|bind|path|ident)",
                tag, name
            ),
        });
    }

    Ok((
        PlaceholderSpan {
            start,
            end,
            kind,
            name: name.to_string(),
            in_scan_path,
        },
        end,
    ))
}

/// Scan forward from the index of an opening `'` (the quote byte itself
/// at `quote_idx`), handling `''` as an escaped literal quote. Returns
/// `(inner_start, inner_end, after_closing_quote)`.
fn scan_quoted_literal(sql: &str, quote_idx: usize) -> std::result::Result<(usize, usize, usize), ()> {
    let bytes = sql.as_bytes();
    let inner_start = quote_idx + 1;
    let mut i = inner_start;
    loop {
        if i >= bytes.len() {
            return Err(());
        }
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return Ok((inner_start, i, i + 1));
        }
        i += 1;
    }
}

#[derive(PartialEq)]
enum State {
    Code,
    SingleQuote,
    LineComment,
    BlockComment,
}

/// Tokenize every `{{...}}` occurrence in `sql`, enforcing the scan-path
/// rule for `parquet_scan(...)` arguments along the way.
pub fn parse_placeholders(report_id: &str, sql: &str) -> Result<Vec<PlaceholderSpan>> {
    let mut spans = Vec::new();
    let mut state = State::Code;
    let mut i = 0usize;

    while i < sql.len() {
        match state {
            State::Code => {
                if sql[i..].get(..13).map(|s| s.eq_ignore_ascii_case("parquet_scan(")).unwrap_or(false) {
                    i = handle_parquet_scan(report_id, sql, i, &mut spans)?;
                    continue;
                }
                if sql.as_bytes()[i] == b'\'' {
                    state = State::SingleQuote;
                    i += 1;
                    continue;
                }
                if sql[i..].starts_with("--") {
                    state = State::LineComment;
                    i += 2;
                    continue;
                }
                if sql[i..].starts_with("/*") {
                    state = State::BlockComment;
                    i += 2;
                    continue;
                }
                if sql[i..].starts_with("{{") {
                    let (span, new_i) = parse_one(report_id, sql, i, false)?;
                    spans.push(span);
                    i = new_i;
                    continue;
                }
                i += 1;
            }
            State::SingleQuote => {
                if sql.as_bytes()[i] == b'\'' {
                    if sql.as_bytes().get(i + 1) == Some(&b'\'') {
                        i += 2;
                        continue;
                    }
                    state = State::Code;
                    i += 1;
                    continue;
                }
                // Ordinary string: '{{' here is inert literal text.
                i += 1;
            }
            State::LineComment => {
                if sql.as_bytes()[i] == b'\n' {
                    state = State::Code;
                }
                i += 1;
            }
            State::BlockComment => {
                if sql[i..].starts_with("*/") {
                    state = State::Code;
                    i += 2;
                    continue;
                }
                i += 1;
            }
        }
    }

    Ok(spans)
}

/// Handle a `parquet_scan(` call found at `call_start` (index of the
/// `p` in `parquet_scan`). Validates and tokenizes its path argument,
/// returns the index just past the argument's closing quote.
fn handle_parquet_scan(
    report_id: &str,
    sql: &str,
    call_start: usize,
    spans: &mut Vec<PlaceholderSpan>,
) -> Result<usize> {
    let paren_idx = call_start + "parquet_scan(".len() - 1;
    let mut i = paren_idx + 1;
    let bytes = sql.as_bytes();

    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }

    if i >= bytes.len() || bytes[i] != b'\'' {
        return Err(Error::IllegalScanPath {
            report: report_id.to_string(),
            detail: "parquet_scan argument must begin with a single-quoted literal".to_string(),
        });
    }

    let (inner_start, inner_end, after_quote) =
        scan_quoted_literal(sql, i).map_err(|_| Error::IllegalScanPath {
            report: report_id.to_string(),
            detail: "unterminated string literal in parquet_scan argument".to_string(),
        })?;

    // Tokenize placeholders inside the literal, restricted to the
    // scan-path-safe kinds.
    let mut j = inner_start;
    while j < inner_end {
        if sql[j..inner_end].starts_with("{{") {
            let (span, new_j) = parse_one(report_id, sql, j, true)?;
            spans.push(span);
            j = new_j;
            continue;
        }
        j += 1;
    }

    // No concatenation/expression allowed after the literal: next
    // non-whitespace byte must close the argument or start the next one.
    let mut k = after_quote;
    while k < bytes.len() && bytes[k].is_ascii_whitespace() {
        k += 1;
    }
    match bytes.get(k) {
        Some(b',') | Some(b')') => Ok(after_quote),
        _ => Err(Error::IllegalScanPath {
            report: report_id.to_string(),
            detail: "parquet_scan path must be a single literal, not a concatenated expression"
                .to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_basic_param() {
        let sql = "SELECT * FROM t WHERE region = {{param Region}}";
        let spans = parse_placeholders("r", sql).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, PlaceholderKind::Param);
        assert_eq!(spans[0].name, "Region");
        assert!(!spans[0].in_scan_path);
    }

    #[test]
    fn ignores_braces_in_string_literal() {
        let sql = "SELECT '{{not a placeholder}}' AS x";
        let spans = parse_placeholders("r", sql).unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn ignores_braces_in_comment() {
        let sql = "-- {{param X}}\nSELECT 1";
        let spans = parse_placeholders("r", sql).unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn recognizes_scan_path_placeholders() {
        let sql = "SELECT * FROM parquet_scan('{{config DATA_ROOT}}/north.parquet')";
        let spans = parse_placeholders("r", sql).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, PlaceholderKind::Config);
        assert!(spans[0].in_scan_path);
    }

    #[test]
    fn rejects_param_inside_scan_path() {
        let sql = "SELECT * FROM parquet_scan('{{param X}}.parquet')";
        let err = parse_placeholders("r", sql).unwrap_err();
        assert_eq!(err.code(), "IllegalScanPath");
    }

    #[test]
    fn rejects_concatenation_in_scan_path() {
        let sql = "SELECT * FROM parquet_scan('{{config DATA_ROOT}}/' || {{bind x}} || '.parquet')";
        let err = parse_placeholders("r", sql).unwrap_err();
        assert_eq!(err.code(), "IllegalScanPath");
    }

    #[test]
    fn rejects_unknown_kind() {
        let sql = "SELECT {{frobnicate X}}";
        let err = parse_placeholders("r", sql).unwrap_err();
        assert_eq!(err.code(), "InvalidPlaceholder");
    }

    #[test]
    fn rejects_malformed_name() {
        let sql = "SELECT {{param 1bad}}";
        let err = parse_placeholders("r", sql).unwrap_err();
        assert_eq!(err.code(), "InvalidPlaceholder");
    }
}
