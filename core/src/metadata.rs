//! Metadata block parser and SQL-body validation (spec.md §4.1, component C2).
//!
//! Scans the raw report text for `/***NAME\n...\n***/` headers at line
//! starts. Everything between a pair of delimiters is YAML; everything
//! else is SQL. Each block's YAML is deserialized into a small
//! `*Yaml`-suffixed struct with `#[serde(deny_unknown_fields)]`, then
//! lowered into the [`MetadataBlock`] variant the rest of the crate
//! works with.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fingerprint::source_fingerprint;
use crate::placeholder::parse_placeholders;
use crate::report::{
    AppliesTo, AppliesToMode, BindingKind, BindingSpec, CacheSpec, ImportSpec, LiteralSourceSpec,
    MaterializationSpec, MetadataBlock, ParamSpec, ParamType, Report, Scope, SecretSpec,
};

const BLOCK_NAMES: &[&str] = &[
    "PARAMS",
    "CONFIG",
    "SOURCES",
    "CACHE",
    "TABLE",
    "SEARCH",
    "FACETS",
    "CHARTS",
    "DERIVED_PARAMS",
    "LITERAL_SOURCES",
    "BINDINGS",
    "IMPORTS",
    "SECRETS",
];

/// A raw `/***NAME ... ***/` block found in the source, before YAML parsing.
struct RawBlock<'a> {
    name: &'a str,
    yaml: &'a str,
}

/// Split `source` into its metadata blocks and the remaining SQL text.
/// Blocks must start at a line beginning with `/***NAME` and end at the
/// first `***/`. Two blocks must be separated only by whitespace (never
/// by SQL) — enforced by requiring everything outside blocks, once
/// trimmed, to contain no block delimiters at all (a leftover `/***` or
/// `***/` outside a recognized header is itself an error).
fn split_blocks(report_id: &str, source: &str) -> Result<(Vec<RawBlock<'_>>, String)> {
    let mut blocks = Vec::new();
    let mut sql_parts = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut rest = source;
    let mut consumed_sql_so_far = String::new();

    loop {
        match find_block_header(rest) {
            None => {
                if rest.contains("***/") || rest.contains("/***") {
                    return Err(Error::InvalidMetadataBlock {
                        report: report_id.to_string(),
                        detail: "stray metadata delimiter outside a recognized block".to_string(),
                    });
                }
                consumed_sql_so_far.push_str(rest);
                sql_parts.push(consumed_sql_so_far);
                break;
            }
            Some((pre, name, yaml, post)) => {
                if !name_is_known(name) {
                    return Err(Error::InvalidMetadataBlock {
                        report: report_id.to_string(),
                        detail: format!("unknown metadata block name {name:?}"),
                    });
                }
                if !seen.insert(name.to_string()) {
                    return Err(Error::InvalidMetadataBlock {
                        report: report_id.to_string(),
                        detail: format!("duplicate metadata block {name:?}"),
                    });
                }
                if !pre.trim().is_empty() {
                    return Err(Error::InvalidMetadataBlock {
                        report: report_id.to_string(),
                        detail: "metadata blocks must be separated from SQL by whitespace only"
                            .to_string(),
                    });
                }
                consumed_sql_so_far.push_str(pre);
                blocks.push(RawBlock { name, yaml });
                rest = post;
            }
        }
    }

    Ok((blocks, sql_parts.concat()))
}

fn name_is_known(name: &str) -> bool {
    BLOCK_NAMES.contains(&name)
}

/// Find the next `/***NAME\n...\n***/` header in `text`. Returns
/// `(before, name, yaml_body, after)`.
fn find_block_header(text: &str) -> Option<(&str, &str, &str, &str)> {
    let marker_pos = text.find("/***")?;
    // Header name runs from after `/***` to end of line.
    let after_marker = &text[marker_pos + 4..];
    let name_end = after_marker.find('\n')?;
    let name = after_marker[..name_end].trim();
    let body_start = marker_pos + 4 + name_end + 1;
    let close_rel = text[body_start..].find("***/")?;
    let yaml = &text[body_start..body_start + close_rel];
    let after = &text[body_start + close_rel + 4..];
    let before = &text[..marker_pos];
    Some((before, name, yaml, after))
}

// ---- YAML-facing structs (author-visible shape) ----

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamSpecYaml {
    name: String,
    #[serde(rename = "type")]
    param_type: String,
    scope: String,
    applies_to: Option<AppliesToYaml>,
    default: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AppliesToYaml {
    cte: String,
    mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BindingSpecYaml {
    id: String,
    source_cte: String,
    key_param: String,
    key_column: String,
    value_column: String,
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImportSpecYaml {
    id: String,
    target_report: String,
    #[serde(default)]
    pass_params: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LiteralSourceSpecYaml {
    id: String,
    from_cte: String,
    value_column: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheSpecYaml {
    ttl_seconds: Option<u64>,
    stale_while_revalidate: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretSpecYaml {
    name: String,
}

fn yaml_err(report_id: &str, block: &str, e: serde_yaml::Error) -> Error {
    Error::InvalidMetadataBlock {
        report: report_id.to_string(),
        detail: format!("{block}: {e}"),
    }
}

fn parse_applies_to(report_id: &str, a: AppliesToYaml) -> Result<AppliesTo> {
    let mode = match a.mode.as_str() {
        "wrapper" => AppliesToMode::Wrapper,
        "inline" => AppliesToMode::Inline,
        other => {
            return Err(Error::InvalidMetadataBlock {
                report: report_id.to_string(),
                detail: format!("unknown applies_to mode {other:?}"),
            })
        }
    };
    Ok(AppliesTo {
        cte_name: a.cte,
        mode,
    })
}

fn parse_param_spec(report_id: &str, p: ParamSpecYaml) -> Result<ParamSpec> {
    let scope = match p.scope.as_str() {
        "data" => Scope::Data,
        "view" => Scope::View,
        "hybrid" => Scope::Hybrid,
        other => {
            return Err(Error::InvalidMetadataBlock {
                report: report_id.to_string(),
                detail: format!("unknown param scope {other:?}"),
            })
        }
    };
    let param_type = parse_type_str(report_id, &p.param_type)?;
    let applies_to = p.applies_to.map(|a| parse_applies_to(report_id, a)).transpose()?;
    Ok(ParamSpec {
        name: p.name,
        param_type,
        scope,
        applies_to,
        default: p.default,
    })
}

fn parse_binding_spec(report_id: &str, b: BindingSpecYaml) -> Result<BindingSpec> {
    let kind = match b.kind.as_str() {
        "partition" => BindingKind::Partition,
        "demo" => BindingKind::Demo,
        "identifier" => BindingKind::Identifier,
        "literal" => BindingKind::Literal,
        other => {
            return Err(Error::InvalidMetadataBlock {
                report: report_id.to_string(),
                detail: format!("unknown binding kind {other:?}"),
            })
        }
    };
    Ok(BindingSpec {
        id: b.id,
        source_cte: b.source_cte,
        key_param: b.key_param,
        key_column: b.key_column,
        value_column: b.value_column,
        kind,
    })
}

/// Parse the closed type grammar from spec.md §6.2, e.g. `Optional[int]`,
/// `List[str]`, `Literal[a,b,c]`, `InjectedIdentLiteral[{A,B,C}]`.
pub fn parse_type_str(report_id: &str, s: &str) -> Result<ParamType> {
    let s = s.trim();
    let bad = |detail: String| -> Error {
        Error::InvalidMetadataBlock {
            report: report_id.to_string(),
            detail,
        }
    };

    if let Some(inner) = strip_wrapper(s, "Optional") {
        return Ok(ParamType::Optional {
            inner: Box::new(parse_type_str(report_id, inner)?),
        });
    }
    if let Some(inner) = strip_wrapper(s, "List") {
        return Ok(ParamType::List {
            inner: Box::new(parse_type_str(report_id, inner)?),
        });
    }
    if let Some(inner) = strip_wrapper(s, "Literal") {
        let values = inner
            .split(',')
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>();
        if values.is_empty() {
            return Err(bad("Literal[...] needs at least one value".to_string()));
        }
        return Ok(ParamType::Literal { values });
    }
    if let Some(inner) = strip_wrapper(s, "InjectedIdentLiteral") {
        let inner = inner.trim().strip_prefix('{').and_then(|i| i.strip_suffix('}')).ok_or_else(|| {
            bad("InjectedIdentLiteral[...] expects a {A,B,C} set".to_string())
        })?;
        let allowed = inner
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>();
        if allowed.is_empty() {
            return Err(bad("InjectedIdentLiteral set cannot be empty".to_string()));
        }
        return Ok(ParamType::InjectedIdentLiteral { allowed });
    }

    match s {
        "int" => Ok(ParamType::Int),
        "float" => Ok(ParamType::Float),
        "bool" => Ok(ParamType::Bool),
        "date" => Ok(ParamType::Date),
        "datetime" => Ok(ParamType::DateTime),
        "str" => Ok(ParamType::Str),
        "InjectedStr" => Ok(ParamType::InjectedStr),
        "InjectedPathStr" => Ok(ParamType::InjectedPathStr),
        other => Err(bad(format!("unknown param type {other:?}"))),
    }
}

fn strip_wrapper<'a>(s: &'a str, wrapper: &str) -> Option<&'a str> {
    let prefix = format!("{wrapper}[");
    s.strip_prefix(&prefix).and_then(|rest| rest.strip_suffix(']'))
}

/// Parse one metadata block's YAML body into a typed [`MetadataBlock`].
fn parse_block(report_id: &str, raw: &RawBlock<'_>) -> Result<MetadataBlock> {
    let y = raw.yaml;
    match raw.name {
        "PARAMS" => {
            let specs: Vec<ParamSpecYaml> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "PARAMS", e))?;
            let specs = specs
                .into_iter()
                .map(|p| parse_param_spec(report_id, p))
                .collect::<Result<Vec<_>>>()?;
            Ok(MetadataBlock::Params(specs))
        }
        "DERIVED_PARAMS" => {
            let specs: Vec<ParamSpecYaml> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "DERIVED_PARAMS", e))?;
            let specs = specs
                .into_iter()
                .map(|p| parse_param_spec(report_id, p))
                .collect::<Result<Vec<_>>>()?;
            Ok(MetadataBlock::DerivedParams(specs))
        }
        "CONFIG" => {
            let map: HashMap<String, String> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "CONFIG", e))?;
            Ok(MetadataBlock::Config(map))
        }
        "SOURCES" => {
            let list: Vec<String> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "SOURCES", e))?;
            Ok(MetadataBlock::Sources(list))
        }
        "CACHE" => {
            let c: CacheSpecYaml =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "CACHE", e))?;
            Ok(MetadataBlock::Cache(CacheSpec {
                ttl_seconds: c.ttl_seconds,
                stale_while_revalidate: c.stale_while_revalidate,
            }))
        }
        "TABLE" => {
            let map: HashMap<String, String> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "TABLE", e))?;
            Ok(MetadataBlock::Table(map))
        }
        "SEARCH" => {
            let map: HashMap<String, String> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "SEARCH", e))?;
            Ok(MetadataBlock::Search(map))
        }
        "FACETS" => {
            let list: Vec<String> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "FACETS", e))?;
            Ok(MetadataBlock::Facets(list))
        }
        "CHARTS" => {
            let list: Vec<String> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "CHARTS", e))?;
            Ok(MetadataBlock::Charts(list))
        }
        "LITERAL_SOURCES" => {
            let list: Vec<LiteralSourceSpecYaml> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "LITERAL_SOURCES", e))?;
            Ok(MetadataBlock::LiteralSources(
                list.into_iter()
                    .map(|l| LiteralSourceSpec {
                        id: l.id,
                        from_cte: l.from_cte,
                        value_column: l.value_column,
                    })
                    .collect(),
            ))
        }
        "BINDINGS" => {
            let list: Vec<BindingSpecYaml> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "BINDINGS", e))?;
            let list = list
                .into_iter()
                .map(|b| parse_binding_spec(report_id, b))
                .collect::<Result<Vec<_>>>()?;
            Ok(MetadataBlock::Bindings(list))
        }
        "IMPORTS" => {
            let list: Vec<ImportSpecYaml> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "IMPORTS", e))?;
            Ok(MetadataBlock::Imports(
                list.into_iter()
                    .map(|i| ImportSpec {
                        id: i.id,
                        target_report: i.target_report,
                        pass_params: i.pass_params,
                    })
                    .collect(),
            ))
        }
        "SECRETS" => {
            let list: Vec<SecretSpecYaml> =
                serde_yaml::from_str(y).map_err(|e| yaml_err(report_id, "SECRETS", e))?;
            Ok(MetadataBlock::Secrets(
                list.into_iter().map(|s| SecretSpec { name: s.name }).collect(),
            ))
        }
        other => unreachable!("unknown block name survived name_is_known: {other}"),
    }
}

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "CREATE", "ATTACH", "INSTALL", "LOAD", "INSERT", "UPDATE", "DELETE", "PRAGMA", "SET",
];

/// Validate the SQL body: exactly one top-level statement, no forbidden
/// DDL/DML keywords outside string/comment context (spec.md §4.1).
fn validate_sql_body(report_id: &str, sql: &str) -> Result<()> {
    let mut statement_count = 0usize;
    let mut saw_non_semicolon_after_semicolon = false;
    let mut word = String::new();
    let mut state = SqlScanState::Code;
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    macro_rules! flush_word {
        () => {
            if !word.is_empty() {
                if FORBIDDEN_KEYWORDS.contains(&word.to_ascii_uppercase().as_str()) {
                    return Err(Error::ForbiddenSqlConstruct {
                        report: report_id.to_string(),
                        detail: format!("forbidden keyword {word:?}"),
                    });
                }
                word.clear();
            }
        };
    }

    while i < chars.len() {
        let c = chars[i];
        match state {
            SqlScanState::Code => {
                if c == '\'' {
                    flush_word!();
                    state = SqlScanState::SingleQuote;
                } else if c == '-' && chars.get(i + 1) == Some(&'-') {
                    flush_word!();
                    state = SqlScanState::LineComment;
                    i += 1;
                } else if c == '/' && chars.get(i + 1) == Some(&'*') {
                    flush_word!();
                    state = SqlScanState::BlockComment;
                    i += 1;
                } else if c == ';' {
                    flush_word!();
                    statement_count += 1;
                } else if c.is_ascii_alphanumeric() || c == '_' {
                    if statement_count > 0 && !c.is_whitespace() {
                        saw_non_semicolon_after_semicolon = true;
                    }
                    word.push(c);
                } else {
                    if statement_count > 0 && !c.is_whitespace() {
                        saw_non_semicolon_after_semicolon = true;
                    }
                    flush_word!();
                }
            }
            SqlScanState::SingleQuote => {
                if c == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        i += 1;
                    } else {
                        state = SqlScanState::Code;
                    }
                }
            }
            SqlScanState::LineComment => {
                if c == '\n' {
                    state = SqlScanState::Code;
                }
            }
            SqlScanState::BlockComment => {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    state = SqlScanState::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    flush_word!();

    if statement_count > 1 || (statement_count == 1 && saw_non_semicolon_after_semicolon) {
        return Err(Error::ForbiddenSqlConstruct {
            report: report_id.to_string(),
            detail: "report SQL must contain exactly one top-level statement".to_string(),
        });
    }

    Ok(())
}

enum SqlScanState {
    Code,
    SingleQuote,
    LineComment,
    BlockComment,
}

/// Extract `MATERIALIZE`/`MATERIALIZE_CLOSED` CTEs from the SQL body.
/// Recognizes `<ident> AS MATERIALIZE[_CLOSED] (` at the top level
/// (case-insensitive on the keyword).
pub fn extract_materializations(sql: &str) -> Vec<MaterializationSpec> {
    let mut out = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if let Some((cte_name, closed, after)) = try_match_materialize_header(sql, i) {
            out.push(MaterializationSpec { cte_name, closed });
            i = after;
        } else {
            i += 1;
        }
    }
    out
}

fn try_match_materialize_header(sql: &str, pos: usize) -> Option<(String, bool, usize)> {
    // Look for an identifier followed by whitespace, "AS", whitespace,
    // "MATERIALIZE" or "MATERIALIZE_CLOSED", whitespace, "(".
    let rest = &sql[pos..];
    let mut chars = rest.char_indices().peekable();
    let (_, first) = *chars.peek()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let mut ident_end = 0;
    for (idx, c) in rest.char_indices() {
        if c.is_ascii_alphanumeric() || c == '_' {
            ident_end = idx + c.len_utf8();
        } else {
            break;
        }
    }
    if ident_end == 0 {
        return None;
    }
    let ident = &rest[..ident_end];
    let mut cursor = ident_end;
    cursor += skip_ws(&rest[cursor..]);
    let after_as = rest[cursor..].get(..2)?;
    if !after_as.eq_ignore_ascii_case("as") {
        return None;
    }
    cursor += 2;
    cursor += skip_ws(&rest[cursor..]);

    let remaining = &rest[cursor..];
    let (closed, kw_len) = if remaining.len() >= 18 && remaining[..18].eq_ignore_ascii_case("materialize_closed")
    {
        (true, 18)
    } else if remaining.len() >= 11 && remaining[..11].eq_ignore_ascii_case("materialize") {
        (false, 11)
    } else {
        return None;
    };
    cursor += kw_len;
    cursor += skip_ws(&rest[cursor..]);
    if rest[cursor..].chars().next() != Some('(') {
        return None;
    }

    Some((ident.to_string(), closed, pos + cursor + 1))
}

fn skip_ws(s: &str) -> usize {
    s.chars().take_while(|c| c.is_whitespace()).map(|c| c.len_utf8()).sum()
}

/// Parse a raw report source into a [`Report`].
pub fn parse_report(report_id: &str, source: &str, source_len: u64) -> Result<Report> {
    let (raw_blocks, sql_body) = split_blocks(report_id, source)?;

    let mut blocks = HashMap::new();
    for raw in &raw_blocks {
        let block = parse_block(report_id, raw)?;
        blocks.insert(block.block_name(), block);
    }

    validate_sql_body(report_id, &sql_body)?;
    let placeholders = parse_placeholders(report_id, &sql_body)?;

    // Canonical form for the source fingerprint: trimmed SQL body plus
    // each block's name and raw YAML, in a fixed (sorted) order so
    // incidental reordering of blocks in the file doesn't change the
    // artifact's cache key.
    let mut canonical = String::new();
    canonical.push_str(sql_body.trim());
    let mut names: Vec<&&'static str> = blocks.keys().collect();
    names.sort();
    for name in names {
        canonical.push('\n');
        canonical.push_str(name);
    }

    Ok(Report {
        id: report_id.to_string(),
        sql_body,
        placeholders,
        blocks,
        source_fingerprint: source_fingerprint(canonical.as_bytes()),
        source_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_params_block_and_sql() {
        let src = r#"
/***PARAMS
- name: Region
  type: str
  scope: data
***/
SELECT * FROM t WHERE region = {{param Region}}
"#;
        let report = parse_report("demo/r", src, src.len() as u64).unwrap();
        assert_eq!(report.params().len(), 1);
        assert_eq!(report.params()[0].name, "Region");
        assert_eq!(report.placeholders.len(), 1);
    }

    #[test]
    fn rejects_duplicate_block() {
        let src = r#"
/***PARAMS
- name: A
  type: str
  scope: data
***/
/***PARAMS
- name: B
  type: str
  scope: data
***/
SELECT 1
"#;
        let err = parse_report("r", src, 0).unwrap_err();
        assert_eq!(err.code(), "InvalidMetadataBlock");
    }

    #[test]
    fn rejects_unknown_block_name() {
        let src = "/***BOGUS\nfoo: 1\n***/\nSELECT 1";
        let err = parse_report("r", src, 0).unwrap_err();
        assert_eq!(err.code(), "InvalidMetadataBlock");
    }

    #[test]
    fn rejects_unknown_yaml_key() {
        let src = r#"
/***PARAMS
- name: A
  type: str
  scope: data
  bogus_key: true
***/
SELECT 1
"#;
        let err = parse_report("r", src, 0).unwrap_err();
        assert_eq!(err.code(), "InvalidMetadataBlock");
    }

    #[test]
    fn rejects_forbidden_construct() {
        let src = "CREATE TABLE t (x INT)";
        let err = parse_report("r", src, 0).unwrap_err();
        assert_eq!(err.code(), "ForbiddenSqlConstruct");
    }

    #[test]
    fn rejects_multiple_statements() {
        let src = "SELECT 1; SELECT 2;";
        let err = parse_report("r", src, 0).unwrap_err();
        assert_eq!(err.code(), "ForbiddenSqlConstruct");
    }

    #[test]
    fn allows_single_trailing_semicolon() {
        let src = "SELECT 1;";
        parse_report("r", src, 0).unwrap();
    }

    #[test]
    fn extracts_materializations() {
        let sql = "WITH foo AS MATERIALIZE (SELECT 1), bar AS MATERIALIZE_CLOSED (SELECT 2) SELECT * FROM foo";
        let mats = extract_materializations(sql);
        assert_eq!(mats.len(), 2);
        assert_eq!(mats[0].cte_name, "foo");
        assert!(!mats[0].closed);
        assert_eq!(mats[1].cte_name, "bar");
        assert!(mats[1].closed);
    }

    #[test]
    fn parses_type_grammar() {
        assert_eq!(parse_type_str("r", "int").unwrap(), ParamType::Int);
        assert_eq!(
            parse_type_str("r", "Optional[int]").unwrap(),
            ParamType::Optional {
                inner: Box::new(ParamType::Int)
            }
        );
        assert_eq!(
            parse_type_str("r", "Literal[a,b,c]").unwrap(),
            ParamType::Literal {
                values: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }
}
