//! Drives the query engine to produce each plan node's artifact
//! (spec.md §4.7, component C8). Every transformation is a position-
//! based splice of literal tokens into the original SQL text — never
//! AST mutation — preserving the "equal fingerprints, equal bytes"
//! determinism contract even across query-engine versions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use duckdb::Connection;
use serde::Serialize;

use crate::cache::{BuildOutcome, Cache, CacheEntry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::params::{ParamValue, ParamValues};
use crate::placeholder::{PlaceholderKind, PlaceholderSpan};
use crate::plan::{Plan, PlanNode, PlanNodeKind};
use crate::report::Report;
use crate::secrets::SecretsVault;

/// One column of an artifact's schema (spec.md line 65 `Artifact.schema`).
#[derive(Debug, Clone, Serialize)]
pub struct SchemaColumn {
    pub name: String,
    pub r#type: String,
}

/// Everything a plan node needs to resolve its placeholders: the
/// already-built upstream artifacts and looked-up binding values.
#[derive(Default)]
pub struct ExecutionContext {
    pub materialize_paths: HashMap<String, PathBuf>,
    pub import_paths: HashMap<String, PathBuf>,
    pub literal_source_paths: HashMap<String, PathBuf>,
    pub binding_values: HashMap<String, String>,
}

pub struct Executor {
    config: Config,
    secrets: SecretsVault,
}

impl Executor {
    pub fn new(config: Config, secrets: SecretsVault) -> Self {
        Self { config, secrets }
    }

    /// Execute every node in `plan`, in order, publishing each through
    /// `cache`. Returns the populated [`ExecutionContext`] plus the
    /// base artifact's cache entry.
    pub async fn run_plan(
        &self,
        report: &Report,
        plan: &Plan,
        params: &ParamValues,
        cache: &Arc<Cache>,
        ttl: Duration,
        stale_while_revalidate: bool,
        resolved_imports: &HashMap<String, PathBuf>,
    ) -> Result<(ExecutionContext, CacheEntry)> {
        let mut ctx = ExecutionContext::default();
        let mut base_entry = None;

        for node in &plan.nodes {
            let entry = self
                .execute_node(
                    report,
                    node,
                    params,
                    &ctx,
                    cache,
                    ttl,
                    stale_while_revalidate,
                    resolved_imports,
                )
                .await?;
            match &node.kind {
                PlanNodeKind::Materialize(name) => {
                    if let Some(path) = entry.as_path() {
                        ctx.materialize_paths.insert(name.clone(), path.to_path_buf());
                    }
                }
                PlanNodeKind::Import(id) => {
                    if let Some(path) = entry.as_path() {
                        ctx.import_paths.insert(id.clone(), path.to_path_buf());
                    }
                }
                PlanNodeKind::LiteralSource(id) => {
                    if let Some(path) = entry.as_path() {
                        ctx.literal_source_paths.insert(id.clone(), path.to_path_buf());
                    }
                }
                PlanNodeKind::Binding(id) => {
                    if let Some(value) = entry.as_value() {
                        ctx.binding_values.insert(id.clone(), value.to_string());
                    }
                }
                PlanNodeKind::Base => {
                    base_entry = Some(entry);
                }
                PlanNodeKind::Slice(_) => {}
            }
        }

        let base_entry = base_entry.ok_or_else(|| {
            Error::SqlExecutionError {
                report: report.id.clone(),
                node: "base".to_string(),
                detail: "plan produced no base node".to_string(),
            }
        })?;

        Ok((ctx, base_entry))
    }

    /// Read the column schema of a built Parquet artifact via DuckDB's
    /// own `DESCRIBE`, rather than threading it through the build path —
    /// this also works for a cache hit, where no build ever ran this call.
    pub fn read_schema(&self, path: &Path) -> Result<Vec<SchemaColumn>> {
        let conn = Connection::open_in_memory().map_err(Error::DuckDb)?;
        let sql = format!("DESCRIBE SELECT * FROM read_parquet('{}')", path.display());
        let mut stmt = conn.prepare(&sql).map_err(Error::DuckDb)?;
        let rows = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                let col_type: String = row.get(1)?;
                Ok(SchemaColumn { name, r#type: col_type })
            })
            .map_err(Error::DuckDb)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(Error::DuckDb)?);
        }
        Ok(out)
    }

    async fn execute_node(
        &self,
        report: &Report,
        node: &PlanNode,
        params: &ParamValues,
        ctx: &ExecutionContext,
        cache: &Arc<Cache>,
        ttl: Duration,
        stale_while_revalidate: bool,
        resolved_imports: &HashMap<String, PathBuf>,
    ) -> Result<CacheEntry> {
        match &node.kind {
            PlanNodeKind::Binding(id) => {
                let binding = report
                    .bindings()
                    .iter()
                    .find(|b| &b.id == id)
                    .ok_or_else(|| Error::UndeclaredName {
                        report: report.id.clone(),
                        kind: "binding",
                        name: id.clone(),
                    })?;
                let source_path = ctx
                    .materialize_paths
                    .get(&binding.source_cte)
                    .cloned()
                    .ok_or_else(|| Error::SqlExecutionError {
                        report: report.id.clone(),
                        node: id.clone(),
                        detail: format!("binding source {:?} was not materialized first", binding.source_cte),
                    })?;
                let key_value = params
                    .server_params
                    .get(&binding.key_param)
                    .map(render_sql_value)
                    .unwrap_or_else(|| "NULL".to_string());
                let key_column = binding.key_column.clone();
                let value_column = binding.value_column.clone();
                let report_id = report.id.clone();
                let node_name = id.clone();

                cache
                    .build_or_wait("bindings", node.fingerprint, ttl, false, move |_| {
                        lookup_binding_value(&source_path, &key_column, &key_value, &value_column)
                            .map(BuildOutcome::Value)
                            .map_err(|e| Error::SqlExecutionError {
                                report: report_id.clone(),
                                node: node_name.clone(),
                                detail: e.to_string(),
                            })
                    })
                    .await
            }
            PlanNodeKind::Materialize(cte_name) => {
                let resolved = self.resolve_sql(report, params, ctx)?;
                let sql = build_materialize_sql(&resolved, cte_name);
                self.run_copy_to_parquet(report, node, "materialize", sql, cache, ttl, stale_while_revalidate)
                    .await
            }
            PlanNodeKind::Base => {
                let resolved = self.resolve_sql(report, params, ctx)?;
                self.run_copy_to_parquet(report, node, "artifacts", resolved, cache, ttl, stale_while_revalidate)
                    .await
            }
            PlanNodeKind::LiteralSource(id) => {
                let ls = report
                    .literal_sources()
                    .iter()
                    .find(|l| &l.id == id)
                    .ok_or_else(|| Error::UndeclaredName {
                        report: report.id.clone(),
                        kind: "literal_source",
                        name: id.clone(),
                    })?;
                let resolved = self.resolve_sql(report, params, ctx)?;
                let sql = build_trailing_select(
                    &resolved,
                    &format!("SELECT DISTINCT {} AS value FROM {}", ls.value_column, ls.from_cte),
                );
                self.run_copy_to_parquet(report, node, "literal_sources", sql, cache, ttl, stale_while_revalidate)
                    .await
            }
            PlanNodeKind::Import(id) => {
                // The dispatcher (C11) recursively dispatches the target
                // report before running this plan and hands us its base
                // artifact path here; an import node contributes that
                // artifact as-is, with no additional build step.
                let path = resolved_imports.get(id).cloned().ok_or_else(|| Error::SqlExecutionError {
                    report: report.id.clone(),
                    node: id.clone(),
                    detail: "import was not resolved before plan execution".to_string(),
                })?;
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).map_err(Error::Io)?;
                Ok(CacheEntry::File { path, size_bytes })
            }
            PlanNodeKind::Slice(_) => Err(Error::SqlExecutionError {
                report: report.id.clone(),
                node: node.kind.node_name().to_string(),
                detail: "slice materialization is not implemented in v1".to_string(),
            }),
        }
    }

    async fn run_copy_to_parquet(
        &self,
        report: &Report,
        node: &PlanNode,
        kind: &str,
        sql: String,
        cache: &Arc<Cache>,
        ttl: Duration,
        stale_while_revalidate: bool,
    ) -> Result<CacheEntry> {
        let report_id = report.id.clone();
        let node_name = node.kind.node_name().to_string();
        let redacted_sql_on_error = self.secrets.redact(&sql);

        cache
            .build_or_wait(kind, node.fingerprint, ttl, stale_while_revalidate, move |tmp_path| {
                run_copy_with_timeout(&sql, tmp_path).map_err(|e| {
                    classify_engine_error(e, &report_id, &node_name, &redacted_sql_on_error)
                })
            })
            .await
    }

    /// Resolve every placeholder span in the report's SQL body to a
    /// literal string and splice it in by byte offset (spec.md §4.7
    /// "never re-orders, re-indents, or re-quotes").
    fn resolve_sql(&self, report: &Report, params: &ParamValues, ctx: &ExecutionContext) -> Result<String> {
        let mut spans: Vec<&PlaceholderSpan> = report.placeholders.iter().collect();
        spans.sort_by_key(|s| s.start);

        let mut out = String::with_capacity(report.sql_body.len());
        let mut last = 0;
        for span in spans {
            out.push_str(&report.sql_body[last..span.start]);
            out.push_str(&self.resolve_one(report, span, params, ctx)?);
            last = span.end;
        }
        out.push_str(&report.sql_body[last..]);
        Ok(strip_materialize_keywords(&out))
    }

    fn resolve_one(
        &self,
        report: &Report,
        span: &PlaceholderSpan,
        params: &ParamValues,
        ctx: &ExecutionContext,
    ) -> Result<String> {
        match span.kind {
            PlaceholderKind::Param => Ok(params
                .server_params
                .get(&span.name)
                .map(render_sql_value)
                .unwrap_or_else(|| "NULL".to_string())),
            PlaceholderKind::Config => {
                let constant = report
                    .config_block()
                    .get(&span.name)
                    .cloned()
                    .or_else(|| {
                        self.config
                            .constants
                            .get(&span.name)
                            .map(|c| c.as_raw_str())
                    });
                match constant {
                    Some(value) => Ok(format!("'{}'", value.replace('\'', "''"))),
                    None => Err(Error::UndeclaredName {
                        report: report.id.clone(),
                        kind: "config",
                        name: span.name.clone(),
                    }),
                }
            }
            PlaceholderKind::Bind => ctx
                .binding_values
                .get(&span.name)
                .map(|v| format!("'{}'", v.replace('\'', "''")))
                .ok_or_else(|| Error::UndeclaredName {
                    report: report.id.clone(),
                    kind: "bind",
                    name: span.name.clone(),
                }),
            PlaceholderKind::Mat => ctx
                .materialize_paths
                .get(&span.name)
                .map(|p| format!("'{}'", p.display()))
                .ok_or_else(|| Error::UndeclaredName {
                    report: report.id.clone(),
                    kind: "mat",
                    name: span.name.clone(),
                }),
            PlaceholderKind::Import => ctx
                .import_paths
                .get(&span.name)
                .map(|p| format!("'{}'", p.display()))
                .ok_or_else(|| Error::UndeclaredName {
                    report: report.id.clone(),
                    kind: "import",
                    name: span.name.clone(),
                }),
            PlaceholderKind::Ident | PlaceholderKind::Path => {
                // Already validated tokens; emitted verbatim.
                Ok(span.name.clone())
            }
            PlaceholderKind::Secret => self
                .secrets
                .get(&span.name)
                .map(|v| format!("'{}'", v.expose().replace('\'', "''")))
                .ok_or_else(|| Error::UndeclaredName {
                    report: report.id.clone(),
                    kind: "secret",
                    name: span.name.clone(),
                }),
        }
    }
}

fn render_sql_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Float(f) => f.to_string(),
        ParamValue::Bool(b) => b.to_string(),
        ParamValue::Date(s) | ParamValue::DateTime(s) | ParamValue::Str(s) => {
            format!("'{}'", s.replace('\'', "''"))
        }
        ParamValue::List(items) => {
            let rendered: Vec<String> = items.iter().map(render_sql_value).collect();
            format!("({})", rendered.join(", "))
        }
        ParamValue::InjectedLiteral(s) => s.clone(),
        ParamValue::InjectedIdent(s) => s.clone(),
        ParamValue::Absent => "NULL".to_string(),
    }
}

/// Rewrite a resolved report body so its final `SELECT` is replaced
/// with `SELECT * FROM <cte_name>`, leaving every CTE definition intact
/// (spec.md §4.7 step 2: "do not modify any other CTE").
fn build_materialize_sql(resolved_sql: &str, cte_name: &str) -> String {
    build_trailing_select(resolved_sql, &format!("SELECT * FROM {cte_name}"))
}

/// Keep a resolved report's leading `WITH` clause (if any) and replace
/// everything after it with `trailing`. Shared by materialize and
/// literal-source builds, which both want the report's CTEs but a
/// different final projection.
fn build_trailing_select(resolved_sql: &str, trailing: &str) -> String {
    match find_main_query_start(resolved_sql) {
        Some(start) => format!("{}\n{}", &resolved_sql[..start], trailing),
        None => trailing.to_string(),
    }
}

/// Strip the ducksearch-only `MATERIALIZE`/`MATERIALIZE_CLOSED` CTE
/// marker down to a plain `AS (...)` before any resolved SQL reaches
/// the query engine, which has no idea what that keyword means. The
/// CTE's rows are still computed inline exactly as written here; the
/// separate cached artifact that materialization buys comes from a
/// different node building this same resolved text through
/// [`build_materialize_sql`], not from anything the engine parses in
/// this string.
fn strip_materialize_keywords(sql: &str) -> String {
    let lead = skip_ws(sql);
    if !sql[lead..].get(..4).map(|s| s.eq_ignore_ascii_case("with")).unwrap_or(false) {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len());
    let mut i = lead + 4;
    out.push_str(&sql[..i]);

    loop {
        let ws = skip_ws(&sql[i..]);
        out.push_str(&sql[i..i + ws]);
        i += ws;

        if sql[i..].get(..9).map(|s| s.eq_ignore_ascii_case("recursive")).unwrap_or(false) {
            out.push_str(&sql[i..i + 9]);
            i += 9;
            let ws = skip_ws(&sql[i..]);
            out.push_str(&sql[i..i + ws]);
            i += ws;
        }

        let Some(ident_end) = skip_ident(sql, i) else {
            out.push_str(&sql[i..]);
            return out;
        };
        out.push_str(&sql[i..ident_end]);
        i = ident_end;

        let ws = skip_ws(&sql[i..]);
        out.push_str(&sql[i..i + ws]);
        i += ws;

        if sql[i..].get(..2).map(|s| s.eq_ignore_ascii_case("as")).unwrap_or(false) {
            out.push_str(&sql[i..i + 2]);
            i += 2;
        } else {
            out.push_str(&sql[i..]);
            return out;
        }

        i += skip_ws(&sql[i..]);
        for kw in ["materialize_closed", "materialize"] {
            if sql[i..].len() >= kw.len() && sql[i..][..kw.len()].eq_ignore_ascii_case(kw) {
                i += kw.len();
                i += skip_ws(&sql[i..]);
                break;
            }
        }
        out.push(' ');

        if sql[i..].chars().next() != Some('(') {
            out.push_str(&sql[i..]);
            return out;
        }
        let Some(close) = find_matching_paren(sql, i) else {
            out.push_str(&sql[i..]);
            return out;
        };
        out.push_str(&sql[i..=close]);
        i = close + 1;

        let ws = skip_ws(&sql[i..]);
        out.push_str(&sql[i..i + ws]);
        i += ws;

        if sql[i..].chars().next() == Some(',') {
            out.push(',');
            i += 1;
            continue;
        }
        out.push_str(&sql[i..]);
        return out;
    }
}

/// Find the byte offset where the main query begins, i.e. just past
/// the last top-level CTE definition's closing paren (and any trailing
/// comma). Returns `None` if `sql` has no leading `WITH` clause.
fn find_main_query_start(sql: &str) -> Option<usize> {
    let trimmed_start = skip_ws(sql);
    if !sql[trimmed_start..].get(..4)?.eq_ignore_ascii_case("with") {
        return None;
    }
    let mut i = trimmed_start + 4;

    loop {
        i += skip_ws(&sql[i..]);
        // RECURSIVE is optional and may appear once, right after WITH.
        if sql[i..].get(..9).map(|s| s.eq_ignore_ascii_case("recursive")).unwrap_or(false) {
            i += 9;
            i += skip_ws(&sql[i..]);
        }

        i = skip_ident(sql, i)?;
        i += skip_ws(&sql[i..]);

        if sql[i..].get(..2).map(|s| s.eq_ignore_ascii_case("as")).unwrap_or(false) {
            i += 2;
            i += skip_ws(&sql[i..]);
        }
        for kw in ["materialize_closed", "materialize"] {
            if sql[i..].len() >= kw.len() && sql[i..][..kw.len()].eq_ignore_ascii_case(kw) {
                i += kw.len();
                i += skip_ws(&sql[i..]);
                break;
            }
        }

        if sql[i..].chars().next() != Some('(') {
            return None;
        }
        i = find_matching_paren(sql, i)? + 1;
        i += skip_ws(&sql[i..]);

        if sql[i..].chars().next() == Some(',') {
            i += 1;
            continue;
        }
        return Some(i);
    }
}

fn skip_ws(s: &str) -> usize {
    s.chars().take_while(|c| c.is_whitespace()).map(|c| c.len_utf8()).sum()
}

fn skip_ident(sql: &str, start: usize) -> Option<usize> {
    let rest = &sql[start..];
    let mut end = 0;
    for (idx, c) in rest.char_indices() {
        if c.is_ascii_alphanumeric() || c == '_' {
            end = idx + c.len_utf8();
        } else {
            break;
        }
    }
    if end == 0 {
        None
    } else {
        Some(start + end)
    }
}

/// Find the index of the `)` matching the `(` at `open_idx`, skipping
/// over single-quoted string contents.
fn find_matching_paren(sql: &str, open_idx: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth = 0i32;
    let mut i = open_idx;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn lookup_binding_value(
    source_parquet: &Path,
    key_column: &str,
    key_value_literal: &str,
    value_column: &str,
) -> std::result::Result<String, duckdb::Error> {
    let conn = Connection::open_in_memory()?;
    let sql = format!(
        "SELECT {value_column} FROM read_parquet('{}') WHERE {key_column} = {key_value_literal} LIMIT 1",
        source_parquet.display()
    );
    conn.query_row(&sql, [], |row| row.get::<_, String>(0))
}

fn run_copy_with_timeout(sql: &str, tmp_path: &Path) -> Result<BuildOutcome> {
    // Synchronous; the cache layer dispatches this via spawn_blocking
    // and races it against the soft/hard timeouts (spec.md §5).
    let conn = Connection::open_in_memory().map_err(Error::DuckDb)?;
    let copy_sql = format!(
        "COPY ({sql}) TO '{}' (FORMAT PARQUET, COMPRESSION ZSTD)",
        tmp_path.display()
    );
    conn.execute_batch(&copy_sql).map_err(Error::DuckDb)?;
    Ok(BuildOutcome::WroteFile)
}

fn classify_engine_error(e: Error, report_id: &str, node_name: &str, redacted_sql: &str) -> Error {
    match &e {
        Error::DuckDb(inner) => {
            let message = inner.to_string();
            if message.contains("IO Error") || message.contains("Connection") || message.contains("lock") {
                Error::EngineUnavailable(message)
            } else {
                Error::SqlExecutionError {
                    report: report_id.to_string(),
                    node: node_name.to_string(),
                    detail: format!(
                        "{} (resolved SQL redacted of secret-derived text: {})",
                        message, redacted_sql.lines().next().unwrap_or("")
                    ),
                }
            }
        }
        _ => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_rewrite_keeps_other_ctes() {
        let sql = "WITH foo AS MATERIALIZE (SELECT 1), bar AS (SELECT 2) SELECT * FROM foo, bar";
        let out = build_materialize_sql(sql, "foo");
        assert!(out.starts_with("WITH foo AS MATERIALIZE (SELECT 1), bar AS (SELECT 2)"));
        assert!(out.trim_end().ends_with("SELECT * FROM foo"));
    }

    #[test]
    fn no_with_clause_is_passthrough_main_query() {
        assert_eq!(find_main_query_start("SELECT 1"), None);
    }

    #[test]
    fn finds_matching_paren_across_nested_calls() {
        let sql = "(SELECT foo(1, (2+3)) FROM t)";
        let end = find_matching_paren(sql, 0).unwrap();
        assert_eq!(end, sql.len() - 1);
    }

    #[test]
    fn render_sql_value_escapes_strings() {
        assert_eq!(render_sql_value(&ParamValue::Str("O'Brien".into())), "'O''Brien'");
        assert_eq!(render_sql_value(&ParamValue::Int(5)), "5");
    }

    #[test]
    fn strip_materialize_keywords_yields_plain_cte() {
        let sql = "WITH foo AS MATERIALIZE (SELECT 1), bar AS (SELECT 2) SELECT * FROM foo, bar";
        let out = strip_materialize_keywords(sql);
        assert_eq!(out, "WITH foo AS (SELECT 1), bar AS (SELECT 2) SELECT * FROM foo, bar");
    }

    #[test]
    fn strip_materialize_keywords_handles_closed_variant_and_multiple_ctes() {
        let sql = "WITH a AS MATERIALIZE_CLOSED (SELECT 1), b AS MATERIALIZE (SELECT 2) SELECT * FROM a, b";
        let out = strip_materialize_keywords(sql);
        assert_eq!(out, "WITH a AS (SELECT 1), b AS (SELECT 2) SELECT * FROM a, b");
    }

    #[test]
    fn strip_materialize_keywords_is_noop_without_with_clause() {
        assert_eq!(strip_materialize_keywords("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn strip_materialize_keywords_leaves_plain_ctes_untouched() {
        let sql = "WITH foo AS (SELECT 1) SELECT * FROM foo";
        assert_eq!(strip_materialize_keywords(sql), sql);
    }

    #[test]
    fn build_trailing_select_keeps_ctes_for_literal_sources() {
        let sql = "WITH segments AS (SELECT 1 AS shard_id) SELECT shard_id FROM segments";
        let out = build_trailing_select(sql, "SELECT DISTINCT shard_id AS value FROM segments");
        assert!(out.starts_with("WITH segments AS (SELECT 1 AS shard_id)"));
        assert!(out.trim_end().ends_with("SELECT DISTINCT shard_id AS value FROM segments"));
    }
}
