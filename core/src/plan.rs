//! Topological plan builder (spec.md §4.5, component C6).
//!
//! Builds the execution order over imports, bindings, materializations,
//! and literal sources using Kahn's algorithm: an explicit queue and an
//! explicit in-degree map, the same hand-rolled traversal style the
//! teacher uses for its query micro-language rather than reaching for
//! a graph crate.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::params::{ParamValue, ParamValues};
use crate::registry::Registry;
use crate::report::Report;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlanNodeKind {
    Materialize(String),
    Binding(String),
    LiteralSource(String),
    Import(String),
    Base,
    Slice(String),
}

impl PlanNodeKind {
    pub fn node_name(&self) -> &str {
        match self {
            PlanNodeKind::Materialize(n) => n,
            PlanNodeKind::Binding(n) => n,
            PlanNodeKind::LiteralSource(n) => n,
            PlanNodeKind::Import(n) => n,
            PlanNodeKind::Base => "base",
            PlanNodeKind::Slice(n) => n,
        }
    }

    fn kind_tag(&self) -> &'static str {
        match self {
            PlanNodeKind::Materialize(_) => "materialize",
            PlanNodeKind::Binding(_) => "binding",
            PlanNodeKind::LiteralSource(_) => "literal_source",
            PlanNodeKind::Import(_) => "import",
            PlanNodeKind::Base => "base",
            PlanNodeKind::Slice(_) => "slice",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub kind: PlanNodeKind,
    pub fingerprint: Fingerprint,
    pub upstream: Vec<Fingerprint>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn base_node(&self) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.kind == PlanNodeKind::Base)
    }
}

/// Build the topological plan for `report` given its resolved params.
pub fn build_plan(
    report: &Report,
    params: &ParamValues,
    registry: &Registry,
    deployment_id: &str,
) -> Result<Plan> {
    check_import_cycle(&report.id, registry)?;

    // Dependency graph over node ids: imports and bindings' source_cte
    // materializations must finish before anything that references them.
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    let mut node_kinds: HashMap<String, PlanNodeKind> = HashMap::new();

    let materializations = report.materializations();

    for m in &materializations {
        node_kinds.insert(m.cte_name.clone(), PlanNodeKind::Materialize(m.cte_name.clone()));
        in_degree.entry(m.cte_name.clone()).or_insert(0);
    }
    for b in report.bindings() {
        node_kinds.insert(format!("binding:{}", b.id), PlanNodeKind::Binding(b.id.clone()));
        in_degree.entry(format!("binding:{}", b.id)).or_insert(0);
        if materializations.iter().any(|m| m.cte_name == b.source_cte) {
            edges
                .entry(b.source_cte.clone())
                .or_default()
                .push(format!("binding:{}", b.id));
            *in_degree.entry(format!("binding:{}", b.id)).or_insert(0) += 1;
        }
    }
    for ls in report.literal_sources() {
        let key = format!("literal_source:{}", ls.id);
        node_kinds.insert(key.clone(), PlanNodeKind::LiteralSource(ls.id.clone()));
        in_degree.entry(key.clone()).or_insert(0);
        if materializations.iter().any(|m| m.cte_name == ls.from_cte) {
            edges.entry(ls.from_cte.clone()).or_default().push(key.clone());
            *in_degree.entry(key).or_insert(0) += 1;
        }
    }
    for i in report.imports() {
        let key = format!("import:{}", i.id);
        node_kinds.insert(key.clone(), PlanNodeKind::Import(i.id.clone()));
        in_degree.entry(key).or_insert(0);
    }

    // Kahn's algorithm.
    let mut queue: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(k, _)| k.clone())
        .collect();
    let mut order: Vec<String> = Vec::new();
    let mut remaining = in_degree.clone();

    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        if let Some(dependents) = edges.get(&id) {
            for dep in dependents {
                let deg = remaining.get_mut(dep).expect("edge target must be a known node");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dep.clone());
                }
            }
        }
    }

    if order.len() != node_kinds.len() {
        return Err(Error::ImportCycle(format!(
            "dependency graph for {} is not acyclic",
            report.id
        )));
    }

    let mut nodes = Vec::new();
    let mut upstream_by_id: HashMap<String, Fingerprint> = HashMap::new();

    for id in &order {
        let kind = node_kinds.get(id).expect("ordered id must be known").clone();
        let upstream: Vec<Fingerprint> = edges
            .iter()
            .filter(|(_, deps)| deps.contains(id))
            .filter_map(|(src, _)| upstream_by_id.get(src).copied())
            .collect();

        let fp = node_fingerprint(report, &kind, &upstream, params, deployment_id);
        upstream_by_id.insert(id.clone(), fp);
        nodes.push(PlanNode {
            kind,
            fingerprint: fp,
            upstream,
        });
    }

    // Base node always comes last: it depends on every materialization,
    // binding, import, and literal source already computed above.
    let base_upstream: Vec<Fingerprint> = nodes.iter().map(|n| n.fingerprint).collect();
    let base_fp = node_fingerprint(report, &PlanNodeKind::Base, &base_upstream, params, deployment_id);
    nodes.push(PlanNode {
        kind: PlanNodeKind::Base,
        fingerprint: base_fp,
        upstream: base_upstream,
    });

    Ok(Plan { nodes })
}

fn node_fingerprint(
    report: &Report,
    kind: &PlanNodeKind,
    upstream: &[Fingerprint],
    params: &ParamValues,
    deployment_id: &str,
) -> Fingerprint {
    let mut b = FingerprintBuilder::new();
    b.field_str(deployment_id);
    b.field_fingerprint(&report.source_fingerprint);
    b.field_str(kind.kind_tag());
    b.field_str(kind.node_name());
    b.field_sorted_fingerprints(upstream.iter().copied());

    let mut applied: Vec<String> = params
        .server_params
        .iter()
        .map(|(k, v)| format!("{k}={v:?}"))
        .collect();
    applied.sort();
    b.field_sorted_strs(&applied);

    b.finalize()
}

/// Hybrid-eligibility predicate (spec.md §4.5): all five conditions
/// must hold for a predicate on `column` to be applied client-side.
pub struct HybridCandidate<'a> {
    pub column: &'a str,
    pub op: &'a str,
    pub param_name: &'a str,
    pub base_schema_columns: &'a HashSet<String>,
    pub value_set_size: usize,
    pub hybrid_value_cap: usize,
}

pub fn hybrid_eligible(report: &Report, candidate: &HybridCandidate<'_>) -> bool {
    const ALLOWED_OPS: &[&str] = &["=", "IN", "<", "<=", ">", ">=", "BETWEEN"];

    let column_present = candidate.base_schema_columns.contains(candidate.column);
    let op_allowed = ALLOWED_OPS.contains(&candidate.op);
    let not_structural = !param_flows_into_structure(report, candidate.param_name);
    let no_limit = !sql_has_limit(&report.sql_body);
    let bounded = candidate.value_set_size <= candidate.hybrid_value_cap;

    column_present && op_allowed && not_structural && no_limit && bounded
}

/// True if `param_name` is referenced by any materialization, binding,
/// import, or scan-path position — i.e. it influences *what gets
/// built*, not just a client-side filter over already-built rows.
fn param_flows_into_structure(report: &Report, param_name: &str) -> bool {
    report.placeholders.iter().any(|span| {
        span.kind == crate::placeholder::PlaceholderKind::Param
            && span.name.eq_ignore_ascii_case(param_name)
            && span.in_scan_path
    })
}

fn sql_has_limit(sql: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    upper.contains("LIMIT ") || upper.ends_with("LIMIT")
}

/// Decide whether a *bare* (unprefixed) hybrid-scoped param should be
/// auto-promoted to `client_params` (spec.md §4.4 step 4). Finds the
/// simple `<column> <op> {{param NAME}}` predicate the param appears
/// in and checks it against [`hybrid_eligible`]; a param that doesn't
/// sit in a predicate shape we can statically recognize is never
/// promoted, matching the spec's "if any condition fails, promoted to
/// server" default.
pub fn auto_promote_hybrid_param(
    report: &Report,
    param_name: &str,
    value: &ParamValue,
    hybrid_value_cap: usize,
) -> bool {
    let Some((column, op)) = find_simple_predicate(report, param_name) else {
        return false;
    };
    let base_schema_columns = extract_select_list_columns(&report.sql_body);
    let candidate = HybridCandidate {
        column: &column,
        op: &op,
        param_name,
        base_schema_columns: &base_schema_columns,
        value_set_size: param_value_set_size(value),
        hybrid_value_cap,
    };
    hybrid_eligible(report, &candidate)
}

fn param_value_set_size(value: &ParamValue) -> usize {
    match value {
        ParamValue::List(items) => items.len(),
        ParamValue::Absent => 0,
        _ => 1,
    }
}

/// Find the `<column> <op>` immediately preceding a `{{param NAME}}`
/// reference, if the predicate takes that shape. Only covers the
/// simple binary-comparison case; `IN`/`BETWEEN` predicates aren't
/// statically recognized here and fall back to ineligible.
fn find_simple_predicate(report: &Report, param_name: &str) -> Option<(String, String)> {
    const OPS: &[&str] = &[">=", "<=", "<>", "!=", "=", "<", ">"];

    let span = report.placeholders.iter().find(|s| {
        s.kind == crate::placeholder::PlaceholderKind::Param && s.name.eq_ignore_ascii_case(param_name)
    })?;

    let before = report.sql_body[..span.start].trim_end();
    for op in OPS {
        let Some(rest) = before.strip_suffix(op) else {
            continue;
        };
        let rest = rest.trim_end();
        let ident_start = rest
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
            .last()
            .map(|(i, _)| i);
        if let Some(start) = ident_start {
            let column = &rest[start..];
            if !column.is_empty() {
                return Some((column.rsplit('.').next().unwrap().to_string(), (*op).to_string()));
            }
        }
    }
    None
}

/// Extract the top-level `SELECT` list's output column names: aliased
/// items contribute their alias, bare (dotted) identifiers contribute
/// their final segment, anything else (an unaliased expression) is
/// omitted — conservatively excluding it from hybrid eligibility
/// rather than guessing a name for it.
fn extract_select_list_columns(sql: &str) -> HashSet<String> {
    let mut columns = HashSet::new();

    let Some(select_at) = find_top_level_keyword(sql, 0, "select") else {
        return columns;
    };
    let list_start = select_at + "select".len();
    let Some(from_at) = find_top_level_keyword(sql, list_start, "from") else {
        return columns;
    };

    for item in split_top_level_commas(&sql[list_start..from_at]) {
        if let Some(name) = column_name_for_item(item.trim()) {
            columns.insert(name);
        }
    }
    columns
}

fn column_name_for_item(item: &str) -> Option<String> {
    if let Some(pos) = find_top_level_keyword(item, 0, "as") {
        let after = item[pos + 2..].trim_start();
        let ident_len = after
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        return (ident_len > 0).then(|| after[..ident_len].to_string());
    }

    let is_plain_ident = !item.is_empty() && item.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    is_plain_ident.then(|| item.rsplit('.').next().unwrap().to_string())
}

/// Byte offset of the first depth-0, outside-string occurrence of
/// `keyword` at or after `start`, word-bounded on both sides.
fn find_top_level_keyword(sql: &str, start: usize, keyword: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut i = start;
    let mut depth = 0i32;
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
            b')' => depth -= 1,
            _ if depth == 0 => {
                let word_start_ok = i == 0 || !(bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
                if word_start_ok && sql.len() >= i + keyword.len() && sql[i..i + keyword.len()].eq_ignore_ascii_case(keyword) {
                    let after_ok = sql[i + keyword.len()..]
                        .chars()
                        .next()
                        .map(|c| !(c.is_ascii_alphanumeric() || c == '_'))
                        .unwrap_or(true);
                    if after_ok {
                        return Some(i);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn split_top_level_commas(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut last = 0usize;
    let mut i = 0usize;
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
            b')' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(&s[last..i]);
                last = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&s[last..]);
    parts
}

fn check_import_cycle(report_id: &str, registry: &Registry) -> Result<()> {
    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    walk_imports(report_id, registry, &mut visiting, &mut visited)
}

fn walk_imports(
    report_id: &str,
    registry: &Registry,
    visiting: &mut HashSet<String>,
    visited: &mut HashSet<String>,
) -> Result<()> {
    if visited.contains(report_id) {
        return Ok(());
    }
    if !visiting.insert(report_id.to_string()) {
        return Err(Error::ImportCycle(format!("cycle detected at {report_id:?}")));
    }
    if let Some(r) = registry.get(report_id) {
        for import in r.imports() {
            walk_imports(&import.target_report, registry, visiting, visited)?;
        }
    }
    visiting.remove(report_id);
    visited.insert(report_id.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::parse_report;
    use crate::params::ParamValues;
    use crate::registry::Registry;

    #[test]
    fn base_node_depends_on_materializations() {
        let src = "WITH windowed AS MATERIALIZE (SELECT 1) SELECT * FROM windowed";
        let report = parse_report("r", src, 0).unwrap();
        let registry = Registry::empty();
        let plan = build_plan(&report, &ParamValues::default(), &registry, "dev").unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.nodes[0].kind, PlanNodeKind::Materialize("windowed".to_string()));
        assert_eq!(plan.nodes[1].kind, PlanNodeKind::Base);
        assert!(plan.nodes[1].upstream.contains(&plan.nodes[0].fingerprint));
    }

    #[test]
    fn same_params_same_fingerprint() {
        let src = "SELECT {{param X}}";
        let report = parse_report_with_param();
        let registry = Registry::empty();
        let mut params = ParamValues::default();
        params
            .server_params
            .insert("X".to_string(), crate::params::ParamValue::Int(1));
        let _ = src;
        let plan_a = build_plan(&report, &params, &registry, "dev").unwrap();
        let plan_b = build_plan(&report, &params, &registry, "dev").unwrap();
        assert_eq!(
            plan_a.base_node().unwrap().fingerprint,
            plan_b.base_node().unwrap().fingerprint
        );
    }

    fn parse_report_with_param() -> Report {
        let src = "/***PARAMS\n- name: X\n  type: int\n  scope: data\n***/\nSELECT {{param X}}";
        parse_report("r", src, 0).unwrap()
    }
}
