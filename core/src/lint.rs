//! Static validation over a parsed report (spec.md §4.3, component C4).
//!
//! Unlike the parser, which aborts dispatch on the first error, the
//! linter collects every finding in one pass so `ducksearch lint` can
//! report the whole root at once.

use crate::placeholder::PlaceholderKind;
use crate::report::{AppliesToMode, Report, Scope};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintSeverity {
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintFinding {
    pub report_id: String,
    pub code: &'static str,
    pub severity: LintSeverity,
    pub message: String,
}

fn finding(report: &Report, code: &'static str, message: impl Into<String>) -> LintFinding {
    LintFinding {
        report_id: report.id.clone(),
        code,
        severity: LintSeverity::Error,
        message: message.into(),
    }
}

/// Run every check in spec.md §4.3 and return all findings.
pub fn lint_report(report: &Report, registry: &Registry) -> Vec<LintFinding> {
    let mut findings = Vec::new();

    check_param_placeholders(report, &mut findings);
    check_entity_placeholders(report, &mut findings);
    check_imports(report, registry, &mut findings);
    check_literal_sources_and_bindings(report, &mut findings);
    check_applies_to_wrapper_ctes(report, &mut findings);
    check_secrets(report, &mut findings);

    findings
}

/// Every `{{param X}}` must reference a declared param with
/// `scope∈{data,hybrid}`; a `scope=view` param must never be referenced.
fn check_param_placeholders(report: &Report, findings: &mut Vec<LintFinding>) {
    for span in &report.placeholders {
        if span.kind != PlaceholderKind::Param {
            continue;
        }
        match report.find_param(&span.name) {
            None => findings.push(finding(
                report,
                "UndeclaredName",
                format!("{{{{param {}}}}} references an undeclared parameter", span.name),
            )),
            Some(p) if !p.scope.may_appear_in_sql() => findings.push(finding(
                report,
                "BadScopeRouting",
                format!(
                    "{{{{param {}}}}} references a view-scoped parameter, which must not appear in SQL",
                    span.name
                ),
            )),
            Some(_) => {}
        }
    }

    for p in report.all_params() {
        if p.scope == Scope::View {
            let referenced = report
                .placeholders
                .iter()
                .any(|s| s.kind == PlaceholderKind::Param && s.name.eq_ignore_ascii_case(&p.name));
            if referenced {
                findings.push(finding(
                    report,
                    "BadScopeRouting",
                    format!("view-scoped parameter {:?} must not be referenced in SQL", p.name),
                ));
            }
        }
    }
}

/// Every `{{bind X}}`/`{{mat X}}`/`{{import X}}` must reference a
/// declared entity.
fn check_entity_placeholders(report: &Report, findings: &mut Vec<LintFinding>) {
    let materializations = report.materializations();

    for span in &report.placeholders {
        match span.kind {
            PlaceholderKind::Bind => {
                if !report.bindings().iter().any(|b| b.id == span.name) {
                    findings.push(finding(
                        report,
                        "UndeclaredName",
                        format!("{{{{bind {}}}}} references an undeclared binding", span.name),
                    ));
                }
            }
            PlaceholderKind::Mat => {
                if !materializations.iter().any(|m| m.cte_name == span.name) {
                    findings.push(finding(
                        report,
                        "UndeclaredName",
                        format!("{{{{mat {}}}}} references an undeclared materialization", span.name),
                    ));
                }
            }
            PlaceholderKind::Import => {
                if !report.imports().iter().any(|i| i.id == span.name) {
                    findings.push(finding(
                        report,
                        "UndeclaredName",
                        format!("{{{{import {}}}}} references an undeclared import", span.name),
                    ));
                }
            }
            PlaceholderKind::Secret => {
                if !report.secrets().iter().any(|s| s.name == span.name) {
                    findings.push(finding(
                        report,
                        "UndeclaredName",
                        format!("{{{{secret {}}}}} references an undeclared secret", span.name),
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Every import must resolve to a report in the registry; import graph
/// must be acyclic (depth-first cycle detection over the registry).
fn check_imports(report: &Report, registry: &Registry, findings: &mut Vec<LintFinding>) {
    for import in report.imports() {
        if registry.get(&import.target_report).is_none() {
            findings.push(finding(
                report,
                "UndeclaredName",
                format!(
                    "import {:?} targets unknown report {:?}",
                    import.id, import.target_report
                ),
            ));
        }
    }

    let mut visiting = std::collections::HashSet::new();
    let mut visited = std::collections::HashSet::new();
    if let Some(cycle) = find_import_cycle(&report.id, registry, &mut visiting, &mut visited) {
        findings.push(finding(report, "ImportCycle", cycle));
    }
}

fn find_import_cycle(
    report_id: &str,
    registry: &Registry,
    visiting: &mut std::collections::HashSet<String>,
    visited: &mut std::collections::HashSet<String>,
) -> Option<String> {
    if visited.contains(report_id) {
        return None;
    }
    if !visiting.insert(report_id.to_string()) {
        return Some(format!("cycle detected at {report_id:?}"));
    }

    if let Some(r) = registry.get(report_id) {
        for import in r.imports() {
            if let Some(cycle) = find_import_cycle(&import.target_report, registry, visiting, visited) {
                return Some(cycle);
            }
        }
    }

    visiting.remove(report_id);
    visited.insert(report_id.to_string());
    None
}

/// Every literal-source and binding `from_cte`/`source_cte` must name a
/// CTE actually present in the SQL body.
fn check_literal_sources_and_bindings(report: &Report, findings: &mut Vec<LintFinding>) {
    for ls in report.literal_sources() {
        if !sql_defines_cte(&report.sql_body, &ls.from_cte) {
            findings.push(finding(
                report,
                "UndeclaredName",
                format!(
                    "literal source {:?} references undeclared CTE {:?}",
                    ls.id, ls.from_cte
                ),
            ));
        }
    }
    for b in report.bindings() {
        if !sql_defines_cte(&report.sql_body, &b.source_cte) {
            findings.push(finding(
                report,
                "UndeclaredName",
                format!(
                    "binding {:?} references undeclared CTE {:?}",
                    b.id, b.source_cte
                ),
            ));
        }
    }
}

/// Crude but sufficient CTE-presence check: does the SQL body declare
/// `<name> AS` (optionally `MATERIALIZE[_CLOSED]`) at a WITH-clause
/// position? We don't have a full SQL parser, so we look for the
/// identifier immediately followed by whitespace and `AS`.
fn sql_defines_cte(sql: &str, name: &str) -> bool {
    let needle_as = format!("{name} AS");
    if contains_word_boundary(sql, &needle_as) {
        return true;
    }
    // case-insensitive fallback scan
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .windows(2)
        .any(|w| w[0].eq_ignore_ascii_case(name) && w[1].eq_ignore_ascii_case("as"))
}

fn contains_word_boundary(haystack: &str, needle: &str) -> bool {
    haystack.contains(needle)
}

/// `applies_to: wrapper` CTEs must have both `<cte>_base` and `<cte>`
/// present in the SQL body.
fn check_applies_to_wrapper_ctes(report: &Report, findings: &mut Vec<LintFinding>) {
    for p in report.all_params() {
        let Some(applies_to) = &p.applies_to else { continue };
        if applies_to.mode != AppliesToMode::Wrapper {
            continue;
        }
        let base_name = format!("{}_base", applies_to.cte_name);
        if !sql_defines_cte(&report.sql_body, &base_name) || !sql_defines_cte(&report.sql_body, &applies_to.cte_name)
        {
            findings.push(finding(
                report,
                "UndeclaredName",
                format!(
                    "applies_to wrapper for {:?} requires both {:?} and {:?} CTEs",
                    p.name, base_name, applies_to.cte_name
                ),
            ));
        }
    }
}

/// Every secret referenced via `{{secret X}}` must be declared (checked
/// in [`check_entity_placeholders`]), and no declared secret's name may
/// otherwise leak into the SQL body as a bare identifier outside a
/// `{{secret ...}}` placeholder.
fn check_secrets(report: &Report, findings: &mut Vec<LintFinding>) {
    let secret_spans: Vec<(usize, usize)> = report
        .placeholders
        .iter()
        .filter(|span| span.kind == PlaceholderKind::Secret)
        .map(|span| (span.start, span.end))
        .collect();

    for s in report.secrets() {
        if let Some(at) = find_leaked_name(&report.sql_body, &s.name, &secret_spans) {
            findings.push(finding(
                report,
                "SecretLeak",
                format!("secret {:?} appears as a bare identifier in the SQL body at byte {at}, outside any {{{{secret ...}}}} placeholder", s.name),
            ));
        }
    }
}

/// Find the first word-bounded occurrence of `name` in `sql` that does
/// not fall inside one of `exclude_spans` (the report's own
/// `{{secret ...}}` placeholder spans), or `None` if there is none.
fn find_leaked_name(sql: &str, name: &str, exclude_spans: &[(usize, usize)]) -> Option<usize> {
    if name.is_empty() {
        return None;
    }
    let bytes = sql.as_bytes();
    let mut start = 0usize;
    while let Some(found) = sql[start..].find(name) {
        let at = start + found;
        let end = at + name.len();

        let before_ok = at == 0 || !(bytes[at - 1].is_ascii_alphanumeric() || bytes[at - 1] == b'_');
        let after_ok = end >= bytes.len() || !(bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_');
        let inside_placeholder = exclude_spans.iter().any(|(s, e)| at >= *s && end <= *e);

        if before_ok && after_ok && !inside_placeholder {
            return Some(at);
        }
        start = at + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::parse_report;

    #[test]
    fn flags_undeclared_param() {
        let src = "SELECT {{param Missing}}";
        let report = parse_report("r", src, 0).unwrap();
        let registry = Registry::empty();
        let findings = lint_report(&report, &registry);
        assert!(findings.iter().any(|f| f.code == "UndeclaredName"));
    }

    #[test]
    fn clean_report_has_no_findings() {
        let src = r#"
/***PARAMS
- name: Region
  type: str
  scope: data
***/
SELECT * FROM t WHERE region = {{param Region}}
"#;
        let report = parse_report("r", src, 0).unwrap();
        let registry = Registry::empty();
        let findings = lint_report(&report, &registry);
        assert!(findings.is_empty(), "{findings:?}");
    }

    #[test]
    fn flags_undeclared_binding() {
        let src = "SELECT {{bind missing_bind}}";
        let report = parse_report("r", src, 0).unwrap();
        let registry = Registry::empty();
        let findings = lint_report(&report, &registry);
        assert!(findings.iter().any(|f| f.code == "UndeclaredName"));
    }

    #[test]
    fn flags_secret_leaked_as_bare_identifier() {
        let src = r#"
/***SECRETS
- name: API_KEY
***/
SELECT * FROM t WHERE token = API_KEY AND auth = {{secret API_KEY}}
"#;
        let report = parse_report("r", src, 0).unwrap();
        let registry = Registry::empty();
        let findings = lint_report(&report, &registry);
        assert!(findings.iter().any(|f| f.code == "SecretLeak"));
    }

    #[test]
    fn secret_used_only_via_placeholder_has_no_leak_finding() {
        let src = r#"
/***SECRETS
- name: API_KEY
***/
SELECT * FROM t WHERE auth = {{secret API_KEY}}
"#;
        let report = parse_report("r", src, 0).unwrap();
        let registry = Registry::empty();
        let findings = lint_report(&report, &registry);
        assert!(findings.iter().all(|f| f.code != "SecretLeak"), "{findings:?}");
    }
}
