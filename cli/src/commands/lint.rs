//! `ducksearch lint --root PATH` (spec.md §6.1).

use std::path::PathBuf;

use ducksearch_core::{lint_report, Config, Registry};

/// Validate every report under `root`. Exit 0 iff every report passes,
/// 1 if any report has findings (including a report that failed to
/// parse at all, e.g. `IllegalScanPath`), 2 if the tool itself failed
/// (bad root, registry I/O error).
pub fn lint(root: Option<&str>) -> i32 {
    let root = root.map(PathBuf::from);

    let config = match Config::load(root.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ducksearch lint: {e}");
            return 2;
        }
    };

    let (registry, parse_errors) = match Registry::discover_lenient(&config.root) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("ducksearch lint: {e}");
            return 2;
        }
    };

    let mut failed = false;

    for (report_id, err) in &parse_errors {
        failed = true;
        eprintln!("{report_id}: Error [{}] {err}", err.code());
    }

    if registry.is_empty() && parse_errors.is_empty() {
        eprintln!("ducksearch lint: no reports found under {}", config.reports_dir().display());
        return 0;
    }

    for report_id in registry.report_ids() {
        let Some(report) = registry.get(&report_id) else {
            continue;
        };
        let findings = lint_report(&report, &registry);
        if findings.is_empty() {
            continue;
        }
        failed = true;
        for finding in &findings {
            eprintln!(
                "{}: {:?} [{}] {}",
                finding.report_id, finding.severity, finding.code, finding.message
            );
        }
    }

    if failed {
        1
    } else {
        println!("ducksearch lint: {} report(s) passed", registry.len());
        0
    }
}
