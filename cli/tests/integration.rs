//! End-to-end tests over the public `ducksearch_core` dispatch pipeline:
//! write real report files to a temp root, then dispatch against them
//! the same way `ducksearch serve` would.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ducksearch_core::{lint_report, Config, Dispatcher, Registry, SecretsVault};
use tempfile::TempDir;

fn write_report(root: &Path, id: &str, body: &str) {
    let path = root.join("reports").join(format!("{id}.sql"));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn dispatcher(tmp: &TempDir) -> Dispatcher {
    let config = Config::with_root(tmp.path());
    let registry = Arc::new(Registry::discover(tmp.path()).unwrap());
    Dispatcher::new(config, registry, SecretsVault::empty())
}

/// Scenario 1: re-issuing the same request hits the cache instead of
/// rebuilding (spec.md §8).
#[tokio::test]
async fn rolling_latency_reissue_is_a_cache_hit() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "deep_demos/speed/rolling_latency",
        r#"
/***PARAMS
- name: Region
  type: str
  scope: data
- name: DayWindow
  type: int
  scope: data
***/
SELECT i AS day, {{param Region}} AS region, i * 10 AS latency_ms
FROM range({{param DayWindow}}) AS t(i)
"#,
    );

    let dispatcher = dispatcher(&tmp);
    let params = vec![("Region".to_string(), "north".to_string()), ("DayWindow".to_string(), "2".to_string())];

    let first = dispatcher.dispatch("deep_demos/speed/rolling_latency", &params).await.unwrap();
    let first_mtime = fs::metadata(&first.base_parquet).unwrap().modified().unwrap();

    let second = dispatcher.dispatch("deep_demos/speed/rolling_latency", &params).await.unwrap();
    let second_mtime = fs::metadata(&second.base_parquet).unwrap().modified().unwrap();

    assert_eq!(first.base_parquet, second.base_parquet);
    assert_eq!(first_mtime, second_mtime, "re-issued request should not rebuild the artifact");
}

/// Scenario 2: a binding resolves the partition value looked up from
/// its materialized source CTE (spec.md §8).
#[tokio::test]
async fn binding_resolves_partition_value() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "deep_demos/bindings/segment_focus",
        r#"
/***PARAMS
- name: Segment
  type: str
  scope: data
- name: Shard
  type: int
  scope: data
***/
/***BINDINGS
- id: segment_label
  source_cte: segments
  key_param: Shard
  key_column: shard_id
  value_column: label
  kind: partition
***/
WITH segments AS MATERIALIZE (
  SELECT i AS shard_id, CASE WHEN i = 2 THEN 'Fast lane' ELSE 'Standard' END AS label
  FROM range(5) AS t(i)
)
SELECT shard_id, label, {{param Segment}} AS segment, {{bind segment_label}} AS resolved_label
FROM segments
WHERE shard_id = {{param Shard}}
"#,
    );

    let dispatcher = dispatcher(&tmp);
    let params = vec![("Segment".to_string(), "alpha".to_string()), ("Shard".to_string(), "2".to_string())];

    let manifest = dispatcher.dispatch("deep_demos/bindings/segment_focus", &params).await.unwrap();
    assert_eq!(manifest.bindings.get("segment_label"), Some(&"Fast lane".to_string()));
}

/// Scenario 3: a hybrid-scoped param sent only as a `__client__` hint
/// does not change the base artifact's fingerprint (spec.md §8, IP3).
#[tokio::test]
async fn client_only_hint_preserves_base_fingerprint() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "deep_demos/bindings/segment_hint",
        r#"
/***PARAMS
- name: Segment
  type: str
  scope: data
- name: Shard
  type: int
  scope: hybrid
***/
SELECT i AS shard_id, {{param Segment}} AS segment
FROM range(5) AS t(i)
"#,
    );

    let dispatcher = dispatcher(&tmp);

    let base = dispatcher
        .dispatch("deep_demos/bindings/segment_hint", &[("Segment".to_string(), "alpha".to_string())])
        .await
        .unwrap();

    let with_hint = dispatcher
        .dispatch(
            "deep_demos/bindings/segment_hint",
            &[
                ("Segment".to_string(), "alpha".to_string()),
                ("__client__Shard".to_string(), "2".to_string()),
            ],
        )
        .await
        .unwrap();

    assert_eq!(base.base_parquet, with_hint.base_parquet);
    assert_eq!(with_hint.client_params.get("Shard"), Some(&"2".to_string()));
}

/// Scenario 3b: a bare (unprefixed) hybrid-scoped param auto-promotes
/// to client-side routing when its predicate satisfies spec.md §4.5 —
/// the column it's compared against is in the base result set, the
/// comparison is a plain `=`, and the param flows into no
/// materialization/binding/import/scan-path (spec.md §4.5, §8).
#[tokio::test]
async fn bare_hybrid_param_auto_promotes_without_a_client_prefix() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "deep_demos/bindings/segment_auto",
        r#"
/***PARAMS
- name: Shard
  type: int
  scope: hybrid
***/
SELECT i AS shard_id, i * 10 AS latency_ms
FROM range(5) AS t(i)
WHERE shard_id = {{param Shard}}
"#,
    );

    let dispatcher = dispatcher(&tmp);

    let manifest = dispatcher
        .dispatch("deep_demos/bindings/segment_auto", &[("Shard".to_string(), "2".to_string())])
        .await
        .unwrap();

    assert_eq!(manifest.client_params.get("Shard"), Some(&"2".to_string()));
}

/// Scenario 4: the imported report's base artifact is built once and
/// reused rather than rebuilt while the importing report resolves
/// (spec.md §8).
#[tokio::test]
async fn import_reuses_target_reports_base_artifact() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "deep_demos/imports/shared_base",
        r#"
/***PARAMS
- name: Topic
  type: str
  scope: data
***/
SELECT i AS id, {{param Topic}} AS topic
FROM range(3) AS t(i)
"#,
    );
    write_report(
        tmp.path(),
        "deep_demos/imports/topic_drilldown",
        r#"
/***PARAMS
- name: Topic
  type: str
  scope: data
- name: FocusVariant
  type: str
  scope: data
***/
/***IMPORTS
- id: stories
  target_report: deep_demos/imports/shared_base
  pass_params: [Topic]
***/
SELECT * FROM read_parquet({{import stories}}) WHERE topic = {{param Topic}} AND {{param FocusVariant}} IS NOT NULL
"#,
    );

    let dispatcher = dispatcher(&tmp);
    let topic_params = [("Topic".to_string(), "routing".to_string())];

    let shared_first = dispatcher.dispatch("deep_demos/imports/shared_base", &topic_params).await.unwrap();
    let shared_first_mtime = fs::metadata(&shared_first.base_parquet).unwrap().modified().unwrap();

    let parent = dispatcher
        .dispatch(
            "deep_demos/imports/topic_drilldown",
            &[
                ("Topic".to_string(), "routing".to_string()),
                ("FocusVariant".to_string(), "beta".to_string()),
            ],
        )
        .await
        .unwrap();
    assert!(Path::new(&parent.base_parquet).exists());

    let shared_again = dispatcher.dispatch("deep_demos/imports/shared_base", &topic_params).await.unwrap();
    let shared_again_mtime = fs::metadata(&shared_again.base_parquet).unwrap().modified().unwrap();

    assert_eq!(shared_first.base_parquet, shared_again.base_parquet);
    assert_eq!(
        shared_first_mtime, shared_again_mtime,
        "the import's dispatch during topic_drilldown must reuse shared_base's artifact, not rebuild it"
    );
}

/// Scenario 5: a `parquet_scan` argument built from concatenation is
/// rejected as `IllegalScanPath` as soon as the report is parsed, so
/// lenient discovery isolates it instead of aborting the whole walk
/// (spec.md §8).
#[tokio::test]
async fn illegal_scan_path_is_isolated_by_lenient_discovery() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "deep_demos/bad/illegal_scan",
        "SELECT * FROM parquet_scan('{{config DATA_ROOT}}/' || {{bind x}} || '.parquet')",
    );

    let (registry, errors) = Registry::discover_lenient(tmp.path()).unwrap();
    assert!(registry.get("deep_demos/bad/illegal_scan").is_none());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1.code(), "IllegalScanPath");
}

/// Scenario 6: concurrent identical requests single-flight to exactly
/// one build, all resolving to the same artifact (spec.md §8, IP4).
#[tokio::test]
async fn concurrent_identical_requests_single_flight() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "deep_demos/speed/fanout_probe",
        r#"
/***PARAMS
- name: Region
  type: str
  scope: data
***/
SELECT {{param Region}} AS region, i
FROM range(10000) AS t(i)
"#,
    );

    let dispatcher = Arc::new(dispatcher(&tmp));
    let params = vec![("Region".to_string(), "north".to_string())];

    let mut handles = Vec::new();
    for _ in 0..50 {
        let dispatcher = Arc::clone(&dispatcher);
        let params = params.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.dispatch("deep_demos/speed/fanout_probe", &params).await.unwrap()
        }));
    }

    let mut paths = std::collections::HashSet::new();
    for handle in handles {
        paths.insert(handle.await.unwrap().base_parquet);
    }
    assert_eq!(paths.len(), 1, "every concurrent dispatch should resolve to the same artifact");
}

/// `ducksearch lint`'s underlying check set: a clean report has no
/// findings.
#[test]
fn lint_report_flags_nothing_on_a_clean_report() {
    let tmp = TempDir::new().unwrap();
    write_report(
        tmp.path(),
        "clean",
        r#"
/***PARAMS
- name: Region
  type: str
  scope: data
***/
SELECT * FROM t WHERE region = {{param Region}}
"#,
    );

    let registry = Registry::discover(tmp.path()).unwrap();
    let report = registry.get("clean").unwrap();
    let findings = lint_report(&report, &registry);
    assert!(findings.is_empty(), "{findings:?}");
}
