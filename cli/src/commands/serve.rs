//! `ducksearch serve --root PATH [--host HOST] [--port N] [--workers N] [--dev]`
//! (spec.md §6.1, §6.3).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info, warn};

use ducksearch_core::error::Error;
use ducksearch_core::{Config, Dispatcher, Registry, SecretsVault};

const ALLOWED_FS_EXTENSIONS: &[&str] = &["csv", "json", "parquet", "txt", "html", "svg", "png"];
const MAX_FS_BYTES: u64 = 64 * 1024 * 1024;

struct AppState {
    dispatcher: Dispatcher,
    config: Config,
    secrets: SecretsVault,
}

pub fn serve(root: Option<&str>, host: &str, port: u16, workers: Option<usize>, dev: bool) -> i32 {
    tracing_subscriber::fmt::init();

    let root = root.map(PathBuf::from);
    let config = match Config::load(root.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ducksearch serve: {e}");
            return 2;
        }
    };

    let worker_threads = workers.unwrap_or_else(|| {
        2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ducksearch serve: failed to start runtime: {e}");
            return 2;
        }
    };

    runtime.block_on(async move { run(config, host, port, dev).await })
}

async fn run(config: Config, host: &str, port: u16, dev: bool) -> i32 {
    let lock_path = config.lock_path();
    if let Some(parent) = lock_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("ducksearch serve: {e}");
            return 2;
        }
    }
    if let Err(e) = acquire_lock(&lock_path) {
        eprintln!("ducksearch serve: {e}");
        return 2;
    }

    let registry = match Registry::discover(&config.root) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("ducksearch serve: {e}");
            return 2;
        }
    };

    let mut declared_secrets: Vec<String> = registry
        .report_ids()
        .iter()
        .filter_map(|id| registry.get(id))
        .flat_map(|report| report.secrets().iter().map(|s| s.name.clone()).collect::<Vec<_>>())
        .collect();
    declared_secrets.sort();
    declared_secrets.dedup();

    let secrets = match SecretsVault::load(config.resolved_secrets_file().as_deref(), &declared_secrets) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ducksearch serve: {e}");
            return 2;
        }
    };

    if dev {
        registry.spawn_watcher(Duration::from_millis(config.watch_poll_ms));
        info!("registry watcher enabled (--dev)");
    }

    let dispatcher = Dispatcher::new(config.clone(), Arc::clone(&registry), secrets.clone());
    let cache = Arc::clone(dispatcher.cache());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if let Err(e) = cache.sweep() {
                warn!(error = %e, "cache sweep failed");
            }
        }
    });

    let state = Arc::new(AppState { dispatcher, config: config.clone(), secrets });

    let app = Router::new()
        .route("/report", get(handle_report))
        .route("/cache/:kind/:fp", get(handle_cache))
        .route("/fs/:jail/*path", get(handle_fs))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("ducksearch serve: invalid address {host}:{port}: {e}");
            return 2;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("ducksearch serve: failed to bind {addr}: {e}");
            return 2;
        }
    };

    info!(%addr, "ducksearch serving");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        return 1;
    }
    0
}

/// Write `cache/lock`, failing if it already exists — single-process
/// assumption (spec.md §5).
fn acquire_lock(lock_path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(mut f) => {
            use std::io::Write;
            writeln!(f, "{}", std::process::id())?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("another ducksearch process owns {}", lock_path.display()),
        )),
        Err(e) => Err(e),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error_code: String,
    message: String,
    report: String,
    reproduction_url: String,
    detail: String,
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::ReportNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidMetadataBlock { .. }
        | Error::ForbiddenSqlConstruct { .. }
        | Error::InvalidPlaceholder { .. }
        | Error::IllegalScanPath { .. }
        | Error::UndeclaredName { .. }
        | Error::ImportCycle(_)
        | Error::DuplicateParamCasing(_)
        | Error::BadParamType { .. }
        | Error::BadScopeRouting(_) => StatusCode::BAD_REQUEST,
        Error::BuildTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::SqlExecutionError { .. } => StatusCode::BAD_GATEWAY,
        Error::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::CacheCorrupt(_) | Error::Io(_) | Error::DuckDb(_) | Error::Config(_) | Error::LockHeld(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(secrets: &SecretsVault, report_id: &str, reproduction_url: &str, err: Error) -> Response {
    let status = error_status(&err);
    let body = ErrorBody {
        error_code: err.code().to_string(),
        message: secrets.redact(&err.to_string()),
        report: report_id.to_string(),
        reproduction_url: reproduction_url.to_string(),
        detail: secrets.redact(&err.to_string()),
    };
    (status, Json(body)).into_response()
}

/// `GET /report?report=<id>&<params>` (spec.md §6.3).
async fn handle_report(State(state): State<Arc<AppState>>, Query(query): Query<HashMap<String, String>>) -> Response {
    let Some(report_id) = query.get("report").cloned() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error_code: "BadRequest".to_string(),
                message: "missing required `report` query parameter".to_string(),
                report: String::new(),
                reproduction_url: "/report".to_string(),
                detail: String::new(),
            }),
        )
            .into_response();
    };

    let want_html = query.get("format").map(|f| f.as_str()) == Some("html");

    let reproduction_url = reproduction_url(&report_id, &query);

    let raw_params: Vec<(String, String)> = query
        .iter()
        .filter(|(k, _)| k.as_str() != "report" && k.as_str() != "format")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match state.dispatcher.dispatch(&report_id, &raw_params).await {
        Ok(manifest) => {
            if want_html {
                Html(render_html_shell(&report_id, &manifest)).into_response()
            } else {
                Json(manifest).into_response()
            }
        }
        Err(e) => error_response(&state.secrets, &report_id, &reproduction_url, e),
    }
}

fn reproduction_url(report_id: &str, query: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .filter(|(k, _)| !k.starts_with("__client__"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    let qs = pairs
        .into_iter()
        .filter(|(k, _)| k != "report")
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    if qs.is_empty() {
        format!("/report?report={report_id}")
    } else {
        format!("/report?report={report_id}&{qs}")
    }
}

fn render_html_shell(report_id: &str, manifest: &ducksearch_core::Manifest) -> String {
    format!(
        "<!doctype html><html><head><title>{report_id}</title></head><body>\
         <script id=\"ducksearch-manifest\" type=\"application/json\">{}</script>\
         </body></html>",
        serde_json::to_string(manifest).unwrap_or_default()
    )
}

/// `GET /cache/<kind>/<fp>.parquet` (spec.md §6.3).
async fn handle_cache(State(state): State<Arc<AppState>>, AxumPath((kind, fp_file)): AxumPath<(String, String)>) -> Response {
    let Some(fp_hex) = fp_file.strip_suffix(".parquet") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !fp_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let path = state.config.cache_kind_dir(&kind).join(format!("{fp_hex}.parquet"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CACHE_CONTROL, "public, max-age=31536000, immutable".to_string()),
                (header::ETAG, format!("\"{fp_hex}\"")),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /fs/<jail>/<path>` (spec.md §6.3) — jailed static serving with
/// an extension allowlist and a hard byte cap.
async fn handle_fs(State(state): State<Arc<AppState>>, AxumPath((jail, rel_path)): AxumPath<(String, String)>) -> Response {
    if jail.is_empty() || !jail.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let extension = rel_path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    if !ALLOWED_FS_EXTENSIONS.contains(&extension.as_str()) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let jail_root = state.config.root.join("filestore").join(&jail);
    let requested = jail_root.join(&rel_path);

    let Ok(canonical_jail) = jail_root.canonicalize() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(canonical_requested) = requested.canonicalize() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !canonical_requested.starts_with(&canonical_jail) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let metadata = match tokio::fs::metadata(&canonical_requested).await {
        Ok(m) => m,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if metadata.len() > MAX_FS_BYTES {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    match tokio::fs::read(&canonical_requested).await {
        Ok(bytes) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type_for(&extension))], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "csv" => "text/csv",
        "json" => "application/json",
        "parquet" => "application/octet-stream",
        "txt" => "text/plain",
        "html" => "text/html",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}
