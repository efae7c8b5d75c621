//! Content-addressed artifact cache with single-flight builds, TTL, and
//! atomic publish (spec.md §4.6, component C7).
//!
//! Directory layout under `cache/`:
//! `{artifacts,slices,materialize,literal_sources,bindings,facets,charts,manifests,tmp}/`,
//! one file per node kind subdirectory, named `<fingerprint_hex>.parquet`.
//! Atomic publish reuses [`atomic`] (temp-file-then-rename, `AlreadyExists`
//! treated as a benign content-addressed dedup hit) verbatim from the
//! teacher's storage layer.

pub mod atomic;
mod token;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::config::CacheLimits;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

use token::BuildToken;

/// Per-node soft/hard build timeouts (spec.md §5 "Cancellation & timeouts").
const SOFT_TIMEOUT: Duration = Duration::from_secs(30);
const HARD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// What a cache probe/build resolves to. Most node kinds produce a
/// Parquet file; bindings resolve to a single literal value looked up
/// from an already-materialized Parquet (spec.md §4.10 manifest shape
/// `bindings: {id: value}` — a value, not a path).
#[derive(Debug, Clone)]
pub enum CacheEntry {
    File { path: PathBuf, size_bytes: u64 },
    Value(String),
}

/// Outcome of a file probe.
enum Probe {
    Fresh(CacheEntry),
    Stale(CacheEntry),
    Miss,
}

impl CacheEntry {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            CacheEntry::File { path, .. } => Some(path),
            CacheEntry::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            CacheEntry::Value(v) => Some(v),
            CacheEntry::File { .. } => None,
        }
    }
}

/// Outcome a builder closure reports: either "I wrote the file you gave
/// me a tmp path for" or "here's a computed value, no file involved."
pub enum BuildOutcome {
    WroteFile,
    Value(String),
}

pub struct Cache {
    root: PathBuf,
    limits: CacheLimits,
    in_flight: Mutex<HashMap<Fingerprint, Arc<BuildToken>>>,
    last_access: Mutex<HashMap<Fingerprint, Instant>>,
    /// In-memory store for `Value` entries (bindings); these aren't
    /// backed by a file, so they don't survive a process restart —
    /// acceptable since a binding lookup is cheap to redo.
    values: Mutex<HashMap<Fingerprint, String>>,
}

impl Cache {
    pub fn new(root: PathBuf, limits: CacheLimits) -> Self {
        Self {
            root,
            limits,
            in_flight: Mutex::new(HashMap::new()),
            last_access: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind_dir(&self, kind: &str) -> PathBuf {
        self.root.join(kind)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn target_path(&self, kind: &str, fp: &Fingerprint) -> PathBuf {
        self.kind_dir(kind).join(format!("{}.parquet", fp.to_hex()))
    }

    fn touch(&self, fp: Fingerprint) {
        self.last_access
            .lock()
            .expect("cache lock poisoned")
            .insert(fp, Instant::now());
    }

    /// Probe for an existing file artifact, distinguishing a fresh hit
    /// from one that's past its TTL (spec.md §4.6: "expired files are
    /// treated as misses but may serve stale-while-revalidate when
    /// explicitly enabled").
    fn probe_file(&self, kind: &str, fp: &Fingerprint, ttl: Duration) -> Probe {
        let path = self.target_path(kind, fp);
        let Ok(metadata) = std::fs::metadata(&path) else {
            return Probe::Miss;
        };
        let Ok(modified) = metadata.modified() else {
            return Probe::Miss;
        };
        let entry = CacheEntry::File {
            path,
            size_bytes: metadata.len(),
        };
        if modified.elapsed().unwrap_or(Duration::MAX) > ttl {
            Probe::Stale(entry)
        } else {
            Probe::Fresh(entry)
        }
    }

    fn probe_value(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        let values = self.values.lock().expect("cache lock poisoned");
        let value = values.get(fp)?.clone();
        drop(values);
        self.touch(*fp);
        Some(CacheEntry::Value(value))
    }

    /// Probe or build the artifact for `(kind, fp)`, single-flighting
    /// concurrent builders for the same fingerprint (spec.md IP4). When
    /// `stale_while_revalidate` is set and the on-disk file is past its
    /// TTL, the stale file is served immediately while a refresh build
    /// runs in the background (spec.md §4.6).
    pub async fn build_or_wait<F>(
        self: &Arc<Self>,
        kind: &str,
        fp: Fingerprint,
        ttl: Duration,
        stale_while_revalidate: bool,
        build: F,
    ) -> Result<CacheEntry>
    where
        F: Fn(&Path) -> Result<BuildOutcome> + Send + Sync + 'static,
    {
        if kind == "bindings" {
            if let Some(hit) = self.probe_value(&fp) {
                return Ok(hit);
            }
        } else {
            match self.probe_file(kind, &fp, ttl) {
                Probe::Fresh(entry) => {
                    self.touch(fp);
                    return Ok(entry);
                }
                Probe::Stale(entry) if stale_while_revalidate => {
                    self.touch(fp);
                    self.spawn_revalidate(kind.to_string(), fp, build);
                    return Ok(entry);
                }
                Probe::Stale(_) | Probe::Miss => {}
            }
        }

        self.build_and_publish(kind, fp, Arc::new(build)).await
    }

    /// Kick off a background rebuild for `(kind, fp)` without making the
    /// caller wait, reusing the same single-flight token so a concurrent
    /// request for the same fingerprint doesn't start a second build.
    fn spawn_revalidate<F>(self: &Arc<Self>, kind: String, fp: Fingerprint, build: F)
    where
        F: Fn(&Path) -> Result<BuildOutcome> + Send + Sync + 'static,
    {
        if self.in_flight.lock().expect("cache lock poisoned").contains_key(&fp) {
            return;
        }
        let cache = Arc::clone(self);
        let build: Arc<dyn Fn(&Path) -> Result<BuildOutcome> + Send + Sync> = Arc::new(build);
        tokio::spawn(async move {
            if let Err(e) = cache.build_and_publish(&kind, fp, build).await {
                warn!(kind, error = %e, "stale-while-revalidate refresh failed");
            }
        });
    }

    /// Single-flighted build: claim the build token for `fp`, run
    /// `build` on a blocking thread (racing the soft/hard timeouts), and
    /// atomically publish the result. Concurrent callers for the same
    /// fingerprint wait on the same token instead of rebuilding.
    async fn build_and_publish(
        self: &Arc<Self>,
        kind: &str,
        fp: Fingerprint,
        build: Arc<dyn Fn(&Path) -> Result<BuildOutcome> + Send + Sync>,
    ) -> Result<CacheEntry> {
        let token = {
            let mut in_flight = self.in_flight.lock().expect("cache lock poisoned");
            if let Some(existing) = in_flight.get(&fp) {
                Arc::clone(existing)
            } else {
                let token = BuildToken::new();
                in_flight.insert(fp, Arc::clone(&token));
                token
            }
        };

        if token.is_complete() {
            return token.wait().await.map_err(arc_error_into);
        }

        // Re-check: are we the one who just inserted a fresh token? A
        // fresh token has no result yet and nobody else could have
        // raced us into the `in_flight` map for this fingerprint while
        // we held the lock above, so the first caller to observe a
        // non-complete, just-inserted token is the builder.
        if self.claim_builder(fp, &token) {
            std::fs::create_dir_all(self.tmp_dir()).map_err(Error::Io)?;
            std::fs::create_dir_all(self.kind_dir(kind)).map_err(Error::Io)?;

            let tmp_path = atomic::temp_path(&self.target_path(kind, &fp));
            let target_path = self.target_path(kind, &fp);

            let outcome = run_build_with_timeout(build, tmp_path.clone()).await;
            let result = match outcome {
                Ok(BuildOutcome::WroteFile) => {
                    atomic::rename_into_place(&tmp_path, &target_path)
                        .map_err(Error::Io)
                        .and_then(|_| std::fs::metadata(&target_path).map_err(Error::Io))
                        .map(|metadata| CacheEntry::File {
                            path: target_path.clone(),
                            size_bytes: metadata.len(),
                        })
                }
                Ok(BuildOutcome::Value(v)) => {
                    self.values.lock().expect("cache lock poisoned").insert(fp, v.clone());
                    Ok(CacheEntry::Value(v))
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    Err(e)
                }
            };

            let shared_result = result.as_ref().map(|e| e.clone()).map_err(|e| Arc::new(clone_error(e)));
            token.complete(shared_result);

            self.in_flight.lock().expect("cache lock poisoned").remove(&fp);
            self.touch(fp);

            return result;
        }

        token.wait().await.map_err(arc_error_into)
    }

    /// Returns true if this call is the one that should run the build
    /// (the token was freshly inserted and has no result yet).
    fn claim_builder(&self, fp: Fingerprint, token: &Arc<BuildToken>) -> bool {
        let in_flight = self.in_flight.lock().expect("cache lock poisoned");
        match in_flight.get(&fp) {
            Some(t) => Arc::ptr_eq(t, token) && !token.is_complete(),
            None => false,
        }
    }

    /// Sweep every kind directory, evicting least-recently-used files
    /// once the configured per-kind or global byte budget is exceeded.
    /// Files with no recorded access are assumed to have been accessed
    /// at their mtime.
    pub fn sweep(&self) -> Result<()> {
        const KINDS: &[&str] = &[
            "artifacts",
            "slices",
            "materialize",
            "literal_sources",
            "facets",
            "charts",
        ];

        let mut total_bytes = 0u64;
        let mut all_files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();

        for kind in KINDS {
            let dir = self.kind_dir(kind);
            if !dir.exists() {
                continue;
            }
            let mut kind_bytes = 0u64;
            let mut kind_files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                kind_bytes += metadata.len();
                kind_files.push((entry.path(), metadata.len(), metadata.modified()?));
            }
            if kind_bytes > self.limits.max_bytes_per_kind {
                self.evict_lru(kind, &mut kind_files, kind_bytes, self.limits.max_bytes_per_kind)?;
            }
            total_bytes += kind_bytes;
            all_files.extend(kind_files);
        }

        if total_bytes > self.limits.max_bytes_total {
            self.evict_lru("(global)", &mut all_files, total_bytes, self.limits.max_bytes_total)?;
        }

        Ok(())
    }

    fn evict_lru(
        &self,
        kind: &str,
        files: &mut [(PathBuf, u64, SystemTime)],
        mut current_bytes: u64,
        budget: u64,
    ) -> Result<()> {
        let last_access = self.last_access.lock().expect("cache lock poisoned").clone();
        files.sort_by_key(|(path, _, mtime)| {
            let fp = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.to_string());
            fp.and_then(|hex| last_access.iter().find(|(k, _)| k.to_hex() == hex).map(|(_, t)| *t))
                .map(|accessed| Instant::now().duration_since(accessed))
                .unwrap_or_else(|| mtime.elapsed().unwrap_or(Duration::MAX))
        });
        files.reverse();

        for (path, size, _) in files.iter() {
            if current_bytes <= budget {
                break;
            }
            if std::fs::remove_file(path).is_ok() {
                current_bytes = current_bytes.saturating_sub(*size);
                debug!(kind, path = %path.display(), "evicted cache entry over budget");
            } else {
                warn!(kind, path = %path.display(), "failed to evict cache entry");
            }
        }
        Ok(())
    }
}

/// Run a builder closure on a blocking thread, racing it first against
/// the soft timeout (logged but non-fatal) and then the hard timeout
/// (fatal, `BuildTimeout`). The engine has no native cancel, so a
/// hard-timed-out task is simply abandoned; its tmp file is removed by
/// the caller.
async fn run_build_with_timeout(
    build: Arc<dyn Fn(&Path) -> Result<BuildOutcome> + Send + Sync>,
    tmp_path: PathBuf,
) -> Result<BuildOutcome> {
    let handle = tokio::task::spawn_blocking(move || build(&tmp_path));
    tokio::pin!(handle);

    if tokio::time::timeout(SOFT_TIMEOUT, &mut handle).await.is_err() {
        warn!(soft = ?SOFT_TIMEOUT, "build node exceeded soft timeout, still waiting for hard timeout");
    } else {
        return (&mut handle).await.map_err(|join_err| Error::SqlExecutionError {
            report: "<unknown>".to_string(),
            node: "<unknown>".to_string(),
            detail: format!("build task panicked: {join_err}"),
        })?;
    }

    match tokio::time::timeout(HARD_TIMEOUT.saturating_sub(SOFT_TIMEOUT), &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(Error::SqlExecutionError {
            report: "<unknown>".to_string(),
            node: "<unknown>".to_string(),
            detail: format!("build task panicked: {join_err}"),
        }),
        Err(_) => Err(Error::BuildTimeout("node exceeded hard timeout".to_string())),
    }
}

fn arc_error_into(e: Arc<Error>) -> Error {
    clone_error(&e)
}

/// `Error` doesn't derive `Clone` (it wraps `io::Error`/`duckdb::Error`,
/// neither of which are cloneable), so a shared `Arc<Error>` result is
/// rendered back into an owned `Error` by re-describing it from its
/// stable code and display text rather than cloning the original.
fn clone_error(e: &Error) -> Error {
    Error::SqlExecutionError {
        report: "<shared-build-failure>".to_string(),
        node: e.code().to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintBuilder;
    use tempfile::TempDir;

    fn fp(n: i64) -> Fingerprint {
        let mut b = FingerprintBuilder::new();
        b.field_i64(n);
        b.finalize()
    }

    #[tokio::test]
    async fn builds_and_then_hits_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(Cache::new(tmp.path().to_path_buf(), CacheLimits::default()));
        let f = fp(1);

        let entry = cache
            .build_or_wait("artifacts", f, Duration::from_secs(300), false, |tmp_path| {
                std::fs::write(tmp_path, b"hello").unwrap();
                Ok(BuildOutcome::WroteFile)
            })
            .await
            .unwrap();
        assert!(entry.as_path().unwrap().exists());

        let build_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let build_count_clone = std::sync::Arc::clone(&build_count);
        let entry2 = cache
            .build_or_wait("artifacts", f, Duration::from_secs(300), false, move |tmp_path| {
                build_count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                std::fs::write(tmp_path, b"hello-again").unwrap();
                Ok(BuildOutcome::WroteFile)
            })
            .await
            .unwrap();
        assert_eq!(
            build_count.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "second call should be a cache hit, not rebuild"
        );
        assert_eq!(entry.as_path(), entry2.as_path());
    }

    #[tokio::test]
    async fn value_entries_do_not_touch_disk() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(Cache::new(tmp.path().to_path_buf(), CacheLimits::default()));
        let f = fp(2);

        let entry = cache
            .build_or_wait("bindings", f, Duration::from_secs(300), false, |_| {
                Ok(BuildOutcome::Value("Fast lane".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(entry.as_value(), Some("Fast lane"));
    }

    #[tokio::test]
    async fn failed_build_removes_tmp_file() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(Cache::new(tmp.path().to_path_buf(), CacheLimits::default()));
        let f = fp(3);

        let result = cache
            .build_or_wait("artifacts", f, Duration::from_secs(300), false, |tmp_path| {
                std::fs::write(tmp_path, b"partial").unwrap();
                Err(Error::BuildTimeout("node".to_string()))
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn expired_file_is_a_plain_miss_without_stale_while_revalidate() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(Cache::new(tmp.path().to_path_buf(), CacheLimits::default()));
        let f = fp(4);

        cache
            .build_or_wait("artifacts", f, Duration::from_secs(0), false, |tmp_path| {
                std::fs::write(tmp_path, b"v1").unwrap();
                Ok(BuildOutcome::WroteFile)
            })
            .await
            .unwrap();

        let build_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let build_count_clone = Arc::clone(&build_count);
        cache
            .build_or_wait("artifacts", f, Duration::from_secs(0), false, move |tmp_path| {
                build_count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                std::fs::write(tmp_path, b"v2").unwrap();
                Ok(BuildOutcome::WroteFile)
            })
            .await
            .unwrap();
        assert_eq!(build_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_the_old_file_immediately() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(Cache::new(tmp.path().to_path_buf(), CacheLimits::default()));
        let f = fp(5);

        cache
            .build_or_wait("artifacts", f, Duration::from_secs(0), false, |tmp_path| {
                std::fs::write(tmp_path, b"v1").unwrap();
                Ok(BuildOutcome::WroteFile)
            })
            .await
            .unwrap();

        let entry = cache
            .build_or_wait("artifacts", f, Duration::from_secs(0), true, |tmp_path| {
                std::fs::write(tmp_path, b"v2").unwrap();
                Ok(BuildOutcome::WroteFile)
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read(entry.as_path().unwrap()).unwrap(), b"v1");
    }
}
