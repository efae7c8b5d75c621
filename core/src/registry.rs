//! Report discovery and copy-on-write snapshotting (spec.md §4.8, C10).
//!
//! Readers snapshot a pointer (`Arc<HashMap<...>>`) under a short lock
//! then read lock-free; the watcher thread (dev mode only) publishes a
//! new snapshot atomically by swapping the `Arc` under the same lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::metadata::parse_report;
use crate::report::Report;

#[derive(Debug, Clone)]
struct FileStat {
    mtime: std::time::SystemTime,
    len: u64,
}

struct Entry {
    report: Arc<Report>,
    path: PathBuf,
    stat: FileStat,
}

/// Discovers `.sql` files under `reports/` and holds parsed [`Report`]s
/// behind a copy-on-write snapshot.
pub struct Registry {
    root: PathBuf,
    snapshot: Mutex<Arc<HashMap<String, Entry>>>,
}

impl Registry {
    /// An empty registry with no backing root, useful for unit tests
    /// that only need in-memory reports.
    pub fn empty() -> Self {
        Self {
            root: PathBuf::new(),
            snapshot: Mutex::new(Arc::new(HashMap::new())),
        }
    }

    /// Walk `root/reports` and parse every `.sql` file found.
    pub fn discover(root: &Path) -> Result<Self> {
        let reports_dir = root.join("reports");
        let mut map = HashMap::new();

        if reports_dir.exists() {
            walk(&reports_dir, &reports_dir, &mut map)?;
        }

        info!(count = map.len(), root = %root.display(), "discovered reports");

        Ok(Self {
            root: root.to_path_buf(),
            snapshot: Mutex::new(Arc::new(map)),
        })
    }

    /// Look up a report by id (path relative to `reports/`, no `.sql` suffix).
    pub fn get(&self, report_id: &str) -> Option<Arc<Report>> {
        let snapshot = self.snapshot.lock().expect("registry lock poisoned");
        snapshot.get(report_id).map(|e| e.report.clone())
    }

    pub fn report_ids(&self) -> Vec<String> {
        let snapshot = self.snapshot.lock().expect("registry lock poisoned");
        snapshot.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Like [`Self::discover`], but a single unparseable report does not
    /// abort the whole walk: each file that fails to parse is collected
    /// alongside its error instead, so `ducksearch lint` can report every
    /// bad report in the tree rather than stop at the first one.
    pub fn discover_lenient(root: &Path) -> Result<(Self, Vec<(String, Error)>)> {
        let reports_dir = root.join("reports");
        let mut map = HashMap::new();
        let mut errors = Vec::new();

        if reports_dir.exists() {
            walk_lenient(&reports_dir, &reports_dir, &mut map, &mut errors)?;
        }

        Ok((
            Self {
                root: root.to_path_buf(),
                snapshot: Mutex::new(Arc::new(map)),
            },
            errors,
        ))
    }

    /// Re-walk the root and publish a new snapshot, reusing already-parsed
    /// reports whose mtime+size haven't changed.
    pub fn rescan(&self) -> Result<()> {
        let reports_dir = self.root.join("reports");
        let mut map = HashMap::new();
        if reports_dir.exists() {
            walk(&reports_dir, &reports_dir, &mut map)?;
        }

        let previous = self.snapshot.lock().expect("registry lock poisoned").clone();
        let mut reused = 0usize;
        let mut merged = HashMap::new();
        for (id, fresh) in map {
            if let Some(prev) = previous.get(&id) {
                if prev.stat.mtime == fresh.stat.mtime && prev.stat.len == fresh.stat.len {
                    reused += 1;
                    merged.insert(
                        id,
                        Entry {
                            report: prev.report.clone(),
                            path: fresh.path,
                            stat: fresh.stat,
                        },
                    );
                    continue;
                }
            }
            merged.insert(id, fresh);
        }

        let total = merged.len();
        *self.snapshot.lock().expect("registry lock poisoned") = Arc::new(merged);
        info!(total, reused, "registry rescanned");
        Ok(())
    }

    /// Spawn a background polling thread (dev mode, spec.md §4.8). The
    /// thread holds an `Arc` to the registry's snapshot lock indirectly
    /// through `self`'s `'static` lifetime requirement, so callers must
    /// wrap the registry in an `Arc` before calling this.
    pub fn spawn_watcher(self: &Arc<Self>, poll_interval: Duration) {
        let registry = Arc::clone(self);
        std::thread::Builder::new()
            .name("ducksearch-registry-watcher".to_string())
            .spawn(move || loop {
                std::thread::sleep(poll_interval);
                if let Err(e) = registry.rescan() {
                    warn!(error = %e, "registry rescan failed");
                }
            })
            .expect("failed to spawn registry watcher thread");
    }
}

fn walk(base: &Path, dir: &Path, out: &mut HashMap<String, Entry>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(base, &path, out)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }

        let relative = path
            .strip_prefix(base)
            .expect("walked path must be under base")
            .with_extension("");
        let report_id = relative.to_string_lossy().replace('\\', "/");

        let metadata = entry.metadata()?;
        let stat = FileStat {
            mtime: metadata.modified()?,
            len: metadata.len(),
        };

        let source = std::fs::read_to_string(&path)?;
        let report = parse_report(&report_id, &source, stat.len)?;

        out.insert(
            report_id,
            Entry {
                report: Arc::new(report),
                path,
                stat,
            },
        );
    }
    Ok(())
}

fn walk_lenient(
    base: &Path,
    dir: &Path,
    out: &mut HashMap<String, Entry>,
    errors: &mut Vec<(String, Error)>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_lenient(base, &path, out, errors)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }

        let relative = path
            .strip_prefix(base)
            .expect("walked path must be under base")
            .with_extension("");
        let report_id = relative.to_string_lossy().replace('\\', "/");

        let metadata = entry.metadata()?;
        let stat = FileStat {
            mtime: metadata.modified()?,
            len: metadata.len(),
        };

        let source = std::fs::read_to_string(&path)?;
        match parse_report(&report_id, &source, stat.len) {
            Ok(report) => {
                out.insert(
                    report_id,
                    Entry {
                        report: Arc::new(report),
                        path,
                        stat,
                    },
                );
            }
            Err(e) => errors.push((report_id, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discovers_nested_reports() {
        let tmp = TempDir::new().unwrap();
        let reports = tmp.path().join("reports/demo");
        std::fs::create_dir_all(&reports).unwrap();
        std::fs::write(reports.join("hello.sql"), "SELECT 1").unwrap();

        let registry = Registry::discover(tmp.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("demo/hello").is_some());
    }

    #[test]
    fn rescan_reuses_unchanged_entries() {
        let tmp = TempDir::new().unwrap();
        let reports = tmp.path().join("reports");
        std::fs::create_dir_all(&reports).unwrap();
        std::fs::write(reports.join("a.sql"), "SELECT 1").unwrap();

        let registry = Registry::discover(tmp.path()).unwrap();
        let first = registry.get("a").unwrap();
        registry.rescan().unwrap();
        let second = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn empty_registry_has_no_reports() {
        let registry = Registry::empty();
        assert!(registry.is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn discover_lenient_isolates_bad_report() {
        let tmp = TempDir::new().unwrap();
        let reports = tmp.path().join("reports");
        std::fs::create_dir_all(&reports).unwrap();
        std::fs::write(reports.join("good.sql"), "SELECT 1").unwrap();
        std::fs::write(
            reports.join("bad.sql"),
            "SELECT parquet_scan('{{config DATA_ROOT}}/' || {{bind x}} || '.parquet')",
        )
        .unwrap();

        let (registry, errors) = Registry::discover_lenient(tmp.path()).unwrap();
        assert!(registry.get("good").is_some());
        assert!(registry.get("bad").is_none());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "bad");
        assert_eq!(errors[0].1.code(), "IllegalScanPath");
    }
}
