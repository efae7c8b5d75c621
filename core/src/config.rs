//! Root configuration for a ducksearch deployment (spec.md §6.4 `config.toml`).
//!
//! `--root` resolution order:
//! 1. Explicit path passed to `Config::load_from`.
//! 2. `DUCKSEARCH_ROOT` environment variable.
//! 3. Current working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single named constant declared in `config.toml`'s `[constants]`
/// table, resolved by `{{config NAME}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfigConstant {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ConfigConstant {
    /// Render as a SQL literal suitable for direct splicing.
    pub fn as_sql_literal(&self) -> String {
        match self {
            ConfigConstant::Str(s) => format!("'{}'", s.replace('\'', "''")),
            ConfigConstant::Int(i) => i.to_string(),
            ConfigConstant::Float(f) => f.to_string(),
            ConfigConstant::Bool(b) => b.to_string(),
        }
    }

    /// Render as a raw string (used for `InjectedPathStr` / path constants).
    pub fn as_raw_str(&self) -> String {
        match self {
            ConfigConstant::Str(s) => s.clone(),
            ConfigConstant::Int(i) => i.to_string(),
            ConfigConstant::Float(f) => f.to_string(),
            ConfigConstant::Bool(b) => b.to_string(),
        }
    }
}

/// Cache sizing and TTL defaults, overridable per-report via a `CACHE` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLimits {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_bytes_per_kind")]
    pub max_bytes_per_kind: u64,
    #[serde(default = "default_max_bytes_total")]
    pub max_bytes_total: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_bytes_per_kind: default_max_bytes_per_kind(),
            max_bytes_total: default_max_bytes_total(),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_max_bytes_per_kind() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_max_bytes_total() -> u64 {
    8 * 1024 * 1024 * 1024
}

/// Root configuration for a ducksearch deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for this deployment (not serialized — derived from load path).
    #[serde(skip)]
    pub root: PathBuf,

    /// Deployment identifier, salts cache paths (spec.md §4.9, §6.1).
    #[serde(default = "default_deployment_id")]
    pub deployment_id: String,

    /// Path to the secrets file, relative to `root` unless absolute.
    pub secrets_file: Option<PathBuf>,

    /// Named constants available to `{{config NAME}}` placeholders.
    #[serde(default)]
    pub constants: HashMap<String, ConfigConstant>,

    #[serde(default)]
    pub cache: CacheLimits,

    /// Hybrid-eligibility value-set cap (spec.md §4.5, default 256).
    #[serde(default = "default_hybrid_value_cap")]
    pub hybrid_value_cap: usize,

    /// Registry poll cadence in dev mode (spec.md §4.8, default 1s).
    #[serde(default = "default_watch_poll_ms")]
    pub watch_poll_ms: u64,
}

fn default_deployment_id() -> String {
    std::env::var("DUCKSEARCH_DEPLOYMENT_ID").unwrap_or_else(|_| "default".to_string())
}

fn default_hybrid_value_cap() -> usize {
    256
}

fn default_watch_poll_ms() -> u64 {
    1_000
}

impl Config {
    /// Create a default config rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            deployment_id: default_deployment_id(),
            secrets_file: None,
            constants: HashMap::new(),
            cache: CacheLimits::default(),
            hybrid_value_cap: default_hybrid_value_cap(),
            watch_poll_ms: default_watch_poll_ms(),
        }
    }

    /// Resolve `--root` using the standard resolution order, then load.
    pub fn load(explicit_root: Option<&Path>) -> Result<Self> {
        let root = resolve_root(explicit_root)?;
        Self::load_from(&root)
    }

    /// Load config from a specific root's `config.toml`, or defaults if absent.
    pub fn load_from(root: &Path) -> Result<Self> {
        let config_path = root.join("config.toml");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let mut config: Config = toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse config.toml: {e}")))?;
            config.root = root.to_path_buf();
            Ok(config)
        } else {
            Ok(Self::with_root(root))
        }
    }

    /// Persist to `root/config.toml`.
    pub fn save(&self) -> Result<()> {
        let config_path = self.root.join("config.toml");
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(config_path, contents)?;
        Ok(())
    }

    // Path helpers (spec.md §6.4 on-disk layout)

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn cache_kind_dir(&self, kind: &str) -> PathBuf {
        self.cache_dir().join(kind)
    }

    pub fn cache_tmp_dir(&self) -> PathBuf {
        self.cache_dir().join("tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.cache_dir().join("lock")
    }

    pub fn composites_dir(&self) -> PathBuf {
        self.root.join("composites")
    }

    /// Resolve the secrets file path (relative to root unless absolute),
    /// honoring the `DUCKSEARCH_SECRETS_FILE` env override.
    pub fn resolved_secrets_file(&self) -> Option<PathBuf> {
        if let Ok(path) = std::env::var("DUCKSEARCH_SECRETS_FILE") {
            return Some(PathBuf::from(path));
        }
        self.secrets_file.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.root.join(p)
            }
        })
    }
}

/// Resolve `--root` using the standard resolution order (spec.md §6.1).
fn resolve_root(explicit_root: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit_root {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("DUCKSEARCH_ROOT") {
        return Ok(PathBuf::from(path));
    }

    std::env::current_dir().map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn with_root_has_sane_defaults() {
        let config = Config::with_root("/tmp/test-ducksearch");
        assert_eq!(config.cache.ttl_seconds, 300);
        assert_eq!(config.hybrid_value_cap, 256);
    }

    #[test]
    fn paths_nest_under_root() {
        let config = Config::with_root("/tmp/test-ducksearch");
        assert_eq!(
            config.reports_dir(),
            PathBuf::from("/tmp/test-ducksearch/reports")
        );
        assert_eq!(
            config.cache_kind_dir("materialize"),
            PathBuf::from("/tmp/test-ducksearch/cache/materialize")
        );
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/tmp/test-ducksearch/cache/lock")
        );
    }

    #[test]
    fn save_and_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path()).unwrap();

        let mut config = Config::with_root(tmp.path());
        config
            .constants
            .insert("DATA_ROOT".to_string(), ConfigConstant::Str("/data".into()));
        config.save().unwrap();

        let loaded = Config::load_from(tmp.path()).unwrap();
        assert_eq!(loaded.cache.ttl_seconds, config.cache.ttl_seconds);
        assert_eq!(
            loaded.constants.get("DATA_ROOT"),
            Some(&ConfigConstant::Str("/data".into()))
        );
    }

    #[test]
    fn config_constant_sql_literal_escapes_quotes() {
        let c = ConfigConstant::Str("O'Brien".to_string());
        assert_eq!(c.as_sql_literal(), "'O''Brien'");
    }
}
