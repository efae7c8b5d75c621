//! Error types for ducksearch-core.
//!
//! Every variant carries the stable error code from the spec's error
//! taxonomy so the CLI, the HTTP layer, and `tracing` logs all speak the
//! same vocabulary.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("report not found: {0}")]
    ReportNotFound(String),

    #[error("invalid metadata block in {report} ({detail})")]
    InvalidMetadataBlock { report: String, detail: String },

    #[error("forbidden SQL construct in {report}: {detail}")]
    ForbiddenSqlConstruct { report: String, detail: String },

    #[error("invalid placeholder in {report} at offset {offset}: {detail}")]
    InvalidPlaceholder {
        report: String,
        offset: usize,
        detail: String,
    },

    #[error("illegal scan path in {report}: {detail}")]
    IllegalScanPath { report: String, detail: String },

    #[error("undeclared name in {report}: {kind} {name:?}")]
    UndeclaredName {
        report: String,
        kind: &'static str,
        name: String,
    },

    #[error("import cycle detected: {0}")]
    ImportCycle(String),

    #[error("duplicate param casing for {0:?}")]
    DuplicateParamCasing(String),

    #[error("bad param type for {name:?}: {detail}")]
    BadParamType { name: String, detail: String },

    #[error("__client__ used on data-scoped param {0:?}")]
    BadScopeRouting(String),

    #[error("build timed out for node {0}")]
    BuildTimeout(String),

    #[error("SQL execution error (report={report}, node={node}): {detail}")]
    SqlExecutionError {
        report: String,
        node: String,
        detail: String,
    },

    #[error("query engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("cache corrupt at {0}")]
    CacheCorrupt(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("another ducksearch process owns {0}")]
    LockHeld(PathBuf),
}

impl Error {
    /// Stable machine-readable code, used in JSON error bodies and lint output.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ReportNotFound(_) => "ReportNotFound",
            Error::InvalidMetadataBlock { .. } => "InvalidMetadataBlock",
            Error::ForbiddenSqlConstruct { .. } => "ForbiddenSqlConstruct",
            Error::InvalidPlaceholder { .. } => "InvalidPlaceholder",
            Error::IllegalScanPath { .. } => "IllegalScanPath",
            Error::UndeclaredName { .. } => "UndeclaredName",
            Error::ImportCycle(_) => "ImportCycle",
            Error::DuplicateParamCasing(_) => "DuplicateParamCasing",
            Error::BadParamType { .. } => "BadParamType",
            Error::BadScopeRouting(_) => "BadScopeRouting",
            Error::BuildTimeout(_) => "BuildTimeout",
            Error::SqlExecutionError { .. } => "SqlExecutionError",
            Error::EngineUnavailable(_) => "EngineUnavailable",
            Error::CacheCorrupt(_) => "CacheCorrupt",
            Error::Io(_) => "IoError",
            Error::DuckDb(_) => "EngineUnavailable",
            Error::Config(_) => "ConfigError",
            Error::LockHeld(_) => "LockHeld",
        }
    }

    /// True if this error should abort the whole dispatch (parse/lint
    /// errors) rather than just the plan node that produced it.
    pub fn is_fatal_to_dispatch(&self) -> bool {
        matches!(
            self,
            Error::ReportNotFound(_)
                | Error::InvalidMetadataBlock { .. }
                | Error::ForbiddenSqlConstruct { .. }
                | Error::InvalidPlaceholder { .. }
                | Error::IllegalScanPath { .. }
                | Error::UndeclaredName { .. }
                | Error::ImportCycle(_)
                | Error::DuplicateParamCasing(_)
                | Error::BadParamType { .. }
                | Error::BadScopeRouting(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::ReportNotFound("x".into()).code(), "ReportNotFound");
        assert_eq!(Error::ImportCycle("a -> b -> a".into()).code(), "ImportCycle");
    }

    #[test]
    fn parse_errors_are_fatal() {
        assert!(Error::ImportCycle("x".into()).is_fatal_to_dispatch());
        assert!(!Error::BuildTimeout("base".into()).is_fatal_to_dispatch());
    }
}
