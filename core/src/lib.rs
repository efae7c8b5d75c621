//! ducksearch-core: parsing, planning, caching, and execution of
//! parameterized SQL reports compiled to Parquet artifacts.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod lint;
pub mod metadata;
pub mod params;
pub mod placeholder;
pub mod plan;
pub mod registry;
pub mod report;
pub mod secrets;

pub use config::Config;
pub use dispatcher::{Dispatcher, Manifest};
pub use error::{Error, Result};
pub use executor::SchemaColumn;
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use lint::{lint_report, LintFinding, LintSeverity};
pub use metadata::parse_report;
pub use placeholder::{PlaceholderKind, PlaceholderSpan};
pub use plan::{Plan, PlanNode};
pub use registry::Registry;
pub use report::{MetadataBlock, ParamSpec, ParamType, Report, Scope};
pub use secrets::SecretsVault;
