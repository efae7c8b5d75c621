//! The report data model (spec.md §3).
//!
//! A [`Report`] is immutable once parsed: metadata blocks, the SQL body,
//! placeholder spans, and a source fingerprint. Reports are produced by
//! the metadata parser ([`crate::metadata`]) and the placeholder parser
//! ([`crate::placeholder`]), then held by the registry for the lifetime
//! of the process (or until a watched file changes).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::placeholder::PlaceholderSpan;

/// Declared parameter scope (spec.md §3 ParamSpec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Data,
    View,
    Hybrid,
}

impl Scope {
    pub fn may_appear_in_sql(self) -> bool {
        matches!(self, Scope::Data | Scope::Hybrid)
    }
}

/// `applies_to` mode for a cross-cutting param (spec.md §3, §9 open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliesToMode {
    Wrapper,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliesTo {
    pub cte_name: String,
    pub mode: AppliesToMode,
}

/// The closed set of declared parameter types (spec.md §6.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Date,
    DateTime,
    Str,
    Optional { inner: Box<ParamType> },
    List { inner: Box<ParamType> },
    Literal { values: Vec<String> },
    InjectedStr,
    InjectedIdentLiteral { allowed: Vec<String> },
    InjectedPathStr,
}

/// A declared report parameter (spec.md §3 ParamSpec).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Canonical (declared) case of the name.
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub scope: Scope,
    pub applies_to: Option<AppliesTo>,
    pub default: Option<String>,
}

/// Binding kind — restricts where a bound value may textually appear
/// (spec.md §3 Binding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    Partition,
    Demo,
    Identifier,
    Literal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingSpec {
    pub id: String,
    pub source_cte: String,
    pub key_param: String,
    pub key_column: String,
    pub value_column: String,
    pub kind: BindingKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializationSpec {
    pub cte_name: String,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSpec {
    pub id: String,
    pub target_report: String,
    pub pass_params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteralSourceSpec {
    pub id: String,
    pub from_cte: String,
    pub value_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSpec {
    pub ttl_seconds: Option<u64>,
    pub stale_while_revalidate: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,
}

/// One parsed `/***NAME ... ***/` block. At most one of each variant
/// may appear per report (spec.md §3 MetadataBlock).
#[derive(Debug, Clone)]
pub enum MetadataBlock {
    Params(Vec<ParamSpec>),
    Config(HashMap<String, String>),
    Sources(Vec<String>),
    Cache(CacheSpec),
    Table(HashMap<String, String>),
    Search(HashMap<String, String>),
    Facets(Vec<String>),
    Charts(Vec<String>),
    DerivedParams(Vec<ParamSpec>),
    LiteralSources(Vec<LiteralSourceSpec>),
    Bindings(Vec<BindingSpec>),
    Imports(Vec<ImportSpec>),
    Secrets(Vec<SecretSpec>),
}

impl MetadataBlock {
    /// The `/***NAME` header this variant is parsed from.
    pub fn block_name(&self) -> &'static str {
        match self {
            MetadataBlock::Params(_) => "PARAMS",
            MetadataBlock::Config(_) => "CONFIG",
            MetadataBlock::Sources(_) => "SOURCES",
            MetadataBlock::Cache(_) => "CACHE",
            MetadataBlock::Table(_) => "TABLE",
            MetadataBlock::Search(_) => "SEARCH",
            MetadataBlock::Facets(_) => "FACETS",
            MetadataBlock::Charts(_) => "CHARTS",
            MetadataBlock::DerivedParams(_) => "DERIVED_PARAMS",
            MetadataBlock::LiteralSources(_) => "LITERAL_SOURCES",
            MetadataBlock::Bindings(_) => "BINDINGS",
            MetadataBlock::Imports(_) => "IMPORTS",
            MetadataBlock::Secrets(_) => "SECRETS",
        }
    }
}

/// An immutable parsed report (spec.md §3 Report).
#[derive(Debug, Clone)]
pub struct Report {
    /// Repository-relative path without the `.sql` suffix.
    pub id: String,
    /// The single SQL statement body (metadata blocks stripped).
    pub sql_body: String,
    /// Placeholder occurrences, position-indexed into `sql_body`.
    pub placeholders: Vec<PlaceholderSpan>,
    /// Parsed metadata blocks, keyed by block name.
    pub blocks: HashMap<&'static str, MetadataBlock>,
    /// SHA-256 of the canonicalized source (spec.md §3 Report).
    pub source_fingerprint: Fingerprint,
    /// mtime/size at parse time, used by the registry to detect staleness.
    pub source_len: u64,
}

impl Report {
    pub fn params(&self) -> &[ParamSpec] {
        match self.blocks.get("PARAMS") {
            Some(MetadataBlock::Params(p)) => p,
            _ => &[],
        }
    }

    pub fn derived_params(&self) -> &[ParamSpec] {
        match self.blocks.get("DERIVED_PARAMS") {
            Some(MetadataBlock::DerivedParams(p)) => p,
            _ => &[],
        }
    }

    pub fn bindings(&self) -> &[BindingSpec] {
        match self.blocks.get("BINDINGS") {
            Some(MetadataBlock::Bindings(b)) => b,
            _ => &[],
        }
    }

    pub fn materializations(&self) -> Vec<MaterializationSpec> {
        // Materializations are derived from the SQL body's CTE headers
        // (MATERIALIZE / MATERIALIZE_CLOSED), not from a metadata block;
        // see crate::metadata::extract_materializations.
        crate::metadata::extract_materializations(&self.sql_body)
    }

    pub fn imports(&self) -> &[ImportSpec] {
        match self.blocks.get("IMPORTS") {
            Some(MetadataBlock::Imports(i)) => i,
            _ => &[],
        }
    }

    pub fn literal_sources(&self) -> &[LiteralSourceSpec] {
        match self.blocks.get("LITERAL_SOURCES") {
            Some(MetadataBlock::LiteralSources(l)) => l,
            _ => &[],
        }
    }

    pub fn secrets(&self) -> &[SecretSpec] {
        match self.blocks.get("SECRETS") {
            Some(MetadataBlock::Secrets(s)) => s,
            _ => &[],
        }
    }

    pub fn cache_spec(&self) -> Option<&CacheSpec> {
        match self.blocks.get("CACHE") {
            Some(MetadataBlock::Cache(c)) => Some(c),
            _ => None,
        }
    }

    pub fn config_block(&self) -> HashMap<String, String> {
        match self.blocks.get("CONFIG") {
            Some(MetadataBlock::Config(c)) => c.clone(),
            _ => HashMap::new(),
        }
    }

    /// All declared params: `PARAMS` ∪ `DERIVED_PARAMS`.
    pub fn all_params(&self) -> Vec<&ParamSpec> {
        self.params().iter().chain(self.derived_params()).collect()
    }

    pub fn find_param(&self, name: &str) -> Option<&ParamSpec> {
        self.all_params()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}
