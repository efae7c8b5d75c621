//! The public entry point: `(report_id, raw_params) -> Manifest`
//! (spec.md §4.10, component C11).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{Executor, SchemaColumn};
use crate::params::{resolve_params, ParamValue};
use crate::plan::build_plan;
use crate::registry::Registry;
use crate::secrets::SecretsVault;

/// The JSON manifest handed back to the browser runtime (spec.md
/// §4.10 step 5).
#[derive(Debug, Serialize)]
pub struct Manifest {
    pub base_parquet: String,
    pub materialize: HashMap<String, String>,
    pub literal_sources: HashMap<String, String>,
    pub bindings: HashMap<String, String>,
    pub client_params: HashMap<String, String>,
    pub ttl_seconds: u64,
    pub schema: Vec<SchemaColumn>,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    cache: Arc<Cache>,
    executor: Executor,
    config: Config,
}

impl Dispatcher {
    pub fn new(config: Config, registry: Arc<Registry>, secrets: SecretsVault) -> Self {
        let cache = Arc::new(Cache::new(config.cache_dir(), config.cache.clone()));
        let executor = Executor::new(config.clone(), secrets);
        Self {
            registry,
            cache,
            executor,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// `dispatch(report_id, raw_params) -> Manifest` (spec.md §4.10).
    #[instrument(skip(self, raw_params), fields(report_id))]
    pub async fn dispatch(&self, report_id: &str, raw_params: &[(String, String)]) -> Result<Manifest> {
        let report = self
            .registry
            .get(report_id)
            .ok_or_else(|| Error::ReportNotFound(report_id.to_string()))?;

        let params = resolve_params(&report, raw_params, self.config.hybrid_value_cap)?;

        let plan = build_plan(
            &report,
            &params,
            &self.registry,
            &self.config.deployment_id,
        )?;

        let ttl = report
            .cache_spec()
            .and_then(|c| c.ttl_seconds)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(self.config.cache.ttl_seconds));
        let stale_while_revalidate = report
            .cache_spec()
            .and_then(|c| c.stale_while_revalidate)
            .unwrap_or(false);

        let mut resolved_imports: HashMap<String, PathBuf> = HashMap::new();
        for import in report.imports() {
            let nested_raw: Vec<(String, String)> = import
                .pass_params
                .iter()
                .filter_map(|name| {
                    params
                        .server_params
                        .get(name)
                        .or_else(|| params.client_params.get(name))
                        .map(|v| (name.clone(), render_client_value(v)))
                })
                .collect();

            // `dispatch` is async and calls itself here for imports, so
            // the recursive call must be boxed to give the future a
            // finite size.
            let nested = Box::pin(self.dispatch(&import.target_report, &nested_raw)).await?;
            resolved_imports.insert(import.id.clone(), PathBuf::from(nested.base_parquet));
        }

        let (ctx, base_entry) = self
            .executor
            .run_plan(
                &report,
                &plan,
                &params,
                &self.cache,
                ttl,
                stale_while_revalidate,
                &resolved_imports,
            )
            .await?;

        let base_path = base_entry
            .as_path()
            .ok_or_else(|| Error::SqlExecutionError {
                report: report_id.to_string(),
                node: "base".to_string(),
                detail: "base node did not produce a file artifact".to_string(),
            })?;

        info!(report_id, fingerprint = %plan.base_node().unwrap().fingerprint, "dispatched");

        let schema = self.executor.read_schema(base_path)?;

        Ok(Manifest {
            base_parquet: base_path.display().to_string(),
            materialize: ctx
                .materialize_paths
                .into_iter()
                .map(|(k, v)| (k, v.display().to_string()))
                .collect(),
            literal_sources: ctx
                .literal_source_paths
                .into_iter()
                .map(|(k, v)| (k, v.display().to_string()))
                .collect(),
            bindings: ctx.binding_values,
            client_params: params
                .client_params
                .into_iter()
                .map(|(k, v)| (k, render_client_value(&v)))
                .collect(),
            ttl_seconds: ttl.as_secs(),
            schema,
        })
    }
}

fn render_client_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Float(f) => f.to_string(),
        ParamValue::Bool(b) => b.to_string(),
        ParamValue::Date(s) | ParamValue::DateTime(s) | ParamValue::Str(s) => s.clone(),
        ParamValue::List(items) => items.iter().map(render_client_value).collect::<Vec<_>>().join(","),
        ParamValue::InjectedLiteral(s) | ParamValue::InjectedIdent(s) => s.clone(),
        ParamValue::Absent => String::new(),
    }
}
