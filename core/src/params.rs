//! URL query → typed, scope-routed parameters (spec.md §4.4, component C5).

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::report::{ParamSpec, ParamType, Report, Scope};

/// A single coerced parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(String),
    DateTime(String),
    Str(String),
    List(Vec<ParamValue>),
    /// Already escaped into a SQL string literal (`InjectedStr`).
    InjectedLiteral(String),
    /// A bare identifier, allowlist-checked (`InjectedIdentLiteral`).
    InjectedIdent(String),
    Absent,
}

/// Resolved parameters, split by where they're allowed to act.
#[derive(Debug, Clone, Default)]
pub struct ParamValues {
    pub server_params: HashMap<String, ParamValue>,
    pub client_params: HashMap<String, ParamValue>,
}

const CLIENT_PREFIX: &str = "__client__";
const SERVER_PREFIX: &str = "__server__";
const FORCE_SERVER_KEY: &str = "__force_server";

enum Routing {
    Client,
    Server,
    /// No `__client__`/`__server__` prefix and no `__force_server` flag —
    /// eligible for hybrid auto-promotion (spec.md §4.4 step 4).
    Default,
}

/// Resolve a raw URL query (already split into key/value(s) pairs — a
/// key may repeat for `List[T]` params) into [`ParamValues`].
///
/// `hybrid_value_cap` is the configured bound (spec.md §4.5 condition e,
/// `Config::hybrid_value_cap`) on how large a hybrid param's value set
/// may be before it's promoted to server regardless of shape.
pub fn resolve_params(
    report: &Report,
    raw: &[(String, String)],
    hybrid_value_cap: usize,
) -> Result<ParamValues> {
    let force_server = raw
        .iter()
        .any(|(k, v)| k == FORCE_SERVER_KEY && v == "1");

    // Step 1: case folding. Group raw entries by canonical param name,
    // detecting a case-insensitive collision on a scalar (non-List) param.
    let mut by_canonical: HashMap<String, Vec<(String, String, Routing)>> = HashMap::new();
    let mut seen_casings: HashMap<String, HashSet<String>> = HashMap::new();

    for (raw_key, value) in raw {
        if raw_key == FORCE_SERVER_KEY {
            continue;
        }
        let (routing, bare_key) = classify_prefix(raw_key, force_server);
        let Some(spec) = report.find_param(&bare_key) else {
            continue;
        };

        let casings = seen_casings.entry(spec.name.clone()).or_default();
        let is_list = matches!(spec.param_type, ParamType::List { .. });
        if !is_list && !casings.contains(bare_key.as_str()) && !casings.is_empty() {
            return Err(Error::DuplicateParamCasing(spec.name.clone()));
        }
        casings.insert(bare_key.clone());

        by_canonical
            .entry(spec.name.clone())
            .or_default()
            .push((bare_key, value.clone(), routing));
    }

    let mut server_params = HashMap::new();
    let mut client_params = HashMap::new();

    for spec in report.all_params() {
        let Some(entries) = by_canonical.get(&spec.name) else {
            continue;
        };

        // Step 4 scope checks happen before coercion: a data-scoped
        // param supplied client-only is a routing error outright.
        for (_, _, routing) in entries {
            if matches!(routing, Routing::Client) && spec.scope == Scope::Data {
                return Err(Error::BadScopeRouting(spec.name.clone()));
            }
        }

        let value = coerce(spec, entries)?;

        let all_client = entries.iter().all(|(_, _, r)| matches!(r, Routing::Client));
        let any_explicit_server = entries.iter().any(|(_, _, r)| matches!(r, Routing::Server));
        let all_default = entries.iter().all(|(_, _, r)| matches!(r, Routing::Default));

        let place_client = if all_client {
            true
        } else if any_explicit_server {
            false
        } else if all_default && spec.scope == Scope::Hybrid {
            crate::plan::auto_promote_hybrid_param(report, &spec.name, &value, hybrid_value_cap)
        } else {
            false
        };

        if place_client {
            client_params.insert(spec.name.clone(), value);
        } else {
            server_params.insert(spec.name.clone(), value);
        }
    }

    Ok(ParamValues {
        server_params,
        client_params,
    })
}

fn classify_prefix(raw_key: &str, force_server: bool) -> (Routing, String) {
    if let Some(rest) = raw_key.strip_prefix(CLIENT_PREFIX) {
        if force_server {
            (Routing::Server, rest.to_string())
        } else {
            (Routing::Client, rest.to_string())
        }
    } else if let Some(rest) = raw_key.strip_prefix(SERVER_PREFIX) {
        (Routing::Server, rest.to_string())
    } else if force_server {
        (Routing::Server, raw_key.to_string())
    } else {
        (Routing::Default, raw_key.to_string())
    }
}

fn coerce(spec: &ParamSpec, entries: &[(String, String, Routing)]) -> Result<ParamValue> {
    coerce_type(&spec.param_type, spec, entries)
}

fn coerce_type(
    ty: &ParamType,
    spec: &ParamSpec,
    entries: &[(String, String, Routing)],
) -> Result<ParamValue> {
    let bad = |detail: String| Error::BadParamType {
        name: spec.name.clone(),
        detail,
    };

    match ty {
        ParamType::List { inner } => {
            let mut values = Vec::new();
            for (_, raw_value, _) in entries {
                for piece in raw_value.split(',') {
                    let single_entry = [(spec.name.clone(), piece.to_string(), Routing::Server)];
                    values.push(coerce_type(inner, spec, &single_entry)?);
                }
            }
            Ok(ParamValue::List(values))
        }
        ParamType::Optional { inner } => {
            if entries.is_empty() {
                Ok(ParamValue::Absent)
            } else {
                coerce_type(inner, spec, entries)
            }
        }
        ParamType::Literal { values } => {
            let raw_value = single_value(entries)?;
            if !values.iter().any(|v| v == raw_value) {
                return Err(bad(format!("{raw_value:?} is not one of {values:?}")));
            }
            Ok(ParamValue::Str(raw_value.clone()))
        }
        ParamType::Int => {
            let raw_value = single_value(entries)?;
            raw_value
                .parse::<i64>()
                .map(ParamValue::Int)
                .map_err(|e| bad(format!("{raw_value:?} is not an int: {e}")))
        }
        ParamType::Float => {
            let raw_value = single_value(entries)?;
            raw_value
                .parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|e| bad(format!("{raw_value:?} is not a float: {e}")))
        }
        ParamType::Bool => {
            let raw_value = single_value(entries)?;
            match raw_value.as_str() {
                "true" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "0" => Ok(ParamValue::Bool(false)),
                other => Err(bad(format!("{other:?} is not a bool"))),
            }
        }
        ParamType::Date => {
            let raw_value = single_value(entries)?;
            chrono::NaiveDate::parse_from_str(raw_value, "%Y-%m-%d")
                .map_err(|e| bad(format!("{raw_value:?} is not a date (expected YYYY-MM-DD): {e}")))?;
            Ok(ParamValue::Date(raw_value.clone()))
        }
        ParamType::DateTime => {
            let raw_value = single_value(entries)?;
            chrono::NaiveDateTime::parse_from_str(raw_value, "%Y-%m-%dT%H:%M:%S")
                .map_err(|e| {
                    bad(format!(
                        "{raw_value:?} is not a datetime (expected YYYY-MM-DDTHH:MM:SS): {e}"
                    ))
                })?;
            Ok(ParamValue::DateTime(raw_value.clone()))
        }
        ParamType::Str => Ok(ParamValue::Str(single_value(entries)?.clone())),
        ParamType::InjectedStr => {
            let raw_value = single_value(entries)?;
            Ok(ParamValue::InjectedLiteral(format!(
                "'{}'",
                raw_value.replace('\'', "''")
            )))
        }
        ParamType::InjectedIdentLiteral { allowed } => {
            let raw_value = single_value(entries)?;
            if !allowed.iter().any(|a| a == raw_value) {
                return Err(bad(format!(
                    "{raw_value:?} is not in the allowed identifier set {allowed:?}"
                )));
            }
            Ok(ParamValue::InjectedIdent(raw_value.clone()))
        }
        ParamType::InjectedPathStr => Err(bad(
            "InjectedPathStr may only be sourced from config, never from the URL".to_string(),
        )),
    }
}

fn single_value(entries: &[(String, String, Routing)]) -> Result<&String> {
    entries
        .first()
        .map(|(_, v, _)| v)
        .ok_or_else(|| Error::BadParamType {
            name: "<unknown>".to_string(),
            detail: "expected exactly one value".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::parse_report;

    fn report_with_param(ty: &str, scope: &str) -> Report {
        let src = format!(
            "/***PARAMS\n- name: X\n  type: {ty}\n  scope: {scope}\n***/\nSELECT {{{{param X}}}}"
        );
        parse_report("r", &src, 0).unwrap()
    }

    #[test]
    fn coerces_int() {
        let report = report_with_param("int", "data");
        let raw = vec![("X".to_string(), "42".to_string())];
        let values = resolve_params(&report, &raw, 256).unwrap();
        assert_eq!(values.server_params.get("X"), Some(&ParamValue::Int(42)));
    }

    #[test]
    fn client_prefix_routes_to_client_bag() {
        let report = report_with_param("int", "hybrid");
        let raw = vec![("__client__X".to_string(), "42".to_string())];
        let values = resolve_params(&report, &raw, 256).unwrap();
        assert!(values.server_params.is_empty());
        assert_eq!(values.client_params.get("X"), Some(&ParamValue::Int(42)));
    }

    #[test]
    fn client_prefix_on_data_param_is_rejected() {
        let report = report_with_param("int", "data");
        let raw = vec![("__client__X".to_string(), "42".to_string())];
        let err = resolve_params(&report, &raw, 256).unwrap_err();
        assert_eq!(err.code(), "BadScopeRouting");
    }

    #[test]
    fn duplicate_casing_on_scalar_is_rejected() {
        let report = report_with_param("int", "data");
        let raw = vec![
            ("X".to_string(), "1".to_string()),
            ("x".to_string(), "2".to_string()),
        ];
        let err = resolve_params(&report, &raw, 256).unwrap_err();
        assert_eq!(err.code(), "DuplicateParamCasing");
    }

    #[test]
    fn literal_constraint_rejects_unknown_value() {
        let src = "/***PARAMS\n- name: X\n  type: Literal[a,b]\n  scope: data\n***/\nSELECT {{param X}}";
        let report = parse_report("r", src, 0).unwrap();
        let raw = vec![("X".to_string(), "z".to_string())];
        let err = resolve_params(&report, &raw, 256).unwrap_err();
        assert_eq!(err.code(), "BadParamType");
    }

    #[test]
    fn rejects_malformed_date() {
        let report = report_with_param("date", "data");
        let raw = vec![("X".to_string(), "not-a-date".to_string())];
        let err = resolve_params(&report, &raw, 256).unwrap_err();
        assert_eq!(err.code(), "BadParamType");
    }

    #[test]
    fn accepts_well_formed_date() {
        let report = report_with_param("date", "data");
        let raw = vec![("X".to_string(), "2026-07-26".to_string())];
        let values = resolve_params(&report, &raw, 256).unwrap();
        assert_eq!(values.server_params.get("X"), Some(&ParamValue::Date("2026-07-26".to_string())));
    }

    #[test]
    fn injected_str_escapes_quotes() {
        let report = report_with_param("InjectedStr", "data");
        let raw = vec![("X".to_string(), "O'Brien".to_string())];
        let values = resolve_params(&report, &raw, 256).unwrap();
        assert_eq!(
            values.server_params.get("X"),
            Some(&ParamValue::InjectedLiteral("'O''Brien'".to_string()))
        );
    }

    #[test]
    fn bare_hybrid_param_auto_promotes_when_eligible() {
        let src = "/***PARAMS\n- name: Shard\n  type: int\n  scope: hybrid\n***/\nSELECT shard_id, latency_ms FROM t WHERE shard_id = {{param Shard}}";
        let report = parse_report("r", src, 0).unwrap();
        let raw = vec![("Shard".to_string(), "7".to_string())];
        let values = resolve_params(&report, &raw, 256).unwrap();
        assert!(values.server_params.is_empty());
        assert_eq!(values.client_params.get("Shard"), Some(&ParamValue::Int(7)));
    }

    #[test]
    fn bare_hybrid_param_stays_server_when_column_not_in_base_schema() {
        let src = "/***PARAMS\n- name: Shard\n  type: int\n  scope: hybrid\n***/\nSELECT latency_ms FROM t WHERE shard_id = {{param Shard}}";
        let report = parse_report("r", src, 0).unwrap();
        let raw = vec![("Shard".to_string(), "7".to_string())];
        let values = resolve_params(&report, &raw, 256).unwrap();
        assert!(values.client_params.is_empty());
        assert_eq!(values.server_params.get("Shard"), Some(&ParamValue::Int(7)));
    }

    #[test]
    fn explicit_server_prefix_overrides_hybrid_auto_promotion() {
        let src = "/***PARAMS\n- name: Shard\n  type: int\n  scope: hybrid\n***/\nSELECT shard_id FROM t WHERE shard_id = {{param Shard}}";
        let report = parse_report("r", src, 0).unwrap();
        let raw = vec![("__server__Shard".to_string(), "7".to_string())];
        let values = resolve_params(&report, &raw, 256).unwrap();
        assert!(values.client_params.is_empty());
        assert_eq!(values.server_params.get("Shard"), Some(&ParamValue::Int(7)));
    }
}
