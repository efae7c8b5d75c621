//! Name→value secret resolution with a strict non-serialization
//! guarantee (spec.md §4.9, component C9).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// A secret value that deliberately never implements `Display` and
/// whose `Debug` impl is hand-rolled to always print a redacted
/// placeholder, so it can't land in a `tracing` log or error message
/// by accident.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue(\"<redacted>\")")
    }
}

/// `DUCKSEARCH_SECRETS_FILE`-backed name→value store, with environment
/// fallback/override for individual names.
#[derive(Debug, Default, Clone)]
pub struct SecretsVault {
    values: HashMap<String, SecretValue>,
}

impl SecretsVault {
    pub fn empty() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Load from a flat `name = "value"` TOML file (matching the
    /// config.toml parsing idiom), falling back to `DUCKSEARCH_SECRET_<NAME>`
    /// environment variables for names the file doesn't cover.
    pub fn load(secrets_file: Option<&Path>, declared_names: &[String]) -> Result<Self> {
        let mut values = HashMap::new();

        if let Some(path) = secrets_file {
            if path.exists() {
                let contents = std::fs::read_to_string(path)?;
                let table: HashMap<String, String> = toml::from_str(&contents)
                    .map_err(|e| Error::Config(format!("failed to parse secrets file: {e}")))?;
                for (name, value) in table {
                    values.insert(name, SecretValue(value));
                }
            }
        }

        for name in declared_names {
            if values.contains_key(name) {
                continue;
            }
            let env_key = format!("DUCKSEARCH_SECRET_{}", name.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&env_key) {
                values.insert(name.clone(), SecretValue(value));
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values.get(name)
    }

    /// Redact any byte sequence equal to a declared secret's value out
    /// of `text` (spec.md IP2, used before text reaches a log or error
    /// body).
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in self.values.values() {
            if secret.0.is_empty() {
                continue;
            }
            out = out.replace(&secret.0, "<redacted>");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn debug_impl_never_prints_value() {
        let secret = SecretValue("super-secret".to_string());
        assert_eq!(format!("{secret:?}"), "SecretValue(\"<redacted>\")");
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "API_KEY = \"abc123\"").unwrap();

        let vault = SecretsVault::load(Some(file.path()), &["API_KEY".to_string()]).unwrap();
        assert_eq!(vault.get("API_KEY").unwrap().expose(), "abc123");
    }

    #[test]
    fn redact_strips_secret_values_from_text() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "API_KEY = \"abc123\"").unwrap();
        let vault = SecretsVault::load(Some(file.path()), &["API_KEY".to_string()]).unwrap();

        let redacted = vault.redact("connection failed with key abc123 attached");
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("<redacted>"));
    }

    #[test]
    fn falls_back_to_environment() {
        std::env::set_var("DUCKSEARCH_SECRET_FOO", "env-value");
        let vault = SecretsVault::load(None, &["FOO".to_string()]).unwrap();
        assert_eq!(vault.get("FOO").unwrap().expose(), "env-value");
        std::env::remove_var("DUCKSEARCH_SECRET_FOO");
    }
}
