//! Secret lookup and `${secret:NAME}` interpolation.
//!
//! Secrets are resolved once, when the stack is loaded. Attribute keys that
//! received a secret value are recorded on the spec as sensitive so that
//! output layers can redact them. Substituted text is escaped, so a secret
//! containing `${` is never read as a reference.

use crate::error::{CirrusError, ConfigError, Result};
use crate::graph::escape_literal;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::spec::ResourceSpec;

const SECRET_PREFIX: &str = "${secret:";

/// A get-secret-by-name source.
pub trait SecretSource: Send + Sync {
    /// Returns the secret value, or `None` if the source does not hold it.
    fn get_secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
///
/// Combined with `.env` loading this covers CI runners, which inject
/// credentials as environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get_secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed in-memory secret map.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretSource {
    secrets: HashMap<String, String>,
}

impl StaticSecretSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret (builder style).
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretSource for StaticSecretSource {
    fn get_secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name).cloned()
    }
}

/// Replaces every `${secret:NAME}` in the spec's attributes.
///
/// # Errors
///
/// Returns an error naming the resource if a secret is unavailable.
pub fn resolve_spec_secrets(spec: &mut ResourceSpec, source: &dyn SecretSource) -> Result<()> {
    let resource = spec.id().to_string();
    for (key, value) in &mut spec.attributes {
        if interpolate(value, source, &resource)? {
            debug!("Resolved secret for {resource}.{key}");
            spec.sensitive.insert(key.clone());
        }
    }
    Ok(())
}

/// Returns true if anything was substituted.
fn interpolate(value: &mut Value, source: &dyn SecretSource, resource: &str) -> Result<bool> {
    match value {
        Value::String(s) if s.contains(SECRET_PREFIX) => {
            *s = substitute(s, source, resource)?;
            Ok(true)
        }
        Value::Array(items) => {
            let mut replaced = false;
            for item in items {
                replaced |= interpolate(item, source, resource)?;
            }
            Ok(replaced)
        }
        Value::Object(map) => {
            let mut replaced = false;
            for item in map.values_mut() {
                replaced |= interpolate(item, source, resource)?;
            }
            Ok(replaced)
        }
        _ => Ok(false),
    }
}

fn substitute(input: &str, source: &dyn SecretSource, resource: &str) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        let (literal, tail) = rest.split_at(pos);
        output.push_str(literal);

        if tail.starts_with("$${") {
            output.push_str(&tail[..3]);
            rest = &tail[3..];
            continue;
        }
        let Some(after) = tail.strip_prefix(SECRET_PREFIX) else {
            output.push('$');
            rest = &tail[1..];
            continue;
        };

        let Some(end) = after.find('}') else {
            return Err(CirrusError::Config(ConfigError::ParseError {
                message: format!("Unterminated secret reference in {resource}"),
                location: None,
            }));
        };
        let name = after[..end].trim();
        let secret = source.get_secret(name).ok_or_else(|| {
            CirrusError::Config(ConfigError::MissingSecret {
                name: name.to_string(),
                resource: resource.to_string(),
            })
        })?;
        output.push_str(&escape_literal(&secret));
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Reference, Resolution, ResourceGraph, resolve_attributes};
    use serde_json::json;

    #[test]
    fn test_resolves_whole_and_embedded_secrets() {
        let source = StaticSecretSource::new()
            .with_secret("DB_PASSWORD", "hunter2")
            .with_secret("REGION", "eu-west-1");
        let mut spec = ResourceSpec::new("aws", "db_instance", "main")
            .with_attribute("password", "${secret:DB_PASSWORD}")
            .with_attribute("endpoint", "db.${secret:REGION}.example")
            .with_attribute("size", 20);

        resolve_spec_secrets(&mut spec, &source).expect("should resolve");

        assert_eq!(spec.attributes["password"], json!("hunter2"));
        assert_eq!(spec.attributes["endpoint"], json!("db.eu-west-1.example"));
        assert!(spec.is_sensitive("password"));
        assert!(spec.is_sensitive("endpoint"));
        assert!(!spec.is_sensitive("size"));
    }

    #[test]
    fn test_nested_secret_marks_top_level_key() {
        let source = StaticSecretSource::new().with_secret("TOKEN", "t0k");
        let mut spec = ResourceSpec::new("aws", "instance", "web")
            .with_attribute("tags", json!({"auth": "${secret:TOKEN}"}));

        resolve_spec_secrets(&mut spec, &source).expect("should resolve");

        assert_eq!(spec.attributes["tags"], json!({"auth": "t0k"}));
        assert!(spec.is_sensitive("tags"));
    }

    #[test]
    fn test_secret_with_placeholder_syntax_stays_literal() {
        let source = StaticSecretSource::new().with_secret("DB_PW", "Xy${9}z");
        let mut spec = ResourceSpec::new("aws", "instance", "db")
            .with_attribute("password", "${secret:DB_PW}")
            .with_attribute("note", "literal $${secret:DB_PW}");

        resolve_spec_secrets(&mut spec, &source).expect("should resolve");
        let graph = ResourceGraph::build(std::slice::from_ref(&spec)).expect("no references");
        assert_eq!(graph.len(), 1);

        let no_refs = |_: &Reference| Ok(Resolution::Unknown);
        let (resolved, unknown) =
            resolve_attributes(&spec.id(), &spec.attributes, &no_refs).expect("resolves");
        assert!(unknown.is_empty());
        assert_eq!(resolved["password"], json!("Xy${9}z"));
        assert_eq!(resolved["note"], json!("literal ${secret:DB_PW}"));
    }

    #[test]
    fn test_missing_secret_names_resource() {
        let source = StaticSecretSource::new();
        let mut spec = ResourceSpec::new("aws", "instance", "web")
            .with_attribute("key", "${secret:NOPE}");

        let err = resolve_spec_secrets(&mut spec, &source).expect_err("should fail");
        assert_eq!(err.resource(), Some("aws.instance.web"));
    }
}
