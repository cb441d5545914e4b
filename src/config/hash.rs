//! Deterministic hashing for change detection and record fingerprints.
//!
//! Attribute values are fed to SHA-256 in a canonical form: object keys are
//! sorted and every value is prefixed with a type tag, so two equal values
//! always hash the same regardless of how they were built.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::spec::{Attributes, ResourceId, ResourceSpec, StackConfig};

/// Hasher for computing configuration hashes and fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire stack configuration.
    ///
    /// This hash changes when any part of the declared resources changes.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        for spec in &config.resources {
            hasher.update(self.hash_spec(spec).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single declared resource.
    #[must_use]
    pub fn hash_spec(&self, spec: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();
        update_id(&mut hasher, &spec.id());
        update_attributes(&mut hasher, &spec.attributes);
        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a state record: identity, provider id
    /// and last-applied attributes.
    #[must_use]
    pub fn fingerprint(&self, id: &ResourceId, provider_id: &str, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        update_id(&mut hasher, id);
        hasher.update(b"\x00id\x00");
        hasher.update(provider_id.as_bytes());
        update_attributes(&mut hasher, attributes);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn update_id(hasher: &mut Sha256, id: &ResourceId) {
    hasher.update(id.provider.as_bytes());
    hasher.update(b"\x00");
    hasher.update(id.resource_type.as_bytes());
    hasher.update(b"\x00");
    hasher.update(id.name.as_bytes());
}

fn update_attributes(hasher: &mut Sha256, attributes: &Attributes) {
    // BTreeMap iterates in key order
    for (key, value) in attributes {
        hasher.update(b"\x00k");
        hasher.update(key.as_bytes());
        update_value(hasher, value);
    }
}

fn update_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                update_value(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_unstable();
            hasher.update(b"{");
            hasher.update((keys.len() as u64).to_be_bytes());
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b"\x00");
                if let Some(item) = map.get(key) {
                    update_value(hasher, item);
                }
            }
        }
    }
}
