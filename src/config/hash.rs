//! Fingerprinting of modules and resources.
//!
//! Hashes are deterministic across runs: maps are walked in key order and
//! every value is written with a type tag and length prefix so that
//! different structures never produce the same byte stream.

use sha2::{Digest, Sha256};

use crate::model::{Module, Resource, Value};

/// Hasher for module and resource fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a whole module.
    ///
    /// Resource order is significant, since it is the declaration order.
    #[must_use]
    pub fn hash_module(&self, module: &Module) -> String {
        let mut hasher = Sha256::new();

        write_str(&mut hasher, &module.name);
        write_str(&mut hasher, &module.version);

        // Labels live in a BTreeMap, already sorted.
        write_len(&mut hasher, module.labels.len());
        for (key, value) in &module.labels {
            write_str(&mut hasher, key);
            write_str(&mut hasher, value);
        }

        write_len(&mut hasher, module.resources.len());
        for resource in &module.resources {
            write_str(&mut hasher, &self.hash_resource(resource));
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();

        write_str(&mut hasher, &resource.resource_type);
        write_str(&mut hasher, &resource.name);
        write_str(&mut hasher, &format!("{:?}", resource.state));

        write_len(&mut hasher, resource.properties.len());
        for (key, value) in &resource.properties {
            write_str(&mut hasher, key);
            write_value(&mut hasher, value);
        }

        // Dependency order does not change meaning.
        let mut deps: Vec<&str> = resource.depends_on.iter().map(|d| d.as_str()).collect();
        deps.sort_unstable();
        write_len(&mut hasher, deps.len());
        for dep in deps {
            write_str(&mut hasher, dep);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
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

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

fn write_str(hasher: &mut Sha256, s: &str) {
    write_len(hasher, s.len());
    hasher.update(s.as_bytes());
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Int(i) => {
            hasher.update([2u8]);
            hasher.update(i.to_be_bytes());
        }
        Value::Float(f) => {
            hasher.update([3u8]);
            hasher.update(f.to_bits().to_be_bytes());
        }
        Value::String(s) => {
            hasher.update([4u8]);
            write_str(hasher, s);
        }
        Value::List(items) => {
            hasher.update([5u8]);
            write_len(hasher, items.len());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Map(map) => {
            hasher.update([6u8]);
            write_len(hasher, map.len());
            for (key, item) in map {
                write_str(hasher, key);
                write_value(hasher, item);
            }
        }
    }
}
