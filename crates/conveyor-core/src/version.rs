//! Resource versions and their content-addressed identity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A version emitted by a resource's `check`. Ordered map so the digest
/// is stable regardless of insertion order.
pub type Version = BTreeMap<String, String>;

/// Declaration of a resource within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: serde_json::Value,
}

/// One field of metadata reported by a resource script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A saved version of a resource. Versions are append-only; `enabled` is
/// the only field that ever moves after save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ResourceVersion {
    /// Identity of this version: `(resource, sha256(version))`.
    pub fn identity(&self) -> (String, String) {
        (self.resource.clone(), version_digest(&self.version))
    }
}

/// Hex sha256 of the canonical JSON rendering of a version map.
pub fn version_digest(version: &Version) -> String {
    let canonical = serde_json::to_vec(version).unwrap_or_default();
    hex_digest(&canonical)
}

/// Hex sha256 of an arbitrary JSON value, used to key check sessions and
/// image caches by resource source.
pub fn source_digest(source: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(source).unwrap_or_default();
    hex_digest(&canonical)
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
