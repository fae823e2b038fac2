use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Grouping for capabilities. Kinds carry no behaviour of their own;
/// they drive catalog grouping and the default activation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Core,
    Compute,
    Storage,
    Network,
    Quine,
    Executor,
    Plugin,
}

impl CapabilityKind {
    /// Default activation priority for capabilities that do not set one.
    /// Lower loads earlier among leaves.
    pub fn default_priority(self) -> i32 {
        match self {
            CapabilityKind::Core => 0,
            CapabilityKind::Network => 10,
            CapabilityKind::Executor => 20,
            CapabilityKind::Compute => 30,
            CapabilityKind::Storage => 30,
            CapabilityKind::Quine => 40,
            CapabilityKind::Plugin => 50,
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CapabilityKind::Core => "core",
            CapabilityKind::Compute => "compute",
            CapabilityKind::Storage => "storage",
            CapabilityKind::Network => "network",
            CapabilityKind::Quine => "quine",
            CapabilityKind::Executor => "executor",
            CapabilityKind::Plugin => "plugin",
        };
        f.write_str(name)
    }
}

/// Content-addressed, self-describing capability record.
///
/// The `genome` is the capability's source descriptor, zlib-compressed
/// and base64-armoured so the full manifest stays ASCII-safe on the
/// wire. `genome_hash` is the first 64 bits (16 hex chars) of SHA-256
/// over the uncompressed source and acts as the content address for the
/// generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(rename = "type")]
    pub kind: CapabilityKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    pub genome: String,
    pub genome_hash: String,
    pub genome_size: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_hot_swappable")]
    pub hot_swappable: bool,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub exports: Vec<String>,
}

fn default_hot_swappable() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest missing required field: {0}")]
    MissingField(&'static str),
    #[error("manifest genome_hash must be 16 lowercase hex chars, got {0:?}")]
    MalformedHash(String),
}

impl CapabilityManifest {
    /// Structural validation applied before a manifest enters the
    /// registry. Genome integrity is the codec's job, not this one.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::MissingField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingField("name"));
        }
        if self.genome.is_empty() {
            return Err(ManifestError::MissingField("genome"));
        }
        if self.genome_hash.len() != 16
            || !self
                .genome_hash
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ManifestError::MalformedHash(self.genome_hash.clone()));
        }
        Ok(())
    }

    /// Every name this manifest satisfies. An id implicitly provides
    /// itself even when the author left it out of `provides`.
    pub fn provided_names(&self) -> impl Iterator<Item = &str> {
        let implicit = if self.provides.iter().any(|p| p == &self.id) {
            None
        } else {
            Some(self.id.as_str())
        };
        self.provides.iter().map(String::as_str).chain(implicit)
    }

    /// Catalog view: the same record with the genome replaced by a size
    /// placeholder, for endpoints that list many manifests.
    pub fn catalog_entry(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("manifest serializes");
        value["genome"] = serde_json::Value::String(format!("<{} bytes>", self.genome_size));
        value
    }
}
