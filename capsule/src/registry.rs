use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::manifest::CapabilityManifest;

#[derive(Default)]
struct RegistryInner {
    by_id: BTreeMap<String, CapabilityManifest>,
    by_kind: HashMap<String, HashSet<String>>,
    by_provides: HashMap<String, String>,
}

/// In-memory, content-addressed store of capability manifests.
///
/// Three indexes are kept in lockstep under one mutex: id -> manifest,
/// kind -> ids, and provided name -> providing id. Registering a
/// manifest whose `(id, genome_hash)` already exists is a no-op; a new
/// hash for a known id is a new generation and replaces the entry,
/// rebinding every name it provides (last write wins).
pub struct CapabilityRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Register a manifest. Returns true when the registry changed,
    /// false for the idempotent same-generation case.
    pub fn register(&self, manifest: CapabilityManifest) -> bool {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.by_id.get(&manifest.id) {
            if existing.genome_hash == manifest.genome_hash {
                return false;
            }
            debug!(
                capability = %manifest.id,
                old_hash = %existing.genome_hash,
                new_hash = %manifest.genome_hash,
                "replacing capability generation"
            );
            let stale = existing.clone();
            remove_from_indexes(&mut inner, &stale);
        }

        let kind = manifest.kind.to_string();
        inner
            .by_kind
            .entry(kind)
            .or_default()
            .insert(manifest.id.clone());
        for name in manifest.provided_names().map(str::to_string).collect::<Vec<_>>() {
            inner.by_provides.insert(name, manifest.id.clone());
        }
        inner.by_id.insert(manifest.id.clone(), manifest);
        true
    }

    pub fn get(&self, id: &str) -> Option<CapabilityManifest> {
        self.inner.lock().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().by_id.contains_key(id)
    }

    /// Resolve an abstract name to the id of its provider. Consults the
    /// provides index first; an id implicitly provides itself.
    pub fn find_provider(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock();
        if let Some(id) = inner.by_provides.get(name) {
            return Some(id.clone());
        }
        inner.by_id.contains_key(name).then(|| name.to_string())
    }

    pub fn ids_of_kind(&self, kind: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner
            .by_kind
            .get(kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Every registered manifest, in stable id order.
    pub fn all(&self) -> Vec<CapabilityManifest> {
        self.inner.lock().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_id.is_empty()
    }

    /// Serialise every manifest to its full wire form, genome included.
    pub fn export(&self) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .by_id
            .values()
            .map(|m| serde_json::to_value(m).expect("manifest serializes"))
            .collect()
    }
}

fn remove_from_indexes(inner: &mut RegistryInner, manifest: &CapabilityManifest) {
    if let Some(ids) = inner.by_kind.get_mut(&manifest.kind.to_string()) {
        ids.remove(&manifest.id);
    }
    for name in manifest.provided_names() {
        // Only unbind names this generation still owns.
        if inner.by_provides.get(name).map(String::as_str) == Some(manifest.id.as_str()) {
            inner.by_provides.remove(name);
        }
    }
}
