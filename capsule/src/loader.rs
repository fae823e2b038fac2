use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError};
use crate::manifest::CapabilityManifest;
use crate::registry::CapabilityRegistry;
use crate::resolver::{self, ResolveError};

/// Lifecycle of one capability generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Declared,
    Resolving,
    Streaming,
    Loaded,
    Active,
    Suspended,
    Failed(String),
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Declared => f.write_str("declared"),
            LifecycleState::Resolving => f.write_str("resolving"),
            LifecycleState::Streaming => f.write_str("streaming"),
            LifecycleState::Loaded => f.write_str("loaded"),
            LifecycleState::Active => f.write_str("active"),
            LifecycleState::Suspended => f.write_str("suspended"),
            LifecycleState::Failed(_) => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("capability not registered: {0}")]
    NotRegistered(String),
    #[error("genome integrity check failed for {0}")]
    Integrity(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("activation of {id} failed: {message}")]
    Activation { id: String, message: String },
}

type SymbolMap = HashMap<String, Value>;

/// Shared symbol table: a service registry keyed by string names.
///
/// Written only by the loader during activation; read freely by
/// capability runtimes and the rest of the node. Readers must treat the
/// contents as eventually consistent - a name may appear at any time
/// and is only replaced by a later activation, never removed mid-flight.
#[derive(Clone, Default)]
pub struct SymbolTable {
    inner: Arc<RwLock<SymbolMap>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn insert(&self, name: &str, value: Value) {
        self.inner.write().insert(name.to_string(), value);
    }

    pub fn snapshot(&self) -> SymbolMap {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Everything a capability runtime sees while starting: its manifest,
/// decompressed source, a read view of the shared table, and its own
/// private namespace.
pub struct ActivationContext<'a> {
    pub manifest: &'a CapabilityManifest,
    pub source: &'a str,
    pub shared: &'a SymbolTable,
    namespace: &'a mut SymbolMap,
}

impl ActivationContext<'_> {
    /// Bind a name in the capability's private namespace. Names listed
    /// in the manifest's `exports` are copied to the shared table once
    /// the runtime has started.
    pub fn publish(&mut self, name: &str, value: Value) {
        self.namespace.insert(name.to_string(), value);
    }

    /// Look a name up, private namespace first, then the shared table.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.namespace
            .get(name)
            .cloned()
            .or_else(|| self.shared.get(name))
    }

    pub fn defines(&self, name: &str) -> bool {
        self.namespace.contains_key(name)
    }
}

/// The compiled-in behaviour behind a capability. Factories produce one
/// instance per activation; hot-swap replaces the instance wholesale.
pub trait CapabilityRuntime: Send {
    /// Execute the capability body: interpret the source descriptor and
    /// populate the private namespace.
    fn start(&mut self, ctx: &mut ActivationContext<'_>) -> anyhow::Result<()>;

    /// Called once after a successful start when the manifest names an
    /// entry point. A runtime that does not define the name treats the
    /// call as a no-op.
    fn invoke(&mut self, entry_point: &str, ctx: &mut ActivationContext<'_>) -> anyhow::Result<()> {
        let _ = (entry_point, ctx);
        Ok(())
    }

    /// Best-effort cleanup on deactivation. Must not fail.
    fn stop(&mut self) {}
}

pub type Factory = Arc<dyn Fn(&CapabilityManifest) -> Box<dyn CapabilityRuntime> + Send + Sync>;

/// Compile-time name -> factory table. Resolution order: exact
/// capability id, then capability kind, then the descriptor fallback.
#[derive(Clone)]
pub struct FactoryTable {
    by_id: HashMap<String, Factory>,
    by_kind: HashMap<String, Factory>,
    fallback: Factory,
}

impl Default for FactoryTable {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_kind: HashMap::new(),
            fallback: Arc::new(|_| Box::new(DescriptorRuntime::default())),
        }
    }
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_id(&mut self, id: &str, factory: Factory) {
        self.by_id.insert(id.to_string(), factory);
    }

    pub fn register_kind(&mut self, kind: &str, factory: Factory) {
        self.by_kind.insert(kind.to_string(), factory);
    }

    fn instantiate(&self, manifest: &CapabilityManifest) -> Box<dyn CapabilityRuntime> {
        if let Some(factory) = self.by_id.get(&manifest.id) {
            return factory(manifest);
        }
        if let Some(factory) = self.by_kind.get(&manifest.kind.to_string()) {
            return factory(manifest);
        }
        (self.fallback)(manifest)
    }
}

/// Default runtime: interprets the decompressed source as a descriptor
/// of `name = <json>` assignments, one per line. Blank lines and lines
/// starting with `#` are ignored. Values that fail to parse as JSON are
/// taken as plain strings.
#[derive(Default)]
pub struct DescriptorRuntime;

impl CapabilityRuntime for DescriptorRuntime {
    fn start(&mut self, ctx: &mut ActivationContext<'_>) -> anyhow::Result<()> {
        for (index, line) in ctx.source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, raw) = line
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("line {}: expected `name = value`", index + 1))?;
            let value = serde_json::from_str(raw.trim())
                .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
            ctx.publish(name.trim(), value);
        }
        Ok(())
    }

    fn invoke(&mut self, entry_point: &str, ctx: &mut ActivationContext<'_>) -> anyhow::Result<()> {
        // Descriptors have no callables; an entry point that names a
        // defined symbol is acknowledged, anything else is absent.
        if ctx.defines(entry_point) {
            debug!(capability = %ctx.manifest.id, entry_point, "entry point acknowledged");
        }
        Ok(())
    }
}

struct CapabilityCell {
    generation: String,
    state: LifecycleState,
    source: Option<String>,
    namespace: SymbolMap,
    runtime: Option<Box<dyn CapabilityRuntime>>,
    loaded_at: Option<DateTime<Utc>>,
    activated_at: Option<DateTime<Utc>>,
}

impl CapabilityCell {
    fn declared(generation: String) -> Self {
        Self {
            generation,
            state: LifecycleState::Declared,
            source: None,
            namespace: SymbolMap::new(),
            runtime: None,
            loaded_at: None,
            activated_at: None,
        }
    }
}

/// Snapshot of one capability's lifecycle, for status surfaces.
#[derive(Debug, Clone)]
pub struct CapabilityStatus {
    pub id: String,
    pub state: LifecycleState,
    pub generation: String,
    pub loaded_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Lifecycle state machine over the registry's manifests.
///
/// `ops` serializes lifecycle operations end to end; `cells` guards the
/// state maps with short critical sections. Runtime user code executes
/// while only `ops` is held, never under the data lock, so status reads
/// stay responsive during a slow activation.
pub struct CapabilityLoader {
    registry: Arc<CapabilityRegistry>,
    factories: FactoryTable,
    symbols: SymbolTable,
    ops: Mutex<()>,
    cells: Mutex<HashMap<String, CapabilityCell>>,
}

impl CapabilityLoader {
    pub fn new(registry: Arc<CapabilityRegistry>, factories: FactoryTable) -> Self {
        Self {
            registry,
            factories,
            symbols: SymbolTable::new(),
            ops: Mutex::new(()),
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn symbols(&self) -> SymbolTable {
        self.symbols.clone()
    }

    /// Verify and decompress a registered capability's genome.
    pub fn load(&self, id: &str) -> Result<(), LoaderError> {
        let _ops = self.ops.lock();
        self.load_inner(id)
    }

    /// Bring a capability and its transitive dependency closure to
    /// `Active`, loading anything not yet loaded along the way.
    pub fn activate(&self, id: &str) -> Result<(), LoaderError> {
        let _ops = self.ops.lock();
        self.activate_inner(id)
    }

    /// Suspend an active capability, running its cleanup best-effort.
    /// Exported symbols stay in the shared table so consumers keep
    /// their bindings; a later activation may overwrite them. Returns
    /// false when the capability was not active.
    pub fn deactivate(&self, id: &str) -> bool {
        let _ops = self.ops.lock();
        self.deactivate_inner(id)
    }

    /// Replace the active generation of `new_manifest.id`. Refuses (and
    /// returns Ok(false)) when the running instance is pinned with
    /// `hot_swappable = false`; otherwise deactivates the old instance,
    /// registers the new manifest, and activates it.
    pub fn hot_swap(&self, new_manifest: CapabilityManifest) -> Result<bool, LoaderError> {
        let _ops = self.ops.lock();
        let id = new_manifest.id.clone();

        if self.is_active(&id) {
            if let Some(current) = self.registry.get(&id) {
                if !current.hot_swappable {
                    warn!(capability = %id, "hot swap refused: instance is pinned");
                    return Ok(false);
                }
            }
            self.deactivate_inner(&id);
        }

        // Drop the old generation's loaded copy before re-registering.
        self.cells.lock().remove(&id);
        self.registry.register(new_manifest);
        self.activate_inner(&id)?;
        info!(capability = %id, "hot swap complete");
        Ok(true)
    }

    pub fn state(&self, id: &str) -> Option<LifecycleState> {
        self.cells.lock().get(id).map(|cell| cell.state.clone())
    }

    pub fn is_active(&self, id: &str) -> bool {
        matches!(self.state(id), Some(LifecycleState::Active))
    }

    pub fn list_active(&self) -> Vec<String> {
        let cells = self.cells.lock();
        let mut active: Vec<String> = cells
            .iter()
            .filter(|(_, cell)| cell.state == LifecycleState::Active)
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        active
    }

    pub fn status(&self, id: &str) -> Option<CapabilityStatus> {
        self.cells.lock().get(id).map(|cell| CapabilityStatus {
            id: id.to_string(),
            state: cell.state.clone(),
            generation: cell.generation.clone(),
            loaded_at: cell.loaded_at,
            activated_at: cell.activated_at,
        })
    }

    fn load_inner(&self, id: &str) -> Result<(), LoaderError> {
        let manifest = self
            .registry
            .get(id)
            .ok_or_else(|| LoaderError::NotRegistered(id.to_string()))?;

        {
            let mut cells = self.cells.lock();
            let cell = cell_for_generation(&mut cells, id, &manifest.genome_hash);
            match &cell.state {
                LifecycleState::Failed(message) => {
                    return Err(LoaderError::Activation {
                        id: id.to_string(),
                        message: message.clone(),
                    });
                }
                LifecycleState::Loaded | LifecycleState::Active | LifecycleState::Suspended
                    if cell.source.is_some() =>
                {
                    return Ok(());
                }
                _ => cell.state = LifecycleState::Streaming,
            }
        }

        if !codec::verify(&manifest.genome, &manifest.genome_hash) {
            self.fail(id, "genome hash mismatch");
            return Err(LoaderError::Integrity(id.to_string()));
        }
        let source = match codec::decompress(&manifest.genome) {
            Ok(source) => source,
            Err(err) => {
                self.fail(id, &err.to_string());
                return Err(err.into());
            }
        };

        let mut cells = self.cells.lock();
        let cell = cell_for_generation(&mut cells, id, &manifest.genome_hash);
        cell.source = Some(source);
        cell.state = LifecycleState::Loaded;
        cell.loaded_at = Some(Utc::now());
        debug!(capability = %id, hash = %manifest.genome_hash, "genome loaded");
        Ok(())
    }

    fn activate_inner(&self, id: &str) -> Result<(), LoaderError> {
        {
            let mut cells = self.cells.lock();
            if let Some(manifest) = self.registry.get(id) {
                let cell = cell_for_generation(&mut cells, id, &manifest.genome_hash);
                if cell.state == LifecycleState::Active {
                    return Ok(());
                }
                cell.state = LifecycleState::Resolving;
            }
        }

        let plan = resolver::resolve(&self.registry, id)?;
        for step in &plan {
            if self.is_active(step) {
                continue;
            }
            self.load_inner(step)?;
            self.activate_one(step)?;
        }
        Ok(())
    }

    fn activate_one(&self, id: &str) -> Result<(), LoaderError> {
        let manifest = self
            .registry
            .get(id)
            .ok_or_else(|| LoaderError::NotRegistered(id.to_string()))?;

        let source = {
            let cells = self.cells.lock();
            let cell = cells
                .get(id)
                .ok_or_else(|| LoaderError::NotRegistered(id.to_string()))?;
            cell.source
                .clone()
                .ok_or_else(|| LoaderError::NotRegistered(id.to_string()))?
        };

        // Seed the private namespace with a view of the shared table
        // plus the capability's own identity.
        let mut namespace = self.symbols.snapshot();
        namespace.insert(
            "__capability_id__".to_string(),
            Value::String(id.to_string()),
        );
        namespace.insert(
            "__capability_manifest__".to_string(),
            serde_json::to_value(&manifest).expect("manifest serializes"),
        );

        let mut runtime = self.factories.instantiate(&manifest);
        let mut ctx = ActivationContext {
            manifest: &manifest,
            source: &source,
            shared: &self.symbols,
            namespace: &mut namespace,
        };

        if let Err(err) = runtime.start(&mut ctx) {
            let message = err.to_string();
            self.fail(id, &message);
            return Err(LoaderError::Activation {
                id: id.to_string(),
                message,
            });
        }

        // Publish exports; later exports overwrite earlier ones. A name
        // the runtime never defined is an activation failure.
        for name in &manifest.exports {
            match namespace.get(name) {
                Some(value) => self.symbols.insert(name, value.clone()),
                None => {
                    let message = format!("export {name} not defined by capability source");
                    self.fail(id, &message);
                    return Err(LoaderError::Activation {
                        id: id.to_string(),
                        message,
                    });
                }
            }
        }

        if let Some(entry_point) = manifest.entry_point.clone() {
            let mut ctx = ActivationContext {
                manifest: &manifest,
                source: &source,
                shared: &self.symbols,
                namespace: &mut namespace,
            };
            if let Err(err) = runtime.invoke(&entry_point, &mut ctx) {
                let message = format!("entry point {entry_point}: {err}");
                self.fail(id, &message);
                return Err(LoaderError::Activation {
                    id: id.to_string(),
                    message,
                });
            }
        }

        let mut cells = self.cells.lock();
        let cell = cell_for_generation(&mut cells, id, &manifest.genome_hash);
        cell.namespace = namespace;
        cell.runtime = Some(runtime);
        cell.state = LifecycleState::Active;
        cell.activated_at = Some(Utc::now());
        info!(capability = %id, "capability active");
        Ok(())
    }

    fn deactivate_inner(&self, id: &str) -> bool {
        let runtime = {
            let mut cells = self.cells.lock();
            match cells.get_mut(id) {
                Some(cell) if cell.state == LifecycleState::Active => {
                    cell.state = LifecycleState::Suspended;
                    cell.runtime.take()
                }
                _ => return false,
            }
        };
        if let Some(mut runtime) = runtime {
            runtime.stop();
        }
        info!(capability = %id, "capability suspended");
        true
    }

    fn fail(&self, id: &str, message: &str) {
        warn!(capability = %id, error = %message, "capability failed");
        if let Some(cell) = self.cells.lock().get_mut(id) {
            cell.state = LifecycleState::Failed(message.to_string());
        }
    }
}

/// Fetch the cell for `id`, resetting it when the registered generation
/// moved past the one the cell was tracking. `Failed` is terminal only
/// within a generation.
fn cell_for_generation<'a>(
    cells: &'a mut HashMap<String, CapabilityCell>,
    id: &str,
    generation: &str,
) -> &'a mut CapabilityCell {
    let cell = cells
        .entry(id.to_string())
        .or_insert_with(|| CapabilityCell::declared(generation.to_string()));
    if cell.generation != generation {
        *cell = CapabilityCell::declared(generation.to_string());
    }
    cell
}
