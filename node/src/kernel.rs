use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use hydra_capsule::codec::build_manifest;
use hydra_capsule::{
    CapabilityKind, CapabilityLoader, CapabilityManifest, CapabilityRegistry, CapabilityStream,
    FactoryTable,
};
use hydra_mesh::wire::{
    parse_payload, payload, AnnouncePayload, JobSubmitPayload, Opcode, Packet, RequestPayload,
    ResponsePayload,
};
use hydra_mesh::{MeshConfig, MeshService, NodeIdentity, SwarmEnvelope};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::builtin::{builtin_manifests, BOOTSTRAP_ORDER};
use crate::config::NodeConfig;
use crate::executors;
use crate::hardware::{self, HardwareProfile};
use crate::http::{self, HttpServer};
use crate::scheduler::Scheduler;

/// Manifest builder request accepted by `POST /inject` and the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct InjectRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<CapabilityKind>,
    pub source: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// The node kernel: exclusive owner of the registry, loader, stream,
/// mesh, and scheduler for the process lifetime. All mutable state
/// lives behind it; there are no globals.
pub struct Kernel {
    config: NodeConfig,
    identity: NodeIdentity,
    hardware: HardwareProfile,
    registry: Arc<CapabilityRegistry>,
    loader: Arc<CapabilityLoader>,
    stream: Arc<CapabilityStream>,
    mesh: MeshService,
    scheduler: Arc<Scheduler>,
    http: Mutex<Option<HttpServer>>,
    started_at: Instant,
}

impl Kernel {
    /// Construct the kernel and seed the registry with the built-in
    /// genome. Identity corruption and socket bind failures are fatal
    /// here; everything later degrades gracefully.
    pub fn bootstrap(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        let data_dir = config.resolved_data_dir();
        let identity =
            NodeIdentity::load_or_generate(&data_dir).context("loading node identity")?;
        let hardware = hardware::probe();

        let registry = Arc::new(CapabilityRegistry::new());
        let stream = Arc::new(CapabilityStream::new());
        let loader = Arc::new(CapabilityLoader::new(
            Arc::clone(&registry),
            FactoryTable::new(),
        ));

        let mesh = MeshService::bind(
            MeshConfig {
                port: config.udp_port,
                heartbeat_interval: config.heartbeat(),
                peer_timeout: config.peer_timeout(),
                broadcast_addr: None,
            },
            identity.fingerprint(),
            &hardware.tag(),
            SwarmEnvelope::new(identity.swarm_key()),
        )
        .context("binding mesh socket")?;

        let scheduler = Arc::new(Scheduler::new());
        executors::install_builtin_executors(&scheduler, config.job_timeout());

        for manifest in builtin_manifests(&config, identity.fingerprint(), &hardware) {
            registry.register(manifest);
        }

        Ok(Arc::new(Self {
            config,
            identity,
            hardware,
            registry,
            loader,
            stream,
            mesh,
            scheduler,
            http: Mutex::new(None),
            started_at: Instant::now(),
        }))
    }

    /// Bring the node up: activate the built-in genome in its fixed
    /// order, wire the stream and mesh dispatch, then start the worker
    /// loop and the HTTP listener. One failed capability logs and does
    /// not halt bootstrap.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        for id in BOOTSTRAP_ORDER {
            if let Err(err) = self.loader.activate(id) {
                warn!(capability = %id, error = %err, "builtin activation failed");
            }
        }
        info!(
            active = self.loader.list_active().len(),
            registered = self.registry.len(),
            "genome bootstrapped"
        );

        let weak = Arc::downgrade(self);
        self.stream.subscribe(move |manifest| {
            if let Some(kernel) = weak.upgrade() {
                kernel.on_streamed(manifest);
            }
            Ok(())
        });

        let advertiser = Arc::clone(self);
        let dispatcher = Arc::clone(self);
        self.mesh.start(
            move || advertiser.loader.list_active(),
            move |packet| dispatcher.handle_packet(&packet),
        );

        self.scheduler.start();

        let server = http::serve(Arc::clone(self), self.config.http_port)
            .context("binding propagation HTTP listener")?;
        info!(port = server.port(), "propagation surface up");
        *self.http.lock() = Some(server);
        Ok(())
    }

    /// Cooperative shutdown: fan out stop signals, join every
    /// background thread.
    pub fn shutdown(&self) {
        info!("kernel shutting down");
        if let Some(server) = self.http.lock().take() {
            server.stop();
        }
        self.mesh.stop();
        self.scheduler.stop();
        self.stream.stop();
    }

    /// Dispatch one decrypted, non-self mesh packet.
    pub fn handle_packet(&self, packet: &Packet) {
        match packet.op {
            Opcode::Ping => {}
            Opcode::CapabilityAnnounce => match parse_payload::<AnnouncePayload>(&packet.data) {
                Ok(announce) => {
                    let ids: Vec<String> =
                        announce.capabilities.iter().map(|m| m.id.clone()).collect();
                    for manifest in announce.capabilities {
                        self.adopt_manifest(manifest, &packet.src);
                    }
                    self.mesh.peers().note_capabilities(&packet.src, ids);
                }
                Err(err) => debug!(src = %packet.src, error = %err, "bad announce payload"),
            },
            Opcode::CapabilityRequest => match parse_payload::<RequestPayload>(&packet.data) {
                Ok(request) => {
                    if let Some(capability) = self.registry.get(&request.id) {
                        debug!(src = %packet.src, capability = %request.id, "serving capability request");
                        self.mesh.sender().send(
                            Opcode::CapabilityResponse,
                            payload(&ResponsePayload { capability }),
                        );
                    }
                }
                Err(err) => debug!(src = %packet.src, error = %err, "bad request payload"),
            },
            Opcode::CapabilityResponse => match parse_payload::<ResponsePayload>(&packet.data) {
                Ok(response) => self.adopt_manifest(response.capability, &packet.src),
                Err(err) => debug!(src = %packet.src, error = %err, "bad response payload"),
            },
            Opcode::JobSubmit => match parse_payload::<JobSubmitPayload>(&packet.data) {
                Ok(submit) => {
                    let id = self.scheduler.submit(
                        &submit.job.job_type,
                        submit.job.spec,
                        submit.job.id,
                    );
                    debug!(src = %packet.src, job = %id, "job accepted from mesh");
                }
                Err(err) => debug!(src = %packet.src, error = %err, "bad job payload"),
            },
        }
    }

    /// Register a manifest that arrived from a peer; novel generations
    /// also go out on the stream.
    fn adopt_manifest(&self, manifest: CapabilityManifest, src: &str) {
        if let Err(err) = manifest.validate() {
            debug!(src = %src, error = %err, "rejecting malformed manifest");
            return;
        }
        let novel = self.registry.register(manifest.clone());
        if novel {
            info!(capability = %manifest.id, src = %src, "adopted capability from mesh");
            self.stream.publish(manifest);
        }
    }

    /// Stream subscriber: a new generation for an active capability is
    /// hot-swapped in; everything else stays registered for on-demand
    /// activation.
    fn on_streamed(&self, manifest: &CapabilityManifest) {
        let stale = self
            .loader
            .status(&manifest.id)
            .map(|status| {
                status.state == hydra_capsule::LifecycleState::Active
                    && status.generation != manifest.genome_hash
            })
            .unwrap_or(false);
        if stale {
            match self.loader.hot_swap(manifest.clone()) {
                Ok(true) => info!(capability = %manifest.id, "hot-swapped streamed generation"),
                Ok(false) => debug!(capability = %manifest.id, "streamed generation refused"),
                Err(err) => warn!(capability = %manifest.id, error = %err, "streamed hot swap failed"),
            }
        }
    }

    /// Build, register, stream, and announce a capability from raw
    /// source. Returns the assigned id and content address.
    pub fn inject(&self, request: InjectRequest) -> anyhow::Result<(String, String)> {
        let id = request.id.unwrap_or_else(|| {
            format!("plugin.{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        });
        let name = request.name.unwrap_or_else(|| id.clone());
        let kind = request.kind.unwrap_or(CapabilityKind::Plugin);

        let manifest = build_manifest(
            &id,
            &name,
            kind,
            &request.source,
            request.dependencies,
            request.provides,
            request.exports,
            &request.description,
        );
        manifest.validate()?;
        let hash = manifest.genome_hash.clone();

        self.registry.register(manifest.clone());
        self.stream.publish(manifest.clone());
        self.announce(vec![manifest]);
        info!(capability = %id, %hash, "capability injected");
        Ok((id, hash))
    }

    /// Replace an existing capability's source in place. Returns false
    /// when the active instance refuses the swap.
    pub fn evolve(&self, id: &str, source: &str) -> anyhow::Result<bool> {
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("capability not registered: {id}"))?;

        let mut next = build_manifest(
            id,
            &current.name,
            current.kind,
            source,
            current.dependencies.clone(),
            current.provides.clone(),
            current.exports.clone(),
            &current.description,
        );
        next.priority = current.priority;
        next.entry_point = current.entry_point.clone();

        let swapped = self.loader.hot_swap(next.clone())?;
        if swapped {
            self.stream.publish(next.clone());
            self.announce(vec![next]);
        }
        Ok(swapped)
    }

    /// Broadcast a capability announce for the given manifests.
    pub fn announce(&self, capabilities: Vec<CapabilityManifest>) {
        self.mesh
            .sender()
            .send(Opcode::CapabilityAnnounce, payload(&AnnouncePayload { capabilities }));
    }

    pub fn submit_job(&self, job_type: &str, spec: Value, id: Option<String>) -> String {
        self.scheduler.submit(job_type, spec, id)
    }

    pub fn cluster_status(&self) -> Value {
        serde_json::json!({
            "node_id": self.identity.fingerprint(),
            "uptime": self.uptime_seconds(),
            "peers": self.mesh.peers().len(),
            "capabilities": {
                "active": self.loader.list_active().len(),
                "registered": self.registry.len(),
            },
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn node_id(&self) -> &str {
        self.identity.fingerprint()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn hardware(&self) -> &HardwareProfile {
        &self.hardware
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<CapabilityLoader> {
        &self.loader
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn peers(&self) -> Arc<hydra_mesh::PeerTable> {
        self.mesh.peers()
    }

    pub fn http_port(&self) -> Option<u16> {
        self.http.lock().as_ref().map(|server| server.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_capsule::LifecycleState;
    use tempfile::TempDir;

    fn test_kernel() -> (Arc<Kernel>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig {
            udp_port: 0,
            http_port: 0,
            data_dir: Some(dir.path().to_path_buf()),
            ..NodeConfig::default()
        };
        let kernel = Kernel::bootstrap(config).unwrap();
        (kernel, dir)
    }

    #[test]
    fn bootstrap_seeds_the_builtin_genome() {
        let (kernel, _dir) = test_kernel();
        assert_eq!(kernel.registry().len(), 8);
        assert!(kernel.registry().contains("core.quine"));
    }

    #[test]
    fn activation_covers_all_builtins() {
        let (kernel, _dir) = test_kernel();
        for id in BOOTSTRAP_ORDER {
            kernel.loader().activate(id).unwrap();
        }
        assert_eq!(kernel.loader().list_active().len(), 8);
        let status = kernel.cluster_status();
        assert_eq!(status["capabilities"]["active"], 8);
        assert_eq!(status["capabilities"]["registered"], 8);
    }

    #[test]
    fn inject_then_activate_exposes_exports() {
        let (kernel, _dir) = test_kernel();
        let (id, hash) = kernel
            .inject(InjectRequest {
                id: Some("plugin.x".to_string()),
                name: None,
                kind: None,
                source: "X = 1".to_string(),
                dependencies: vec![],
                provides: vec![],
                exports: vec!["X".to_string()],
                description: String::new(),
            })
            .unwrap();
        assert_eq!(id, "plugin.x");
        assert_eq!(hash.len(), 16);

        kernel.loader().activate("plugin.x").unwrap();
        assert_eq!(kernel.loader().symbols().get("X"), Some(Value::from(1)));
    }

    #[test]
    fn evolve_hot_swaps_the_generation() {
        let (kernel, _dir) = test_kernel();
        kernel
            .inject(InjectRequest {
                id: Some("plugin.x".to_string()),
                name: None,
                kind: None,
                source: "X = 1".to_string(),
                dependencies: vec![],
                provides: vec![],
                exports: vec!["X".to_string()],
                description: String::new(),
            })
            .unwrap();
        kernel.loader().activate("plugin.x").unwrap();
        assert_eq!(kernel.loader().symbols().get("X"), Some(Value::from(1)));

        assert!(kernel.evolve("plugin.x", "X = 2").unwrap());
        assert_eq!(kernel.loader().symbols().get("X"), Some(Value::from(2)));
        assert_eq!(
            kernel.loader().state("plugin.x"),
            Some(LifecycleState::Active)
        );
    }

    #[test]
    fn announce_packets_register_and_note_capabilities() {
        let (kernel, _dir) = test_kernel();
        let manifest = build_manifest(
            "plugin.remote",
            "remote",
            CapabilityKind::Plugin,
            "R = 7",
            vec![],
            vec![],
            vec!["R".to_string()],
            "",
        );
        // The peer has to exist before capabilities attach to it.
        kernel
            .peers()
            .observe("peer-b", "127.0.0.1".parse().unwrap(), "test");

        let packet = Packet::new(
            "peer-b",
            Opcode::CapabilityAnnounce,
            payload(&AnnouncePayload {
                capabilities: vec![manifest],
            }),
        );
        kernel.handle_packet(&packet);

        assert!(kernel.registry().contains("plugin.remote"));
        assert_eq!(
            kernel.peers().get("peer-b").unwrap().capability_ids,
            vec!["plugin.remote"]
        );
    }

    #[test]
    fn job_submit_packets_queue_jobs() {
        let (kernel, _dir) = test_kernel();
        let packet = Packet::new(
            "peer-b",
            Opcode::JobSubmit,
            serde_json::json!({
                "job": {"id": "wire-job", "type": "expr", "spec": {"code": "1 + 1"}},
            }),
        );
        kernel.handle_packet(&packet);
        let job = kernel.scheduler().get("wire-job").unwrap();
        assert_eq!(job.job_type, "expr");
    }

    #[test]
    fn malformed_packets_are_absorbed() {
        let (kernel, _dir) = test_kernel();
        let packet = Packet::new("peer-b", Opcode::CapabilityAnnounce, Value::Null);
        kernel.handle_packet(&packet);
        let packet = Packet::new("peer-b", Opcode::JobSubmit, serde_json::json!({"job": 5}));
        kernel.handle_packet(&packet);
        assert_eq!(kernel.registry().len(), 8);
    }
}
