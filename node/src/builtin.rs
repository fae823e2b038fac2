use hydra_capsule::codec::build_manifest;
use hydra_capsule::{CapabilityKind, CapabilityManifest};

use crate::config::NodeConfig;
use crate::hardware::HardwareProfile;

/// The fixed bootstrap order: config -> identity -> hardware -> mesh ->
/// executors -> propagation -> quine.
pub const BOOTSTRAP_ORDER: [&str; 8] = [
    "core.config",
    "core.identity",
    "core.hardware",
    "net.mesh",
    "executor.python",
    "executor.container",
    "net.propagation",
    "core.quine",
];

/// Build the node's built-in genome: eight capabilities whose
/// descriptor sources are generated from live node state, so their
/// content addresses change exactly when the node's shape does.
pub fn builtin_manifests(
    config: &NodeConfig,
    node_id: &str,
    hardware: &HardwareProfile,
) -> Vec<CapabilityManifest> {
    let config_json = serde_json::json!({
        "udp_port": config.udp_port,
        "http_port": config.http_port,
        "heartbeat_interval": config.heartbeat_interval,
        "peer_timeout": config.peer_timeout,
        "job_timeout": config.job_timeout,
    });

    let mut manifests = Vec::with_capacity(BOOTSTRAP_ORDER.len());

    manifests.push(with_priority(
        build_manifest(
            "core.config",
            "config",
            CapabilityKind::Core,
            &format!("# node runtime configuration\nconfig = {config_json}\n"),
            vec![],
            vec!["config".to_string()],
            vec!["config".to_string()],
            "Node runtime configuration",
        ),
        0,
    ));

    let mut identity = with_priority(
        build_manifest(
            "core.identity",
            "identity",
            CapabilityKind::Core,
            &format!("node_id = \"{node_id}\"\n"),
            vec!["core.config".to_string()],
            vec!["identity".to_string()],
            vec!["node_id".to_string()],
            "Node keypair fingerprint",
        ),
        1,
    );
    // Swapping identity under a live mesh would orphan the node.
    identity.hot_swappable = false;
    manifests.push(identity);

    manifests.push(with_priority(
        build_manifest(
            "core.hardware",
            "hardware",
            CapabilityKind::Core,
            &format!(
                "hardware = {}\n",
                serde_json::to_string(hardware).expect("hardware serializes")
            ),
            vec!["core.config".to_string()],
            vec!["hardware".to_string()],
            vec!["hardware".to_string()],
            "Host hardware snapshot",
        ),
        2,
    ));

    let mut mesh = with_priority(
        build_manifest(
            "net.mesh",
            "mesh",
            CapabilityKind::Network,
            &format!(
                "mesh_port = {}\nheartbeat_interval = {}\n",
                config.udp_port, config.heartbeat_interval
            ),
            vec!["core.identity".to_string(), "core.hardware".to_string()],
            vec!["mesh".to_string()],
            vec!["mesh_port".to_string(), "heartbeat_interval".to_string()],
            "Encrypted broadcast discovery",
        ),
        10,
    );
    mesh.hot_swappable = false;
    manifests.push(mesh);

    manifests.push(with_priority(
        build_manifest(
            "executor.python",
            "python",
            CapabilityKind::Executor,
            "python_runtime = \"python3\"\n",
            vec!["core.config".to_string()],
            vec!["python".to_string()],
            vec!["python_runtime".to_string()],
            "Python subprocess executor",
        ),
        20,
    ));

    manifests.push(with_priority(
        build_manifest(
            "executor.container",
            "container",
            CapabilityKind::Executor,
            "container_runtime = \"docker\"\n",
            vec!["core.config".to_string()],
            vec!["container".to_string()],
            vec!["container_runtime".to_string()],
            "Container subprocess executor",
        ),
        21,
    ));

    manifests.push(with_priority(
        build_manifest(
            "net.propagation",
            "propagation",
            CapabilityKind::Network,
            &format!("http_port = {}\n", config.http_port),
            vec!["net.mesh".to_string()],
            vec!["propagation".to_string()],
            vec!["http_port".to_string()],
            "Capability catalog and injection over HTTP",
        ),
        30,
    ));

    let mut quine = with_priority(
        build_manifest(
            "core.quine",
            "quine",
            CapabilityKind::Quine,
            "# serve our own binary to joining peers\nreplicate = \"serve_self\"\n",
            vec!["net.propagation".to_string()],
            vec!["quine".to_string()],
            vec!["replicate".to_string()],
            "Self-replication seed",
        ),
        40,
    );
    quine.entry_point = Some("replicate".to_string());
    manifests.push(quine);

    manifests
}

fn with_priority(mut manifest: CapabilityManifest, priority: i32) -> CapabilityManifest {
    manifest.priority = priority;
    manifest
}
