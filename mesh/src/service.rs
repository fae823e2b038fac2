use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::envelope::SwarmEnvelope;
use crate::peers::PeerTable;
use crate::wire::{parse_payload, Opcode, Packet, PingPayload};

/// Largest datagram the mesh will send or accept.
pub const MAX_DATAGRAM: usize = 65_507;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
    /// Override for the limited broadcast target, used to point two
    /// nodes at each other over loopback.
    pub broadcast_addr: Option<SocketAddr>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            port: 9999,
            heartbeat_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
            broadcast_addr: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("failed to bind mesh socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Outbound half of the mesh: seals packets and sends them at the
/// broadcast target. Cheap to clone into opcode handlers.
pub struct MeshSender {
    node_id: String,
    socket: UdpSocket,
    envelope: Arc<SwarmEnvelope>,
    target: SocketAddr,
}

impl MeshSender {
    pub fn send(&self, op: Opcode, data: Value) {
        let packet = Packet::new(&self.node_id, op, data);
        let wire = self.envelope.seal(&packet.to_map());
        if wire.len() > MAX_DATAGRAM {
            warn!(?op, bytes = wire.len(), "dropping oversize mesh packet");
            return;
        }
        if let Err(err) = self.socket.send_to(&wire, self.target) {
            debug!(?op, error = %err, "mesh send failed");
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Clone for MeshSender {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            socket: self
                .socket
                .try_clone()
                .expect("cloning a bound UDP socket cannot fail"),
            envelope: Arc::clone(&self.envelope),
            target: self.target,
        }
    }
}

/// Encrypted UDP broadcast transport with peer liveness.
///
/// One listener thread absorbs every receive-path failure - malformed,
/// unauthenticated, stale, or oversize packets must never kill the
/// loop. One heartbeat thread broadcasts `PING` and sweeps silent
/// peers. Both stop cooperatively.
pub struct MeshService {
    node_id: String,
    hw_tag: String,
    config: MeshConfig,
    envelope: Arc<SwarmEnvelope>,
    socket: UdpSocket,
    peers: Arc<PeerTable>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshService {
    /// Bind the wildcard broadcast socket. Failure here is fatal to the
    /// node; everything after bind is absorb-and-continue.
    pub fn bind(
        config: MeshConfig,
        node_id: &str,
        hw_tag: &str,
        envelope: SwarmEnvelope,
    ) -> Result<Self, MeshError> {
        let bind_err = |source| MeshError::Bind {
            port: config.port,
            source,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_broadcast(true).map_err(bind_err)?;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        socket.bind(&bind_addr.into()).map_err(bind_err)?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(bind_err)?;

        Ok(Self {
            node_id: node_id.to_string(),
            hw_tag: hw_tag.to_string(),
            config,
            envelope: Arc::new(envelope),
            socket: socket.into(),
            peers: Arc::new(PeerTable::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Port the socket actually bound (differs from the configured one
    /// when binding port 0).
    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port)
    }

    pub fn peers(&self) -> Arc<PeerTable> {
        Arc::clone(&self.peers)
    }

    pub fn sender(&self) -> MeshSender {
        let target = self.config.broadcast_addr.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.config.port)
        });
        MeshSender {
            node_id: self.node_id.clone(),
            socket: self
                .socket
                .try_clone()
                .expect("cloning a bound UDP socket cannot fail"),
            envelope: Arc::clone(&self.envelope),
            target,
        }
    }

    /// Start the listener and heartbeat threads. `advertised` supplies
    /// the capability ids carried in each `PING`; `handler` receives
    /// every non-PING packet from other nodes.
    pub fn start(
        &self,
        advertised: impl Fn() -> Vec<String> + Send + 'static,
        handler: impl Fn(Packet) + Send + 'static,
    ) {
        let mut threads = self.threads.lock();

        let listener = {
            let socket = self
                .socket
                .try_clone()
                .expect("cloning a bound UDP socket cannot fail");
            let envelope = Arc::clone(&self.envelope);
            let peers = Arc::clone(&self.peers);
            let shutdown = Arc::clone(&self.shutdown);
            let node_id = self.node_id.clone();
            thread::Builder::new()
                .name("mesh-listener".to_string())
                .spawn(move || {
                    listen_loop(&socket, &envelope, &peers, &shutdown, &node_id, handler)
                })
                .expect("spawning the mesh listener cannot fail")
        };
        threads.push(listener);

        let heartbeat = {
            let sender = self.sender();
            let peers = Arc::clone(&self.peers);
            let shutdown = Arc::clone(&self.shutdown);
            let hw_tag = self.hw_tag.clone();
            let interval = self.config.heartbeat_interval;
            let timeout_seconds = self.config.peer_timeout.as_secs() as i64;
            thread::Builder::new()
                .name("mesh-heartbeat".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        sender.send(
                            Opcode::Ping,
                            serde_json::json!({
                                "hw": hw_tag,
                                "capabilities": advertised(),
                            }),
                        );
                        let evicted = peers.sweep(timeout_seconds);
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "heartbeat evicted peers");
                        }
                        sleep_until_shutdown(&shutdown, interval);
                    }
                })
                .expect("spawning the mesh heartbeat cannot fail")
        };
        threads.push(heartbeat);
    }

    /// Signal both threads and join them.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn sleep_until_shutdown(shutdown: &AtomicBool, total: Duration) {
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(SHUTDOWN_POLL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn listen_loop(
    socket: &UdpSocket,
    envelope: &SwarmEnvelope,
    peers: &PeerTable,
    shutdown: &AtomicBool,
    node_id: &str,
    handler: impl Fn(Packet),
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                debug!(error = %err, "mesh receive failed");
                continue;
            }
        };

        let Some(map) = envelope.open(&buf[..len]) else {
            trace!(%addr, "dropping unauthenticated datagram");
            continue;
        };
        let packet = match Packet::from_map(map) {
            Ok(packet) => packet,
            Err(err) => {
                trace!(%addr, error = %err, "dropping malformed packet");
                continue;
            }
        };
        // Our own broadcasts come back to us; drop them on src.
        if packet.src == node_id {
            continue;
        }

        match packet.op {
            Opcode::Ping => {
                let ping: PingPayload = parse_payload(&packet.data).unwrap_or(PingPayload {
                    hw: String::new(),
                    capabilities: Vec::new(),
                });
                peers.observe(&packet.src, addr.ip(), &ping.hw);
                if !ping.capabilities.is_empty() {
                    peers.note_capabilities(&packet.src, ping.capabilities);
                }
            }
            _ => {
                peers.observe(&packet.src, addr.ip(), "");
                handler(packet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{payload, RequestPayload};
    use std::sync::mpsc::channel;
    use std::time::Instant;

    const KEY: [u8; 32] = *b"shared swarm key for loop tests!";

    fn service(node_id: &str, target: Option<SocketAddr>) -> MeshService {
        service_on(node_id, 0, target)
    }

    fn service_on(node_id: &str, port: u16, target: Option<SocketAddr>) -> MeshService {
        let config = MeshConfig {
            port,
            heartbeat_interval: Duration::from_millis(200),
            peer_timeout: Duration::from_secs(1),
            broadcast_addr: target,
        };
        MeshService::bind(config, node_id, "test/hw", SwarmEnvelope::new(&KEY))
            .expect("loopback bind")
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn wait_for(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if probe() {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn two_nodes_discover_each_other_over_loopback() {
        let port_a = free_port();
        let port_b = free_port();
        let a = service_on("node-a", port_a, Some(loopback(port_b)));
        let b = service_on("node-b", port_b, Some(loopback(port_a)));

        a.start(Vec::new, |_| {});
        b.start(Vec::new, |_| {});

        assert!(
            wait_for(Duration::from_secs(3), || {
                a.peers().get("node-b").is_some() && b.peers().get("node-a").is_some()
            }),
            "both nodes should discover each other within two heartbeat intervals"
        );

        a.stop();
        b.stop();
    }

    #[test]
    fn silent_peer_is_evicted() {
        let a = service("node-a", None);
        a.start(Vec::new, |_| {});

        // Inject a PING from a fake peer directly at A's socket.
        let envelope = SwarmEnvelope::new(&KEY);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let ping = Packet::new("node-ghost", Opcode::Ping, serde_json::json!({"hw": "x"}));
        sock.send_to(&envelope.seal(&ping.to_map()), loopback(a.local_port()))
            .unwrap();

        assert!(
            wait_for(Duration::from_secs(2), || a.peers().get("node-ghost").is_some()),
            "ghost peer should appear"
        );
        assert!(
            wait_for(Duration::from_secs(3), || a.peers().get("node-ghost").is_none()),
            "ghost peer should be evicted after the timeout"
        );
        a.stop();
    }

    #[test]
    fn own_packets_are_discarded() {
        let a = service("node-a", None);
        let (tx, rx) = channel();
        a.start(Vec::new, move |packet| {
            let _ = tx.send(packet.op);
        });

        let envelope = SwarmEnvelope::new(&KEY);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let own = Packet::new(
            "node-a",
            Opcode::CapabilityRequest,
            payload(&RequestPayload {
                id: "plugin.x".to_string(),
            }),
        );
        sock.send_to(&envelope.seal(&own.to_map()), loopback(a.local_port()))
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(800)).is_err());
        assert!(a.peers().get("node-a").is_none());
        a.stop();
    }

    #[test]
    fn non_ping_packets_reach_the_handler() {
        let a = service("node-a", None);
        let (tx, rx) = channel();
        a.start(Vec::new, move |packet| {
            let _ = tx.send((packet.src.clone(), packet.op));
        });

        let envelope = SwarmEnvelope::new(&KEY);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let request = Packet::new(
            "node-b",
            Opcode::CapabilityRequest,
            payload(&RequestPayload {
                id: "plugin.x".to_string(),
            }),
        );
        sock.send_to(&envelope.seal(&request.to_map()), loopback(a.local_port()))
            .unwrap();

        let (src, op) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(src, "node-b");
        assert_eq!(op, Opcode::CapabilityRequest);
        assert!(a.peers().get("node-b").is_some());
        a.stop();
    }

    #[test]
    fn garbage_datagrams_do_not_kill_the_listener() {
        let a = service("node-a", None);
        let (tx, rx) = channel();
        a.start(Vec::new, move |packet| {
            let _ = tx.send(packet.op);
        });

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.send_to(b"definitely not ciphertext", loopback(a.local_port()))
            .unwrap();

        // A valid packet afterwards still gets through.
        let envelope = SwarmEnvelope::new(&KEY);
        let request = Packet::new(
            "node-b",
            Opcode::CapabilityRequest,
            payload(&RequestPayload {
                id: "plugin.x".to_string(),
            }),
        );
        sock.send_to(&envelope.seal(&request.to_map()), loopback(a.local_port()))
            .unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Opcode::CapabilityRequest
        );
        a.stop();
    }
}
