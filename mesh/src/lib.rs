//! # Hydra Mesh
//!
//! The coordination layer between nodes sharing a broadcast domain:
//!
//! - [`identity`] - per-node ed25519 keypair and the shared swarm secret
//! - [`envelope`] - the authenticated AES-GCM packet envelope
//! - [`wire`] - decrypted packet shape and the mesh opcodes
//! - [`peers`] - peer registry with last-seen liveness
//! - [`service`] - UDP broadcast transport, listener, and heartbeat
//!
//! Every datagram on the wire is sealed with the swarm key; a packet
//! that fails to open is dropped without comment. Peer churn is normal
//! and expected.

pub mod envelope;
pub mod identity;
pub mod peers;
pub mod service;
pub mod wire;

pub use envelope::SwarmEnvelope;
pub use identity::{IdentityError, NodeIdentity};
pub use peers::{PeerRecord, PeerTable};
pub use service::{MeshConfig, MeshError, MeshSender, MeshService};
pub use wire::{Opcode, Packet};
