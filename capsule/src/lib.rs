//! # Hydra Capability Subsystem
//!
//! A capability is a named, versioned bundle of behaviour that can be
//! streamed between peers, registered, activated, and hot-swapped while
//! the node runs. This crate carries the whole lifecycle:
//!
//! - [`manifest`] - the self-describing, content-addressed manifest model
//! - [`codec`] - zlib + base64 genome armouring and hash verification
//! - [`registry`] - in-memory manifest store indexed by id, kind, and
//!   provided name
//! - [`resolver`] - dependency-ordered load planning with cycle detection
//! - [`loader`] - the lifecycle state machine, factory table, and shared
//!   symbol table
//! - [`stream`] - the in-process fan-out bus carrying discovered
//!   manifests to subscribers
//!
//! Capability behaviour is compiled in: manifests select a registered
//! factory, and the genome they carry is a configuration descriptor for
//! that factory rather than executable code.

pub mod codec;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod stream;

pub use codec::{CodecError, Genome};
pub use loader::{
    ActivationContext, CapabilityLoader, CapabilityRuntime, CapabilityStatus, FactoryTable,
    LifecycleState, LoaderError, SymbolTable,
};
pub use manifest::{CapabilityKind, CapabilityManifest, ManifestError};
pub use registry::CapabilityRegistry;
pub use resolver::{resolve, resolve_all, ResolveError};
pub use stream::CapabilityStream;
