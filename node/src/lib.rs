//! # Hydra Node
//!
//! The runnable half of the mesh: configuration, the hardware probe,
//! the job scheduler with its built-in executors, the propagation HTTP
//! surface, and the kernel that wires everything together. The `hydra`
//! binary runs a SEED (interactive CLI) when stdin is a terminal and a
//! headless WORKER otherwise; both are identical on the wire.

pub mod builtin;
pub mod cli;
pub mod config;
pub mod executors;
pub mod hardware;
pub mod http;
pub mod kernel;
pub mod sandbox;
pub mod scheduler;

pub use config::NodeConfig;
pub use kernel::Kernel;
