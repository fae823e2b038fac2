use std::io::IsTerminal;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hydra_node::{cli, Kernel, NodeConfig};

fn main() {
    let config = NodeConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(config) {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run(config: NodeConfig) -> anyhow::Result<()> {
    let seed = !config.worker && std::io::stdin().is_terminal();
    let kernel = Kernel::bootstrap(config)?;
    kernel.start()?;

    if seed {
        banner(&kernel);
        cli::run(&kernel);
        kernel.shutdown();
    } else {
        // WORKER: headless, identical on the wire. Runs until killed.
        info!(node_id = %kernel.node_id(), "running as worker");
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }
    Ok(())
}

fn banner(kernel: &std::sync::Arc<Kernel>) {
    println!("hydra v{}", env!("CARGO_PKG_VERSION"));
    println!("node {}", kernel.node_id());
    if let Some(port) = kernel.http_port() {
        println!("propagation surface on :{port}");
    }
    println!("type 'help' for commands, 'exit' to shut down\n");
}
