use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Startup configuration for a Hydra node.
#[derive(Debug, Clone, Parser)]
#[command(name = "hydra", about = "Self-propagating distributed compute mesh node")]
pub struct NodeConfig {
    /// UDP port for encrypted broadcast discovery.
    #[arg(long, default_value_t = 9999)]
    pub udp_port: u16,

    /// TCP port for the propagation HTTP surface.
    #[arg(long, default_value_t = 8080)]
    pub http_port: u16,

    /// Seconds between heartbeat broadcasts.
    #[arg(long, default_value_t = 5)]
    pub heartbeat_interval: u64,

    /// Seconds of silence before a peer is evicted.
    #[arg(long, default_value_t = 30)]
    pub peer_timeout: u64,

    /// Wall-clock limit for a single job, seconds.
    #[arg(long, default_value_t = 60)]
    pub job_timeout: u64,

    /// Where keys and node state live. Defaults to the platform data
    /// directory; HYDRA_DATA_DIR overrides both.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Force headless WORKER mode even on a terminal.
    #[arg(long, default_value_t = false)]
    pub worker: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            udp_port: 9999,
            http_port: 8080,
            heartbeat_interval: 5,
            peer_timeout: 30,
            job_timeout: 60,
            data_dir: None,
            worker: false,
        }
    }
}

impl NodeConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout)
    }

    /// Resolve the data directory: flag, then HYDRA_DATA_DIR, then the
    /// platform default.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("HYDRA_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hydra")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = NodeConfig::default();
        assert_eq!(config.udp_port, 9999);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.heartbeat(), Duration::from_secs(5));
        assert_eq!(config.peer_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = NodeConfig {
            data_dir: Some(PathBuf::from("/tmp/hydra-test")),
            ..NodeConfig::default()
        };
        assert_eq!(config.resolved_data_dir(), PathBuf::from("/tmp/hydra-test"));
    }

    #[test]
    fn parses_flags() {
        let config = NodeConfig::parse_from([
            "hydra",
            "--udp-port",
            "7001",
            "--http-port",
            "7002",
            "--worker",
        ]);
        assert_eq!(config.udp_port, 7001);
        assert_eq!(config.http_port, 7002);
        assert!(config.worker);
    }
}
