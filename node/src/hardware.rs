use serde::Serialize;
use sha2::{Digest, Sha256};
use sysinfo::System;

/// Snapshot of the machine a node runs on. Served by `GET /health` and
/// condensed into the hardware tag carried in every heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct HardwareProfile {
    pub hostname: Option<String>,
    pub os: String,
    pub os_version: String,
    pub cpu_arch: String,
    pub cpu_count: usize,
    pub memory_mb: u64,
    pub fingerprint: String,
}

pub fn probe() -> HardwareProfile {
    let mut system = System::new_all();
    system.refresh_all();

    let hostname = System::host_name();
    let os = normalize_os(std::env::consts::OS);
    let os_version = System::long_os_version()
        .or_else(System::os_version)
        .unwrap_or_else(|| "unknown".to_string());
    let cpu_arch = std::env::consts::ARCH.to_string();
    let cpu_count = system.cpus().len();
    let memory_mb = system.total_memory() / 1_048_576;

    let mut hasher = Sha256::new();
    hasher.update(os.as_bytes());
    hasher.update(os_version.as_bytes());
    hasher.update(cpu_arch.as_bytes());
    if let Some(host) = &hostname {
        hasher.update(host.as_bytes());
    }
    let fingerprint = hex::encode(&hasher.finalize()[..8]);

    HardwareProfile {
        hostname,
        os,
        os_version,
        cpu_arch,
        cpu_count,
        memory_mb,
        fingerprint,
    }
}

impl HardwareProfile {
    /// Short tag for peer records, e.g. `linux/x86_64/8c`.
    pub fn tag(&self) -> String {
        format!("{}/{}/{}c", self.os, self.cpu_arch, self.cpu_count)
    }
}

fn normalize_os(raw: &str) -> String {
    match raw {
        "macos" | "darwin" => "macos".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_yields_a_stable_fingerprint() {
        let first = probe();
        let second = probe();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.fingerprint.len(), 16);
    }

    #[test]
    fn tag_encodes_os_arch_and_cores() {
        let profile = probe();
        let tag = profile.tag();
        assert!(tag.contains(&profile.os));
        assert!(tag.ends_with(&format!("{}c", profile.cpu_count)));
    }
}
