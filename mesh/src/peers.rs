use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// What the mesh knows about one peer. Owned by the peer table; handed
/// out by value only.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub id: String,
    pub addr: IpAddr,
    pub hw_tag: String,
    pub last_seen: DateTime<Utc>,
    pub capability_ids: Vec<String>,
}

/// Peer registry keyed by node id. Records refresh on any observed
/// activity and are evicted once `last_seen` ages past the timeout.
#[derive(Default)]
pub struct PeerTable {
    inner: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity from a peer. New peers are logged; known peers
    /// just refresh `last_seen` and their address. An empty hardware
    /// tag leaves the previous one in place (only `PING` carries it).
    pub fn observe(&self, id: &str, addr: IpAddr, hw_tag: &str) {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(record) => {
                record.addr = addr;
                record.last_seen = Utc::now();
                if !hw_tag.is_empty() {
                    record.hw_tag = hw_tag.to_string();
                }
            }
            None => {
                info!(peer = %id, %addr, "discovered peer");
                inner.insert(
                    id.to_string(),
                    PeerRecord {
                        id: id.to_string(),
                        addr,
                        hw_tag: hw_tag.to_string(),
                        last_seen: Utc::now(),
                        capability_ids: Vec::new(),
                    },
                );
            }
        }
    }

    /// Remember which capability ids a peer advertises.
    pub fn note_capabilities(&self, id: &str, capability_ids: Vec<String>) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.capability_ids = capability_ids;
        }
    }

    /// Evict every peer silent for longer than `timeout_seconds`.
    /// Returns the evicted ids.
    pub fn sweep(&self, timeout_seconds: i64) -> Vec<String> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .iter()
            .filter(|(_, record)| (now - record.last_seen).num_seconds() > timeout_seconds)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.remove(id);
            info!(peer = %id, "evicted silent peer");
        }
        stale
    }

    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.inner.lock().get(id).cloned()
    }

    /// Snapshot of every live peer, in stable id order.
    pub fn get_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.inner.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn observe_inserts_then_refreshes() {
        let table = PeerTable::new();
        table.observe("peer-a", localhost(), "linux/x64");
        assert_eq!(table.len(), 1);

        let before = table.get("peer-a").unwrap().last_seen;
        table.observe("peer-a", localhost(), "");
        let record = table.get("peer-a").unwrap();
        assert!(record.last_seen >= before);
        assert_eq!(record.hw_tag, "linux/x64");
    }

    #[test]
    fn sweep_evicts_only_stale_peers() {
        let table = PeerTable::new();
        table.observe("fresh", localhost(), "");
        table.observe("stale", localhost(), "");
        {
            let mut inner = table.inner.lock();
            inner.get_mut("stale").unwrap().last_seen = Utc::now() - Duration::seconds(90);
        }

        let evicted = table.sweep(30);
        assert_eq!(evicted, vec!["stale"]);
        assert!(table.get("stale").is_none());
        assert!(table.get("fresh").is_some());
    }

    #[test]
    fn capabilities_attach_to_known_peers_only() {
        let table = PeerTable::new();
        table.note_capabilities("ghost", vec!["plugin.x".to_string()]);
        assert!(table.is_empty());

        table.observe("peer-a", localhost(), "");
        table.note_capabilities("peer-a", vec!["plugin.x".to_string()]);
        assert_eq!(
            table.get("peer-a").unwrap().capability_ids,
            vec!["plugin.x"]
        );
    }

    #[test]
    fn get_peers_is_sorted() {
        let table = PeerTable::new();
        table.observe("b", localhost(), "");
        table.observe("a", localhost(), "");
        let ids: Vec<String> = table.get_peers().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
