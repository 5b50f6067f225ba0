use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use super::types::{Heartbeat, PeerId, PeerNode};

const RELIABILITY_SMOOTHING: f64 = 0.2;
const LATENCY_SMOOTHING: f64 = 0.3;

/// Live view of known peers. Every mutation is confined to one entry.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: DashMap<PeerId, PeerNode>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, or merge a fresh descriptor into the record we hold.
    /// Reliability and latency are our own measurements and survive the
    /// merge. Returns true if the peer was not known before.
    pub fn upsert(&self, mut node: PeerNode) -> bool {
        let id = node.id;
        match self.peers.entry(id) {
            Entry::Occupied(mut entry) => {
                let known = entry.get_mut();
                known.address = node.address;
                known.storage_limit = node.storage_limit;
                known.used_storage = node.used_storage;
                known.relay_capable = node.relay_capable;
                if node.bandwidth_bps > 0 {
                    known.bandwidth_bps = node.bandwidth_bps;
                }
                if node.location.is_some() {
                    known.location = node.location;
                }
                known.last_heartbeat = Instant::now();
                false
            }
            Entry::Vacant(entry) => {
                node.last_heartbeat = Instant::now();
                entry.insert(node);
                info!(peer = %id, "Peer joined");
                true
            }
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerNode> {
        self.peers.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerNode> {
        self.peers.remove(id).map(|(_, node)| node)
    }

    /// Refresh a known peer from its heartbeat. Unknown peers are ignored.
    pub fn apply_heartbeat(&self, heartbeat: &Heartbeat) -> bool {
        match self.peers.get_mut(&heartbeat.peer_id) {
            Some(mut entry) => {
                entry.address = heartbeat.address.clone();
                entry.storage_limit = heartbeat.storage_limit;
                entry.used_storage = heartbeat.used_storage;
                entry.relay_capable = heartbeat.relay_capable;
                if heartbeat.bandwidth_bps > 0 {
                    entry.bandwidth_bps = heartbeat.bandwidth_bps;
                }
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Apply a heartbeat, registering its sender if it was unknown.
    /// Returns true when the sender is new.
    pub fn observe(&self, heartbeat: &Heartbeat) -> bool {
        if self.apply_heartbeat(heartbeat) {
            return false;
        }
        self.upsert(heartbeat.to_node())
    }

    /// Fold the outcome of one transfer into the peer's reliability and latency.
    pub fn record_outcome(&self, id: &PeerId, success: bool, latency: Option<Duration>) {
        if let Some(mut entry) = self.peers.get_mut(id) {
            let sample = if success { 1.0 } else { 0.0 };
            entry.reliability =
                (1.0 - RELIABILITY_SMOOTHING) * entry.reliability + RELIABILITY_SMOOTHING * sample;
            if let Some(latency) = latency {
                let ms = latency.as_secs_f64() * 1000.0;
                entry.latency_ms = if entry.latency_ms == 0.0 {
                    ms
                } else {
                    (1.0 - LATENCY_SMOOTHING) * entry.latency_ms + LATENCY_SMOOTHING * ms
                };
            }
        }
    }

    /// Account bytes a peer has just accepted, until its next heartbeat corrects the figure.
    pub fn reserve_storage(&self, id: &PeerId, bytes: u64) {
        if let Some(mut entry) = self.peers.get_mut(id) {
            entry.used_storage = entry.used_storage.saturating_add(bytes);
        }
    }

    /// Remove peers silent for longer than `timeout`.
    pub fn evict_stale(&self, timeout: Duration) -> Vec<PeerNode> {
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| now.duration_since(entry.last_heartbeat) > timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            // Re-check under the entry lock so a heartbeat that raced in keeps the peer.
            if let Some((_, node)) = self
                .peers
                .remove_if(&id, |_, node| now.duration_since(node.last_heartbeat) > timeout)
            {
                debug!(peer = %id, "Evicting silent peer");
                evicted.push(node);
            }
        }
        evicted
    }

    /// All peers, ordered by id.
    pub fn snapshot(&self) -> Vec<PeerNode> {
        let mut peers: Vec<PeerNode> = self.peers.iter().map(|entry| entry.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn relays(&self) -> Vec<PeerNode> {
        self.snapshot()
            .into_iter()
            .filter(|node| node.relay_capable)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerAddress;

    fn node(name: &str) -> PeerNode {
        PeerNode::new(PeerId::from_name(name), PeerAddress::Memory, 1000)
    }

    #[test]
    fn test_upsert_and_get() {
        let table = PeerTable::new();
        assert!(table.upsert(node("a")));
        assert!(!table.upsert(node("a")));
        assert_eq!(table.len(), 1);
        assert!(table.get(&PeerId::from_name("a")).is_some());
    }

    #[test]
    fn test_heartbeat_updates_capacity() {
        let table = PeerTable::new();
        table.upsert(node("a"));

        let heartbeat = Heartbeat {
            peer_id: PeerId::from_name("a"),
            address: PeerAddress::Memory,
            storage_limit: 5000,
            used_storage: 1200,
            bandwidth_bps: 10_000,
            relay_capable: true,
            timestamp_ms: 0,
        };
        assert!(table.apply_heartbeat(&heartbeat));

        let peer = table.get(&PeerId::from_name("a")).unwrap();
        assert_eq!(peer.available_storage(), 3800);
        assert!(peer.relay_capable);
        assert_eq!(table.relays().len(), 1);
    }

    #[test]
    fn test_heartbeat_from_unknown_peer_ignored() {
        let table = PeerTable::new();
        let heartbeat = Heartbeat {
            peer_id: PeerId::from_name("ghost"),
            address: PeerAddress::Memory,
            storage_limit: 1,
            used_storage: 0,
            bandwidth_bps: 0,
            relay_capable: false,
            timestamp_ms: 0,
        };
        assert!(!table.apply_heartbeat(&heartbeat));
        assert!(table.is_empty());
    }

    #[test]
    fn test_observe_registers_unknown_sender() {
        let table = PeerTable::new();
        let addr: std::net::SocketAddr = "10.0.0.7:7400".parse().unwrap();
        let heartbeat = Heartbeat {
            peer_id: PeerId::from_name("newcomer"),
            address: PeerAddress::Quic(addr),
            storage_limit: 4000,
            used_storage: 1000,
            bandwidth_bps: 500,
            relay_capable: true,
            timestamp_ms: 0,
        };

        assert!(table.observe(&heartbeat));
        let peer = table.get(&heartbeat.peer_id).unwrap();
        assert_eq!(peer.address, PeerAddress::Quic(addr));
        assert_eq!(peer.available_storage(), 3000);
        assert!(peer.relay_capable);

        assert!(!table.observe(&heartbeat));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upsert_keeps_measurements() {
        let table = PeerTable::new();
        let id = PeerId::from_name("a");
        table.upsert(node("a").with_bandwidth(100));
        table.record_outcome(&id, false, Some(Duration::from_millis(80)));
        let measured = table.get(&id).unwrap();

        let mut fresh = node("a");
        fresh.used_storage = 400;
        assert!(!table.upsert(fresh));

        let peer = table.get(&id).unwrap();
        assert_eq!(peer.reliability, measured.reliability);
        assert!(peer.reliability < 1.0);
        assert_eq!(peer.latency_ms, 80.0);
        assert_eq!(peer.bandwidth_bps, 100);
        assert_eq!(peer.used_storage, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale() {
        let table = PeerTable::new();
        table.upsert(node("old"));
        tokio::time::advance(Duration::from_secs(60)).await;
        table.upsert(node("fresh"));

        let evicted = table.evict_stale(Duration::from_secs(30));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, PeerId::from_name("old"));
        assert!(table.contains(&PeerId::from_name("fresh")));
    }

    #[test]
    fn test_record_outcome_moves_reliability() {
        let table = PeerTable::new();
        table.upsert(node("a"));
        let id = PeerId::from_name("a");

        table.record_outcome(&id, false, None);
        let after_failure = table.get(&id).unwrap().reliability;
        assert!(after_failure < 1.0);

        table.record_outcome(&id, true, Some(Duration::from_millis(40)));
        let peer = table.get(&id).unwrap();
        assert!(peer.reliability > after_failure);
        assert_eq!(peer.latency_ms, 40.0);
    }

    #[test]
    fn test_snapshot_sorted() {
        let table = PeerTable::new();
        for name in ["c", "a", "b", "d"] {
            table.upsert(node(name));
        }
        let ids: Vec<_> = table.snapshot().into_iter().map(|n| n.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
