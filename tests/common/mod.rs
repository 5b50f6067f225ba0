#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use megaswarm::directory::{MemoryReplica, RemoteReplicaFactory, ReplicatedDirectory};
use megaswarm::manager::{KeyRing, NetworkManager};
use megaswarm::network::{ChunkStore, ChunkTransport, PeerService, RetryPolicy, SimFaults, SimNetwork};
use megaswarm::peer::{PeerAddress, PeerId, PeerNode, PeerTable};
use megaswarm::relay::RelayClient;
use megaswarm::Config;

pub const KIB: u64 = 1024;

pub struct TestNode {
    pub id: PeerId,
    pub manager: Arc<NetworkManager>,
    pub faults: Arc<SimFaults>,
}

/// In-process swarm. Node 0 is the origin that distributes files.
pub struct Cluster {
    pub network: Arc<SimNetwork>,
    pub keys: Arc<KeyRing>,
    pub nodes: Vec<TestNode>,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        attempt_timeout: Duration::from_secs(2),
    }
}

pub fn config(name: &str, chunk_size: u64) -> Config {
    Config {
        node_name: name.to_string(),
        chunk_size,
        storage_limit: 64 * 1024 * KIB,
        replication_target: 2,
        encryption_enabled: false,
        max_concurrent_transfers: 4,
        directory_timeout: Duration::from_millis(500),
        peer_timeout: Duration::from_secs(30),
        maintenance_interval: Duration::from_secs(10),
        retry: fast_retry(),
        ..Config::default()
    }
}

/// Deterministic, non-repeating-looking content.
pub fn payload(len: usize) -> Bytes {
    (0..len)
        .map(|i| ((i * 31 + i / 251) % 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            network: SimNetwork::new(),
            keys: Arc::new(KeyRing::new()),
            nodes: Vec::new(),
        }
    }

    /// Origin plus `peers` storage peers, all sharing `make`'s settings.
    pub fn with_peers(peers: usize, make: impl Fn(&str) -> Config) -> Self {
        let mut cluster = Self::new();
        cluster.add(make("origin"));
        for i in 0..peers {
            cluster.add(make(&format!("peer-{i}")));
        }
        cluster.connect_all();
        cluster
    }

    pub fn add(&mut self, config: Config) -> usize {
        self.add_with(config, |node| node)
    }

    /// Add a node whose advertised descriptor is adjusted by `shape`.
    pub fn add_with(&mut self, config: Config, shape: impl FnOnce(PeerNode) -> PeerNode) -> usize {
        let id = PeerId::from_name(&config.node_name);
        let descriptor = shape(
            PeerNode::new(id, PeerAddress::Memory, config.storage_limit)
                .with_relay(config.relay_capable),
        );
        let peers = Arc::new(PeerTable::new());
        let replica = Arc::new(MemoryReplica::new(id));
        let service = Arc::new(PeerService::new(
            descriptor,
            Arc::new(ChunkStore::new(config.storage_limit)),
            replica.clone(),
            peers.clone(),
        ));
        let endpoint = Arc::new(self.network.endpoint(id));
        service.set_forwarder(endpoint.clone());
        let faults = self.network.register(service.clone());

        let directory =
            ReplicatedDirectory::new(replica, config.directory_replication, config.directory_timeout)
                .with_factory(Arc::new(RemoteReplicaFactory::new(endpoint.clone())));
        let mut transport = ChunkTransport::new(endpoint.clone(), config.retry.clone());
        if config.relay_fallback {
            transport = transport.with_relay(Arc::new(RelayClient::new(id, endpoint, peers.clone())));
        }

        let manager = NetworkManager::builder(config)
            .service(service)
            .directory(Arc::new(directory))
            .transport(Arc::new(transport))
            .peers(peers)
            .key_provider(self.keys.clone())
            .build()
            .unwrap();

        self.nodes.push(TestNode {
            id,
            manager: Arc::new(manager),
            faults,
        });
        self.nodes.len() - 1
    }

    /// Every node learns every other node.
    pub fn connect_all(&self) {
        for a in &self.nodes {
            for b in &self.nodes {
                a.manager.add_peer(b.manager.descriptor());
            }
        }
    }

    pub fn origin(&self) -> &TestNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: &PeerId) -> &TestNode {
        self.nodes.iter().find(|n| n.id == *id).unwrap()
    }
}
