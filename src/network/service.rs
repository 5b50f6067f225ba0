//! Request handler every peer runs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::error::NetworkError;
use super::store::ChunkStore;
use super::transport::Exchange;
use super::types::{RejectReason, WireMessage, WireResponse};
use crate::directory::{DirectoryReplica, MemoryReplica};
use crate::peer::{Heartbeat, PeerNode, PeerTable};
use crate::relay::RelayEnvelope;

pub struct PeerService {
    descriptor: RwLock<PeerNode>,
    store: Arc<ChunkStore>,
    replica: Arc<MemoryReplica>,
    peers: Arc<PeerTable>,
    /// Outbound link used when forwarding for others
    forwarder: RwLock<Option<Arc<dyn Exchange>>>,
    relayed_for_others: AtomicU64,
}

impl PeerService {
    pub fn new(
        descriptor: PeerNode,
        store: Arc<ChunkStore>,
        replica: Arc<MemoryReplica>,
        peers: Arc<PeerTable>,
    ) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            store,
            replica,
            peers,
            forwarder: RwLock::new(None),
            relayed_for_others: AtomicU64::new(0),
        }
    }

    /// Enable forwarding for relay requests. Only used when the node is relay capable.
    pub fn set_forwarder(&self, forwarder: Arc<dyn Exchange>) {
        *self.forwarder.write() = Some(forwarder);
    }

    /// This node as other peers should see it, with current storage usage.
    pub fn descriptor(&self) -> PeerNode {
        let mut node = self.descriptor.read().clone();
        node.storage_limit = self.store.limit();
        node.used_storage = self.store.used();
        node
    }

    pub fn set_address(&self, address: crate::peer::PeerAddress) {
        self.descriptor.write().address = address;
    }

    pub fn heartbeat(&self) -> Heartbeat {
        let node = self.descriptor();
        Heartbeat {
            peer_id: node.id,
            address: node.address,
            storage_limit: node.storage_limit,
            used_storage: node.used_storage,
            bandwidth_bps: node.bandwidth_bps,
            relay_capable: node.relay_capable,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn relayed_for_others(&self) -> u64 {
        self.relayed_for_others.load(Ordering::Relaxed)
    }

    pub async fn handle(&self, message: WireMessage) -> WireResponse {
        debug!(kind = message.kind(), "Handling request");
        match message {
            WireMessage::StoreChunk(transfer) => {
                let chunk_id = transfer.chunk_id;
                let hash = transfer.hash;
                match self.store.store(transfer) {
                    Ok(_) => WireResponse::Stored { chunk_id, hash },
                    Err(NetworkError::IntegrityMismatch { .. }) => {
                        WireResponse::Rejected(RejectReason::IntegrityMismatch { chunk_id })
                    }
                    Err(NetworkError::ChunkConflict { .. }) => {
                        WireResponse::Rejected(RejectReason::ChunkConflict { chunk_id })
                    }
                    Err(NetworkError::StorageExceeded { needed, available }) => {
                        WireResponse::Rejected(RejectReason::StorageExceeded { needed, available })
                    }
                    Err(e) => WireResponse::Error(e.to_string()),
                }
            }
            WireMessage::FetchChunk { chunk_id } => match self.store.get(&chunk_id) {
                Some(transfer) => WireResponse::Chunk(transfer),
                None => WireResponse::NotFound,
            },
            WireMessage::Directory(message) => match self.replica.handle(message).await {
                Ok(reply) => WireResponse::Directory(reply),
                Err(e) => WireResponse::Error(e.to_string()),
            },
            WireMessage::Heartbeat(heartbeat) => {
                let own = self.heartbeat();
                if heartbeat.peer_id != own.peer_id && self.peers.observe(&heartbeat) {
                    info!(peer = %heartbeat.peer_id, address = %heartbeat.address, "Peer introduced itself");
                }
                WireResponse::Heartbeat(own)
            }
            WireMessage::Ping => WireResponse::Pong(self.descriptor()),
            WireMessage::ListPeers => WireResponse::Peers(self.peers.snapshot()),
            WireMessage::Relay(envelope) => self.relay(envelope).await,
        }
    }

    async fn relay(&self, envelope: RelayEnvelope) -> WireResponse {
        let local = self.descriptor.read().clone();
        if !local.relay_capable {
            return WireResponse::Rejected(RejectReason::NotARelay);
        }
        let RelayEnvelope { mut route, message } = envelope;
        if matches!(*message, WireMessage::Relay(_)) || route.has_visited(&local.id) {
            return WireResponse::Rejected(RejectReason::RelayLoop);
        }
        if route.is_expired() {
            return WireResponse::Rejected(RejectReason::TtlExpired);
        }
        route.add_hop(local.id);

        let Some(forwarder) = self.forwarder.read().clone() else {
            return WireResponse::Rejected(RejectReason::NotARelay);
        };

        match forwarder.exchange(&route.destination, *message).await {
            Ok(response) => {
                self.relayed_for_others.fetch_add(1, Ordering::Relaxed);
                debug!(source = %route.source, destination = %route.destination.id, "Relayed message");
                response
            }
            Err(e) => {
                warn!(destination = %route.destination.id, error = %e, "Relay forward failed");
                WireResponse::Error(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkId, FileId};
    use crate::directory::{DirectoryKey, DirectoryMessage, DirectoryReply};
    use crate::integrity::IntegrityVerifier;
    use crate::network::ChunkTransfer;
    use crate::peer::{PeerAddress, PeerId};
    use bytes::Bytes;

    fn service(limit: u64) -> PeerService {
        service_named("svc", limit)
    }

    fn service_named(name: &str, limit: u64) -> PeerService {
        let id = PeerId::from_name(name);
        PeerService::new(
            PeerNode::new(id, PeerAddress::Memory, limit),
            Arc::new(ChunkStore::new(limit)),
            Arc::new(MemoryReplica::new(id)),
            Arc::new(PeerTable::new()),
        )
    }

    fn transfer(len: usize) -> ChunkTransfer {
        let ciphertext = Bytes::from(vec![3u8; len]);
        ChunkTransfer {
            chunk_id: ChunkId::new(FileId::new(), 0),
            total: 1,
            hash: IntegrityVerifier::calculate_checksum(&ciphertext),
            ciphertext,
            nonce: [0u8; 12],
        }
    }

    #[tokio::test]
    async fn test_store_then_fetch() {
        let svc = service(1000);
        let t = transfer(100);

        match svc.handle(WireMessage::StoreChunk(t.clone())).await {
            WireResponse::Stored { chunk_id, hash } => {
                assert_eq!(chunk_id, t.chunk_id);
                assert_eq!(hash, t.hash);
            }
            other => panic!("unexpected {:?}", other),
        }

        match svc.handle(WireMessage::FetchChunk { chunk_id: t.chunk_id }).await {
            WireResponse::Chunk(fetched) => assert_eq!(fetched, t),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(svc.descriptor().used_storage, 100);
    }

    #[tokio::test]
    async fn test_storage_exceeded_rejected() {
        let svc = service(50);
        let response = svc.handle(WireMessage::StoreChunk(transfer(100))).await;
        assert!(matches!(
            response,
            WireResponse::Rejected(RejectReason::StorageExceeded { needed: 100, available: 50 })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_push_rejected() {
        let svc = service(1000);
        let mut t = transfer(100);
        t.hash = [0u8; 32];
        assert!(matches!(
            svc.handle(WireMessage::StoreChunk(t)).await,
            WireResponse::Rejected(RejectReason::IntegrityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_conflicting_push_rejected() {
        let svc = service(1000);
        let original = transfer(100);
        svc.handle(WireMessage::StoreChunk(original.clone())).await;

        let mut other = original.clone();
        other.ciphertext = Bytes::from(vec![4u8; 100]);
        other.hash = IntegrityVerifier::calculate_checksum(&other.ciphertext);

        assert!(matches!(
            svc.handle(WireMessage::StoreChunk(other)).await,
            WireResponse::Rejected(RejectReason::ChunkConflict { .. })
        ));
        match svc.handle(WireMessage::FetchChunk { chunk_id: original.chunk_id }).await {
            WireResponse::Chunk(fetched) => assert_eq!(fetched, original),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_unknown_chunk() {
        let svc = service(1000);
        let response = svc
            .handle(WireMessage::FetchChunk {
                chunk_id: ChunkId::new(FileId::new(), 3),
            })
            .await;
        assert!(matches!(response, WireResponse::NotFound));
    }

    #[tokio::test]
    async fn test_directory_request_served_by_replica() {
        let svc = service(1000);
        let key = DirectoryKey::File(FileId::new());
        let response = svc
            .handle(WireMessage::Directory(DirectoryMessage::get(key)))
            .await;
        assert!(matches!(
            response,
            WireResponse::Directory(DirectoryReply::Missing { version: 0 })
        ));
    }

    #[tokio::test]
    async fn test_ping_and_heartbeat() {
        let svc = service(1000);
        match svc.handle(WireMessage::Ping).await {
            WireResponse::Pong(node) => assert_eq!(node.id, PeerId::from_name("svc")),
            other => panic!("unexpected {:?}", other),
        }

        let heartbeat = svc.heartbeat();
        match svc.handle(WireMessage::Heartbeat(heartbeat)).await {
            WireResponse::Heartbeat(reply) => assert_eq!(reply.storage_limit, 1000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_from_stranger_registers_it() {
        let svc = service(1000);
        let stranger = service_named("stranger", 500);
        let heartbeat = stranger.heartbeat();

        match svc.handle(WireMessage::Heartbeat(heartbeat)).await {
            WireResponse::Heartbeat(reply) => assert_eq!(reply.peer_id, PeerId::from_name("svc")),
            other => panic!("unexpected {:?}", other),
        }
        let known = svc.peers.get(&PeerId::from_name("stranger")).unwrap();
        assert_eq!(known.storage_limit, 500);

        match svc.handle(WireMessage::ListPeers).await {
            WireResponse::Peers(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].id, PeerId::from_name("stranger"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_own_heartbeat_not_registered() {
        let svc = service(1000);
        svc.handle(WireMessage::Heartbeat(svc.heartbeat())).await;
        assert!(svc.peers.is_empty());
    }

    #[tokio::test]
    async fn test_non_relay_refuses_forwarding() {
        let svc = service(1000);
        let destination = PeerNode::new(PeerId::from_name("dest"), PeerAddress::Memory, 0);
        let envelope = RelayEnvelope {
            route: crate::relay::RouteInfo::new(PeerId::from_name("src"), destination),
            message: Box::new(WireMessage::Ping),
        };
        assert!(matches!(
            svc.handle(WireMessage::Relay(envelope)).await,
            WireResponse::Rejected(RejectReason::NotARelay)
        ));
    }
}
