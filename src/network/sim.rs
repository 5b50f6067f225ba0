//! In-process network for deterministic multi-peer runs
//!
//! Every registered peer runs a real `PeerService`; requests are handed to
//! it directly. Faults are injected per peer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use super::error::{NetworkError, NetworkResult};
use super::service::PeerService;
use super::transport::Exchange;
use super::types::{WireMessage, WireResponse};
use crate::peer::{PeerId, PeerNode};

/// Knobs for one simulated peer.
#[derive(Debug, Default)]
pub struct SimFaults {
    offline: AtomicBool,
    behind_nat: AtomicBool,
    corrupt_fetches: AtomicBool,
    transient_failures: AtomicU32,
    latency_ms: AtomicU64,
}

impl SimFaults {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Only relay-capable peers can open connections to this peer.
    pub fn set_behind_nat(&self, behind_nat: bool) {
        self.behind_nat.store(behind_nat, Ordering::SeqCst);
    }

    /// Flip one byte of every chunk this peer serves.
    pub fn set_corrupt_fetches(&self, corrupt: bool) {
        self.corrupt_fetches.store(corrupt, Ordering::SeqCst);
    }

    /// Time out the next `count` requests.
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct SimNode {
    service: Arc<PeerService>,
    faults: Arc<SimFaults>,
    relay_capable: bool,
}

#[derive(Default)]
pub struct SimNetwork {
    nodes: DashMap<PeerId, SimNode>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, service: Arc<PeerService>) -> Arc<SimFaults> {
        let descriptor = service.descriptor();
        let faults = Arc::new(SimFaults::default());
        self.nodes.insert(
            descriptor.id,
            SimNode {
                service,
                faults: faults.clone(),
                relay_capable: descriptor.relay_capable,
            },
        );
        faults
    }

    pub fn unregister(&self, id: &PeerId) {
        self.nodes.remove(id);
    }

    pub fn faults(&self, id: &PeerId) -> Option<Arc<SimFaults>> {
        self.nodes.get(id).map(|n| n.faults.clone())
    }

    /// The exchange a given peer uses to talk to the others.
    pub fn endpoint(self: &Arc<Self>, local: PeerId) -> SimEndpoint {
        SimEndpoint {
            network: Arc::downgrade(self),
            local,
        }
    }

    async fn deliver(&self, source: PeerId, target: &PeerNode, message: WireMessage) -> NetworkResult<WireResponse> {
        let unreachable = |reason: &str| NetworkError::Unreachable {
            peer: target.id.to_string(),
            reason: reason.to_string(),
        };

        let (service, faults) = match self.nodes.get(&target.id) {
            Some(node) => (node.service.clone(), node.faults.clone()),
            None => return Err(unreachable("unknown peer")),
        };
        let source_is_relay = self
            .nodes
            .get(&source)
            .map(|n| n.relay_capable)
            .unwrap_or(false);

        if faults.offline.load(Ordering::SeqCst) {
            return Err(unreachable("offline"));
        }
        if faults.behind_nat.load(Ordering::SeqCst) && !source_is_relay {
            return Err(unreachable("behind NAT"));
        }
        if faults.take_transient_failure() {
            return Err(NetworkError::Timeout(Duration::from_millis(
                faults.latency_ms.load(Ordering::SeqCst),
            )));
        }

        let latency = faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        trace!(from = %source, to = %target.id, kind = message.kind(), "Sim exchange");
        let mut response = service.handle(message).await;

        if faults.corrupt_fetches.load(Ordering::SeqCst) {
            if let WireResponse::Chunk(transfer) = &mut response {
                let mut bytes = transfer.ciphertext.to_vec();
                match bytes.first_mut() {
                    Some(first) => *first ^= 0xff,
                    None => bytes.push(0xff),
                }
                transfer.ciphertext = Bytes::from(bytes);
            }
        }

        Ok(response)
    }
}

/// One peer's handle onto the simulated network.
#[derive(Clone)]
pub struct SimEndpoint {
    network: Weak<SimNetwork>,
    local: PeerId,
}

#[async_trait]
impl Exchange for SimEndpoint {
    async fn exchange(&self, target: &PeerNode, message: WireMessage) -> NetworkResult<WireResponse> {
        let Some(network) = self.network.upgrade() else {
            return Err(NetworkError::Unreachable {
                peer: target.id.to_string(),
                reason: "network shut down".into(),
            });
        };
        network.deliver(self.local, target, message).await
    }
}
