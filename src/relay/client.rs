//! Delivery through relay-capable peers when a destination cannot be reached directly

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::types::{RelayEnvelope, RelayStats, RouteInfo};
use crate::network::{Exchange, NetworkError, NetworkResult, RejectReason, WireMessage, WireResponse};
use crate::peer::{PeerId, PeerNode, PeerTable};

#[async_trait]
pub trait Relay: Send + Sync {
    /// Deliver `message` to `destination` through an intermediary and return its answer.
    async fn forward(&self, destination: &PeerNode, message: WireMessage) -> NetworkResult<WireResponse>;

    fn stats(&self) -> RelayStats;
}

#[derive(Default)]
struct RelayCounters {
    requested: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Picks relay-capable peers from the live peer table, in table order.
pub struct RelayClient<E> {
    local_id: PeerId,
    exchange: Arc<E>,
    peers: Arc<PeerTable>,
    counters: RelayCounters,
}

impl<E: Exchange> RelayClient<E> {
    pub fn new(local_id: PeerId, exchange: Arc<E>, peers: Arc<PeerTable>) -> Self {
        Self {
            local_id,
            exchange,
            peers,
            counters: RelayCounters::default(),
        }
    }
}

#[async_trait]
impl<E: Exchange> Relay for RelayClient<E> {
    async fn forward(&self, destination: &PeerNode, message: WireMessage) -> NetworkResult<WireResponse> {
        if matches!(message, WireMessage::Relay(_)) {
            return Err(NetworkError::Rejected("nested relay".into()));
        }

        let relays: Vec<PeerNode> = self
            .peers
            .relays()
            .into_iter()
            .filter(|r| r.id != destination.id && r.id != self.local_id)
            .collect();
        if relays.is_empty() {
            return Err(NetworkError::RelayUnavailable(
                "no relay-capable peers known".into(),
            ));
        }

        self.counters.requested.fetch_add(1, Ordering::Relaxed);
        let mut last_error = String::from("no relay answered");

        for relay in relays {
            let envelope = RelayEnvelope {
                route: RouteInfo::new(self.local_id, destination.clone()),
                message: Box::new(message.clone()),
            };

            match self.exchange.exchange(&relay, WireMessage::Relay(envelope)).await {
                Ok(WireResponse::Error(e)) => {
                    debug!(relay = %relay.id, destination = %destination.id, error = %e, "Relay could not deliver");
                    last_error = e;
                }
                Ok(WireResponse::Rejected(
                    reason @ (RejectReason::NotARelay | RejectReason::RelayLoop | RejectReason::TtlExpired),
                )) => {
                    debug!(relay = %relay.id, ?reason, "Relay refused message");
                    last_error = format!("{reason:?}");
                }
                Ok(response) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(relay = %relay.id, destination = %destination.id, "Delivered via relay");
                    return Ok(response);
                }
                Err(e) => {
                    debug!(relay = %relay.id, error = %e, "Relay unreachable");
                    last_error = e.to_string();
                }
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(destination = %destination.id, error = %last_error, "All relays failed");
        Err(NetworkError::RelayUnavailable(last_error))
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            requested: self.counters.requested.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
