//! Relay routing types

use serde::{Deserialize, Serialize};

use crate::network::WireMessage;
use crate::peer::{PeerId, PeerNode};

/// Default hop budget for a relayed message.
pub const DEFAULT_RELAY_TTL: u8 = 4;

/// Routing information for a relayed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Originating peer
    pub source: PeerId,

    /// Final destination, with the address the relay should use
    pub destination: PeerNode,

    /// Relays this message has passed through
    pub hops: Vec<PeerId>,

    /// Time-to-live in hops
    pub ttl: u8,
}

impl RouteInfo {
    pub fn new(source: PeerId, destination: PeerNode) -> Self {
        Self {
            source,
            destination,
            hops: Vec::new(),
            ttl: DEFAULT_RELAY_TTL,
        }
    }

    /// Add a hop to the route
    pub fn add_hop(&mut self, node_id: PeerId) {
        self.hops.push(node_id);
        if self.ttl > 0 {
            self.ttl -= 1;
        }
    }

    /// Check if TTL is exhausted
    pub fn is_expired(&self) -> bool {
        self.ttl == 0
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn has_visited(&self, node_id: &PeerId) -> bool {
        self.hops.contains(node_id)
    }
}

/// A message wrapped for delivery through a relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub route: RouteInfo,
    pub message: Box<WireMessage>,
}

/// Statistics for relayed traffic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Messages this node asked a relay to deliver
    pub requested: u64,

    /// Of those, delivered
    pub delivered: u64,

    /// Relay attempts that failed (relay down, destination unreachable)
    pub failed: u64,
}

impl RelayStats {
    /// Delivery success rate in percent
    pub fn success_rate(&self) -> f64 {
        if self.requested == 0 {
            return 100.0;
        }
        self.delivered as f64 / self.requested as f64 * 100.0
    }
}

impl std::fmt::Display for RelayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Relay: {} requested, {} delivered, {} failed ({:.1}% success)",
            self.requested,
            self.delivered,
            self.failed,
            self.success_rate()
        )
    }
}
