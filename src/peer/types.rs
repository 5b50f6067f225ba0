use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Stable 256-bit peer identity. Also the coordinate used for directory proximity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive an identity from a stable node name.
    pub fn from_name(name: &str) -> Self {
        Self(*blake3::hash(name.as_bytes()).as_bytes())
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to a point in the identity space; compare results lexicographically.
    pub fn distance(&self, point: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ point[i];
        }
        out
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &hex::encode(self.0)[..12])
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// How to reach a peer. Each network implementation handles its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerAddress {
    Quic(SocketAddr),
    /// Routed by peer id inside an in-process simulated network.
    Memory,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Quic(addr) => write!(f, "quic://{addr}"),
            PeerAddress::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
}

impl GeoLocation {
    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &GeoLocation) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerNode {
    pub id: PeerId,
    pub address: PeerAddress,
    pub storage_limit: u64,
    pub used_storage: u64,
    pub bandwidth_bps: u64,
    pub latency_ms: f64,
    /// Fraction of recent transfers that succeeded, in [0, 1].
    pub reliability: f64,
    pub location: Option<GeoLocation>,
    pub relay_capable: bool,
    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat: Instant,
}

impl PeerNode {
    pub fn new(id: PeerId, address: PeerAddress, storage_limit: u64) -> Self {
        Self {
            id,
            address,
            storage_limit,
            used_storage: 0,
            bandwidth_bps: 0,
            latency_ms: 0.0,
            reliability: 1.0,
            location: None,
            relay_capable: false,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn with_bandwidth(mut self, bandwidth_bps: u64) -> Self {
        self.bandwidth_bps = bandwidth_bps;
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability.clamp(0.0, 1.0);
        self
    }

    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_relay(mut self, relay_capable: bool) -> Self {
        self.relay_capable = relay_capable;
        self
    }

    pub fn available_storage(&self) -> u64 {
        self.storage_limit.saturating_sub(self.used_storage)
    }
}

/// Liveness and capacity report a peer sends periodically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub peer_id: PeerId,
    /// Where the sender accepts requests, so a receiver that has never
    /// seen it can register it.
    pub address: PeerAddress,
    pub storage_limit: u64,
    pub used_storage: u64,
    pub bandwidth_bps: u64,
    pub relay_capable: bool,
    pub timestamp_ms: i64,
}

impl Heartbeat {
    /// A fresh peer record for a sender seen for the first time.
    pub fn to_node(&self) -> PeerNode {
        let mut node = PeerNode::new(self.peer_id, self.address.clone(), self.storage_limit)
            .with_bandwidth(self.bandwidth_bps)
            .with_relay(self.relay_capable);
        node.used_storage = self.used_storage;
        node
    }
}
