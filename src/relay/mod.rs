//! Relay fallback
//!
//! Peers that cannot reach each other directly (NAT traversal failure)
//! exchange messages through a relay-capable peer. A relay forwards a
//! message exactly one hop; relaying through a relay is refused.

pub mod client;
pub mod types;

pub use client::{Relay, RelayClient};
pub use types::{RelayEnvelope, RelayStats, RouteInfo, DEFAULT_RELAY_TTL};
