pub mod error;
pub mod quic_transport;
pub mod rate_limiter;
pub mod retry;
pub mod service;
pub mod sim;
pub mod store;
pub mod transport;
pub mod types;

pub use error::{NetworkError, NetworkResult};
pub use quic_transport::{QuicStats, QuicTransport};
pub use rate_limiter::TransferRateLimiter;
pub use retry::RetryPolicy;
pub use service::PeerService;
pub use sim::{SimEndpoint, SimFaults, SimNetwork};
pub use store::{ChunkStore, StoreOutcome};
pub use transport::{transfer_rates, ChunkTransport, Exchange, Transport};
pub use types::{
    ChunkTransfer, ConnectionConfig, Delivery, RejectReason, TransferStats, WireMessage,
    WireResponse,
};
