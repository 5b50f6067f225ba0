//! Peer-to-peer distribution of large files.
//!
//! A file is split into fixed-size chunks, each chunk is pushed to several
//! peers chosen for capacity, bandwidth, latency and reliability, and the
//! placement is recorded in a replicated directory so any node can later
//! locate, verify and reassemble the file. A periodic maintenance cycle
//! evicts silent peers and restores chunks that fell below their target
//! replication.

pub mod api;
pub mod chunk;
pub mod config;
pub mod directory;
pub mod integrity;
pub mod manager;
pub mod metrics;
pub mod network;
pub mod peer;
pub mod relay;
pub mod selection;

pub use config::Config;
pub use manager::{NetworkManager, NetworkManagerBuilder};
