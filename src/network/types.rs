use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkId, ContentHash, FileId};
use crate::directory::{DirectoryMessage, DirectoryReply};
use crate::peer::{Heartbeat, PeerId, PeerNode};
use crate::relay::RelayEnvelope;

/// A chunk as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTransfer {
    pub chunk_id: ChunkId,
    pub total: u32,
    pub ciphertext: Bytes,
    pub hash: ContentHash,
    pub nonce: [u8; 12],
}

impl ChunkTransfer {
    pub fn file_id(&self) -> FileId {
        self.chunk_id.file_id
    }

    pub fn index(&self) -> u32 {
        self.chunk_id.index
    }

    pub fn size(&self) -> u64 {
        self.ciphertext.len() as u64
    }
}

impl From<&Chunk> for ChunkTransfer {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id,
            total: chunk.total_chunks,
            ciphertext: chunk.ciphertext.clone(),
            hash: chunk.hash,
            nonce: chunk.nonce,
        }
    }
}

/// Requests a peer service understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    StoreChunk(ChunkTransfer),
    FetchChunk { chunk_id: ChunkId },
    Directory(DirectoryMessage),
    Heartbeat(Heartbeat),
    /// Ask a peer to describe itself.
    Ping,
    /// Ask a peer for every peer it knows.
    ListPeers,
    Relay(RelayEnvelope),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::StoreChunk(_) => "store",
            WireMessage::FetchChunk { .. } => "fetch",
            WireMessage::Directory(_) => "directory",
            WireMessage::Heartbeat(_) => "heartbeat",
            WireMessage::Ping => "ping",
            WireMessage::ListPeers => "list_peers",
            WireMessage::Relay(_) => "relay",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireResponse {
    /// The receiver recomputed the hash and it matched.
    Stored { chunk_id: ChunkId, hash: ContentHash },
    Chunk(ChunkTransfer),
    Directory(DirectoryReply),
    Heartbeat(Heartbeat),
    Pong(PeerNode),
    Peers(Vec<PeerNode>),
    NotFound,
    Rejected(RejectReason),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    IntegrityMismatch { chunk_id: ChunkId },
    /// The id is already held with a different hash.
    ChunkConflict { chunk_id: ChunkId },
    StorageExceeded { needed: u64, available: u64 },
    NotARelay,
    RelayLoop,
    TtlExpired,
}

/// Outcome of a successful chunk push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub peer: PeerId,
    pub relayed: bool,
    pub attempts: u32,
    pub latency: Duration,
}

/// Counters kept by a transport. Rates are derived from these over time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub chunks_sent: u64,
    pub chunks_fetched: u64,
    pub relayed: u64,
    pub retries: u64,
    pub failures: u64,
    pub integrity_failures: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub bind_addr: SocketAddr,
    pub max_idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub max_concurrent_streams: u32,
    /// Largest frame accepted from a peer.
    pub max_message_size: usize,
    /// Skip TLS verification of peer certificates (self-signed overlays)
    pub insecure_skip_verify: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_idle_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(5),
            max_concurrent_streams: 100,
            max_message_size: 256 * 1024 * 1024,
            insecure_skip_verify: true,
        }
    }
}
