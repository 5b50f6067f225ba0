use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkId, ContentHash, FileId, FileManifest};
use crate::peer::{PeerId, PeerNode};

/// The three directory namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DirectoryKey {
    Peer(PeerId),
    File(FileId),
    Chunk(ChunkId),
}

impl DirectoryKey {
    /// Position of the key in the peer identity space.
    pub fn routing_id(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        match self {
            DirectoryKey::Peer(id) => {
                hasher.update(b"peer:");
                hasher.update(id.as_bytes());
            }
            DirectoryKey::File(id) => {
                hasher.update(b"file:");
                hasher.update(id.as_uuid().as_bytes());
            }
            DirectoryKey::Chunk(id) => {
                hasher.update(b"chunk:");
                hasher.update(id.file_id.as_uuid().as_bytes());
                hasher.update(&id.index.to_be_bytes());
            }
        }
        *hasher.finalize().as_bytes()
    }
}

impl fmt::Display for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryKey::Peer(id) => write!(f, "peer/{id}"),
            DirectoryKey::File(id) => write!(f, "file/{id}"),
            DirectoryKey::Chunk(id) => write!(f, "chunk/{id}"),
        }
    }
}

/// Hosting metadata for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    pub hash: ContentHash,
    /// Ciphertext size in bytes
    pub size: u64,
    pub hosts: BTreeSet<PeerId>,
    pub replication_target: u32,
}

impl ChunkRecord {
    pub fn file_id(&self) -> FileId {
        self.chunk_id.file_id
    }

    pub fn index(&self) -> u32 {
        self.chunk_id.index
    }

    pub fn is_under_replicated(&self) -> bool {
        (self.hosts.len() as u32) < self.replication_target
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirectoryValue {
    Peer(PeerNode),
    File(FileManifest),
    Chunk(ChunkRecord),
}

impl DirectoryValue {
    pub fn kind(&self) -> &'static str {
        match self {
            DirectoryValue::Peer(_) => "peer",
            DirectoryValue::File(_) => "file",
            DirectoryValue::Chunk(_) => "chunk",
        }
    }
}

/// A value tagged with its write version. Higher versions win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub value: DirectoryValue,
}

impl Versioned {
    /// Content digest, used to tell apart two writes that carry the same version.
    pub fn digest(&self) -> [u8; 32] {
        let encoded = bincode::serialize(&self.value).unwrap_or_default();
        *blake3::hash(&encoded).as_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryOp {
    Put,
    Get,
    Delete { version: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryMessage {
    pub op: DirectoryOp,
    pub key: DirectoryKey,
    pub value: Option<Versioned>,
    /// Time-to-live for the stored value, in milliseconds
    pub ttl_ms: Option<u64>,
}

impl DirectoryMessage {
    pub fn get(key: DirectoryKey) -> Self {
        Self {
            op: DirectoryOp::Get,
            key,
            value: None,
            ttl_ms: None,
        }
    }

    pub fn put(key: DirectoryKey, value: Versioned, ttl_ms: Option<u64>) -> Self {
        Self {
            op: DirectoryOp::Put,
            key,
            value: Some(value),
            ttl_ms,
        }
    }

    pub fn delete(key: DirectoryKey, version: u64) -> Self {
        Self {
            op: DirectoryOp::Delete { version },
            key,
            value: None,
            ttl_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirectoryReply {
    /// The replica now holds `version` (its own, if it already had something newer).
    Stored { version: u64 },
    Found(Versioned),
    /// Nothing live under the key; `version` is the tombstone or expired version, 0 if never written.
    Missing { version: u64 },
    Deleted { version: u64 },
}

impl DirectoryReply {
    pub fn version(&self) -> u64 {
        match self {
            DirectoryReply::Stored { version }
            | DirectoryReply::Missing { version }
            | DirectoryReply::Deleted { version } => *version,
            DirectoryReply::Found(v) => v.version,
        }
    }
}
