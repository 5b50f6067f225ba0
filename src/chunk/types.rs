use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ChunkError;

/// BLAKE3 digest of a chunk's ciphertext.
pub type ContentHash = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(FileId)
            .map_err(|e| ChunkError::InvalidFileId(format!("{s}: {e}")))
    }
}

/// Identity of a chunk, unique per (file, index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub file_id: FileId,
    pub index: u32,
}

impl ChunkId {
    pub fn new(file_id: FileId, index: u32) -> Self {
        Self { file_id, index }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.file_id, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub total_chunks: u32,
    pub plaintext_size: u64,
    pub nonce: [u8; 12],
    pub hash: ContentHash,
    pub ciphertext: Bytes,
}

impl Chunk {
    pub fn file_id(&self) -> FileId {
        self.id.file_id
    }

    pub fn index(&self) -> u32 {
        self.id.index
    }

    /// Size on the wire and on a hosting peer's disk.
    pub fn stored_size(&self) -> u64 {
        self.ciphertext.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: FileId,
    pub name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_ids: Vec<ChunkId>,
    pub chunk_hashes: Vec<ContentHash>,
    pub encrypted: bool,
    pub created_at: i64,
}

impl FileManifest {
    pub fn total_chunks(&self) -> u32 {
        self.chunk_ids.len() as u32
    }

    /// Plaintext length of the chunk at `index`.
    pub fn expected_plaintext_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size;
        self.total_size.saturating_sub(start).min(self.chunk_size)
    }
}
