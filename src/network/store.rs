//! Chunks this node hosts for other peers

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::{NetworkError, NetworkResult};
use super::types::ChunkTransfer;
use crate::chunk::{ChunkId, FileId};
use crate::integrity::IntegrityVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// An identical copy was already held; nothing changed.
    AlreadyPresent,
}

#[derive(Default)]
struct StoreInner {
    chunks: HashMap<ChunkId, ChunkTransfer>,
    used: u64,
}

/// Hosted chunks under a hard byte ceiling. Capacity is checked and
/// reserved under one lock so concurrent pushes cannot overshoot it.
pub struct ChunkStore {
    limit: u64,
    inner: Mutex<StoreInner>,
}

impl ChunkStore {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Verify and keep a pushed chunk. A chunk id never changes content once held.
    pub fn store(&self, transfer: ChunkTransfer) -> NetworkResult<StoreOutcome> {
        if let Err(e) = IntegrityVerifier::verify_payload(transfer.chunk_id, &transfer.hash, &transfer.ciphertext) {
            warn!(chunk = %transfer.chunk_id, error = %e, "Rejecting corrupted chunk");
            return Err(NetworkError::IntegrityMismatch {
                chunk_id: transfer.chunk_id.to_string(),
            });
        }

        let size = transfer.size();
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.chunks.get(&transfer.chunk_id) {
            if existing.hash == transfer.hash {
                return Ok(StoreOutcome::AlreadyPresent);
            }
            warn!(chunk = %transfer.chunk_id, "Rejecting push that would replace a held chunk");
            return Err(NetworkError::ChunkConflict {
                chunk_id: transfer.chunk_id.to_string(),
            });
        }

        if inner.used + size > self.limit {
            let available = self.limit.saturating_sub(inner.used);
            return Err(NetworkError::StorageExceeded {
                needed: size,
                available,
            });
        }

        inner.used += size;
        debug!(chunk = %transfer.chunk_id, size, used = inner.used, "Chunk stored");
        inner.chunks.insert(transfer.chunk_id, transfer);
        Ok(StoreOutcome::Stored)
    }

    pub fn get(&self, chunk_id: &ChunkId) -> Option<ChunkTransfer> {
        self.inner.lock().chunks.get(chunk_id).cloned()
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.inner.lock().chunks.contains_key(chunk_id)
    }

    pub fn remove(&self, chunk_id: &ChunkId) -> Option<ChunkTransfer> {
        let mut inner = self.inner.lock();
        let removed = inner.chunks.remove(chunk_id)?;
        inner.used -= removed.size();
        Some(removed)
    }

    pub fn used(&self) -> u64 {
        self.inner.lock().used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct files with at least one chunk held here.
    pub fn file_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .chunks
            .keys()
            .map(|id| id.file_id)
            .collect::<HashSet<FileId>>()
            .len()
    }
}
