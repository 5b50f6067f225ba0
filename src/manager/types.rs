use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::chunk::{ChunkId, FileId};
use crate::peer::PeerId;

/// Lifecycle of pushing one chunk to one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostingState {
    Pending,
    Sent,
    /// The host replied that it stored the chunk.
    Acknowledged,
    /// The hash the host recomputed matched ours.
    Verified,
    /// Retries exhausted or the host rejected the chunk.
    Failed,
    /// A substitute host was chosen for a failed attempt.
    Replaced,
}

impl HostingState {
    /// The chunk reached the host and stays there even if the operation is cancelled.
    pub fn is_durable(&self) -> bool {
        matches!(self, HostingState::Acknowledged | HostingState::Verified)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostOutcome {
    pub peer: PeerId,
    pub state: HostingState,
    pub relayed: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-chunk detail of a distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkDistribution {
    pub chunk_id: ChunkId,
    pub index: u32,
    pub size: u64,
    /// Hosts that verified the chunk
    pub hosts: Vec<PeerId>,
    pub attempts: Vec<HostOutcome>,
    pub under_replicated: bool,
    /// Placed but the directory did not take the host list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkDistribution {
    pub fn is_hosted(&self) -> bool {
        !self.hosts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionResult {
    pub file_id: FileId,
    pub name: String,
    pub total_size: u64,
    /// Every chunk reached at least one host.
    pub success: bool,
    pub total_chunks: u32,
    pub hosted_chunks: u32,
    /// Sum of per-chunk host counts, so a peer holding two chunks counts twice
    pub total_hosts: usize,
    /// Distinct peers holding at least one chunk of the file
    pub distinct_hosts: usize,
    pub under_replicated_chunks: u32,
    pub cancelled: bool,
    pub chunks: Vec<ChunkDistribution>,
}

impl DistributionResult {
    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkDistribution> {
        self.chunks.iter().filter(|c| !c.is_hosted())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub peer_count: usize,
    pub hosted_file_count: usize,
    pub used_storage: u64,
    pub storage_limit: u64,
    /// Bytes per second, measured over the last maintenance interval
    pub upload_rate: f64,
    pub download_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub peers_contacted: usize,
    pub peers_responded: usize,
    /// Peers learned this cycle from other peers' lists
    pub discovered: Vec<PeerId>,
    pub evicted: Vec<PeerId>,
    pub chunks_checked: usize,
    pub under_replicated: usize,
    /// Replicas added to under-replicated chunks
    pub healed: usize,
    /// Chunks still below target after this cycle
    pub unhealed: usize,
    pub stats: NetworkStats,
}

/// One file this node distributed, as seen from the directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostingStatus {
    pub file_id: FileId,
    pub name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    /// Chunks with at least one live host
    pub available_chunks: u32,
    pub replication_target: u32,
}

impl HostingStatus {
    pub fn is_fully_available(&self) -> bool {
        self.available_chunks == self.total_chunks
    }
}

/// Cooperative cancellation for one distribution or retrieval.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so the wait only ends on cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(10), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_durable_states() {
        assert!(HostingState::Verified.is_durable());
        assert!(HostingState::Acknowledged.is_durable());
        assert!(!HostingState::Sent.is_durable());
        assert!(!HostingState::Failed.is_durable());
    }
}
