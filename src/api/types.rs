use serde::{Deserialize, Serialize};

use crate::manager::{ChunkDistribution, DistributionResult, MaintenanceReport, NetworkStats};
use crate::peer::PeerNode;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitQuery {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub index: u32,
    pub size: u64,
    pub hosts: Vec<String>,
    pub under_replicated: bool,
    /// Errors from attempts that did not end on a host
    pub failures: Vec<String>,
}

impl From<&ChunkDistribution> for ChunkSummary {
    fn from(chunk: &ChunkDistribution) -> Self {
        Self {
            index: chunk.index,
            size: chunk.size,
            hosts: chunk.hosts.iter().map(|h| h.to_string()).collect(),
            under_replicated: chunk.under_replicated,
            failures: chunk
                .attempts
                .iter()
                .filter_map(|a| a.error.clone())
                .chain(chunk.error.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionResponse {
    /// Identifier to hand to whoever should retrieve the file
    pub file_id: String,
    pub name: String,
    pub total_size: u64,
    pub success: bool,
    pub total_chunks: u32,
    pub hosted_chunks: u32,
    /// Sum of per-chunk host counts
    pub total_hosts: usize,
    pub distinct_hosts: usize,
    pub under_replicated_chunks: u32,
    pub chunks: Vec<ChunkSummary>,
}

impl From<&DistributionResult> for DistributionResponse {
    fn from(result: &DistributionResult) -> Self {
        Self {
            file_id: result.file_id.to_string(),
            name: result.name.clone(),
            total_size: result.total_size,
            success: result.success,
            total_chunks: result.total_chunks,
            hosted_chunks: result.hosted_chunks,
            total_hosts: result.total_hosts,
            distinct_hosts: result.distinct_hosts,
            under_replicated_chunks: result.under_replicated_chunks,
            chunks: result.chunks.iter().map(ChunkSummary::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub address: String,
    pub available_storage: u64,
    pub bandwidth_bps: u64,
    pub latency_ms: f64,
    pub reliability: f64,
    pub relay_capable: bool,
}

impl From<&PeerNode> for PeerSummary {
    fn from(node: &PeerNode) -> Self {
        Self {
            id: node.id.to_string(),
            address: node.address.to_string(),
            available_storage: node.available_storage(),
            bandwidth_bps: node.bandwidth_bps,
            latency_ms: node.latency_ms,
            reliability: node.reliability,
            relay_capable: node.relay_capable,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceResponse {
    pub peers_contacted: usize,
    pub peers_responded: usize,
    pub discovered: Vec<String>,
    pub evicted: Vec<String>,
    pub chunks_checked: usize,
    pub under_replicated: usize,
    pub healed: usize,
    pub unhealed: usize,
    pub stats: NetworkStats,
}

impl From<MaintenanceReport> for MaintenanceResponse {
    fn from(report: MaintenanceReport) -> Self {
        Self {
            peers_contacted: report.peers_contacted,
            peers_responded: report.peers_responded,
            discovered: report.discovered.iter().map(|p| p.to_string()).collect(),
            evicted: report.evicted.iter().map(|p| p.to_string()).collect(),
            chunks_checked: report.chunks_checked,
            under_replicated: report.under_replicated,
            healed: report.healed,
            unhealed: report.unhealed,
            stats: report.stats,
        }
    }
}
