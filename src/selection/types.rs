use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::peer::{GeoLocation, PeerId, PeerNode};

/// Relative weight of each scoring signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionWeights {
    pub bandwidth: f64,
    pub latency: f64,
    pub reliability: f64,
    /// Zero disables geographic preference.
    pub proximity: f64,
    pub redundancy_debt: f64,
    /// Bandwidth that scores half of the bandwidth weight.
    pub reference_bandwidth_bps: f64,
    /// Latency that scores half of the latency weight.
    pub reference_latency_ms: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            bandwidth: 0.35,
            latency: 0.25,
            reliability: 0.30,
            proximity: 0.0,
            redundancy_debt: 0.5,
            reference_bandwidth_bps: 12_500_000.0,
            reference_latency_ms: 100.0,
        }
    }
}

impl SelectionWeights {
    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            ("bandwidth", self.bandwidth),
            ("latency", self.latency),
            ("reliability", self.reliability),
            ("proximity", self.proximity),
            ("redundancy_debt", self.redundancy_debt),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(format!("selection weight {name} must be a non-negative number"));
            }
        }
        if !(self.reference_bandwidth_bps > 0.0 && self.reference_latency_ms > 0.0) {
            return Err("selection reference values must be positive".to_string());
        }
        Ok(())
    }
}

/// How many chunks of the file being distributed each peer already holds.
#[derive(Debug, Clone, Default)]
pub struct HostLoad {
    counts: HashMap<PeerId, u32>,
}

impl HostLoad {
    pub fn record(&mut self, peer: PeerId) {
        *self.counts.entry(peer).or_insert(0) += 1;
    }

    pub fn release(&mut self, peer: &PeerId) {
        if let Some(count) = self.counts.get_mut(peer) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn count(&self, peer: &PeerId) -> u32 {
        self.counts.get(peer).copied().unwrap_or(0)
    }

    pub fn distinct_hosts(&self) -> usize {
        self.counts.values().filter(|c| **c > 0).count()
    }
}

/// Per-call inputs beyond the peer snapshot.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// Peers that must not be chosen (current hosts, failed hosts, self)
    pub exclude: HashSet<PeerId>,
    pub load: HostLoad,
    pub origin: Option<GeoLocation>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub hosts: Vec<PeerNode>,
    /// Fewer eligible peers than the target
    pub under_replicated: bool,
}

impl Selection {
    pub fn host_ids(&self) -> Vec<PeerId> {
        self.hosts.iter().map(|h| h.id).collect()
    }
}
