use std::cmp::Ordering;

use tracing::debug;

use super::types::{Selection, SelectionContext, SelectionWeights};
use crate::peer::{GeoLocation, PeerNode};

/// Neutral proximity score for peers without a known location.
const UNKNOWN_PROXIMITY: f64 = 0.5;

/// Ranks peers for hosting and fetching chunks.
#[derive(Debug, Clone, Default)]
pub struct HostSelector {
    weights: SelectionWeights,
}

impl HostSelector {
    pub fn new(weights: SelectionWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &SelectionWeights {
        &self.weights
    }

    /// Score of a peer before any redundancy-debt penalty.
    pub fn base_score(&self, peer: &PeerNode, origin: Option<&GeoLocation>) -> f64 {
        let w = &self.weights;

        let bandwidth = peer.bandwidth_bps as f64;
        let bandwidth_score = bandwidth / (bandwidth + w.reference_bandwidth_bps);

        let latency = peer.latency_ms.max(0.0);
        let latency_score = 1.0 / (1.0 + latency / w.reference_latency_ms);

        let reliability = if peer.reliability.is_finite() {
            peer.reliability.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let proximity = match (origin, peer.location.as_ref()) {
            (Some(origin), Some(location)) => 1.0 / (1.0 + origin.distance_km(location) / 1000.0),
            _ => UNKNOWN_PROXIMITY,
        };

        w.bandwidth * bandwidth_score
            + w.latency * latency_score
            + w.reliability * reliability
            + w.proximity * proximity
    }

    pub fn score(&self, peer: &PeerNode, ctx: &SelectionContext) -> f64 {
        let held = ctx.load.count(&peer.id) as f64;
        let debt = held / (held + 1.0);
        self.base_score(peer, ctx.origin.as_ref()) - self.weights.redundancy_debt * debt
    }

    /// Pick up to `target` distinct hosts with room for `chunk_size` bytes.
    pub fn select(
        &self,
        chunk_size: u64,
        target: usize,
        peers: &[PeerNode],
        ctx: &SelectionContext,
    ) -> Selection {
        let mut scored: Vec<(f64, &PeerNode)> = peers
            .iter()
            .filter(|p| !ctx.exclude.contains(&p.id))
            .filter(|p| p.available_storage() >= chunk_size)
            .map(|p| (self.score(p, ctx), p))
            .collect();

        scored.sort_by(|a, b| by_score_then_id(a.0, a.1, b.0, b.1));
        scored.dedup_by(|a, b| a.1.id == b.1.id);

        let hosts: Vec<PeerNode> = scored
            .into_iter()
            .take(target)
            .map(|(_, p)| p.clone())
            .collect();
        let under_replicated = hosts.len() < target;

        debug!(
            chunk_size,
            target,
            chosen = hosts.len(),
            under_replicated,
            "Hosts selected"
        );

        Selection {
            hosts,
            under_replicated,
        }
    }

    /// Order candidate hosts for fetching, best first.
    pub fn rank(&self, peers: &[PeerNode], origin: Option<&GeoLocation>) -> Vec<PeerNode> {
        let mut scored: Vec<(f64, &PeerNode)> = peers
            .iter()
            .map(|p| (self.base_score(p, origin), p))
            .collect();
        scored.sort_by(|a, b| by_score_then_id(a.0, a.1, b.0, b.1));
        scored.into_iter().map(|(_, p)| p.clone()).collect()
    }
}

fn by_score_then_id(a_score: f64, a: &PeerNode, b_score: f64, b: &PeerNode) -> Ordering {
    b_score.total_cmp(&a_score).then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerAddress, PeerId};

    fn peer(name: &str, storage: u64) -> PeerNode {
        PeerNode::new(PeerId::from_name(name), PeerAddress::Memory, storage)
            .with_bandwidth(10_000_000)
            .with_latency(20.0)
    }

    fn identical_peers(n: usize) -> Vec<PeerNode> {
        (0..n).map(|i| peer(&format!("peer-{i}"), 1 << 30)).collect()
    }

    #[test]
    fn test_storage_is_hard_filter() {
        let selector = HostSelector::default();
        let peers = vec![peer("small", 10), peer("big", 1000)];

        let selection = selector.select(100, 2, &peers, &SelectionContext::default());
        assert_eq!(selection.hosts.len(), 1);
        assert_eq!(selection.hosts[0].id, PeerId::from_name("big"));
        assert!(selection.under_replicated);
    }

    #[test]
    fn test_prefers_faster_and_more_reliable() {
        let selector = HostSelector::default();
        let slow = peer("slow", 1 << 20).with_bandwidth(100_000).with_latency(400.0);
        let flaky = peer("flaky", 1 << 20).with_reliability(0.2);
        let good = peer("good", 1 << 20);

        let selection = selector.select(
            1,
            3,
            &[slow.clone(), flaky.clone(), good.clone()],
            &SelectionContext::default(),
        );
        assert_eq!(selection.hosts[0].id, good.id);
        assert!(!selection.under_replicated);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let selector = HostSelector::default();
        let peers = identical_peers(5);
        let mut ids: Vec<PeerId> = peers.iter().map(|p| p.id).collect();
        ids.sort();

        let selection = selector.select(1, 2, &peers, &SelectionContext::default());
        assert_eq!(selection.host_ids(), ids[..2].to_vec());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let selector = HostSelector::default();
        let mut peers = identical_peers(8);
        let first = selector.select(1, 3, &peers, &SelectionContext::default());

        peers.reverse();
        for _ in 0..10 {
            let again = selector.select(1, 3, &peers, &SelectionContext::default());
            assert_eq!(again.host_ids(), first.host_ids());
        }
    }

    #[test]
    fn test_redundancy_debt_spreads_load() {
        let selector = HostSelector::default();
        let peers = identical_peers(5);
        let mut ctx = SelectionContext::default();

        let mut chosen = Vec::new();
        for _ in 0..3 {
            let selection = selector.select(1, 2, &peers, &ctx);
            for id in selection.host_ids() {
                ctx.load.record(id);
                chosen.push(id);
            }
        }

        assert_eq!(chosen.len(), 6);
        assert_eq!(ctx.load.distinct_hosts(), 5);
    }

    #[test]
    fn test_excluded_peers_skipped() {
        let selector = HostSelector::default();
        let peers = identical_peers(3);
        let mut ctx = SelectionContext::default();
        ctx.exclude.insert(peers[0].id);
        ctx.exclude.insert(peers[1].id);

        let selection = selector.select(1, 2, &peers, &ctx);
        assert_eq!(selection.host_ids(), vec![peers[2].id]);
        assert!(selection.under_replicated);
    }

    #[test]
    fn test_proximity_weight() {
        let weights = SelectionWeights {
            proximity: 1.0,
            ..Default::default()
        };
        let selector = HostSelector::new(weights);
        let here = GeoLocation { lat: 52.52, lon: 13.40 };
        let near = peer("near", 1 << 20).with_location(GeoLocation { lat: 52.0, lon: 13.0 });
        let far = peer("far", 1 << 20).with_location(GeoLocation { lat: -33.9, lon: 151.2 });

        let ctx = SelectionContext {
            origin: Some(here),
            ..Default::default()
        };
        let selection = selector.select(1, 1, &[far, near.clone()], &ctx);
        assert_eq!(selection.hosts[0].id, near.id);
    }

    #[test]
    fn test_rank_orders_by_score() {
        let selector = HostSelector::default();
        let bad = peer("bad", 0).with_reliability(0.1);
        let good = peer("good", 0);
        let ranked = selector.rank(&[bad.clone(), good.clone()], None);
        assert_eq!(ranked[0].id, good.id);
        assert_eq!(ranked[1].id, bad.id);
    }
}
