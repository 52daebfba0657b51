//! Aggregation - collective snapshot of the mesh
//!
//! Folds the local node and every active peer into one `AggregateSnapshot`.
//! Always recomputed from scratch; the peer sets involved are small.

use super::models::{AggregateSnapshot, LocalNode, NodeView, PeerNode};
use super::phase::Phase;

/// Compute the aggregate over `local` followed by `active` in the given order.
///
/// `total_peers` is the registry size including inactive entries. Modes break
/// ties by first occurrence in iteration order (local node first), which makes
/// the local node win any tie it takes part in.
pub fn aggregate(local: &LocalNode, active: &[PeerNode], total_peers: usize) -> AggregateSnapshot {
    let nodes: Vec<&dyn NodeView> = std::iter::once(local as &dyn NodeView)
        .chain(active.iter().map(|p| p as &dyn NodeView))
        .collect();
    let n = nodes.len() as f64;

    let mean_coherence = clamp_unit(nodes.iter().map(|v| v.coherence()).sum::<f64>() / n);
    let mean_presence = clamp_unit(nodes.iter().map(|v| v.presence()).sum::<f64>() / n);

    let (dominant_phase, phase_count) = mode(nodes.iter().map(|v| v.phase()));
    let (dominant_signature, signature_count) = mode(nodes.iter().map(|v| v.signature()));

    AggregateSnapshot {
        active_peers: active.len(),
        total_peers,
        mean_coherence,
        mean_presence,
        dominant_phase: dominant_phase.unwrap_or(Phase::Inhale),
        dominant_signature: dominant_signature.unwrap_or_default().to_string(),
        phase_synchrony: phase_count as f64 / n,
        signature_coherence: signature_count as f64 / n,
        field_strength: (mean_coherence + mean_presence) / 2.0,
    }
}

/// Most frequent value and its count; ties go to the value seen first
fn mode<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> (Option<T>, usize) {
    // (value, count) in first-seen order
    let mut counts: Vec<(T, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(T, usize)> = None;
    for (value, count) in counts {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((value, count)),
        }
    }
    match best {
        Some((value, count)) => (Some(value), count),
        None => (None, 0),
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::models::Position;
    use tokio::time::Instant;

    fn local(coherence: f64, presence: f64, phase: Phase, signature: &str) -> LocalNode {
        LocalNode {
            node_id: "local".to_string(),
            device_type: "node".to_string(),
            purpose: "test".to_string(),
            phase,
            coherence,
            presence,
            signature: signature.to_string(),
            position: Position::ORIGIN,
            breaths: 0,
        }
    }

    fn peer(id: &str, coherence: f64, presence: f64, phase: Phase, signature: &str) -> PeerNode {
        PeerNode {
            node_id: id.to_string(),
            device_type: "node".to_string(),
            purpose: "test".to_string(),
            phase,
            coherence,
            presence,
            signature: signature.to_string(),
            position: Position::from_node_id(id),
            sent_at: 0.0,
            last_heartbeat: Instant::now(),
            packets: 1,
            active: true,
        }
    }

    #[tokio::test]
    async fn test_empty_peer_set_equals_local() {
        let me = local(0.42, 0.77, Phase::Hold, "sig");
        let snapshot = aggregate(&me, &[], 3);

        assert_eq!(snapshot.mean_coherence, 0.42);
        assert_eq!(snapshot.mean_presence, 0.77);
        assert_eq!(snapshot.dominant_phase, Phase::Hold);
        assert_eq!(snapshot.dominant_signature, "sig");
        assert_eq!(snapshot.phase_synchrony, 1.0);
        assert_eq!(snapshot.active_peers, 0);
        assert_eq!(snapshot.total_peers, 3);
        assert!((snapshot.field_strength - 0.595).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_means_over_local_and_peers() {
        let me = local(0.8, 0.6, Phase::Inhale, "a");
        let peers = vec![
            peer("b", 0.8, 0.6, Phase::Inhale, "a"),
            peer("c", 0.1, 0.3, Phase::Exhale, "b"),
        ];
        let snapshot = aggregate(&me, &peers, 2);

        assert!((snapshot.mean_coherence - 0.5666666666).abs() < 1e-6);
        assert!((snapshot.mean_presence - 0.5).abs() < 1e-12);
        assert_eq!(snapshot.dominant_phase, Phase::Inhale);
        assert!((snapshot.phase_synchrony - 2.0 / 3.0).abs() < 1e-12);
        assert!((snapshot.signature_coherence - 2.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_mode_tie_goes_to_first_seen() {
        let me = local(0.5, 0.5, Phase::Echo, "x");
        let peers = vec![
            peer("b", 0.5, 0.5, Phase::Hold, "y"),
            peer("c", 0.5, 0.5, Phase::Hold, "y"),
            peer("d", 0.5, 0.5, Phase::Echo, "x"),
        ];
        let snapshot = aggregate(&me, &peers, 3);

        // 2 vs 2: local node's values were encountered first
        assert_eq!(snapshot.dominant_phase, Phase::Echo);
        assert_eq!(snapshot.dominant_signature, "x");
        assert_eq!(snapshot.phase_synchrony, 0.5);
    }

    #[tokio::test]
    async fn test_aggregate_stays_in_unit_range() {
        let me = local(1.0, 0.0, Phase::Inhale, "s");
        let peers: Vec<PeerNode> = (0..20)
            .map(|i| {
                let v = (i as f64) / 19.0;
                peer(&format!("p{:02}", i), v, 1.0 - v, Phase::Inhale, "s")
            })
            .collect();
        let snapshot = aggregate(&me, &peers, peers.len());

        assert!((0.0..=1.0).contains(&snapshot.mean_coherence));
        assert!((0.0..=1.0).contains(&snapshot.mean_presence));
        assert!((0.0..=1.0).contains(&snapshot.field_strength));
    }
}
