//! Drift detection
//!
//! Compares every active peer against the aggregate along four dimensions.
//! Drift is diagnostic only: it never triggers remediation, it is counted per
//! peer and kept in a bounded ring buffer for observers.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use super::models::{
    emit, unix_now, AggregateSnapshot, DriftDimension, DriftEvent, EventSender, MeshEvent, NodeId,
    PeerNode,
};
use crate::config::DriftConfig;

pub struct DriftDetector {
    coherence_threshold: f64,
    presence_threshold: f64,
    capacity: usize,
    history: VecDeque<DriftEvent>,
    scores: HashMap<NodeId, u64>,
    events: EventSender,
}

impl DriftDetector {
    pub fn new(config: &DriftConfig, events: EventSender) -> Self {
        Self {
            coherence_threshold: config.coherence_threshold,
            presence_threshold: config.presence_threshold,
            capacity: config.history_size.max(1),
            history: VecDeque::with_capacity(config.history_size.max(1)),
            scores: HashMap::new(),
            events,
        }
    }

    /// Check `peers` against `snapshot` and return the drifts found this pass
    pub fn detect(&mut self, peers: &[PeerNode], snapshot: &AggregateSnapshot) -> Vec<DriftEvent> {
        let now = unix_now();
        let mut found = Vec::new();

        for peer in peers {
            let numeric = [
                (
                    DriftDimension::Coherence,
                    (peer.coherence - snapshot.mean_coherence).abs(),
                    self.coherence_threshold,
                ),
                (
                    DriftDimension::Presence,
                    (peer.presence - snapshot.mean_presence).abs(),
                    self.presence_threshold,
                ),
            ];
            for (dimension, magnitude, threshold) in numeric {
                if magnitude > threshold {
                    found.push(DriftEvent {
                        node_id: peer.node_id.clone(),
                        dimension,
                        magnitude,
                        threshold,
                        timestamp: now,
                    });
                }
            }

            let categorical = [
                (DriftDimension::Phase, peer.phase != snapshot.dominant_phase),
                (
                    DriftDimension::Signature,
                    peer.signature != snapshot.dominant_signature,
                ),
            ];
            for (dimension, differs) in categorical {
                if differs {
                    found.push(DriftEvent {
                        node_id: peer.node_id.clone(),
                        dimension,
                        magnitude: 1.0,
                        threshold: 0.0,
                        timestamp: now,
                    });
                }
            }
        }

        // Forget scores of peers that are gone
        let present: HashSet<&str> = peers.iter().map(|p| p.node_id.as_str()).collect();
        self.scores.retain(|id, _| present.contains(id.as_str()));

        for event in &found {
            *self.scores.entry(event.node_id.clone()).or_insert(0) += 1;
            debug!(
                node_id = %event.node_id,
                dimension = ?event.dimension,
                magnitude = event.magnitude,
                threshold = event.threshold,
                "Peer drift"
            );
            self.history.push_back(event.clone());
            while self.history.len() > self.capacity {
                self.history.pop_front();
            }
            emit(&self.events, MeshEvent::Drift(event.clone()));
        }

        found
    }

    /// Cumulative drift count of a peer
    pub fn drift_score(&self, node_id: &str) -> u64 {
        self.scores.get(node_id).copied().unwrap_or(0)
    }

    /// Most recent drift events, newest first
    pub fn recent(&self, count: usize) -> Vec<DriftEvent> {
        self.history.iter().rev().take(count).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::models::Position;
    use crate::mesh::phase::Phase;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    fn snapshot() -> AggregateSnapshot {
        AggregateSnapshot {
            active_peers: 2,
            total_peers: 2,
            mean_coherence: 0.6,
            mean_presence: 0.6,
            dominant_phase: Phase::Hold,
            dominant_signature: "s".to_string(),
            phase_synchrony: 1.0,
            signature_coherence: 1.0,
            field_strength: 0.6,
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
            position: Position::ORIGIN,
            sent_at: 0.0,
            last_heartbeat: Instant::now(),
            packets: 1,
            active: true,
        }
    }

    fn detector(history: usize) -> DriftDetector {
        let (events, _) = broadcast::channel(16);
        DriftDetector::new(
            &DriftConfig {
                history_size: history,
                ..Default::default()
            },
            events,
        )
    }

    #[tokio::test]
    async fn test_numeric_drift_uses_strict_threshold() {
        let mut detector = detector(100);
        let peers = vec![
            peer("near", 0.7, 0.75, Phase::Hold, "s"),
            peer("far", 0.3, 0.95, Phase::Hold, "s"),
        ];
        let found = detector.detect(&peers, &snapshot());

        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|e| e.node_id == "far"));
        assert!(found.iter().any(|e| e.dimension == DriftDimension::Coherence));
        assert!(found.iter().any(|e| e.dimension == DriftDimension::Presence));
        assert_eq!(detector.drift_score("near"), 0);
        assert_eq!(detector.drift_score("far"), 2);
    }

    #[tokio::test]
    async fn test_categorical_drift() {
        let mut detector = detector(100);
        let peers = vec![peer("p", 0.6, 0.6, Phase::Echo, "other")];
        let found = detector.detect(&peers, &snapshot());

        let dims: Vec<DriftDimension> = found.iter().map(|e| e.dimension).collect();
        assert_eq!(dims, vec![DriftDimension::Phase, DriftDimension::Signature]);
        assert!(found.iter().all(|e| e.magnitude == 1.0));
    }

    #[tokio::test]
    async fn test_scores_accumulate_and_prune() {
        let mut detector = detector(100);
        let drifting = vec![peer("p", 0.0, 0.6, Phase::Hold, "s")];
        detector.detect(&drifting, &snapshot());
        detector.detect(&drifting, &snapshot());
        assert_eq!(detector.drift_score("p"), 2);

        detector.detect(&[], &snapshot());
        assert_eq!(detector.drift_score("p"), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut detector = detector(5);
        let peers = vec![peer("p", 0.0, 0.0, Phase::Echo, "x")];
        for _ in 0..3 {
            detector.detect(&peers, &snapshot());
        }
        assert_eq!(detector.history_len(), 5);
        assert_eq!(detector.recent(2).len(), 2);
    }
}
