//! Mesh models - shared types for the coherence mesh
//!
//! Node records, derived snapshots, collapse/drift records and the event
//! stream that external observers subscribe to.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::f64::consts::TAU;
use std::fmt;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::patterns::PatternKind;
use super::phase::Phase;

/// Unique identifier for a node in the mesh
pub type NodeId = String;

/// Sender side of the mesh event stream
pub type EventSender = broadcast::Sender<MeshEvent>;

/// Capacity of the event stream; slow subscribers lag instead of blocking
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Publish an event. Having no subscriber is not an error.
pub(crate) fn emit(events: &EventSender, event: MeshEvent) {
    let _ = events.send(event);
}

/// Seconds since the unix epoch as a float
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

//=============================================================================
// NODES
//=============================================================================

/// Position of a node on the mesh plane, used to order choreographies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Stable position derived from a node id, each axis in [-1, 1]
    pub fn from_node_id(node_id: &str) -> Self {
        let digest = Sha256::digest(node_id.as_bytes());
        let word = |i: usize| {
            let bytes = [digest[i], digest[i + 1], digest[i + 2], digest[i + 3]];
            u32::from_be_bytes(bytes) as f64 / u32::MAX as f64 * 2.0 - 1.0
        };
        Self {
            x: word(0),
            y: word(4),
        }
    }

    /// Euclidean distance to another position
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Polar angle around the origin, in [0, 2π)
    pub fn angle(&self) -> f64 {
        let a = self.y.atan2(self.x);
        if a < 0.0 {
            a + TAU
        } else {
            a
        }
    }
}

/// This process's own node record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalNode {
    pub node_id: NodeId,
    pub device_type: String,
    pub purpose: String,
    pub phase: Phase,
    pub coherence: f64,
    pub presence: f64,
    pub signature: String,
    pub position: Position,
    /// Completed phase cycles
    pub breaths: u64,
}

/// A remote node as seen through its last received packet
#[derive(Debug, Clone, Serialize)]
pub struct PeerNode {
    pub node_id: NodeId,
    pub device_type: String,
    pub purpose: String,
    pub phase: Phase,
    pub coherence: f64,
    pub presence: f64,
    pub signature: String,
    pub position: Position,
    /// Producer timestamp of the last packet (unix seconds)
    pub sent_at: f64,
    /// Arrival time of the last packet
    #[serde(skip)]
    pub last_heartbeat: Instant,
    /// Packets received since discovery
    pub packets: u64,
    /// Heard from within the peer timeout
    pub active: bool,
}

/// Anything the aggregation can fold over
pub trait NodeView {
    fn phase(&self) -> Phase;
    fn coherence(&self) -> f64;
    fn presence(&self) -> f64;
    fn signature(&self) -> &str;
}

impl NodeView for LocalNode {
    fn phase(&self) -> Phase { self.phase }
    fn coherence(&self) -> f64 { self.coherence }
    fn presence(&self) -> f64 { self.presence }
    fn signature(&self) -> &str { &self.signature }
}

impl NodeView for PeerNode {
    fn phase(&self) -> Phase { self.phase }
    fn coherence(&self) -> f64 { self.coherence }
    fn presence(&self) -> f64 { self.presence }
    fn signature(&self) -> &str { &self.signature }
}

//=============================================================================
// AGGREGATE
//=============================================================================

/// Collective view computed from the local node plus all active peers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub active_peers: usize,
    pub total_peers: usize,
    pub mean_coherence: f64,
    pub mean_presence: f64,
    pub dominant_phase: Phase,
    pub dominant_signature: String,
    /// Fraction of considered nodes in the dominant phase
    pub phase_synchrony: f64,
    /// Fraction of considered nodes carrying the dominant signature
    pub signature_coherence: f64,
    /// mean(coherence, presence)
    pub field_strength: f64,
}

impl AggregateSnapshot {
    /// Value read by the threshold of `dimension`
    pub fn value(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Coherence => self.mean_coherence,
            Dimension::Presence => self.mean_presence,
            Dimension::Resonance => self.field_strength,
            Dimension::PhaseSynchrony => self.phase_synchrony,
            Dimension::SignatureCoherence => self.signature_coherence,
        }
    }
}

//=============================================================================
// THRESHOLDS & COLLAPSES
//=============================================================================

/// Monitored dimensions of the aggregate, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Coherence,
    Presence,
    Resonance,
    PhaseSynchrony,
    SignatureCoherence,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Coherence,
        Dimension::Presence,
        Dimension::Resonance,
        Dimension::PhaseSynchrony,
        Dimension::SignatureCoherence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Coherence => "coherence",
            Dimension::Presence => "presence",
            Dimension::Resonance => "resonance",
            Dimension::PhaseSynchrony => "phase_synchrony",
            Dimension::SignatureCoherence => "signature_coherence",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
    Recovery,
}

/// Record of a threshold crossing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollapseEvent {
    /// Monotonic per-gatekeeper sequence number
    pub seq: u64,
    pub dimension: Dimension,
    pub value: f64,
    /// The tier boundary that was crossed
    pub threshold: f64,
    pub severity: Severity,
    /// Pattern launched for this event, if any
    pub remediation: Option<PatternKind>,
    pub timestamp: f64,
}

/// Overall mesh health, derived from the number of active collapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Peaceful,
    Moderate,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_active(count: usize) -> Self {
        match count {
            0 => ThreatLevel::Peaceful,
            1 => ThreatLevel::Moderate,
            2 => ThreatLevel::High,
            _ => ThreatLevel::Critical,
        }
    }
}

//=============================================================================
// DRIFT
//=============================================================================

/// Per-peer dimensions compared against the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftDimension {
    Coherence,
    Presence,
    Phase,
    Signature,
}

/// A peer deviating from the aggregate along one dimension
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEvent {
    pub node_id: NodeId,
    pub dimension: DriftDimension,
    /// Absolute deviation; 1.0 for categorical mismatches
    pub magnitude: f64,
    pub threshold: f64,
    pub timestamp: f64,
}

//=============================================================================
// CHOREOGRAPHY
//=============================================================================

/// Final statistics of a choreography run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoreographyReport {
    pub pattern: PatternKind,
    pub participants: usize,
    pub peers_activated: usize,
    pub duration_secs: f64,
    pub coherence_peaks: u64,
    /// False when stopped before the pattern duration elapsed
    pub completed: bool,
}

//=============================================================================
// EVENTS
//=============================================================================

/// Events published to external observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    PhaseTransition {
        from: Phase,
        to: Phase,
        breaths: u64,
    },
    PeerDiscovered {
        node_id: NodeId,
    },
    PeerLost {
        node_id: NodeId,
    },
    Drift(DriftEvent),
    Collapse(CollapseEvent),
    ThreatLevelChanged {
        from: ThreatLevel,
        to: ThreatLevel,
    },
    ChoreographyStarted {
        pattern: PatternKind,
        participants: usize,
    },
    NodeActivated {
        pattern: PatternKind,
        node_id: NodeId,
        offset_ms: u64,
    },
    ChoreographyCompleted(ChoreographyReport),
}
