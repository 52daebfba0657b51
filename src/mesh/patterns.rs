//! Choreography patterns
//!
//! Static, typed table of the remediation patterns. Each pattern traverses an
//! ordered list of phases while sampling two target curves over its duration,
//! and orders its participants by a pattern-specific positional key.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::models::{NodeId, Position};
use super::phase::Phase;
use crate::config::ConfigError;

/// One participant's slot in a pattern run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeActivation {
    pub node_id: NodeId,
    /// Delay after the run starts
    pub offset: Duration,
    pub fired: bool,
}

impl NodeActivation {
    fn pending(node_id: NodeId, offset: Duration) -> Self {
        Self {
            node_id,
            offset,
            fired: false,
        }
    }

    /// Whether the slot is due at `elapsed` and has not fired yet
    pub fn is_due(&self, elapsed: Duration) -> bool {
        !self.fired && elapsed >= self.offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    CoherenceSpiral,
    PresenceWave,
    HarmonicPulse,
    DawnCascade,
    RitualCircle,
}

impl PatternKind {
    pub const ALL: [PatternKind; 5] = [
        PatternKind::CoherenceSpiral,
        PatternKind::PresenceWave,
        PatternKind::HarmonicPulse,
        PatternKind::DawnCascade,
        PatternKind::RitualCircle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::CoherenceSpiral => "coherence_spiral",
            PatternKind::PresenceWave => "presence_wave",
            PatternKind::HarmonicPulse => "harmonic_pulse",
            PatternKind::DawnCascade => "dawn_cascade",
            PatternKind::RitualCircle => "ritual_circle",
        }
    }

    /// How participants are ordered for activation
    pub fn ordering(&self) -> ActivationOrder {
        match self {
            PatternKind::CoherenceSpiral => ActivationOrder::PolarAngle,
            PatternKind::PresenceWave => ActivationOrder::AxisSum,
            PatternKind::HarmonicPulse => ActivationOrder::Simultaneous,
            PatternKind::DawnCascade => ActivationOrder::DistanceFromOrigin,
            PatternKind::RitualCircle => ActivationOrder::PolarAngle,
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatternKind::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown pattern '{}'", s))
    }
}

/// Activation ordering rule of a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOrder {
    /// Everyone at offset zero
    Simultaneous,
    /// Closest to the origin first
    DistanceFromOrigin,
    /// Counter-clockwise from the positive x axis
    PolarAngle,
    /// Ascending x + y
    AxisSum,
}

impl ActivationOrder {
    fn key(&self, position: &Position) -> f64 {
        match self {
            ActivationOrder::Simultaneous => 0.0,
            ActivationOrder::DistanceFromOrigin => position.distance_to(&Position::ORIGIN),
            ActivationOrder::PolarAngle => position.angle(),
            ActivationOrder::AxisSum => position.x + position.y,
        }
    }
}

/// Static definition of a choreography
#[derive(Debug, Clone, PartialEq)]
pub struct ChoreographyPattern {
    pub kind: PatternKind,
    pub duration: Duration,
    pub phases: Vec<Phase>,
    pub coherence_curve: Vec<f64>,
    pub presence_curve: Vec<f64>,
}

/// Targets at one point of a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatternTarget {
    pub phase: Phase,
    pub coherence: f64,
    pub presence: f64,
}

impl ChoreographyPattern {
    /// Index into a list of `len` samples at `progress` in [0, 1]
    fn sample_index(progress: f64, len: usize) -> usize {
        let p = if progress.is_finite() { progress.clamp(0.0, 1.0) } else { 0.0 };
        ((p * len as f64) as usize).min(len.saturating_sub(1))
    }

    /// Target phase and metrics at `progress` in [0, 1]
    pub fn target_at(&self, progress: f64) -> PatternTarget {
        PatternTarget {
            phase: self.phases[Self::sample_index(progress, self.phases.len())],
            coherence: self.coherence_curve[Self::sample_index(progress, self.coherence_curve.len())],
            presence: self.presence_curve[Self::sample_index(progress, self.presence_curve.len())],
        }
    }

    /// Activation order and offsets for the given participants.
    ///
    /// Deterministic: equal keys fall back to node id order.
    pub fn plan(&self, participants: &[(NodeId, Position)], delay: Duration) -> Vec<NodeActivation> {
        let ordering = self.kind.ordering();
        if ordering == ActivationOrder::Simultaneous {
            let mut ids: Vec<NodeId> = participants.iter().map(|(id, _)| id.clone()).collect();
            ids.sort();
            return ids
                .into_iter()
                .map(|id| NodeActivation::pending(id, Duration::ZERO))
                .collect();
        }

        let mut keyed: Vec<(f64, &NodeId)> = participants
            .iter()
            .map(|(id, pos)| (ordering.key(pos), id))
            .collect();
        keyed.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });

        keyed
            .into_iter()
            .enumerate()
            .map(|(i, (_, id))| {
                let step = u32::try_from(i).unwrap_or(u32::MAX);
                NodeActivation::pending(id.clone(), delay.saturating_mul(step))
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPattern {
            pattern: self.kind.as_str(),
            reason: reason.to_string(),
        };
        if self.duration.is_zero() {
            return Err(invalid("duration must be positive"));
        }
        if self.phases.is_empty() {
            return Err(invalid("phase list is empty"));
        }
        if self.coherence_curve.is_empty() || self.presence_curve.is_empty() {
            return Err(invalid("target curve is empty"));
        }
        let in_unit = |v: &f64| v.is_finite() && (0.0..=1.0).contains(v);
        if !self.coherence_curve.iter().all(in_unit) || !self.presence_curve.iter().all(in_unit) {
            return Err(invalid("curve value outside [0, 1]"));
        }
        Ok(())
    }
}

/// The five remediation patterns, indexed by kind
#[derive(Debug, Clone)]
pub struct PatternTable {
    patterns: Vec<ChoreographyPattern>,
}

impl PatternTable {
    pub fn standard() -> Self {
        use Phase::*;

        let pattern = |kind, secs, phases: &[Phase], coherence: &[f64], presence: &[f64]| {
            ChoreographyPattern {
                kind,
                duration: Duration::from_secs(secs),
                phases: phases.to_vec(),
                coherence_curve: coherence.to_vec(),
                presence_curve: presence.to_vec(),
            }
        };

        Self {
            patterns: vec![
                pattern(
                    PatternKind::CoherenceSpiral,
                    30,
                    &[Inhale, Hold, Exhale, Echo],
                    &[0.6, 0.7, 0.8, 0.9, 0.95, 0.9],
                    &[0.6, 0.65, 0.7, 0.75, 0.8, 0.8],
                ),
                pattern(
                    PatternKind::PresenceWave,
                    20,
                    &[Exhale, Caesura, Inhale],
                    &[0.6, 0.65, 0.7, 0.7],
                    &[0.6, 0.75, 0.9, 0.85],
                ),
                pattern(
                    PatternKind::HarmonicPulse,
                    12,
                    &[Hold, Hold, Exhale, Hold],
                    &[0.7, 0.9, 0.7, 0.9],
                    &[0.7, 0.9, 0.7, 0.9],
                ),
                pattern(
                    PatternKind::DawnCascade,
                    24,
                    &[Caesura, Inhale, Hold, Exhale, Echo],
                    &[0.5, 0.6, 0.7, 0.8, 0.85],
                    &[0.5, 0.6, 0.7, 0.8, 0.85],
                ),
                pattern(
                    PatternKind::RitualCircle,
                    36,
                    &[Inhale, Hold, Exhale, Caesura, Echo],
                    &[0.7, 0.75, 0.8, 0.85, 0.9, 0.9],
                    &[0.7, 0.75, 0.8, 0.8, 0.85, 0.85],
                ),
            ],
        }
    }

    pub fn get(&self, kind: PatternKind) -> Option<&ChoreographyPattern> {
        self.patterns.iter().find(|p| p.kind == kind)
    }

    /// Every kind present exactly once and every pattern well formed
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in PatternKind::ALL {
            let count = self.patterns.iter().filter(|p| p.kind == kind).count();
            if count != 1 {
                return Err(ConfigError::InvalidPattern {
                    pattern: kind.as_str(),
                    reason: format!("defined {} times", count),
                });
            }
        }
        self.patterns.iter().try_for_each(ChoreographyPattern::validate)
    }
}
