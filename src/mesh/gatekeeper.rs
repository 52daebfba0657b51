//! Threshold gatekeeper
//!
//! Classifies the aggregate against five tiered thresholds and launches the
//! bound remediation pattern when a dimension collapses. Remediation starts
//! are globally rate limited: at most one per cooldown window across all
//! thresholds. A collapse that lands inside the window is still recorded; it
//! just does not launch anything.
//!
//! Warnings are edge triggered. A dimension emits one warning when it enters
//! the band between its critical and warning bounds and stays silent while it
//! remains there, so a mesh parked in the band does not produce a warning on
//! every evaluation. Leaving the band re-arms it. A dimension holding an open
//! critical collapse does not warn at all until it recovers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::choreography::Remediator;
use super::models::{
    emit, unix_now, AggregateSnapshot, CollapseEvent, Dimension, EventSender, MeshEvent, Severity,
    ThreatLevel,
};
use super::patterns::PatternKind;
use super::status::MeshStats;
use crate::config::{ConfigError, GatekeeperConfig, ThresholdsConfig};

/// Tiered bounds of one monitored dimension
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub dimension: Dimension,
    pub critical: f64,
    pub warning: f64,
    pub recovery: f64,
    pub description: &'static str,
    pub pattern: PatternKind,
}

impl Threshold {
    /// How far below critical `value` sits, relative to the critical bound
    fn breach_depth(&self, value: f64) -> f64 {
        if self.critical > 0.0 {
            (self.critical - value) / self.critical
        } else {
            self.critical - value
        }
    }
}

fn binding(dimension: Dimension) -> (&'static str, PatternKind) {
    match dimension {
        Dimension::Coherence => (
            "Mean coherence of the mesh",
            PatternKind::CoherenceSpiral,
        ),
        Dimension::Presence => ("Mean presence of the mesh", PatternKind::PresenceWave),
        Dimension::Resonance => (
            "Field strength, the mean of coherence and presence",
            PatternKind::HarmonicPulse,
        ),
        Dimension::PhaseSynchrony => (
            "Share of nodes in the dominant phase",
            PatternKind::DawnCascade,
        ),
        Dimension::SignatureCoherence => (
            "Share of nodes carrying the dominant signature",
            PatternKind::RitualCircle,
        ),
    }
}

/// One threshold per dimension, in evaluation order
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    thresholds: Vec<Threshold>,
}

impl ThresholdTable {
    pub fn from_config(config: &ThresholdsConfig) -> Result<Self, ConfigError> {
        let mut thresholds = Vec::with_capacity(Dimension::ALL.len());
        for dimension in Dimension::ALL {
            let tiers = config.tiers(dimension);
            let invalid = |reason: String| ConfigError::InvalidThreshold { dimension, reason };

            for value in [tiers.critical, tiers.warning, tiers.recovery] {
                if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                    return Err(invalid(format!("{} outside [0, 1]", value)));
                }
            }
            if !(tiers.critical < tiers.warning && tiers.warning < tiers.recovery) {
                return Err(invalid(format!(
                    "expected critical < warning < recovery, got {} / {} / {}",
                    tiers.critical, tiers.warning, tiers.recovery
                )));
            }

            let (description, pattern) = binding(dimension);
            thresholds.push(Threshold {
                dimension,
                critical: tiers.critical,
                warning: tiers.warning,
                recovery: tiers.recovery,
                description,
                pattern,
            });
        }
        Ok(Self { thresholds })
    }

    pub fn get(&self, dimension: Dimension) -> Option<&Threshold> {
        self.thresholds.iter().find(|t| t.dimension == dimension)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }
}

/// Outcome of one evaluation tick
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub events: Vec<CollapseEvent>,
    pub remediation: Option<PatternKind>,
    pub threat_level: ThreatLevel,
}

pub struct ThresholdGatekeeper {
    table: ThresholdTable,
    cooldown: Duration,
    last_remediation: Option<Instant>,
    /// Open critical collapses by dimension
    active: BTreeMap<Dimension, CollapseEvent>,
    /// Dimensions currently inside their warning band
    warned: HashSet<Dimension>,
    history: Vec<CollapseEvent>,
    threat: ThreatLevel,
    seq: u64,
    remediator: Arc<dyn Remediator>,
    events: EventSender,
    stats: Arc<MeshStats>,
}

impl ThresholdGatekeeper {
    pub fn new(
        config: &GatekeeperConfig,
        remediator: Arc<dyn Remediator>,
        events: EventSender,
        stats: Arc<MeshStats>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            table: ThresholdTable::from_config(&config.thresholds)?,
            cooldown: config.recovery_cooldown(),
            last_remediation: None,
            active: BTreeMap::new(),
            warned: HashSet::new(),
            history: Vec::new(),
            threat: ThreatLevel::Peaceful,
            seq: 0,
            remediator,
            events,
            stats,
        })
    }

    pub fn threat_level(&self) -> ThreatLevel {
        self.threat
    }

    pub fn active_collapses(&self) -> Vec<CollapseEvent> {
        self.active.values().cloned().collect()
    }

    /// Every collapse, warning and recovery recorded so far
    pub fn history(&self) -> &[CollapseEvent] {
        &self.history
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_remediation
            .map_or(true, |last| now.duration_since(last) >= self.cooldown)
    }

    fn record(&mut self, threshold: &Threshold, value: f64, bound: f64, severity: Severity) -> CollapseEvent {
        self.seq += 1;
        CollapseEvent {
            seq: self.seq,
            dimension: threshold.dimension,
            value,
            threshold: bound,
            severity,
            remediation: None,
            timestamp: unix_now(),
        }
    }

    /// Classify `snapshot` against every threshold
    pub async fn evaluate(&mut self, snapshot: &AggregateSnapshot) -> EvaluationReport {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut breaches: Vec<(Threshold, f64)> = Vec::new();

        let thresholds: Vec<Threshold> = self.table.iter().cloned().collect();
        for threshold in &thresholds {
            let dimension = threshold.dimension;
            let value = snapshot.value(dimension);

            if value <= threshold.critical {
                if !self.active.contains_key(&dimension) {
                    breaches.push((threshold.clone(), value));
                }
            } else if value <= threshold.warning {
                if !self.active.contains_key(&dimension) && self.warned.insert(dimension) {
                    let event = self.record(threshold, value, threshold.warning, Severity::Warning);
                    warn!(
                        dimension = %dimension,
                        value,
                        warning = threshold.warning,
                        "Threshold warning"
                    );
                    events.push(event);
                }
            } else {
                self.warned.remove(&dimension);
                if value >= threshold.recovery && self.active.remove(&dimension).is_some() {
                    let event = self.record(threshold, value, threshold.recovery, Severity::Recovery);
                    info!(
                        dimension = %dimension,
                        value,
                        recovery = threshold.recovery,
                        "Threshold recovered"
                    );
                    events.push(event);
                }
            }
        }

        // Deepest relative breach claims the cooldown slot; stable sort keeps
        // table order between equal depths.
        breaches.sort_by(|a, b| {
            b.0.breach_depth(b.1)
                .partial_cmp(&a.0.breach_depth(a.1))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut remediation = None;
        for (threshold, value) in breaches {
            let mut event = self.record(&threshold, value, threshold.critical, Severity::Critical);
            self.warned.remove(&threshold.dimension);

            if remediation.is_none() && self.cooldown_elapsed(now) {
                if self.remediator.start(threshold.pattern).await {
                    event.remediation = Some(threshold.pattern);
                    remediation = Some(threshold.pattern);
                    self.last_remediation = Some(now);
                    self.stats.record_remediation();
                } else {
                    warn!(
                        dimension = %threshold.dimension,
                        pattern = %threshold.pattern,
                        "Remediation refused"
                    );
                }
            } else {
                debug!(
                    dimension = %threshold.dimension,
                    "Remediation suppressed by cooldown"
                );
            }

            warn!(
                dimension = %threshold.dimension,
                value,
                critical = threshold.critical,
                remediation = ?event.remediation,
                "Threshold collapse"
            );
            self.active.insert(threshold.dimension, event.clone());
            events.push(event);
        }

        for event in &events {
            self.history.push(event.clone());
            emit(&self.events, MeshEvent::Collapse(event.clone()));
        }

        let threat = ThreatLevel::from_active(self.active.len());
        if threat != self.threat {
            info!(from = ?self.threat, to = ?threat, "Threat level changed");
            emit(
                &self.events,
                MeshEvent::ThreatLevelChanged {
                    from: self.threat,
                    to: threat,
                },
            );
            self.threat = threat;
        }

        EvaluationReport {
            events,
            remediation,
            threat_level: threat,
        }
    }
}
