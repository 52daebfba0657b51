//! Status snapshot and mesh counters
//!
//! The status snapshot is the single outward-facing view of a node. Building
//! one has no side effects and only takes read locks, so any number of
//! concurrent readers is fine.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::models::ThreatLevel;
use super::patterns::PatternKind;
use super::phase::Phase;

/// Process-lifetime counters shared by every component
#[derive(Debug, Default)]
pub struct MeshStats {
    breaths: AtomicU64,
    discoveries: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    self_dropped: AtomicU64,
    coherence_peaks: AtomicU64,
    remediations: AtomicU64,
}

impl MeshStats {
    pub fn record_breath(&self) {
        self.breaths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery(&self) {
        self.discoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Our own broadcast looped back to us
    pub fn record_self_dropped(&self) {
        self.self_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peaks(&self, count: u64) {
        self.coherence_peaks.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_remediation(&self) {
        self.remediations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            breaths: self.breaths.load(Ordering::Relaxed),
            discoveries: self.discoveries.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            self_dropped: self.self_dropped.load(Ordering::Relaxed),
            coherence_peaks: self.coherence_peaks.load(Ordering::Relaxed),
            remediations: self.remediations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub breaths: u64,
    pub discoveries: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub self_dropped: u64,
    pub coherence_peaks: u64,
    pub remediations: u64,
}

/// Read-only view of a node for visualizers and APIs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub node_id: String,
    pub device_type: String,
    pub purpose: String,
    pub running: bool,
    pub phase: Phase,
    pub coherence: f64,
    pub presence: f64,
    pub collective_coherence: f64,
    pub collective_presence: f64,
    pub field_strength: f64,
    pub active_peers: usize,
    pub total_peers: usize,
    pub threat_level: ThreatLevel,
    pub active_pattern: Option<PatternKind>,
    pub stats: StatsSnapshot,
}

impl StatusSnapshot {
    /// Flat map of named metrics; nested stats become `stats.<name>`
    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) {
            for (key, value) in fields {
                match value {
                    serde_json::Value::Object(nested) => {
                        for (inner, v) in nested {
                            map.insert(format!("{}.{}", key, inner), v);
                        }
                    }
                    other => {
                        map.insert(key, other);
                    }
                }
            }
        }
        map
    }
}
