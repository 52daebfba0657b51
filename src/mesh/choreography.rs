//! Choreography engine - timed remediation sequences
//!
//! A run snapshots the active peers, orders them by the pattern's key and
//! activates them at fixed offsets. While it runs the engine steers the local
//! agent toward the pattern's target curves and samples the aggregate for
//! coherence peaks. Only one run exists at a time.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::agent::SteeringTarget;
use super::aggregate::aggregate;
use super::models::{emit, ChoreographyReport, EventSender, LocalNode, MeshEvent, NodeId, Position};
use super::patterns::{ChoreographyPattern, NodeActivation, PatternKind, PatternTable};
use super::registry::PeerRegistry;
use super::status::MeshStats;
use crate::config::ChoreographyConfig;

/// Progress of the current remediation, if any
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemediationStatus {
    pub pattern: Option<PatternKind>,
    /// Fraction of the pattern duration elapsed, in [0, 1]
    pub progress: f64,
    pub active_peer_count: usize,
}

/// Something that can run a remediation pattern on behalf of the gatekeeper
#[async_trait::async_trait]
pub trait Remediator: Send + Sync {
    /// Launch `pattern`. False when the request was refused.
    async fn start(&self, pattern: PatternKind) -> bool;
    async fn stop(&self);
    async fn status(&self) -> RemediationStatus;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChoreographyError {
    #[error("Unknown pattern: {0}")]
    UnknownPattern(String),

    #[error("Pattern {0} is already running")]
    AlreadyRunning(PatternKind),

    #[error("No active peers to choreograph")]
    NoActivePeers,
}

struct ActiveRun {
    id: u64,
    pattern: PatternKind,
    started: Instant,
    duration: Duration,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ChoreographyEngine {
    registry: Arc<PeerRegistry>,
    local: watch::Receiver<LocalNode>,
    steering: Arc<watch::Sender<Option<SteeringTarget>>>,
    patterns: Arc<PatternTable>,
    config: ChoreographyConfig,
    events: EventSender,
    stats: Arc<MeshStats>,
    active: Arc<RwLock<Option<ActiveRun>>>,
    /// Finished runs, oldest first
    reports: Arc<RwLock<Vec<ChoreographyReport>>>,
    next_run: Arc<AtomicU64>,
}

impl ChoreographyEngine {
    pub fn new(
        registry: Arc<PeerRegistry>,
        local: watch::Receiver<LocalNode>,
        steering: watch::Sender<Option<SteeringTarget>>,
        patterns: PatternTable,
        config: ChoreographyConfig,
        events: EventSender,
        stats: Arc<MeshStats>,
    ) -> Self {
        Self {
            registry,
            local,
            steering: Arc::new(steering),
            patterns: Arc::new(patterns),
            config,
            events,
            stats,
            active: Arc::new(RwLock::new(None)),
            reports: Arc::new(RwLock::new(Vec::new())),
            next_run: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a pattern by its wire name
    pub async fn start_named(&self, name: &str) -> Result<(), ChoreographyError> {
        let kind: PatternKind = name
            .parse()
            .map_err(|_| ChoreographyError::UnknownPattern(name.to_string()))?;
        self.start_pattern(kind).await
    }

    pub async fn start_pattern(&self, kind: PatternKind) -> Result<(), ChoreographyError> {
        let pattern = self
            .patterns
            .get(kind)
            .cloned()
            .ok_or_else(|| ChoreographyError::UnknownPattern(kind.to_string()))?;

        let mut active = self.active.write().await;
        if let Some(run) = active.as_ref() {
            return Err(ChoreographyError::AlreadyRunning(run.pattern));
        }

        let peers = self.registry.active_peers().await;
        if peers.is_empty() {
            return Err(ChoreographyError::NoActivePeers);
        }
        let participants: Vec<(NodeId, Position)> = peers
            .iter()
            .map(|p| (p.node_id.clone(), p.position))
            .collect();
        let schedule = pattern.plan(&participants, self.config.node_activation_delay());

        let id = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        info!(
            pattern = %kind,
            participants = schedule.len(),
            duration_secs = pattern.duration.as_secs_f64(),
            "Choreography started"
        );
        emit(
            &self.events,
            MeshEvent::ChoreographyStarted {
                pattern: kind,
                participants: schedule.len(),
            },
        );

        let duration = pattern.duration;
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.run(id, pattern, schedule, started, cancel_rx).await;
        });

        *active = Some(ActiveRun {
            id,
            pattern: kind,
            started,
            duration,
            cancel: cancel_tx,
            handle,
        });
        Ok(())
    }

    /// Cancel the current run and wait for its report. No-op when idle.
    pub async fn stop(&self) {
        let run = self.active.write().await.take();
        let Some(run) = run else {
            return;
        };

        info!(pattern = %run.pattern, "Stopping choreography");
        let _ = run.cancel.send(true);
        if let Err(e) = run.handle.await {
            warn!(pattern = %run.pattern, error = %e, "Choreography task failed");
            self.steering.send_replace(None);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active.read().await.is_some()
    }

    pub async fn active_pattern(&self) -> Option<PatternKind> {
        self.active.read().await.as_ref().map(|run| run.pattern)
    }

    pub async fn reports(&self) -> Vec<ChoreographyReport> {
        self.reports.read().await.clone()
    }

    pub async fn remediation_status(&self) -> RemediationStatus {
        let (pattern, progress) = match self.active.read().await.as_ref() {
            Some(run) => {
                let total = run.duration.as_secs_f64();
                let progress = if total > 0.0 {
                    (run.started.elapsed().as_secs_f64() / total).min(1.0)
                } else {
                    1.0
                };
                (Some(run.pattern), progress)
            }
            None => (None, 0.0),
        };
        RemediationStatus {
            pattern,
            progress,
            active_peer_count: self.registry.active_peers().await.len(),
        }
    }

    async fn run(
        self,
        id: u64,
        pattern: ChoreographyPattern,
        mut schedule: Vec<NodeActivation>,
        started: Instant,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut peaks = 0u64;
        let total = pattern.duration.as_secs_f64();

        let completed = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => break false,
            }

            let elapsed = started.elapsed();
            if elapsed >= pattern.duration {
                break true;
            }

            let target = pattern.target_at(elapsed.as_secs_f64() / total);
            self.steering.send_replace(Some(SteeringTarget {
                coherence: target.coherence,
                presence: target.presence,
            }));

            for slot in schedule.iter_mut().filter(|slot| slot.is_due(elapsed)) {
                slot.fired = true;
                let offset_ms = u64::try_from(slot.offset.as_millis()).unwrap_or(u64::MAX);
                debug!(
                    pattern = %pattern.kind,
                    node_id = %slot.node_id,
                    offset_ms,
                    target_phase = %target.phase,
                    "Node activated"
                );
                emit(
                    &self.events,
                    MeshEvent::NodeActivated {
                        pattern: pattern.kind,
                        node_id: slot.node_id.clone(),
                        offset_ms,
                    },
                );
            }

            let local = self.local.borrow().clone();
            let peers = self.registry.active_peers().await;
            let snapshot = aggregate(&local, &peers, self.registry.total_count().await);
            if snapshot.mean_coherence > self.config.peak_coherence {
                peaks += 1;
            }
        };

        self.steering.send_replace(None);

        {
            let mut active = self.active.write().await;
            if active.as_ref().map(|run| run.id) == Some(id) {
                *active = None;
            }
        }

        let report = ChoreographyReport {
            pattern: pattern.kind,
            participants: schedule.len(),
            peers_activated: schedule.iter().filter(|slot| slot.fired).count(),
            duration_secs: started.elapsed().as_secs_f64(),
            coherence_peaks: peaks,
            completed,
        };
        self.stats.record_peaks(peaks);

        info!(
            pattern = %report.pattern,
            peers_activated = report.peers_activated,
            coherence_peaks = report.coherence_peaks,
            completed = report.completed,
            "Choreography finished"
        );
        self.reports.write().await.push(report.clone());
        emit(&self.events, MeshEvent::ChoreographyCompleted(report));
    }
}

#[async_trait::async_trait]
impl Remediator for ChoreographyEngine {
    async fn start(&self, pattern: PatternKind) -> bool {
        match self.start_pattern(pattern).await {
            Ok(()) => true,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Choreography refused");
                false
            }
        }
    }

    async fn stop(&self) {
        ChoreographyEngine::stop(self).await;
    }

    async fn status(&self) -> RemediationStatus {
        self.remediation_status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::codec::{StatePacket, KEY_POSITION};
    use crate::mesh::models::EVENT_CHANNEL_CAPACITY;
    use crate::mesh::phase::Phase;
    use tokio::sync::broadcast;

    struct Fixture {
        engine: ChoreographyEngine,
        registry: Arc<PeerRegistry>,
        steering: watch::Receiver<Option<SteeringTarget>>,
        events: broadcast::Receiver<MeshEvent>,
        stats: Arc<MeshStats>,
    }

    fn fixture(local_coherence: f64) -> Fixture {
        let (events_tx, events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stats = Arc::new(MeshStats::default());
        let registry = Arc::new(PeerRegistry::new(
            Duration::from_secs(120),
            events_tx.clone(),
            stats.clone(),
        ));
        let (_local_tx, local) = watch::channel(LocalNode {
            node_id: "local".to_string(),
            device_type: "node".to_string(),
            purpose: "test".to_string(),
            phase: Phase::Hold,
            coherence: local_coherence,
            presence: 0.9,
            signature: "s".to_string(),
            position: Position::ORIGIN,
            breaths: 0,
        });
        let (steer_tx, steering) = watch::channel(None);
        let engine = ChoreographyEngine::new(
            registry.clone(),
            local,
            steer_tx,
            PatternTable::standard(),
            ChoreographyConfig::default(),
            events_tx,
            stats.clone(),
        );
        Fixture {
            engine,
            registry,
            steering,
            events,
            stats,
        }
    }

    async fn add_peer(registry: &PeerRegistry, id: &str, x: f64, y: f64, coherence: f64) {
        let mut packet = StatePacket::new(id, Phase::Hold, coherence, 0.9, "s", 1.0);
        packet.insert(KEY_POSITION, serde_json::json!([x, y]));
        registry.upsert(packet).await;
    }

    fn activations(rx: &mut broadcast::Receiver<MeshEvent>) -> Vec<(String, u64)> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                MeshEvent::NodeActivated { node_id, offset_ms, .. } => Some((node_id, offset_ms)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_spiral_runs_to_completion_in_angle_order() {
        let mut fx = fixture(0.5);
        add_peer(&fx.registry, "west", -1.0, 0.0, 0.5).await;
        add_peer(&fx.registry, "north", 0.0, 1.0, 0.5).await;
        add_peer(&fx.registry, "east", 1.0, 0.0, 0.5).await;

        fx.engine.start_pattern(PatternKind::CoherenceSpiral).await.unwrap();
        assert!(fx.engine.is_running().await);
        assert_eq!(fx.engine.active_pattern().await, Some(PatternKind::CoherenceSpiral));

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(!fx.engine.is_running().await);
        assert_eq!(
            activations(&mut fx.events),
            vec![
                ("east".to_string(), 0),
                ("north".to_string(), 2000),
                ("west".to_string(), 4000),
            ]
        );

        let reports = fx.engine.reports().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].completed);
        assert_eq!(reports[0].peers_activated, 3);
        assert_eq!(reports[0].coherence_peaks, 0);
        assert!(fx.steering.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_activates_everyone_at_once() {
        let mut fx = fixture(0.5);
        add_peer(&fx.registry, "b", 0.5, 0.5, 0.5).await;
        add_peer(&fx.registry, "a", -0.5, 0.2, 0.5).await;

        fx.engine.start_named("harmonic_pulse").await.unwrap();
        tokio::time::sleep(Duration::from_secs(13)).await;

        assert_eq!(
            activations(&mut fx.events),
            vec![("a".to_string(), 0), ("b".to_string(), 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_while_running() {
        let fx = fixture(0.5);
        add_peer(&fx.registry, "p", 0.1, 0.1, 0.5).await;

        fx.engine.start_pattern(PatternKind::PresenceWave).await.unwrap();
        assert_eq!(
            fx.engine.start_pattern(PatternKind::DawnCascade).await,
            Err(ChoreographyError::AlreadyRunning(PatternKind::PresenceWave))
        );
        assert!(!Remediator::start(&fx.engine, PatternKind::DawnCascade).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_peers_and_unknown_names_fail() {
        let fx = fixture(0.5);
        assert_eq!(
            fx.engine.start_pattern(PatternKind::RitualCircle).await,
            Err(ChoreographyError::NoActivePeers)
        );
        assert!(matches!(
            fx.engine.start_named("moonwalk").await,
            Err(ChoreographyError::UnknownPattern(_))
        ));
        assert!(!fx.engine.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_reports_partial_run() {
        let fx = fixture(0.5);
        add_peer(&fx.registry, "p", 0.3, 0.3, 0.5).await;

        fx.engine.stop().await;
        fx.engine.start_pattern(PatternKind::DawnCascade).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fx.steering.borrow().is_some());

        let status = fx.engine.remediation_status().await;
        assert_eq!(status.pattern, Some(PatternKind::DawnCascade));
        assert!(status.progress > 0.1 && status.progress < 0.2);
        assert_eq!(status.active_peer_count, 1);

        fx.engine.stop().await;
        fx.engine.stop().await;

        assert!(!fx.engine.is_running().await);
        assert!(fx.steering.borrow().is_none());
        let reports = fx.engine.reports().await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].completed);
        assert_eq!(reports[0].peers_activated, 1);

        // Slot is free again
        fx.engine.start_pattern(PatternKind::DawnCascade).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peaks_are_counted_and_recorded() {
        let fx = fixture(1.0);
        add_peer(&fx.registry, "p", 0.2, 0.2, 0.99).await;

        fx.engine.start_pattern(PatternKind::HarmonicPulse).await.unwrap();
        tokio::time::sleep(Duration::from_secs(13)).await;

        let reports = fx.engine.reports().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].coherence_peaks > 100);
        assert_eq!(fx.stats.snapshot().coherence_peaks, reports[0].coherence_peaks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_loss_mid_run_is_tolerated() {
        let fx = fixture(0.5);
        add_peer(&fx.registry, "a", 1.0, 0.0, 0.5).await;
        add_peer(&fx.registry, "b", 0.0, 1.0, 0.5).await;

        fx.engine.start_pattern(PatternKind::PresenceWave).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.registry.evict_stale(Duration::ZERO).await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        let reports = fx.engine.reports().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].completed);
        assert_eq!(reports[0].participants, 2);
    }
}
