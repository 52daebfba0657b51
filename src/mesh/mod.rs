//! Mesh node - coherence orchestrator
//!
//! Owns every component of one node and runs its loops as tokio tasks.
//!
//! # Architecture
//!
//! ```text
//!   Agent ──watch──▶ Broadcaster ──UDP──▶ network ──UDP──▶ Listener
//!     ▲                                                      │
//!     │ steering                                      upsert │
//!     │                                                      ▼
//!   Choreography ◀── Gatekeeper ◀── aggregate ◀──────── Registry
//!                                       │
//!                                       └──▶ Drift
//! ```
//!
//! Loops: phase tick, broadcaster, listener, monitor (eviction, aggregate,
//! drift) and gatekeeper. A choreography run gets its own task.

pub mod agent;
pub mod aggregate;
pub mod choreography;
pub mod drift;
pub mod gatekeeper;
pub mod models;
pub mod patterns;
pub mod phase;
pub mod registry;
pub mod status;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::gossip::transport::GossipTransport;
use agent::{LocalAgent, SteeringTarget};
use aggregate::aggregate;
use choreography::{ChoreographyEngine, RemediationStatus, Remediator};
use drift::DriftDetector;
use gatekeeper::{EvaluationReport, ThresholdGatekeeper};
use models::{
    AggregateSnapshot, CollapseEvent, DriftEvent, EventSender, LocalNode, MeshEvent, PeerNode,
    EVENT_CHANNEL_CAPACITY,
};
use patterns::{PatternKind, PatternTable};
use registry::PeerRegistry;
use status::{MeshStats, StatusSnapshot};

pub struct MeshNode {
    config: Config,
    events: EventSender,
    stats: Arc<MeshStats>,
    registry: Arc<PeerRegistry>,
    choreography: ChoreographyEngine,
    gatekeeper: Arc<Mutex<ThresholdGatekeeper>>,
    drift: Arc<Mutex<DriftDetector>>,
    /// Handed to its task on start
    agent: Option<LocalAgent>,
    local: watch::Receiver<LocalNode>,
    aggregate_tx: Arc<watch::Sender<Option<AggregateSnapshot>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl MeshNode {
    /// Build a node from validated configuration. Nothing runs until `start`.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stats = Arc::new(MeshStats::default());
        let (steering_tx, steering_rx) = watch::channel::<Option<SteeringTarget>>(None);

        let agent = LocalAgent::new(&config, steering_rx, events.clone(), stats.clone())?;
        let local = agent.subscribe();

        let registry = Arc::new(PeerRegistry::new(
            config.registry.peer_timeout(),
            events.clone(),
            stats.clone(),
        ));

        let choreography = ChoreographyEngine::new(
            registry.clone(),
            local.clone(),
            steering_tx,
            PatternTable::standard(),
            config.choreography.clone(),
            events.clone(),
            stats.clone(),
        );

        let gatekeeper = ThresholdGatekeeper::new(
            &config.gatekeeper,
            Arc::new(choreography.clone()),
            events.clone(),
            stats.clone(),
        )?;
        let drift = DriftDetector::new(&config.drift, events.clone());
        let (aggregate_tx, _) = watch::channel(None);

        Ok(Self {
            config,
            events,
            stats,
            registry,
            choreography,
            gatekeeper: Arc::new(Mutex::new(gatekeeper)),
            drift: Arc::new(Mutex::new(drift)),
            agent: Some(agent),
            local,
            aggregate_tx: Arc::new(aggregate_tx),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            tasks: Vec::new(),
            local_addr: None,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the gossip socket is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn choreography(&self) -> &ChoreographyEngine {
        &self.choreography
    }

    /// Copy of the local node as of the last tick
    pub fn local_node(&self) -> LocalNode {
        self.local.borrow().clone()
    }

    /// Subscribe to the mesh event stream
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Bind the gossip socket and spawn every loop.
    ///
    /// A node starts once; bind failures are returned and leave it startable.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.agent.is_none() {
            anyhow::bail!("mesh node {} was already started", self.config.node.id);
        }

        let transport = Arc::new(
            GossipTransport::bind(
                &self.config.gossip,
                self.config.node.id.clone(),
                self.stats.clone(),
            )
            .await
            .context("starting gossip transport")?,
        );
        self.local_addr = Some(transport.local_addr());

        let agent = self.agent.take().context("local agent missing")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.tasks.push(tokio::spawn(agent.run(shutdown_rx.clone())));

        self.tasks.push(tokio::spawn(transport.clone().run_broadcaster(
            self.local.clone(),
            self.aggregate_tx.subscribe(),
            self.config.gossip.broadcast_interval(),
            shutdown_rx.clone(),
        )));

        self.tasks.push(tokio::spawn(transport.run_listener(
            self.registry.clone(),
            self.config.gossip.read_timeout(),
            shutdown_rx.clone(),
        )));

        self.tasks.push(tokio::spawn(monitor_loop(
            self.registry.clone(),
            self.local.clone(),
            self.aggregate_tx.clone(),
            self.drift.clone(),
            self.config.monitor.interval(),
            shutdown_rx.clone(),
        )));

        self.tasks.push(tokio::spawn(gatekeeper_loop(
            self.registry.clone(),
            self.local.clone(),
            self.gatekeeper.clone(),
            self.config.gatekeeper.evaluation_interval(),
            shutdown_rx,
        )));

        self.shutdown_tx = Some(shutdown_tx);
        self.running.store(true, Ordering::SeqCst);

        info!(
            node_id = %self.config.node.id,
            addr = ?self.local_addr,
            device_type = %self.config.node.device_type,
            purpose = %self.config.node.purpose,
            "Mesh node started"
        );
        Ok(())
    }

    /// Signal every loop and wait for the tasks, then stop any choreography.
    /// Tasks still running after the shutdown timeout are aborted.
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };

        info!(node_id = %self.config.node.id, "Mesh node stopping");
        let _ = shutdown_tx.send(true);

        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let grace = Duration::from_millis(self.config.node.shutdown_timeout_ms);

        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(timeout_ms = grace.as_millis() as u64, "Shutdown timed out, aborting tasks");
            for abort in aborts {
                abort.abort();
            }
        }

        // Only after the gatekeeper loop is gone, so nothing can launch a new run
        self.choreography.stop().await;

        self.running.store(false, Ordering::SeqCst);
        info!(node_id = %self.config.node.id, "Mesh node stopped");
    }

    /// Fresh aggregate over the local node and the active peers
    pub async fn snapshot(&self) -> AggregateSnapshot {
        collect(&self.registry, &self.local).await.1
    }

    /// Run one gatekeeper evaluation right now
    pub async fn evaluate_now(&self) -> EvaluationReport {
        let snapshot = self.snapshot().await;
        self.gatekeeper.lock().await.evaluate(&snapshot).await
    }

    /// Run one monitor pass right now: evict, aggregate, check drift
    pub async fn monitor_now(&self) -> Vec<DriftEvent> {
        monitor_pass(&self.registry, &self.local, &self.aggregate_tx, &self.drift).await
    }

    /// Latest drift events, newest first
    pub async fn recent_drift(&self, count: usize) -> Vec<DriftEvent> {
        self.drift.lock().await.recent(count)
    }

    /// Cumulative drift count of a peer; zero for unknown peers
    pub async fn drift_score(&self, node_id: &str) -> u64 {
        self.drift.lock().await.drift_score(node_id)
    }

    /// Every collapse, warning and recovery the gatekeeper recorded, oldest first
    pub async fn collapse_history(&self) -> Vec<CollapseEvent> {
        self.gatekeeper.lock().await.history().to_vec()
    }

    /// Critical collapses that have not recovered yet
    pub async fn active_collapses(&self) -> Vec<CollapseEvent> {
        self.gatekeeper.lock().await.active_collapses()
    }

    pub async fn status(&self) -> StatusSnapshot {
        let local = self.local_node();
        let snapshot = self.snapshot().await;
        let threat_level = self.gatekeeper.lock().await.threat_level();

        StatusSnapshot {
            node_id: local.node_id,
            device_type: local.device_type,
            purpose: local.purpose,
            running: self.is_running(),
            phase: local.phase,
            coherence: local.coherence,
            presence: local.presence,
            collective_coherence: snapshot.mean_coherence,
            collective_presence: snapshot.mean_presence,
            field_strength: snapshot.field_strength,
            active_peers: snapshot.active_peers,
            total_peers: snapshot.total_peers,
            threat_level,
            active_pattern: self.choreography.active_pattern().await,
            stats: self.stats.snapshot(),
        }
    }

    /// Status flattened into named metrics
    pub async fn status_map(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        self.status().await.to_map()
    }

    /// Manually trigger a remediation pattern
    pub async fn start_remediation(&self, pattern: PatternKind) -> bool {
        Remediator::start(&self.choreography, pattern).await
    }

    pub async fn stop_remediation(&self) {
        Remediator::stop(&self.choreography).await;
    }

    pub async fn remediation_status(&self) -> RemediationStatus {
        Remediator::status(&self.choreography).await
    }
}

async fn collect(
    registry: &PeerRegistry,
    local: &watch::Receiver<LocalNode>,
) -> (Vec<PeerNode>, AggregateSnapshot) {
    let node = local.borrow().clone();
    let peers = registry.active_peers().await;
    let snapshot = aggregate(&node, &peers, registry.total_count().await);
    (peers, snapshot)
}

async fn monitor_pass(
    registry: &PeerRegistry,
    local: &watch::Receiver<LocalNode>,
    aggregate_tx: &watch::Sender<Option<AggregateSnapshot>>,
    drift: &Mutex<DriftDetector>,
) -> Vec<DriftEvent> {
    registry.evict_stale(registry.timeout()).await;
    let (peers, snapshot) = collect(registry, local).await;
    debug!(
        active_peers = snapshot.active_peers,
        mean_coherence = snapshot.mean_coherence,
        mean_presence = snapshot.mean_presence,
        dominant_phase = %snapshot.dominant_phase,
        "Mesh aggregate"
    );
    let drifts = drift.lock().await.detect(&peers, &snapshot);
    aggregate_tx.send_replace(Some(snapshot));
    drifts
}

async fn monitor_loop(
    registry: Arc<PeerRegistry>,
    local: watch::Receiver<LocalNode>,
    aggregate_tx: Arc<watch::Sender<Option<AggregateSnapshot>>>,
    drift: Arc<Mutex<DriftDetector>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        monitor_pass(&registry, &local, &aggregate_tx, &drift).await;
    }

    debug!("Monitor loop stopped");
}

async fn gatekeeper_loop(
    registry: Arc<PeerRegistry>,
    local: watch::Receiver<LocalNode>,
    gatekeeper: Arc<Mutex<ThresholdGatekeeper>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let (_, snapshot) = collect(&registry, &local).await;
        let report = gatekeeper.lock().await.evaluate(&snapshot).await;
        if let Some(pattern) = report.remediation {
            info!(pattern = %pattern, threat_level = ?report.threat_level, "Remediation launched");
        }
    }

    debug!("Gatekeeper loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::codec::StatePacket;
    use crate::mesh::models::{Dimension, DriftDimension, Severity, ThreatLevel};
    use crate::mesh::phase::Phase;

    fn config(id: &str) -> Config {
        let mut config = Config::default();
        config.node.id = id.to_string();
        config.node.initial_coherence = 0.6;
        config.node.initial_presence = 0.6;
        config.phase.seed = Some(1);
        config
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut cfg = config("n");
        cfg.node.id = " ".to_string();
        assert!(matches!(MeshNode::new(cfg), Err(ConfigError::EmptyNodeId)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_before_start() {
        let node = MeshNode::new(config("n1")).unwrap();
        node.registry()
            .upsert(StatePacket::new("p1", Phase::Hold, 0.8, 0.8, "x", 1.0))
            .await;

        let status = node.status().await;
        assert_eq!(status.node_id, "n1");
        assert!(!status.running);
        assert_eq!(status.active_peers, 1);
        assert!((status.collective_coherence - 0.7).abs() < 1e-9);
        assert_eq!(status.threat_level, ThreatLevel::Peaceful);
        assert_eq!(status.stats.discoveries, 1);

        let map = node.status_map().await;
        assert_eq!(map["stats.discoveries"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_remediation_needs_peers() {
        let node = MeshNode::new(config("n1")).unwrap();
        assert!(!node.start_remediation(PatternKind::HarmonicPulse).await);

        node.registry()
            .upsert(StatePacket::new("p1", Phase::Hold, 0.8, 0.8, "x", 1.0))
            .await;
        assert!(node.start_remediation(PatternKind::HarmonicPulse).await);
        assert_eq!(
            node.remediation_status().await.pattern,
            Some(PatternKind::HarmonicPulse)
        );
        node.stop_remediation().await;
        assert_eq!(node.remediation_status().await.pattern, None);
    }

    fn peer(id: &str, coherence: f64) -> StatePacket {
        StatePacket::new(id, Phase::Inhale, coherence, 0.6, "resonance:node", 1.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_is_readable_through_the_node() {
        let node = MeshNode::new(config("n1")).unwrap();
        for id in ["a", "b", "c", "d", "e"] {
            node.registry().upsert(peer(id, 0.6)).await;
        }
        node.registry().upsert(peer("outlier", 0.0)).await;

        let found = node.monitor_now().await;
        assert_eq!(found.len(), 1);

        let recent = node.recent_drift(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].node_id, "outlier");
        assert_eq!(recent[0].dimension, DriftDimension::Coherence);
        assert_eq!(node.drift_score("outlier").await, 1);
        assert_eq!(node.drift_score("a").await, 0);

        node.monitor_now().await;
        assert_eq!(node.drift_score("outlier").await, 2);
        assert_eq!(node.recent_drift(1).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapses_are_readable_through_the_node() {
        let node = MeshNode::new(config("n1")).unwrap();
        assert!(node.collapse_history().await.is_empty());

        node.registry().upsert(peer("a", 0.1)).await;
        node.registry().upsert(peer("b", 0.1)).await;
        let report = node.evaluate_now().await;
        assert_eq!(report.remediation, Some(PatternKind::CoherenceSpiral));

        let history = node.collapse_history().await;
        assert_eq!(history.len(), report.events.len());
        let critical: Vec<_> = history
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].dimension, Dimension::Coherence);
        assert_eq!(critical[0].remediation, Some(PatternKind::CoherenceSpiral));

        let active = node.active_collapses().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].dimension, Dimension::Coherence);

        node.stop_remediation().await;
    }

    #[tokio::test]
    async fn test_stop_ends_running_choreography() {
        let mut cfg = config("n1");
        cfg.gossip.bind_addr = "127.0.0.1".parse().unwrap();
        cfg.gossip.listen_port = 0;
        cfg.gossip.broadcast_targets = vec!["127.0.0.1:9".parse().unwrap()];
        cfg.gossip.read_timeout_ms = 50;

        let mut node = MeshNode::new(cfg).unwrap();
        node.start().await.unwrap();
        node.registry().upsert(peer("a", 0.8)).await;
        assert!(node.start_remediation(PatternKind::HarmonicPulse).await);

        node.stop().await;
        assert!(!node.choreography().is_running().await);
        assert_eq!(node.remediation_status().await.pattern, None);

        let reports = node.choreography().reports().await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].completed);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut cfg = config("n1");
        cfg.gossip.bind_addr = "127.0.0.1".parse().unwrap();
        cfg.gossip.listen_port = 0;
        cfg.gossip.broadcast_targets = vec!["127.0.0.1:9".parse().unwrap()];
        cfg.gossip.read_timeout_ms = 50;

        let mut node = MeshNode::new(cfg).unwrap();
        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.local_addr().is_some());
        assert!(node.start().await.is_err());

        node.stop().await;
        assert!(!node.is_running());
        node.stop().await;
    }
}
