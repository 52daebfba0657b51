//! Local node agent
//!
//! Owns this process's `LocalNode`: advances the phase cycle on a fixed tick,
//! counts breaths, and moves coherence/presence by a bounded random walk. The
//! walk is the only thing that ever changes the local metrics; a running
//! choreography can bias its direction through a steering target but cannot
//! write the values.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::models::{emit, EventSender, LocalNode, MeshEvent, Position};
use super::phase::{Phase, PhaseCycle};
use super::status::MeshStats;
use crate::config::{Config, ConfigError};

/// Metrics a choreography wants the local walk to drift toward
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SteeringTarget {
    pub coherence: f64,
    pub presence: f64,
}

pub struct LocalAgent {
    node: LocalNode,
    cycle: PhaseCycle,
    tick: Duration,
    walk_step: f64,
    rng: StdRng,
    origin: Instant,
    state_tx: watch::Sender<LocalNode>,
    steering: watch::Receiver<Option<SteeringTarget>>,
    events: EventSender,
    stats: Arc<MeshStats>,
}

impl LocalAgent {
    pub fn new(
        config: &Config,
        steering: watch::Receiver<Option<SteeringTarget>>,
        events: EventSender,
        stats: Arc<MeshStats>,
    ) -> Result<Self, ConfigError> {
        let cycle = config.phase.cycle()?;
        let node_cfg = &config.node;

        let node = LocalNode {
            node_id: node_cfg.id.clone(),
            device_type: node_cfg.device_type.clone(),
            purpose: node_cfg.purpose.clone(),
            phase: Phase::Inhale,
            coherence: node_cfg.initial_coherence.clamp(0.0, 1.0),
            presence: node_cfg.initial_presence.clamp(0.0, 1.0),
            signature: node_cfg.signature(),
            position: node_cfg
                .position
                .map(|[x, y]| Position::new(x, y))
                .unwrap_or_else(|| Position::from_node_id(&node_cfg.id)),
            breaths: 0,
        };

        let rng = match config.phase.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (state_tx, _) = watch::channel(node.clone());

        Ok(Self {
            node,
            cycle,
            tick: config.phase.tick(),
            walk_step: config.phase.walk_step,
            rng,
            origin: Instant::now(),
            state_tx,
            steering,
            events,
            stats,
        })
    }

    /// Read-only handle on the local node; every read is a copy
    pub fn subscribe(&self) -> watch::Receiver<LocalNode> {
        self.state_tx.subscribe()
    }

    pub fn node(&self) -> &LocalNode {
        &self.node
    }

    /// Advance to `now`: recompute the phase, then take one walk step.
    pub fn tick(&mut self, now: Instant) {
        let phase = self.cycle.phase_at(now.duration_since(self.origin));
        if phase != self.node.phase {
            let from = self.node.phase;
            self.node.phase = phase;
            if phase == Phase::Inhale {
                self.node.breaths += 1;
                self.stats.record_breath();
            }
            debug!(from = %from, to = %phase, breaths = self.node.breaths, "Phase transition");
            emit(
                &self.events,
                MeshEvent::PhaseTransition {
                    from,
                    to: phase,
                    breaths: self.node.breaths,
                },
            );
        }

        let target = *self.steering.borrow();
        self.node.coherence = self.walk(self.node.coherence, target.map(|t| t.coherence));
        self.node.presence = self.walk(self.node.presence, target.map(|t| t.presence));
        trace!(
            coherence = self.node.coherence,
            presence = self.node.presence,
            "Local walk step"
        );

        self.state_tx.send_replace(self.node.clone());
    }

    /// One bounded step. With a target the step's mean leans toward it.
    fn walk(&mut self, value: f64, target: Option<f64>) -> f64 {
        let step = self.walk_step;
        if step <= 0.0 {
            return value;
        }
        let noise = self.rng.gen_range(-step..=step);
        let delta = match target {
            Some(t) => (noise / 2.0 + (t - value).clamp(-step, step) / 2.0).clamp(-step, step),
            None => noise,
        };
        (value + delta).clamp(0.0, 1.0)
    }

    /// Tick until shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            node_id = %self.node.node_id,
            cycle_secs = self.cycle.total().as_secs_f64(),
            "Local agent started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.tick(Instant::now()),
                _ = shutdown.changed() => break,
            }
        }

        info!(node_id = %self.node.node_id, breaths = self.node.breaths, "Local agent stopped");
    }
}
