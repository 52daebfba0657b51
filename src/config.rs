//! Node configuration
//!
//! Every knob of the mesh is a construction-time value. The daemon loads this
//! tree from TOML; library users build it in code. `validate()` rejects values
//! that would break an invariant before any loop is started.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::mesh::gatekeeper::ThresholdTable;
use crate::mesh::models::Dimension;
use crate::mesh::patterns::PatternTable;
use crate::mesh::phase::PhaseCycle;

/// Upper bound on the spacing between choreography activations
pub const MAX_ACTIVATION_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub phase: PhaseConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub gatekeeper: GatekeeperConfig,
    #[serde(default)]
    pub choreography: ChoreographyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Device class advertised to peers
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Role of this node in the mesh
    #[serde(default = "default_purpose")]
    pub purpose: String,

    /// Signature string; defaults to "<purpose>:<device_type>"
    #[serde(default)]
    pub signature: Option<String>,

    /// Starting coherence, in [0, 1]
    #[serde(default = "default_initial_metric")]
    pub initial_coherence: f64,

    /// Starting presence, in [0, 1]
    #[serde(default = "default_initial_metric")]
    pub initial_presence: f64,

    /// Advertised mesh position; derived from the node id when unset
    #[serde(default)]
    pub position: Option<[f64; 2]>,

    /// Upper bound on joining all loops during stop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl NodeConfig {
    pub fn signature(&self) -> String {
        self.signature
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.purpose, self.device_type))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            device_type: default_device_type(),
            purpose: default_purpose(),
            signature: None,
            initial_coherence: default_initial_metric(),
            initial_presence: default_initial_metric(),
            position: None,
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Phase cycle and local random walk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default = "default_inhale")]
    pub inhale_secs: f64,
    #[serde(default = "default_hold")]
    pub hold_secs: f64,
    #[serde(default = "default_exhale")]
    pub exhale_secs: f64,
    #[serde(default = "default_caesura")]
    pub caesura_secs: f64,
    #[serde(default = "default_echo")]
    pub echo_secs: f64,

    /// Phase recomputation tick
    #[serde(default = "default_phase_tick")]
    pub tick_ms: u64,

    /// Maximum per-tick change of coherence/presence
    #[serde(default = "default_walk_step")]
    pub walk_step: f64,

    /// Fixed RNG seed (reproducible walks)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl PhaseConfig {
    pub fn cycle(&self) -> Result<PhaseCycle, ConfigError> {
        PhaseCycle::new([
            self.inhale_secs,
            self.hold_secs,
            self.exhale_secs,
            self.caesura_secs,
            self.echo_secs,
        ])
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            inhale_secs: default_inhale(),
            hold_secs: default_hold(),
            exhale_secs: default_exhale(),
            caesura_secs: default_caesura(),
            echo_secs: default_echo(),
            tick_ms: default_phase_tick(),
            walk_step: default_walk_step(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Local address the listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port the listener binds
    #[serde(default = "default_gossip_port")]
    pub listen_port: u16,

    /// Port broadcasts are sent to
    #[serde(default = "default_gossip_port")]
    pub broadcast_port: u16,

    /// Broadcast interval in milliseconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,

    /// Explicit send targets; empty means the limited broadcast address
    #[serde(default)]
    pub broadcast_targets: Vec<SocketAddr>,

    /// Bound on a single socket read, so shutdown is observed promptly
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Socket send buffer in bytes
    #[serde(default = "default_socket_buffer")]
    pub send_buffer_bytes: usize,

    /// Socket receive buffer in bytes
    #[serde(default = "default_socket_buffer")]
    pub recv_buffer_bytes: usize,
}

impl GossipConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.listen_port)
    }

    /// Addresses each broadcast is sent to
    pub fn targets(&self) -> Vec<SocketAddr> {
        if self.broadcast_targets.is_empty() {
            vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                self.broadcast_port,
            )]
        } else {
            self.broadcast_targets.clone()
        }
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            listen_port: default_gossip_port(),
            broadcast_port: default_gossip_port(),
            broadcast_interval_ms: default_broadcast_interval(),
            broadcast_targets: vec![],
            read_timeout_ms: default_read_timeout(),
            send_buffer_bytes: default_socket_buffer(),
            recv_buffer_bytes: default_socket_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Peers silent for longer than this are inactive and evicted
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
}

impl RegistryConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            peer_timeout_secs: default_peer_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Eviction + drift detection interval
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_coherence_drift")]
    pub coherence_threshold: f64,
    #[serde(default = "default_presence_drift")]
    pub presence_threshold: f64,
    /// Drift events retained for observability
    #[serde(default = "default_drift_history")]
    pub history_size: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            coherence_threshold: default_coherence_drift(),
            presence_threshold: default_presence_drift(),
            history_size: default_drift_history(),
        }
    }
}

/// Three ordered tiers of a monitored dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub critical: f64,
    pub warning: f64,
    pub recovery: f64,
}

impl TierConfig {
    pub const fn new(critical: f64, warning: f64, recovery: f64) -> Self {
        Self {
            critical,
            warning,
            recovery,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_coherence_tiers")]
    pub coherence: TierConfig,
    #[serde(default = "default_presence_tiers")]
    pub presence: TierConfig,
    #[serde(default = "default_resonance_tiers")]
    pub resonance: TierConfig,
    #[serde(default = "default_phase_sync_tiers")]
    pub phase_synchrony: TierConfig,
    #[serde(default = "default_signature_tiers")]
    pub signature_coherence: TierConfig,
}

impl ThresholdsConfig {
    pub fn tiers(&self, dimension: Dimension) -> TierConfig {
        match dimension {
            Dimension::Coherence => self.coherence,
            Dimension::Presence => self.presence,
            Dimension::Resonance => self.resonance,
            Dimension::PhaseSynchrony => self.phase_synchrony,
            Dimension::SignatureCoherence => self.signature_coherence,
        }
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            coherence: default_coherence_tiers(),
            presence: default_presence_tiers(),
            resonance: default_resonance_tiers(),
            phase_synchrony: default_phase_sync_tiers(),
            signature_coherence: default_signature_tiers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,

    /// Minimum time between two remediation starts, across all thresholds
    #[serde(default = "default_recovery_cooldown")]
    pub recovery_cooldown_secs: u64,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,
}

impl GatekeeperConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_evaluation_interval(),
            recovery_cooldown_secs: default_recovery_cooldown(),
            thresholds: ThresholdsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoreographyConfig {
    #[serde(default = "default_choreography_tick")]
    pub tick_ms: u64,

    /// Spacing between consecutive peer activations
    #[serde(default = "default_activation_delay")]
    pub node_activation_delay_ms: u64,

    /// Aggregate coherence above which a progress sample counts as a peak
    #[serde(default = "default_peak_coherence")]
    pub peak_coherence: f64,
}

impl ChoreographyConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn node_activation_delay(&self) -> Duration {
        Duration::from_millis(self.node_activation_delay_ms)
    }
}

impl Default for ChoreographyConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_choreography_tick(),
            node_activation_delay_ms: default_activation_delay(),
            peak_coherence: default_peak_coherence(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check construction-time invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        check_unit("node.initial_coherence", self.node.initial_coherence)?;
        check_unit("node.initial_presence", self.node.initial_presence)?;
        check_unit("phase.walk_step", self.phase.walk_step)?;
        check_unit("drift.coherence_threshold", self.drift.coherence_threshold)?;
        check_unit("drift.presence_threshold", self.drift.presence_threshold)?;
        check_unit("choreography.peak_coherence", self.choreography.peak_coherence)?;

        self.phase.cycle()?;

        let intervals = [
            ("phase.tick_ms", self.phase.tick_ms),
            ("gossip.broadcast_interval_ms", self.gossip.broadcast_interval_ms),
            ("gossip.read_timeout_ms", self.gossip.read_timeout_ms),
            ("registry.peer_timeout_secs", self.registry.peer_timeout_secs),
            ("monitor.interval_ms", self.monitor.interval_ms),
            (
                "gatekeeper.evaluation_interval_secs",
                self.gatekeeper.evaluation_interval_secs,
            ),
            ("choreography.tick_ms", self.choreography.tick_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.drift.history_size == 0 {
            return Err(ConfigError::ZeroInterval("drift.history_size"));
        }
        if self.choreography.node_activation_delay_ms > MAX_ACTIVATION_DELAY_MS {
            return Err(ConfigError::AboveLimit {
                name: "choreography.node_activation_delay_ms",
                value: self.choreography.node_activation_delay_ms,
                max: MAX_ACTIVATION_DELAY_MS,
            });
        }

        ThresholdTable::from_config(&self.gatekeeper.thresholds)?;
        PatternTable::standard().validate()?;
        Ok(())
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Node id must not be empty")]
    EmptyNodeId,

    #[error("{name} must lie in [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f64 },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("{name} must be at most {max}, got {value}")]
    AboveLimit { name: &'static str, value: u64, max: u64 },

    #[error("Phase {phase} has invalid duration {secs}s")]
    InvalidPhaseDuration { phase: &'static str, secs: f64 },

    #[error("Threshold {dimension} is invalid: {reason}")]
    InvalidThreshold { dimension: Dimension, reason: String },

    #[error("Pattern {pattern} is invalid: {reason}")]
    InvalidPattern { pattern: &'static str, reason: String },
}

// Defaults
fn default_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
fn default_device_type() -> String { "node".to_string() }
fn default_purpose() -> String { "resonance".to_string() }
fn default_initial_metric() -> f64 { 0.8 }
fn default_shutdown_timeout() -> u64 { 5000 }
fn default_inhale() -> f64 { 2.0 }
fn default_hold() -> f64 { 3.0 }
fn default_exhale() -> f64 { 4.0 }
fn default_caesura() -> f64 { 1.0 }
fn default_echo() -> f64 { 2.0 }
fn default_phase_tick() -> u64 { 100 }
fn default_walk_step() -> f64 { 0.02 }
fn default_bind_addr() -> IpAddr { IpAddr::V4(Ipv4Addr::UNSPECIFIED) }
fn default_gossip_port() -> u16 { 7770 }
fn default_broadcast_interval() -> u64 { 5000 }
fn default_read_timeout() -> u64 { 1000 }
fn default_socket_buffer() -> usize { 256 * 1024 }
fn default_peer_timeout() -> u64 { 30 }
fn default_monitor_interval() -> u64 { 2000 }
fn default_coherence_drift() -> f64 { 0.15 }
fn default_presence_drift() -> f64 { 0.20 }
fn default_drift_history() -> usize { 100 }
fn default_evaluation_interval() -> u64 { 5 }
fn default_recovery_cooldown() -> u64 { 30 }
fn default_coherence_tiers() -> TierConfig { TierConfig::new(0.3, 0.5, 0.7) }
fn default_presence_tiers() -> TierConfig { TierConfig::new(0.4, 0.6, 0.8) }
fn default_resonance_tiers() -> TierConfig { TierConfig::new(0.35, 0.55, 0.75) }
fn default_phase_sync_tiers() -> TierConfig { TierConfig::new(0.25, 0.45, 0.65) }
fn default_signature_tiers() -> TierConfig { TierConfig::new(0.3, 0.5, 0.7) }
fn default_choreography_tick() -> u64 { 100 }
fn default_activation_delay() -> u64 { 2000 }
fn default_peak_coherence() -> f64 { 0.95 }
