//! Config loading and defaults integration tests

use std::io::Write;
use std::time::Duration;

use coherence_node::config::{Config, ConfigError};
use coherence_node::mesh::models::Dimension;

#[test]
fn test_minimal_config_uses_defaults() {
    let config: Config = toml::from_str(
        r#"
[node]
id = "test-node"
"#,
    )
    .expect("valid TOML");

    assert_eq!(config.node.id, "test-node");
    assert_eq!(config.node.signature(), "resonance:node");
    assert_eq!(config.gossip.listen_port, 7770);
    assert_eq!(config.gossip.broadcast_interval(), Duration::from_secs(5));
    assert_eq!(config.registry.peer_timeout(), Duration::from_secs(30));
    assert_eq!(config.gatekeeper.recovery_cooldown(), Duration::from_secs(30));
    assert_eq!(config.gatekeeper.thresholds.coherence.critical, 0.3);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_with_all_sections() {
    let config: Config = toml::from_str(
        r#"
[node]
id = "garden-pi-1"
device_type = "pi"
purpose = "anchor"
signature = "anchor:garden"
initial_coherence = 0.7
initial_presence = 0.65
position = [0.5, -0.5]

[phase]
inhale_secs = 1.0
hold_secs = 1.0
exhale_secs = 2.0
caesura_secs = 0.5
echo_secs = 0.5
seed = 42

[gossip]
bind_addr = "127.0.0.1"
listen_port = 9000
broadcast_targets = ["127.0.0.1:9001", "127.0.0.1:9002"]
broadcast_interval_ms = 1000

[registry]
peer_timeout_secs = 10

[drift]
coherence_threshold = 0.1

[gatekeeper]
recovery_cooldown_secs = 60

[gatekeeper.thresholds.presence]
critical = 0.2
warning = 0.4
recovery = 0.6

[choreography]
node_activation_delay_ms = 500
"#,
    )
    .expect("valid TOML");

    assert!(config.validate().is_ok());
    assert_eq!(config.node.signature(), "anchor:garden");
    assert_eq!(config.node.position, Some([0.5, -0.5]));
    assert_eq!(config.phase.seed, Some(42));
    assert_eq!(config.phase.cycle().unwrap().total(), Duration::from_secs(5));
    assert_eq!(
        config.gossip.targets(),
        vec![
            "127.0.0.1:9001".parse().unwrap(),
            "127.0.0.1:9002".parse().unwrap()
        ]
    );
    assert_eq!(config.gatekeeper.thresholds.presence.critical, 0.2);
    // Untouched tiers keep their defaults
    assert_eq!(config.gatekeeper.thresholds.resonance.critical, 0.35);
    assert_eq!(
        config.choreography.node_activation_delay(),
        Duration::from_millis(500)
    );
}

#[test]
fn test_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[node]
id = "file-node"

[monitor]
interval_ms = 500
"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.node.id, "file-node");
    assert_eq!(config.monitor.interval(), Duration::from_millis(500));
}

#[test]
fn test_from_file_rejects_invalid_values() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[node]
id = "bad"

[phase]
hold_secs = -1.0
"#
    )
    .unwrap();

    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::from_file(dir.path().join("absent.toml"));
    assert!(result.is_err());
}

#[test]
fn test_unordered_tiers_are_rejected() {
    let config: Config = toml::from_str(
        r#"
[node]
id = "n"

[gatekeeper.thresholds.signature_coherence]
critical = 0.5
warning = 0.5
recovery = 0.7
"#,
    )
    .unwrap();

    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidThreshold {
            dimension: Dimension::SignatureCoherence,
            ..
        })
    ));
}
