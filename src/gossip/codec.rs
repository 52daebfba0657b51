//! State packet codec - wire format for gossip
//!
//! Packets are flat, versionless MessagePack maps with named fields. The
//! payload map is ordered, so encoding is deterministic. Decoding fails closed:
//! any structural or range problem yields a `DecodeError` and the packet is
//! dropped by the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::mesh::models::{AggregateSnapshot, LocalNode, Position};
use crate::mesh::phase::Phase;

/// Maximum encoded packet size in bytes
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// Deepest container nesting accepted while decoding
pub const MAX_NESTING_DEPTH: usize = 32;

/// Payload keys
pub const KEY_DEVICE_TYPE: &str = "device_type";
pub const KEY_PURPOSE: &str = "purpose";
pub const KEY_POSITION: &str = "position";
pub const KEY_AGGREGATE: &str = "aggregate";

/// One node's state as broadcast on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePacket {
    pub node_id: String,
    pub phase: Phase,
    pub coherence: f64,
    pub presence: f64,
    pub signature: String,
    /// Producer clock, unix seconds
    pub timestamp: f64,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl StatePacket {
    pub fn new(
        node_id: impl Into<String>,
        phase: Phase,
        coherence: f64,
        presence: f64,
        signature: impl Into<String>,
        timestamp: f64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            phase,
            coherence,
            presence,
            signature: signature.into(),
            timestamp,
            payload: BTreeMap::new(),
        }
    }

    /// Packet describing the local node, with the aggregate it currently sees
    pub fn from_local(local: &LocalNode, timestamp: f64, aggregate: Option<&AggregateSnapshot>) -> Self {
        let mut packet = Self::new(
            local.node_id.clone(),
            local.phase,
            local.coherence,
            local.presence,
            local.signature.clone(),
            timestamp,
        );
        packet.insert(KEY_DEVICE_TYPE, serde_json::json!(local.device_type));
        packet.insert(KEY_PURPOSE, serde_json::json!(local.purpose));
        packet.insert(
            KEY_POSITION,
            serde_json::json!([local.position.x, local.position.y]),
        );
        if let Some(agg) = aggregate {
            packet.insert(
                KEY_AGGREGATE,
                serde_json::json!({
                    "coherence": agg.mean_coherence,
                    "presence": agg.mean_presence,
                    "active_peers": agg.active_peers,
                }),
            );
        }
        packet
    }

    pub fn insert(&mut self, key: &str, value: serde_json::Value) {
        self.payload.insert(key.to_string(), value);
    }

    pub fn device_type(&self) -> &str {
        self.payload_str(KEY_DEVICE_TYPE)
    }

    pub fn purpose(&self) -> &str {
        self.payload_str(KEY_PURPOSE)
    }

    /// Advertised position, or one derived from the node id
    pub fn position(&self) -> Position {
        self.payload
            .get(KEY_POSITION)
            .and_then(|v| v.as_array())
            .filter(|a| a.len() == 2)
            .and_then(|a| Some(Position::new(a[0].as_f64()?, a[1].as_f64()?)))
            .filter(|p| p.x.is_finite() && p.y.is_finite())
            .unwrap_or_else(|| Position::from_node_id(&self.node_id))
    }

    fn payload_str(&self, key: &str) -> &str {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
    }
}

/// Why a datagram was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Packet of {0} bytes exceeds limit")]
    Oversized(usize),

    #[error("Invalid field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Encode failed: {0}")]
pub struct EncodeError(String);

/// Serialize a packet to bytes
pub fn encode(packet: &StatePacket) -> Result<Vec<u8>, EncodeError> {
    let bytes = rmp_serde::to_vec_named(packet).map_err(|e| EncodeError(e.to_string()))?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(EncodeError(format!("{} bytes exceeds limit", bytes.len())));
    }
    Ok(bytes)
}

/// Parse and validate a packet
pub fn decode(bytes: &[u8]) -> Result<StatePacket, DecodeError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(DecodeError::Oversized(bytes.len()));
    }
    // Payload values are arbitrary, so nesting is capped before serde recurses
    let mut de = rmp_serde::Deserializer::from_read_ref(bytes);
    de.set_max_depth(MAX_NESTING_DEPTH);
    let packet =
        StatePacket::deserialize(&mut de).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    validate(&packet)?;
    Ok(packet)
}

fn validate(packet: &StatePacket) -> Result<(), DecodeError> {
    if packet.node_id.trim().is_empty() {
        return Err(DecodeError::Invalid {
            field: "node_id",
            reason: "empty".to_string(),
        });
    }
    for (field, value) in [("coherence", packet.coherence), ("presence", packet.presence)] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(DecodeError::Invalid {
                field,
                reason: format!("{} outside [0, 1]", value),
            });
        }
    }
    if !packet.timestamp.is_finite() || packet.timestamp < 0.0 {
        return Err(DecodeError::Invalid {
            field: "timestamp",
            reason: format!("{} is not a valid unix time", packet.timestamp),
        });
    }
    Ok(())
}
