//! coherence-node: decentralized node-coherence mesh
//!
//! Every node runs a breathing phase cycle, gossips its state over UDP,
//! folds what it hears into a collective snapshot and, when that snapshot
//! collapses below a threshold, launches a timed choreography across its
//! peers.

pub mod config;
pub mod gossip;
pub mod mesh;

pub use config::{Config, ConfigError};
pub use mesh::choreography::{ChoreographyError, RemediationStatus, Remediator};
pub use mesh::models::{AggregateSnapshot, MeshEvent};
pub use mesh::patterns::PatternKind;
pub use mesh::phase::Phase;
pub use mesh::status::StatusSnapshot;
pub use mesh::MeshNode;
