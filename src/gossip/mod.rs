//! Gossip layer
//!
//! Wire codec for state packets and the UDP transport that broadcasts and
//! receives them.

pub mod codec;
pub mod transport;

pub use codec::{decode, encode, DecodeError, EncodeError, StatePacket, MAX_PACKET_SIZE};
pub use transport::GossipTransport;
