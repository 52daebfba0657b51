//! UDP gossip transport
//!
//! One socket serves both directions: the broadcaster periodically sends the
//! local state to every target, the listener decodes whatever arrives and
//! feeds the peer registry. Delivery is best effort. Nothing is retried and a
//! failed send or receive only gets logged.

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::codec::{self, DecodeError, StatePacket};
use crate::config::GossipConfig;
use crate::mesh::models::{unix_now, AggregateSnapshot, LocalNode, NodeId};
use crate::mesh::registry::PeerRegistry;
use crate::mesh::status::MeshStats;

/// Largest datagram we read; anything above the codec limit is rejected later
const RECV_BUFFER_SIZE: usize = 64 * 1024;

pub struct GossipTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    targets: Vec<SocketAddr>,
    node_id: NodeId,
    stats: Arc<MeshStats>,
}

impl GossipTransport {
    /// Bind the gossip socket with broadcast enabled
    pub async fn bind(
        config: &GossipConfig,
        node_id: NodeId,
        stats: Arc<MeshStats>,
    ) -> anyhow::Result<Self> {
        let addr = config.listen_addr();
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .context("creating gossip socket")?;
        socket.set_send_buffer_size(config.send_buffer_bytes)?;
        socket.set_recv_buffer_size(config.recv_buffer_bytes)?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        socket
            .bind(&addr.into())
            .with_context(|| format!("binding gossip socket to {}", addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;
        let targets = config.targets();

        info!(
            addr = %local_addr,
            targets = ?targets,
            sndbuf = config.send_buffer_bytes,
            rcvbuf = config.recv_buffer_bytes,
            "Gossip transport bound"
        );

        Ok(Self {
            socket,
            local_addr,
            targets,
            node_id,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    /// Send one encoded packet to every target. Returns how many sends succeeded.
    pub async fn send_state(&self, bytes: &[u8]) -> usize {
        let mut sent = 0;
        for target in &self.targets {
            match self.socket.send_to(bytes, target).await {
                Ok(_) => {
                    self.stats.record_sent();
                    sent += 1;
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "Gossip send failed");
                }
            }
        }
        sent
    }

    /// Decode a datagram and hand it to the registry.
    ///
    /// Returns whether the packet was accepted; our own packets are ignored.
    pub async fn handle_datagram(
        &self,
        bytes: &[u8],
        from: SocketAddr,
        registry: &PeerRegistry,
    ) -> Result<bool, DecodeError> {
        let packet = match codec::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.record_dropped();
                debug!(from = %from, len = bytes.len(), error = %e, "Dropped gossip packet");
                return Err(e);
            }
        };

        if packet.node_id == self.node_id {
            self.stats.record_self_dropped();
            trace!(from = %from, "Ignoring own packet");
            return Ok(false);
        }

        self.stats.record_received();
        trace!(from = %from, node_id = %packet.node_id, "Gossip packet received");
        registry.upsert(packet).await;
        Ok(true)
    }

    /// Periodically broadcast the local node until shutdown
    pub async fn run_broadcaster(
        self: Arc<Self>,
        local: watch::Receiver<LocalNode>,
        aggregate: watch::Receiver<Option<AggregateSnapshot>>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Outgoing timestamps never go backwards, even if the wall clock does
        let mut last_timestamp = 0.0_f64;

        info!(interval_ms = every.as_millis() as u64, "Gossip broadcaster started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let timestamp = unix_now().max(last_timestamp);
            last_timestamp = timestamp;

            let node = local.borrow().clone();
            let snapshot = aggregate.borrow().clone();
            let packet = StatePacket::from_local(&node, timestamp, snapshot.as_ref());

            match codec::encode(&packet) {
                Ok(bytes) => {
                    let sent = self.send_state(&bytes).await;
                    trace!(
                        phase = %node.phase,
                        coherence = node.coherence,
                        presence = node.presence,
                        bytes = bytes.len(),
                        sent,
                        "State broadcast"
                    );
                }
                Err(e) => warn!(error = %e, "Failed to encode local state"),
            }
        }

        info!("Gossip broadcaster stopped");
    }

    /// Receive packets until shutdown. Each read is bounded by `read_timeout`
    /// so shutdown is observed promptly.
    pub async fn run_listener(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        read_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        info!(addr = %self.local_addr, "Gossip listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                received = timeout(read_timeout, self.socket.recv_from(&mut buf)) => {
                    match received {
                        Err(_) => continue,
                        Ok(Ok((len, from))) => {
                            let _ = self.handle_datagram(&buf[..len], from, &registry).await;
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "Gossip receive failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Gossip listener stopped");
    }
}
