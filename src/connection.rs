//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the socket and the little state that outlives a
//! single operation: the agreed peer, the sequence numbers exchanged during
//! the handshake, and the base of the last completed inbound session.
//!
//! Every operation is a state machine run (see [`crate::fsm`]) over an
//! operation-specific context:
//! - [`Connection::connect`] / [`Connection::accept`]: [`crate::handshake`]
//! - [`Connection::send`]: [`crate::sender`]
//! - [`Connection::recv`]: [`crate::receiver`]
//! - [`Connection::close`]: [`crate::teardown`]
//!
//! Contexts borrow nothing from the connection: each takes a [`Link`] (a
//! shared handle to the socket plus the one-datagram push-back slot) and
//! hands it back when the run finishes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::TransportConfig;
use crate::fsm::FsmError;
use crate::packet::{Packet, PacketError};
use crate::socket::{Recv, Socket, SocketError};
use crate::state::ConnectionState;

/// Errors surfaced by connection operations.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// The handshake did not complete within the disconnect timeout.
    #[error("handshake with {peer} did not complete within {after:?}")]
    HandshakeFailed { peer: SocketAddr, after: Duration },
    /// A chunk stayed unacknowledged for longer than the disconnect timeout.
    #[error("peer stopped acknowledging after {0:?}")]
    DisconnectTimeout(Duration),
    /// The peer rejected the session.
    #[error("connection reset by peer")]
    Reset,
    /// The operation needs a peer address and none is known.
    #[error("no peer address; connect or accept first")]
    NotConnected,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Socket handle plus a single-datagram push-back slot.
pub(crate) struct Link {
    socket: Arc<Socket>,
    pending: Option<(Packet, SocketAddr)>,
}

impl Link {
    pub(crate) async fn send(&self, packet: &Packet, dest: SocketAddr) -> Result<(), ConnError> {
        log::debug!("[link] → {dest} {packet}");
        self.socket.send_to(packet, dest).await?;
        Ok(())
    }

    /// Next datagram, or [`Recv::TimedOut`] once `wait` elapses.
    ///
    /// `None` waits forever.  A pushed-back datagram is returned first.
    pub(crate) async fn recv(&mut self, wait: Option<Duration>) -> Result<Recv, ConnError> {
        if let Some((packet, addr)) = self.pending.take() {
            return Ok(Recv::Datagram(packet, addr));
        }
        let got = match wait {
            Some(wait) => self.socket.recv_timeout(wait).await?,
            None => {
                let (packet, addr) = self.socket.recv_from().await?;
                Recv::Datagram(packet, addr)
            }
        };
        if let Recv::Datagram(packet, addr) = &got {
            log::debug!("[link] ← {addr} {packet}");
        }
        Ok(got)
    }

    /// Hold `packet` for the next [`Link::recv`].
    pub(crate) fn push_back(&mut self, packet: Packet, addr: SocketAddr) {
        self.pending = Some((packet, addr));
    }

    /// Throw away datagrams still queued from a finished session.
    pub(crate) fn flush(&self) {
        let dropped = self.socket.drain();
        if dropped > 0 {
            log::debug!("[link] flushed {dropped} stray datagram(s)");
        }
    }
}

/// A reliable connection over one UDP socket.
#[derive(Debug)]
pub struct Connection {
    /// Current lifecycle state.
    pub state: ConnectionState,
    socket: Arc<Socket>,
    config: TransportConfig,
    peer: Option<SocketAddr>,
    /// Our next sequence number after the handshake.
    local_seq: u16,
    /// The peer's next sequence number after the handshake.
    peer_seq: u16,
    /// Base of the last inbound session that completed.
    prev_random_number: Option<u16>,
    pending: Option<(Packet, SocketAddr)>,
}

impl Connection {
    /// Bind a UDP socket to `local_addr` and wrap it.
    pub async fn bind(local_addr: SocketAddr, config: TransportConfig) -> Result<Self, ConnError> {
        config.validate().map_err(ConnError::Config)?;
        let socket = Socket::bind_with_buffer(local_addr, config.buffer_size).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: Socket, config: TransportConfig) -> Self {
        Self {
            state: ConnectionState::Closed,
            socket: Arc::new(socket),
            config,
            peer: None,
            local_seq: 0,
            peer_seq: 0,
            prev_random_number: None,
            pending: None,
        }
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// The agreed peer, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Talk to `peer` without a handshake.
    ///
    /// Sessions started by [`Connection::send`] carry their own SYN, so a
    /// handshake is not required for data transfer.
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn local_seq(&self) -> u16 {
        self.local_seq
    }

    pub fn peer_seq(&self) -> u16 {
        self.peer_seq
    }

    /// Base of the last inbound session that completed.
    pub fn prev_random_number(&self) -> Option<u16> {
        self.prev_random_number
    }

    pub(crate) fn take_link(&mut self) -> Link {
        Link {
            socket: Arc::clone(&self.socket),
            pending: self.pending.take(),
        }
    }

    pub(crate) fn restore_link(&mut self, link: Link) {
        self.pending = link.pending;
    }

    pub(crate) fn established(&mut self, peer: SocketAddr, local_seq: u16, peer_seq: u16) {
        self.peer = Some(peer);
        self.local_seq = local_seq;
        self.peer_seq = peer_seq;
        self.state = ConnectionState::Established;
    }

    pub(crate) fn remember_session(&mut self, base: u16) {
        self.prev_random_number = Some(base);
    }
}
