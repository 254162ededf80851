//! Per-session sequencing state.
//!
//! Each top-level operation (`connect`, `accept`, `send`, `recv`, `close`)
//! builds a fresh [`SessionState`] and drops it when the operation returns.
//! The session identifier plays the role of an initial sequence number:
//! every segment's `seq_num` is `identifier + offset`, in 16-bit wrap-around
//! arithmetic, so that retransmissions from an earlier session do not line
//! up with the current one.

use std::net::SocketAddr;

use rand::Rng;

use crate::config::TransportConfig;
use crate::timer::RetransmitTimer;

/// A freshly drawn random session identifier.
pub fn random_session_id() -> u16 {
    rand::rng().random()
}

/// `true` when `a` is at or after `b` in 16-bit sequence space.
///
/// Valid as long as the two numbers are less than half the space apart.
#[inline]
pub fn seq_ge(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) < 0x8000
}

/// Mutable fields of one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Address of the remote end, once known.
    pub peer: Option<SocketAddr>,
    /// Locally chosen identifier (`random_number`).
    pub random_number: u16,
    /// The remote end's identifier for the data flowing toward us.
    pub peer_base: Option<u16>,
    /// Bytes cumulatively acknowledged (sending) or received (receiving).
    message_pointer: usize,
    pub retransmit_timer: RetransmitTimer,
}

impl SessionState {
    /// A session with a random identifier.
    pub fn new(peer: Option<SocketAddr>, config: &TransportConfig) -> Self {
        Self::with_id(peer, random_session_id(), config)
    }

    pub fn with_id(peer: Option<SocketAddr>, random_number: u16, config: &TransportConfig) -> Self {
        Self {
            peer,
            random_number,
            peer_base: None,
            message_pointer: 0,
            retransmit_timer: RetransmitTimer::new(config),
        }
    }

    /// Start tracking a new remote session, restarting the cursor.
    pub fn adopt_peer(&mut self, peer: SocketAddr, base: u16) {
        self.peer = Some(peer);
        self.peer_base = Some(base);
        self.message_pointer = 0;
    }

    pub fn message_pointer(&self) -> usize {
        self.message_pointer
    }

    /// Move the cursor forward by `len` bytes.
    pub fn advance(&mut self, len: usize) {
        self.message_pointer += len;
    }

    /// `true` when `addr` is the session's peer.  Before a peer is known
    /// every address matches.
    pub fn is_peer(&self, addr: SocketAddr) -> bool {
        self.peer.map_or(true, |peer| peer == addr)
    }

    /// Our own sequence number `offset` bytes into the session.
    pub fn seq_at(&self, offset: usize) -> u16 {
        self.random_number.wrapping_add(offset as u16)
    }

    /// The cursor folded into 16-bit sequence space.
    pub fn wrapped_pointer(&self) -> u16 {
        self.message_pointer as u16
    }

    /// Position of an inbound segment relative to the tracked peer session.
    pub fn peer_offset(&self, seq: u16) -> Option<u16> {
        self.peer_base.map(|base| seq.wrapping_sub(base))
    }

    /// Cumulative acknowledgement for the tracked peer session.
    pub fn peer_ack(&self) -> Option<u16> {
        self.peer_base
            .map(|base| base.wrapping_add(self.wrapped_pointer()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn seq_ge_wraps() {
        assert!(seq_ge(5, 5));
        assert!(seq_ge(6, 5));
        assert!(!seq_ge(4, 5));
        assert!(seq_ge(2, 65_530));
        assert!(!seq_ge(65_530, 2));
    }

    #[test]
    fn sequence_numbers_wrap_from_identifier() {
        let s = SessionState::with_id(None, 65_534, &TransportConfig::default());
        assert_eq!(s.seq_at(0), 65_534);
        assert_eq!(s.seq_at(3), 1);
    }

    #[test]
    fn adopting_resets_pointer() {
        let config = TransportConfig::default();
        let mut s = SessionState::with_id(None, 10, &config);
        s.advance(7);
        assert_eq!(s.message_pointer(), 7);
        s.adopt_peer(addr(9000), 500);
        assert_eq!(s.message_pointer(), 0);
        assert_eq!(s.peer_ack(), Some(500));
    }

    #[test]
    fn peer_offsets_are_relative_to_base() {
        let mut s = SessionState::with_id(None, 0, &TransportConfig::default());
        assert_eq!(s.peer_offset(7), None);
        s.adopt_peer(addr(1), 65_535);
        assert_eq!(s.peer_offset(65_535), Some(0));
        assert_eq!(s.peer_offset(2), Some(3));
        s.advance(3);
        assert_eq!(s.peer_ack(), Some(2));
    }

    #[test]
    fn unknown_peer_matches_anyone() {
        let mut s = SessionState::with_id(None, 0, &TransportConfig::default());
        assert!(s.is_peer(addr(1)));
        s.adopt_peer(addr(2), 0);
        assert!(!s.is_peer(addr(1)));
        assert!(s.is_peer(addr(2)));
    }
}
