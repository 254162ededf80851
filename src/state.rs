//! Connection lifecycle states.
//!
//! Data transfer itself is made of self-contained sessions (see
//! [`crate::sender`] and [`crate::receiver`]), so the connection only tracks
//! whether a peer has been agreed on.
//!
//! ```text
//!  Closed ──connect──▶ SynSent ──SYN-ACK──▶ Established
//!  Closed ──accept───▶ Listen ──SYN, ACK──▶ Established
//!  Established ──peer FIN──▶ Closed
//! ```

/// All possible states of a [`crate::connection::Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No peer agreed on; initial state.
    #[default]
    Closed,
    /// Waiting for a SYN.
    Listen,
    /// SYN sent; waiting for SYN-ACK.
    SynSent,
    /// Handshake complete.
    Established,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
