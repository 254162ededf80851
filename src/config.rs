//! Tunable transport parameters.

use std::time::Duration;

use crate::packet::HEADER_LEN;

/// Timeout, retry and segmentation knobs for one [`crate::connection::Connection`].
///
/// The defaults favour a loopback or LAN peer; raise `disconnect_timeout` for
/// links with heavy loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportConfig {
    /// Retransmit timeout before any RTT sample, and the floor it never
    /// shrinks below.
    pub initial_rto: Duration,
    /// Upper bound on the retransmit timeout, on how long one chunk may stay
    /// unacknowledged, and on handshake/teardown exchanges.
    pub disconnect_timeout: Duration,
    /// Multiplier applied to the retransmit timeout after each timeout.
    pub backoff: f64,
    /// Retransmissions of a FIN before giving up on its acknowledgement.
    pub max_fin_retries: u32,
    /// Payload bytes per data segment.
    pub chunk_size: usize,
    /// How long a sender keeps re-acknowledging the peer's FIN after a send.
    pub linger: Duration,
    /// Receive buffer size; larger datagrams are truncated.
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let initial_rto = Duration::from_millis(100);
        Self {
            initial_rto,
            disconnect_timeout: Duration::from_secs(5),
            backoff: 1.5,
            max_fin_retries: 5,
            chunk_size: 1,
            linger: initial_rto * 2,
            buffer_size: 1024,
        }
    }
}

impl TransportConfig {
    pub fn with_initial_rto(mut self, rto: Duration) -> Self {
        self.initial_rto = rto;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, factor: f64) -> Self {
        self.backoff = factor;
        self
    }

    pub fn with_max_fin_retries(mut self, retries: u32) -> Self {
        self.max_fin_retries = retries;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Check the knobs for combinations the protocol cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_rto.is_zero() {
            return Err("initial_rto must be positive".into());
        }
        if self.disconnect_timeout < self.initial_rto {
            return Err(format!(
                "disconnect_timeout ({:?}) is shorter than initial_rto ({:?})",
                self.disconnect_timeout, self.initial_rto
            ));
        }
        if !(self.backoff >= 1.0) {
            return Err(format!("backoff must be at least 1.0, got {}", self.backoff));
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1".into());
        }
        // Sequence numbers are 16 bits wide; a chunk must not lap them.
        if self.chunk_size > u16::MAX as usize / 2 {
            return Err(format!("chunk_size {} exceeds {}", self.chunk_size, u16::MAX / 2));
        }
        if self.buffer_size < HEADER_LEN + self.chunk_size {
            return Err(format!(
                "buffer_size {} cannot hold a {}-byte header plus a {}-byte chunk",
                self.buffer_size, HEADER_LEN, self.chunk_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(TransportConfig::default().validate(), Ok(()));
    }

    #[test]
    fn builder_overrides_fields() {
        let config = TransportConfig::default()
            .with_initial_rto(Duration::from_millis(20))
            .with_disconnect_timeout(Duration::from_secs(30))
            .with_chunk_size(8);
        assert_eq!(config.initial_rto, Duration::from_millis(20));
        assert_eq!(config.disconnect_timeout, Duration::from_secs(30));
        assert_eq!(config.chunk_size, 8);
        assert_eq!(config.max_fin_retries, 5);
    }

    #[test]
    fn rejects_chunks_that_do_not_fit_the_buffer() {
        let config = TransportConfig::default()
            .with_buffer_size(16)
            .with_chunk_size(12);
        assert!(config.validate().unwrap_err().contains("buffer_size"));
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let config = TransportConfig::default().with_backoff(0.5);
        assert!(config.validate().is_err());
        let config = TransportConfig::default().with_backoff(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_chunks() {
        assert!(TransportConfig::default().with_chunk_size(0).validate().is_err());
    }
}
