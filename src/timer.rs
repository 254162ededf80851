//! Retransmit timing.
//!
//! - [`RetransmitTimer`]: the adaptive wait before a segment is re-sent.
//!   It grows by the configured back-off factor on every timeout (capped at
//!   the disconnect timeout) and, when an ACK arrives, moves halfway toward
//!   the measured round-trip time without dropping below its initial value.
//! - [`Budget`]: a wall-clock allowance for a whole exchange (handshake,
//!   one chunk, teardown).

use std::time::Duration;

use tokio::time::Instant;

use crate::config::TransportConfig;

/// Adaptive retransmit timeout for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct RetransmitTimer {
    floor: Duration,
    ceiling: Duration,
    factor: f64,
    current: Duration,
}

impl RetransmitTimer {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            floor: config.initial_rto,
            ceiling: config.disconnect_timeout.max(config.initial_rto),
            factor: config.backoff,
            current: config.initial_rto,
        }
    }

    /// How long to wait for the next ACK.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grow the timeout after a retransmission, up to the ceiling.
    pub fn back_off(&mut self) {
        let grown = (self.current.as_nanos() as f64 * self.factor).round();
        self.current = if grown >= self.ceiling.as_nanos() as f64 {
            self.ceiling
        } else {
            Duration::from_nanos(grown as u64)
        };
    }

    /// Shrink toward a measured round-trip time.
    ///
    /// Samples at or above the current timeout leave it unchanged.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        if sample < self.current {
            self.current = ((self.current + sample) / 2).max(self.floor);
        }
    }
}

/// Time allowance for an exchange, measured from when it started.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    started: Instant,
    limit: Duration,
}

impl Budget {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.limit
    }

    /// `wait`, shortened so it does not run past the end of the budget.
    pub fn clamp(&self, wait: Duration) -> Duration {
        wait.min(self.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> RetransmitTimer {
        RetransmitTimer::new(
            &TransportConfig::default()
                .with_initial_rto(Duration::from_millis(100))
                .with_disconnect_timeout(Duration::from_secs(1))
                .with_backoff(1.5),
        )
    }

    #[test]
    fn backs_off_by_factor() {
        let mut t = timer();
        t.back_off();
        assert_eq!(t.current(), Duration::from_millis(150));
        t.back_off();
        assert_eq!(t.current(), Duration::from_millis(225));
    }

    #[test]
    fn back_off_is_capped_at_disconnect_timeout() {
        let mut t = timer();
        for _ in 0..20 {
            t.back_off();
        }
        assert_eq!(t.current(), Duration::from_secs(1));
    }

    #[test]
    fn fast_ack_shrinks_but_not_below_floor() {
        let mut t = timer();
        for _ in 0..4 {
            t.back_off();
        }
        let grown = t.current();
        t.record_rtt_sample(Duration::from_millis(10));
        assert!(t.current() < grown);
        for _ in 0..20 {
            t.record_rtt_sample(Duration::from_millis(1));
        }
        assert_eq!(t.current(), Duration::from_millis(100));
    }

    #[test]
    fn slow_sample_does_not_grow() {
        let mut t = timer();
        t.record_rtt_sample(Duration::from_millis(400));
        assert_eq!(t.current(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_expires_after_limit() {
        let budget = Budget::start(Duration::from_millis(50));
        assert!(!budget.expired());
        assert_eq!(budget.clamp(Duration::from_secs(1)), Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(budget.expired());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }
}
