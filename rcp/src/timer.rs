//! Retransmission deadline management.
//!
//! Reliable delivery requires that the oldest unacknowledged packet is re-sent
//! if no ACK arrives within a bounded time.  [`AckTimer`] tracks that
//! deadline for one connection:
//! - [`AckTimer::arm`] starts a fresh deadline `now + rto`.
//! - [`AckTimer::back_off`] doubles the RTO after a timeout-driven resend,
//!   up to a configured maximum.
//! - [`AckTimer::restore`] returns to the initial RTO once an ACK shows the
//!   path is moving again.
//!
//! Times come from [`tokio::time::Instant`], so tests can drive the clock with
//! `tokio::time::pause` / `advance`.

use std::time::Duration;

use tokio::time::Instant;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO used for a fresh deadline.
    pub initial_rto: Duration,
    /// Maximum RTO after repeated back-off.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(10),
        }
    }
}

/// The retransmission deadline for one connection.
#[derive(Debug, Clone)]
pub struct AckTimer {
    config: TimerConfig,
    rto: Duration,
    deadline: Option<Instant>,
}

impl AckTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            rto: config.initial_rto,
            config,
            deadline: None,
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// The armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start a new deadline `rto` from now.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.rto);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// `true` once the armed deadline has passed.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|at| at <= Instant::now())
    }

    /// Double the RTO (exponential back-off), capped at `max_rto`.
    pub fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(self.config.max_rto);
    }

    /// Return to the initial RTO.
    pub fn restore(&mut self) {
        self.rto = self.config.initial_rto;
    }
}
