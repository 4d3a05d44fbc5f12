//! Tunable protocol constants.
//!
//! A [`Config`] is given to a [`Socket`](crate::socket::Socket) and copied
//! into every connection it creates.

use std::time::Duration;

use crate::congestion::CongestionStrategy;
use crate::timer::TimerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// RTO for a fresh retransmission deadline.
    pub initial_rto: Duration,
    /// Cap for the doubled RTO.
    pub max_rto: Duration,
    /// SYN / SYN+ACK retransmissions before `HandshakeTimeout`.
    pub handshake_retries: u32,
    /// Retransmissions of one packet before the peer is given up on.
    pub max_retransmits: u32,
    /// Packets queued behind the congestion window before `send` blocks.
    pub max_buffered: usize,
    /// How long a blocked `send` waits for room.
    pub backlog_timeout: Duration,
    /// How long `close` waits for the teardown to finish.
    pub linger_timeout: Duration,
    /// Inbound packets queued per connection.
    pub inbound_queue: usize,
    /// Completed handshakes waiting for `accept`.
    pub accept_backlog: usize,
    /// Receive buffers kept by the pool.
    pub pool_capacity: usize,
    pub congestion: CongestionStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(10),
            handshake_retries: 6,
            max_retransmits: 12,
            max_buffered: 64,
            backlog_timeout: Duration::from_secs(5),
            linger_timeout: Duration::from_secs(5),
            inbound_queue: 256,
            accept_backlog: 32,
            pool_capacity: 64,
            congestion: CongestionStrategy::default(),
        }
    }
}

impl Config {
    pub fn timer(&self) -> TimerConfig {
        TimerConfig {
            initial_rto: self.initial_rto,
            max_rto: self.max_rto,
        }
    }
}
