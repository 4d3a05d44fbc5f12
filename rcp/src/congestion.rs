//! Pluggable congestion control.
//!
//! [`CongestionControl`] is the capability set the
//! [`RetransmissionWindow`](crate::window::RetransmissionWindow) consults:
//! whether another packet may enter flight, how ACKs and timeouts change the
//! usable window, and when the oldest in-flight packet must be resent.
//!
//! Two strategies ship with the crate:
//! - [`FixedWindow`]: a constant number of packets in flight.  Predictable,
//!   so the tests use it.
//! - [`Aimd`]: Reno-style slow start, additive increase and multiplicative
//!   decrease.  The default.
//!
//! Both arm fast retransmit after [`DUP_ACK_THRESHOLD`] duplicate ACKs and
//! share the same [`AckTimer`] deadline logic.  A strategy is picked once per
//! connection through [`CongestionStrategy::build`].

use tokio::time::Instant;

use crate::packet::MAX_PAYLOAD;
use crate::seq::HALF;
use crate::timer::{AckTimer, TimerConfig};

/// Duplicate ACKs that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Largest window any strategy may grant: full packets that fit in flight
/// while keeping every in-flight number less than half the ring apart.
pub const MAX_WINDOW: usize = (HALF as usize - 1) / MAX_PAYLOAD;

/// How an incoming ACK relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Same acknowledgment number as before while data is outstanding.
    Duplicate,
    /// The ACK moved the window forward, acknowledging `newly_acked` packets.
    Advanced { newly_acked: usize },
}

/// Admission and retransmission policy for one connection.
pub trait CongestionControl: Send + std::fmt::Debug {
    /// May another packet be moved from `buffered` into flight?
    fn can_send_packet(&self) -> bool;

    /// One packet entered flight.
    fn packet_sent(&mut self);

    /// An ACK arrived.
    fn ack_received(&mut self, ack: Ack);

    /// `true` when the oldest in-flight packet must be resent now, either
    /// because its deadline passed or because fast retransmit is armed.
    fn should_resend_first_unacked(&self) -> bool;

    /// Re-arm the retransmission deadline.  Called whenever a packet is
    /// (re)sent or an ACK advances the window.
    fn reset_ack_timeout(&mut self);

    /// The retransmission deadline passed; called before the resend.
    fn timed_out(&mut self) {}

    /// When the retransmission timer must next be checked.
    fn ack_deadline(&self) -> Option<Instant>;

    /// Current window, in packets.
    fn window(&self) -> usize;
}

/// Which [`CongestionControl`] a connection is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionStrategy {
    /// [`FixedWindow`] with the given number of packets; 0 means 1.
    Fixed(usize),
    /// [`Aimd`].
    Aimd,
}

impl Default for CongestionStrategy {
    fn default() -> Self {
        Self::Aimd
    }
}

impl CongestionStrategy {
    pub fn build(self, timer: TimerConfig) -> Box<dyn CongestionControl> {
        match self {
            Self::Fixed(window) => Box::new(FixedWindow::new(window, timer)),
            Self::Aimd => Box::new(Aimd::new(timer)),
        }
    }
}

/// Duplicate-ACK bookkeeping shared by both strategies.
#[derive(Debug, Clone, Default)]
struct DupAcks {
    count: u32,
    fast_retransmit: bool,
}

impl DupAcks {
    /// Count one duplicate; returns `true` exactly when the threshold is hit.
    fn on_duplicate(&mut self) -> bool {
        self.count += 1;
        if self.count == DUP_ACK_THRESHOLD {
            self.fast_retransmit = true;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.count = 0;
        self.fast_retransmit = false;
    }
}

// ---------------------------------------------------------------------------
// FixedWindow
// ---------------------------------------------------------------------------

/// A constant window of `window` packets.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    window: usize,
    in_flight: usize,
    dup: DupAcks,
    timer: AckTimer,
}

impl FixedWindow {
    /// `window` is clamped to `1..=MAX_WINDOW`.
    pub fn new(window: usize, timer: TimerConfig) -> Self {
        Self {
            window: window.clamp(1, MAX_WINDOW),
            in_flight: 0,
            dup: DupAcks::default(),
            timer: AckTimer::new(timer),
        }
    }
}

impl CongestionControl for FixedWindow {
    fn can_send_packet(&self) -> bool {
        self.in_flight < self.window
    }

    fn packet_sent(&mut self) {
        self.in_flight += 1;
    }

    fn ack_received(&mut self, ack: Ack) {
        match ack {
            Ack::Duplicate => {
                if self.dup.on_duplicate() {
                    log::debug!("[rcp:cc] {} duplicate ACKs; fast retransmit", DUP_ACK_THRESHOLD);
                }
            }
            Ack::Advanced { newly_acked } => {
                self.in_flight = self.in_flight.saturating_sub(newly_acked);
                self.dup.reset();
                self.timer.restore();
            }
        }
    }

    fn should_resend_first_unacked(&self) -> bool {
        self.dup.fast_retransmit || self.timer.expired()
    }

    fn reset_ack_timeout(&mut self) {
        self.dup.fast_retransmit = false;
        self.timer.arm();
    }

    fn timed_out(&mut self) {
        self.dup.reset();
        self.timer.back_off();
    }

    fn ack_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    fn window(&self) -> usize {
        self.window
    }
}

// ---------------------------------------------------------------------------
// Aimd
// ---------------------------------------------------------------------------

/// Initial congestion window, in packets.
const INITIAL_CWND: usize = 2;

/// Additive-increase / multiplicative-decrease window, counted in packets.
///
/// - Below `ssthresh` (slow start) every acknowledged packet grows `cwnd`
///   by one.
/// - At or above it (congestion avoidance) `cwnd` grows by one per window's
///   worth of acknowledged packets.
/// - Fast retransmit halves the window; a timeout collapses it to one.
#[derive(Debug, Clone)]
pub struct Aimd {
    cwnd: usize,
    ssthresh: usize,
    acked_since_growth: usize,
    in_flight: usize,
    dup: DupAcks,
    timer: AckTimer,
}

impl Aimd {
    pub fn new(timer: TimerConfig) -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: MAX_WINDOW,
            acked_since_growth: 0,
            in_flight: 0,
            dup: DupAcks::default(),
            timer: AckTimer::new(timer),
        }
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    fn halve(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2);
        self.acked_since_growth = 0;
    }

    fn grow(&mut self, newly_acked: usize) {
        if self.cwnd < self.ssthresh {
            self.cwnd += newly_acked;
        } else {
            self.acked_since_growth += newly_acked;
            if self.acked_since_growth >= self.cwnd {
                self.acked_since_growth -= self.cwnd;
                self.cwnd += 1;
            }
        }
        self.cwnd = self.cwnd.min(MAX_WINDOW);
    }
}

impl CongestionControl for Aimd {
    fn can_send_packet(&self) -> bool {
        self.in_flight < self.cwnd
    }

    fn packet_sent(&mut self) {
        self.in_flight += 1;
    }

    fn ack_received(&mut self, ack: Ack) {
        match ack {
            Ack::Duplicate => {
                if self.dup.on_duplicate() {
                    self.halve();
                    self.cwnd = self.ssthresh;
                    log::debug!(
                        "[rcp:cc] fast retransmit; cwnd={} ssthresh={}",
                        self.cwnd,
                        self.ssthresh
                    );
                }
            }
            Ack::Advanced { newly_acked } => {
                self.in_flight = self.in_flight.saturating_sub(newly_acked);
                self.dup.reset();
                self.timer.restore();
                self.grow(newly_acked);
            }
        }
    }

    fn should_resend_first_unacked(&self) -> bool {
        self.dup.fast_retransmit || self.timer.expired()
    }

    fn reset_ack_timeout(&mut self) {
        self.dup.fast_retransmit = false;
        self.timer.arm();
    }

    fn timed_out(&mut self) {
        self.halve();
        self.cwnd = 1;
        self.dup.reset();
        self.timer.back_off();
        log::debug!(
            "[rcp:cc] timeout; cwnd=1 ssthresh={} rto={:?}",
            self.ssthresh,
            self.timer.rto()
        );
    }

    fn ack_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    fn window(&self) -> usize {
        self.cwnd
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn timer() -> TimerConfig {
        TimerConfig {
            initial_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(1),
        }
    }

    #[test]
    fn max_window_respects_half_ring() {
        assert_eq!(MAX_WINDOW, 14);
        assert!(MAX_WINDOW * MAX_PAYLOAD < HALF as usize);
    }

    #[test]
    fn fixed_window_admits_up_to_window() {
        let mut cc = FixedWindow::new(2, timer());
        assert!(cc.can_send_packet());
        cc.packet_sent();
        assert!(cc.can_send_packet());
        cc.packet_sent();
        assert!(!cc.can_send_packet());

        cc.ack_received(Ack::Advanced { newly_acked: 1 });
        assert!(cc.can_send_packet());
        assert_eq!(cc.window(), 2);
    }

    #[test]
    fn fixed_window_is_clamped() {
        let mut cc = FixedWindow::new(0, timer());
        assert_eq!(cc.window(), 1);
        assert!(cc.can_send_packet());
        cc.packet_sent();
        assert!(!cc.can_send_packet());

        assert_eq!(FixedWindow::new(usize::MAX, timer()).window(), MAX_WINDOW);
    }

    #[test]
    fn fixed_window_duplicate_acks_arm_fast_retransmit() {
        let mut cc = FixedWindow::new(1, timer());
        cc.packet_sent();
        cc.reset_ack_timeout();

        cc.ack_received(Ack::Duplicate);
        cc.ack_received(Ack::Duplicate);
        assert!(!cc.should_resend_first_unacked());
        cc.ack_received(Ack::Duplicate);
        assert!(cc.should_resend_first_unacked());

        // The resend re-arms the timer and consumes the trigger.
        cc.reset_ack_timeout();
        assert!(!cc.should_resend_first_unacked());

        // A fourth duplicate does not re-trigger.
        cc.ack_received(Ack::Duplicate);
        assert!(!cc.should_resend_first_unacked());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_requests_resend() {
        let mut cc = FixedWindow::new(1, timer());
        cc.packet_sent();
        cc.reset_ack_timeout();
        let first = cc.ack_deadline().unwrap();
        assert!(!cc.should_resend_first_unacked());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cc.should_resend_first_unacked());

        cc.timed_out();
        cc.reset_ack_timeout();
        assert!(!cc.should_resend_first_unacked());
        // Backed off: the next deadline is twice as far out.
        assert_eq!(cc.ack_deadline().unwrap() - first, Duration::from_millis(200));
    }

    #[test]
    fn aimd_slow_start_then_additive_increase() {
        let mut cc = Aimd::new(timer());
        assert_eq!(cc.window(), INITIAL_CWND);

        cc.packet_sent();
        cc.packet_sent();
        assert!(!cc.can_send_packet());
        cc.ack_received(Ack::Advanced { newly_acked: 2 });
        assert_eq!(cc.window(), 4);

        // Force congestion avoidance.
        cc.ssthresh = 4;
        cc.ack_received(Ack::Advanced { newly_acked: 3 });
        assert_eq!(cc.window(), 4);
        cc.ack_received(Ack::Advanced { newly_acked: 1 });
        assert_eq!(cc.window(), 5);
    }

    #[test]
    fn aimd_window_is_capped() {
        let mut cc = Aimd::new(timer());
        for _ in 0..10 {
            cc.ack_received(Ack::Advanced { newly_acked: 8 });
        }
        assert_eq!(cc.window(), MAX_WINDOW);
    }

    #[test]
    fn aimd_fast_retransmit_halves_window() {
        let mut cc = Aimd::new(timer());
        cc.ack_received(Ack::Advanced { newly_acked: 8 });
        assert_eq!(cc.window(), 10);

        for _ in 0..DUP_ACK_THRESHOLD {
            cc.ack_received(Ack::Duplicate);
        }
        assert!(cc.should_resend_first_unacked());
        assert_eq!(cc.window(), 5);
        assert_eq!(cc.ssthresh(), 5);
    }

    #[test]
    fn aimd_timeout_collapses_window() {
        let mut cc = Aimd::new(timer());
        cc.ack_received(Ack::Advanced { newly_acked: 6 });
        assert_eq!(cc.window(), 8);

        cc.timed_out();
        assert_eq!(cc.window(), 1);
        assert_eq!(cc.ssthresh(), 4);
    }

    #[test]
    fn strategy_builds_requested_controller() {
        assert_eq!(CongestionStrategy::Fixed(3).build(timer()).window(), 3);
        assert_eq!(CongestionStrategy::Aimd.build(timer()).window(), INITIAL_CWND);
        assert_eq!(CongestionStrategy::default(), CongestionStrategy::Aimd);
    }
}
