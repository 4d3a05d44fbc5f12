//! Send-side retransmission window.
//!
//! [`RetransmissionWindow`] holds every outbound packet of one connection
//! until it is acknowledged:
//!
//! ```text
//!   buffered (FIFO)                pending (oldest first)
//!  ┌───┬───┬───┐   admit_ready   ┌───┬───┬───┐   cumulative ACK
//!  │ 9 │ 8 │ 7 │ ──────────────▶ │ 6 │ 5 │ 4 │ ─────────────────▶ dropped
//!  └───┴───┴───┘  (controller    └───┴───┴───┘
//!                  grants credit)   ▲ oldest is resent on timeout or
//!                                   │ after three duplicate ACKs
//! ```
//!
//! # Protocol contract
//!
//! - A packet is in exactly one of `buffered`, `pending`, or gone.
//! - ACKs are **cumulative**: `ack = K` acknowledges every pending packet
//!   whose last sequence number comes before `K`.
//! - Only the **oldest** pending packet is ever retransmitted; it stays
//!   pending until acknowledged.
//! - In-flight sequence numbers never span half the ring, so
//!   [`seq::precedes`] stays well-defined over the whole window.
//!
//! This module only manages state; every method returns the packets the
//! caller must put on the wire, and all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

use thiserror::Error;
use tokio::time::Instant;

use crate::congestion::{Ack, CongestionControl};
use crate::packet::Packet;
use crate::seq::{self, HALF};

/// The buffered queue is at its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retransmission backlog is full")]
pub struct BacklogFull;

/// A packet that has been sent at least once and awaits acknowledgment.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub packet: Packet,
    /// Total transmissions, including the first.
    pub tx_count: u32,
}

/// What an incoming ACK did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Acknowledged new data, releasing `n` pending packets.
    Advanced(usize),
    /// Repeated the previous acknowledgment number.
    Duplicate,
    /// Old, out-of-window, or nothing outstanding; no effect.
    Ignored,
}

/// Result of [`RetransmissionWindow::on_ack`].
#[derive(Debug)]
pub struct AckOutcome {
    pub kind: AckKind,
    /// Packets to transmit, in order: a fast retransmit (if any) followed by
    /// newly admitted packets.
    pub transmit: Vec<Packet>,
}

/// Buffered and in-flight packets for one connection.
#[derive(Debug)]
pub struct RetransmissionWindow {
    /// Oldest unacknowledged sequence number (the last advancing ACK).
    una: u16,
    /// First sequence number after the newest in-flight packet.
    nxt: u16,
    pending: VecDeque<InFlight>,
    buffered: VecDeque<Packet>,
    max_buffered: usize,
    controller: Box<dyn CongestionControl>,
}

impl RetransmissionWindow {
    /// An empty window whose first packet will carry `start`.
    pub fn new(start: u16, controller: Box<dyn CongestionControl>, max_buffered: usize) -> Self {
        Self {
            una: start,
            nxt: start,
            pending: VecDeque::new(),
            buffered: VecDeque::with_capacity(max_buffered),
            max_buffered,
            controller,
        }
    }

    /// Move an empty window to a new starting sequence number.
    pub fn rebase(&mut self, start: u16) {
        debug_assert!(self.is_idle(), "rebase on a window with outstanding packets");
        self.una = start;
        self.nxt = start;
    }

    /// `true` when another packet may be enqueued.
    pub fn has_room(&self) -> bool {
        self.buffered.len() < self.max_buffered
    }

    /// Append `packet` to the buffered queue.
    pub fn enqueue(&mut self, packet: Packet) -> Result<(), BacklogFull> {
        if !self.has_room() {
            return Err(BacklogFull);
        }
        self.buffered.push_back(packet);
        Ok(())
    }

    /// Move buffered packets into flight while the controller grants credit.
    ///
    /// Returns the admitted packets, oldest first, for transmission.
    pub fn admit_ready(&mut self) -> Vec<Packet> {
        let mut admitted = Vec::new();
        while let Some(front) = self.buffered.front() {
            if !self.controller.can_send_packet() {
                break;
            }
            let span = seq::distance(self.una, self.nxt) + front.segment_len();
            if span >= HALF {
                break;
            }
            let Some(packet) = self.buffered.pop_front() else {
                break;
            };

            self.nxt = seq::advance(packet.sequence_number(), packet.segment_len());
            admitted.push(packet.clone());
            self.pending.push_back(InFlight {
                packet,
                tx_count: 1,
            });
            self.controller.packet_sent();
            self.controller.reset_ack_timeout();
        }
        admitted
    }

    /// Process a pure ACK.  A repeat of the last acknowledgment number counts
    /// towards fast retransmit.
    pub fn on_ack(&mut self, ack: u16) -> AckOutcome {
        self.process_ack(ack, true)
    }

    /// Process an ACK carried by a data or FIN packet.  Such ACKs advance
    /// the window but never count as duplicates.
    pub fn on_piggybacked_ack(&mut self, ack: u16) -> AckOutcome {
        self.process_ack(ack, false)
    }

    fn process_ack(&mut self, ack: u16, count_duplicate: bool) -> AckOutcome {
        let mut transmit = Vec::new();

        let outstanding = seq::distance(self.una, self.nxt);
        let kind = if self.pending.is_empty() || !seq::in_window(ack, self.una, outstanding + 1) {
            AckKind::Ignored
        } else if ack == self.una {
            if count_duplicate {
                let expired = self.deadline_passed();
                self.controller.ack_received(Ack::Duplicate);
                if self.controller.should_resend_first_unacked() {
                    if expired {
                        self.controller.timed_out();
                    }
                    transmit.extend(self.resend_oldest());
                }
                AckKind::Duplicate
            } else {
                AckKind::Ignored
            }
        } else {
            let mut newly_acked = 0;
            while let Some(front) = self.pending.front() {
                let end = seq::advance(front.packet.sequence_number(), front.packet.segment_len());
                if end == ack || seq::precedes(end, ack) {
                    self.pending.pop_front();
                    newly_acked += 1;
                } else {
                    break;
                }
            }
            if newly_acked == 0 {
                // Inside the oldest packet; packets are only released whole.
                AckKind::Ignored
            } else {
                self.una = self
                    .pending
                    .front()
                    .map_or(self.nxt, |e| e.packet.sequence_number());
                self.controller.ack_received(Ack::Advanced { newly_acked });
                if !self.pending.is_empty() {
                    self.controller.reset_ack_timeout();
                }
                AckKind::Advanced(newly_acked)
            }
        };

        if kind != AckKind::Ignored {
            transmit.extend(self.admit_ready());
        }
        AckOutcome { kind, transmit }
    }

    /// Retransmission timer check.  When the oldest pending packet's
    /// deadline has passed, returns it for resending; it stays pending.
    pub fn on_timer_tick(&mut self) -> Option<Packet> {
        if self.pending.is_empty() || !self.controller.should_resend_first_unacked() {
            return None;
        }
        self.controller.timed_out();
        self.resend_oldest()
    }

    fn deadline_passed(&self) -> bool {
        self.controller
            .ack_deadline()
            .is_some_and(|at| at <= Instant::now())
    }

    fn resend_oldest(&mut self) -> Option<Packet> {
        let front = self.pending.front_mut()?;
        front.tx_count += 1;
        let packet = front.packet.clone();
        self.controller.reset_ack_timeout();
        log::debug!(
            "[rcp] ↻ resend seq={} (tx #{})",
            packet.sequence_number(),
            front.tx_count
        );
        Some(packet)
    }

    /// When [`on_timer_tick`](Self::on_timer_tick) next needs to run.
    /// `None` while nothing is in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        self.controller.ack_deadline()
    }

    /// Transmissions of the oldest pending packet so far.
    pub fn oldest_tx_count(&self) -> u32 {
        self.pending.front().map_or(0, |e| e.tx_count)
    }

    /// Nothing buffered and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.buffered.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Oldest unacknowledged sequence number.
    pub fn una(&self) -> u16 {
        self.una
    }

    /// In-flight packets, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &InFlight> {
        self.pending.iter()
    }

    pub fn controller(&self) -> &dyn CongestionControl {
        self.controller.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::congestion::{CongestionStrategy, DUP_ACK_THRESHOLD};
    use crate::seq::MAX_SEQ_NUM;
    use crate::timer::TimerConfig;

    fn timer() -> TimerConfig {
        TimerConfig {
            initial_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(1),
        }
    }

    fn window(start: u16, size: usize, max_buffered: usize) -> RetransmissionWindow {
        RetransmissionWindow::new(start, CongestionStrategy::Fixed(size).build(timer()), max_buffered)
    }

    fn data(seq: u16, len: usize) -> Packet {
        let mut pkt = Packet::new();
        pkt.set_sequence_number(seq).unwrap();
        pkt.set_ack();
        pkt.set_payload(&vec![0xAB; len]).unwrap();
        pkt
    }

    fn seqs(packets: &[Packet]) -> Vec<u16> {
        packets.iter().map(Packet::sequence_number).collect()
    }

    #[test]
    fn window_of_one_sends_one_packet_per_ack() {
        let mut w = window(0, 1, 8);
        for seq in [0, 10, 20] {
            w.enqueue(data(seq, 10)).unwrap();
        }

        assert_eq!(seqs(&w.admit_ready()), vec![0]);
        assert!(w.admit_ready().is_empty());
        assert_eq!(w.in_flight(), 1);
        assert_eq!(w.buffered(), 2);

        let out = w.on_ack(10);
        assert_eq!(out.kind, AckKind::Advanced(1));
        assert_eq!(seqs(&out.transmit), vec![10]);

        let out = w.on_ack(20);
        assert_eq!(seqs(&out.transmit), vec![20]);

        let out = w.on_ack(30);
        assert_eq!(out.kind, AckKind::Advanced(1));
        assert!(out.transmit.is_empty());
        assert!(w.is_idle());
    }

    #[test]
    fn three_duplicate_acks_resend_oldest_immediately() {
        let mut w = window(0, 4, 8);
        for seq in [0, 10, 20] {
            w.enqueue(data(seq, 10)).unwrap();
        }
        assert_eq!(w.admit_ready().len(), 3);

        for _ in 0..DUP_ACK_THRESHOLD - 1 {
            let out = w.on_ack(0);
            assert_eq!(out.kind, AckKind::Duplicate);
            assert!(out.transmit.is_empty());
        }
        let out = w.on_ack(0);
        assert_eq!(out.kind, AckKind::Duplicate);
        assert_eq!(seqs(&out.transmit), vec![0]);

        // Still pending until acknowledged.
        assert_eq!(w.in_flight(), 3);
        assert_eq!(w.oldest_tx_count(), 2);
    }

    #[test]
    fn piggybacked_acks_never_count_as_duplicates() {
        let mut w = window(0, 4, 8);
        w.enqueue(data(0, 10)).unwrap();
        w.admit_ready();

        for _ in 0..5 {
            let out = w.on_piggybacked_ack(0);
            assert_eq!(out.kind, AckKind::Ignored);
            assert!(out.transmit.is_empty());
        }
        assert_eq!(w.on_piggybacked_ack(10).kind, AckKind::Advanced(1));
    }

    #[test]
    fn cumulative_ack_releases_every_covered_packet() {
        let mut w = window(100, 4, 8);
        for seq in [100, 105, 110] {
            w.enqueue(data(seq, 5)).unwrap();
        }
        w.admit_ready();

        let out = w.on_ack(110);
        assert_eq!(out.kind, AckKind::Advanced(2));
        assert_eq!(w.in_flight(), 1);
        assert_eq!(w.una(), 110);
        assert_eq!(w.pending().next().unwrap().packet.sequence_number(), 110);
    }

    #[test]
    fn ack_inside_a_packet_releases_only_whole_packets() {
        let mut w = window(0, 4, 8);
        for seq in [0, 10, 20] {
            w.enqueue(data(seq, 10)).unwrap();
        }
        w.admit_ready();

        w.on_ack(0);
        w.on_ack(0);
        assert_eq!(w.on_ack(5).kind, AckKind::Ignored);
        assert_eq!(w.una(), 0);
        assert_eq!(w.in_flight(), 3);

        // The duplicate count survived the partial ACK.
        let out = w.on_ack(0);
        assert_eq!(out.kind, AckKind::Duplicate);
        assert_eq!(seqs(&out.transmit), vec![0]);

        assert_eq!(w.on_ack(15).kind, AckKind::Advanced(1));
        assert_eq!(w.una(), 10);
    }

    #[test]
    fn acks_outside_the_window_are_ignored() {
        let mut w = window(100, 4, 8);
        w.enqueue(data(100, 5)).unwrap();
        w.admit_ready();

        // Beyond anything sent.
        assert_eq!(w.on_ack(200).kind, AckKind::Ignored);
        // Behind the window.
        assert_eq!(w.on_ack(50).kind, AckKind::Ignored);
        assert_eq!(w.in_flight(), 1);
        assert_eq!(w.una(), 100);
    }

    #[test]
    fn ack_with_nothing_outstanding_is_ignored() {
        let mut w = window(0, 4, 8);
        assert_eq!(w.on_ack(0).kind, AckKind::Ignored);
        assert!(w.next_deadline().is_none());
    }

    #[test]
    fn acks_work_across_the_wrap() {
        let start = MAX_SEQ_NUM - 6;
        let mut w = window(start, 4, 8);
        w.enqueue(data(start, 4)).unwrap();
        w.enqueue(data(MAX_SEQ_NUM - 2, 4)).unwrap();
        w.admit_ready();

        assert_eq!(w.on_ack(MAX_SEQ_NUM - 2).kind, AckKind::Advanced(1));
        assert_eq!(w.on_ack(2).kind, AckKind::Advanced(1));
        assert!(w.is_idle());
        assert_eq!(w.una(), 2);
    }

    #[test]
    fn fin_consumes_one_sequence_number() {
        let mut w = window(40, 4, 8);
        let mut fin = Packet::new();
        fin.set_sequence_number(40).unwrap();
        fin.set_fin();
        fin.set_ack();
        w.enqueue(fin).unwrap();
        w.admit_ready();

        assert_eq!(w.on_ack(41).kind, AckKind::Advanced(1));
        assert!(w.is_idle());
    }

    #[test]
    fn buffered_queue_is_bounded() {
        let mut w = window(0, 1, 2);
        w.enqueue(data(0, 1)).unwrap();
        w.enqueue(data(1, 1)).unwrap();
        assert!(!w.has_room());
        assert_eq!(w.enqueue(data(2, 1)), Err(BacklogFull));

        // Admission frees room.
        w.admit_ready();
        assert!(w.has_room());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_resends_oldest_and_keeps_it_pending() {
        let mut w = window(0, 2, 8);
        w.enqueue(data(0, 10)).unwrap();
        w.enqueue(data(10, 10)).unwrap();
        w.admit_ready();
        assert!(w.next_deadline().is_some());

        assert!(w.on_timer_tick().is_none());

        tokio::time::advance(Duration::from_millis(100)).await;
        let resent = w.on_timer_tick().expect("deadline passed");
        assert_eq!(resent.sequence_number(), 0);
        assert_eq!(w.in_flight(), 2);
        assert_eq!(w.oldest_tx_count(), 2);

        // Re-armed with a backed-off RTO.
        assert!(w.on_timer_tick().is_none());
        tokio::time::advance(Duration::from_millis(199)).await;
        assert!(w.on_timer_tick().is_none());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(w.on_timer_tick().is_some());
        assert_eq!(w.oldest_tx_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ack_after_the_deadline_is_a_timeout() {
        let mut w = RetransmissionWindow::new(0, CongestionStrategy::Aimd.build(timer()), 8);
        w.enqueue(data(0, 10)).unwrap();
        w.enqueue(data(10, 10)).unwrap();
        assert_eq!(w.admit_ready().len(), 2);
        assert_eq!(w.controller().window(), 2);

        tokio::time::advance(Duration::from_millis(100)).await;
        let out = w.on_ack(0);
        assert_eq!(out.kind, AckKind::Duplicate);
        assert_eq!(seqs(&out.transmit), vec![0]);
        assert_eq!(w.controller().window(), 1);

        // The resend was re-armed with the backed-off RTO.
        tokio::time::advance(Duration::from_millis(199)).await;
        assert!(w.on_timer_tick().is_none());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(w.on_timer_tick().is_some());
    }

    #[test]
    fn acked_window_stops_the_timer() {
        let mut w = window(0, 2, 8);
        w.enqueue(data(0, 10)).unwrap();
        w.admit_ready();
        w.on_ack(10);
        assert!(w.next_deadline().is_none());
        assert!(w.on_timer_tick().is_none());
    }
}
