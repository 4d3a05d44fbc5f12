//! Transmission control block: the per-connection protocol state machine.
//!
//! A [`Tcb`] owns everything one peer relationship needs besides I/O: the
//! [`ConnectionState`], both sequence cursors, the
//! [`RetransmissionWindow`] (and through it the congestion controller), and
//! the in-order bytes waiting for the application.
//!
//! Every method takes an event (an inbound packet, an application write, a
//! timer tick) and returns the packets that must go on the wire in response.
//! State changes happen synchronously inside the call, so a caller that is
//! cancelled between calls never observes a half-applied transition.
//!
//! Receive policy: only the segment starting at `expected_peer_seq` is
//! accepted.  Anything else (a duplicate, or a segment that arrived ahead
//! of a gap) is dropped and answered with a pure ACK for
//! `expected_peer_seq`; the sender sees that as a duplicate ACK and the
//! missing segment is fast-retransmitted.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

use crate::config::Config;
use crate::error::ConnError;
use crate::packet::{flags, Packet};
use crate::seq;
use crate::state::ConnectionState;
use crate::window::{AckKind, RetransmissionWindow};

#[derive(Debug)]
pub struct Tcb {
    state: ConnectionState,
    /// Our initial sequence number.
    isn: u16,
    /// Sequence number of the next segment we create.
    local_next_seq: u16,
    /// Sequence number of the next in-order segment from the peer.
    expected_peer_seq: u16,
    /// End of our FIN once it has been queued.
    fin_end: Option<u16>,
    /// The peer's FIN has been accepted.
    peer_fin: bool,
    window: RetransmissionWindow,
    received: VecDeque<u8>,
    max_retransmits: u32,
}

impl Tcb {
    pub fn new(config: &Config) -> Self {
        Self {
            state: ConnectionState::Closed,
            isn: 0,
            local_next_seq: 0,
            expected_peer_seq: 0,
            fin_end: None,
            peer_fin: false,
            window: RetransmissionWindow::new(
                0,
                config.congestion.build(config.timer()),
                config.max_buffered,
            ),
            received: VecDeque::new(),
            max_retransmits: config.max_retransmits,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_next_seq(&self) -> u16 {
        self.local_next_seq
    }

    pub fn expected_peer_seq(&self) -> u16 {
        self.expected_peer_seq
    }

    pub fn window(&self) -> &RetransmissionWindow {
        &self.window
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Active open: move to `SynSent` and return the SYN to send.
    pub fn open_active(&mut self, isn: u16) -> Packet {
        debug_assert_eq!(self.state, ConnectionState::Closed);
        self.isn = isn;
        self.local_next_seq = seq::advance(isn, 1);
        self.window.rebase(self.local_next_seq);
        self.transition(ConnectionState::SynSent);
        self.syn()
    }

    /// Passive open in response to `syn`: move to `SynReceived` and return
    /// the SYN+ACK to send.
    pub fn open_passive(&mut self, syn: &Packet, isn: u16) -> Packet {
        debug_assert_eq!(self.state, ConnectionState::Closed);
        self.expected_peer_seq = seq::advance(syn.sequence_number(), 1);
        self.isn = isn;
        self.local_next_seq = seq::advance(isn, 1);
        self.window.rebase(self.local_next_seq);
        self.transition(ConnectionState::SynReceived);
        self.syn_ack()
    }

    /// The handshake packet to retransmit while the handshake is pending.
    pub fn handshake_packet(&self) -> Option<Packet> {
        match self.state {
            ConnectionState::SynSent => Some(self.syn()),
            ConnectionState::SynReceived => Some(self.syn_ack()),
            _ => None,
        }
    }

    fn syn(&self) -> Packet {
        Packet::with_header(self.isn, 0, flags::SYN)
    }

    fn syn_ack(&self) -> Packet {
        Packet::with_header(self.isn, self.expected_peer_seq, flags::SYN | flags::ACK)
    }

    fn ack(&self) -> Packet {
        Packet::with_header(self.local_next_seq, self.expected_peer_seq, flags::ACK)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Feed one packet from the peer; returns the packets to send in reply.
    pub fn on_packet(&mut self, packet: &Packet) -> Vec<Packet> {
        match self.state {
            ConnectionState::Closed => self.on_packet_closed(packet),
            ConnectionState::SynSent => self.on_packet_syn_sent(packet),
            ConnectionState::SynReceived => self.on_packet_syn_received(packet),
            _ => self.on_segment(packet),
        }
    }

    fn on_packet_closed(&mut self, packet: &Packet) -> Vec<Packet> {
        // Our final ACK was lost and the peer resent its FIN.
        let end = seq::advance(packet.sequence_number(), packet.segment_len());
        if self.peer_fin && packet.is_fin() && end == self.expected_peer_seq {
            return vec![self.ack()];
        }
        Vec::new()
    }

    fn on_packet_syn_sent(&mut self, packet: &Packet) -> Vec<Packet> {
        if !(packet.is_syn() && packet.is_ack()) {
            return Vec::new();
        }
        if packet.acknowledgment_number() != self.local_next_seq {
            log::debug!(
                "[rcp] ← SYN+ACK with ack={} (expected {}); ignored",
                packet.acknowledgment_number(),
                self.local_next_seq
            );
            return Vec::new();
        }
        self.expected_peer_seq = seq::advance(packet.sequence_number(), 1);
        self.transition(ConnectionState::Established);
        vec![self.ack()]
    }

    fn on_packet_syn_received(&mut self, packet: &Packet) -> Vec<Packet> {
        if packet.is_syn() {
            // The peer did not see our SYN+ACK.
            if !packet.is_ack()
                && seq::advance(packet.sequence_number(), 1) == self.expected_peer_seq
            {
                return vec![self.syn_ack()];
            }
            return Vec::new();
        }
        if !packet.is_ack() || packet.acknowledgment_number() != self.local_next_seq {
            return Vec::new();
        }
        self.transition(ConnectionState::Established);
        // The final ACK may ride on the peer's first data segment.
        if packet.segment_len() > 0 {
            self.on_segment(packet)
        } else {
            Vec::new()
        }
    }

    fn on_segment(&mut self, packet: &Packet) -> Vec<Packet> {
        let mut out = Vec::new();

        if packet.is_syn() {
            // Retransmitted SYN+ACK: our handshake ACK was lost.
            if packet.is_ack() {
                out.push(self.ack());
            }
            return out;
        }

        if packet.is_ack() {
            let ack = packet.acknowledgment_number();
            let outcome = if packet.segment_len() == 0 {
                self.window.on_ack(ack)
            } else {
                self.window.on_piggybacked_ack(ack)
            };
            if let AckKind::Advanced(n) = outcome.kind {
                log::trace!("[rcp] ← ACK ack={ack} released {n}");
            }
            out.extend(outcome.transmit);
            self.check_fin_acked();
        }

        if packet.segment_len() == 0 {
            return out;
        }

        if packet.sequence_number() == self.expected_peer_seq && self.state.can_receive() {
            self.received.extend(packet.payload());
            self.expected_peer_seq = seq::advance(self.expected_peer_seq, packet.segment_len());
            if packet.is_fin() {
                self.on_peer_fin();
            }
        } else {
            log::trace!(
                "[rcp] ← seq={} len={} dropped (expected {})",
                packet.sequence_number(),
                packet.length(),
                self.expected_peer_seq
            );
        }
        out.push(self.ack());
        out
    }

    fn on_peer_fin(&mut self) {
        self.peer_fin = true;
        match self.state {
            ConnectionState::Established => self.transition(ConnectionState::CloseWait),
            ConnectionState::FinWait1 => self.transition(ConnectionState::Closing),
            ConnectionState::FinWait2 => self.transition(ConnectionState::Closed),
            _ => {}
        }
    }

    fn check_fin_acked(&mut self) {
        let Some(fin_end) = self.fin_end else {
            return;
        };
        if self.window.una() != fin_end {
            return;
        }
        match self.state {
            ConnectionState::FinWait1 => self.transition(ConnectionState::FinWait2),
            ConnectionState::Closing | ConnectionState::LastAck => {
                self.transition(ConnectionState::Closed)
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Room for another packet in the send backlog.
    pub fn has_room(&self) -> bool {
        self.window.has_room()
    }

    /// Queue up to one payload's worth of `data`.
    ///
    /// Returns how many bytes were taken and the packets the window admitted
    /// as a result.
    pub fn write(&mut self, data: &[u8]) -> Result<(usize, Vec<Packet>), ConnError> {
        self.check_can_send()?;
        let mut packet = Packet::with_header(self.local_next_seq, self.expected_peer_seq, flags::ACK);
        let n = packet.fill_payload(data);
        self.window.enqueue(packet)?;
        self.local_next_seq = seq::advance(self.local_next_seq, n as u16);
        Ok((n, self.window.admit_ready()))
    }

    /// Queue our FIN.  Returns the packets admitted as a result; nothing
    /// when a FIN is already queued.
    pub fn close(&mut self) -> Result<Vec<Packet>, ConnError> {
        let next = match self.state {
            ConnectionState::Established => ConnectionState::FinWait1,
            ConnectionState::CloseWait => ConnectionState::LastAck,
            ConnectionState::Closed | ConnectionState::SynSent | ConnectionState::SynReceived => {
                self.transition(ConnectionState::Closed);
                return Ok(Vec::new());
            }
            _ => return Ok(Vec::new()),
        };

        let fin = Packet::with_header(
            self.local_next_seq,
            self.expected_peer_seq,
            flags::FIN | flags::ACK,
        );
        self.window.enqueue(fin)?;
        self.local_next_seq = seq::advance(self.local_next_seq, 1);
        self.fin_end = Some(self.local_next_seq);
        self.transition(next);
        Ok(self.window.admit_ready())
    }

    /// `Ok` while data may still be queued.
    pub fn check_can_send(&self) -> Result<(), ConnError> {
        match self.state {
            s if s.can_send() => Ok(()),
            s if !s.is_synchronized() && s != ConnectionState::Closed => {
                Err(ConnError::NotEstablished(s))
            }
            _ => Err(ConnError::ConnectionClosed),
        }
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// When [`on_tick`](Self::on_tick) must next run.
    pub fn retransmit_deadline(&self) -> Option<tokio::time::Instant> {
        self.window.next_deadline()
    }

    /// Retransmission timer check.  Fails with `PeerUnresponsive` (and
    /// aborts) once one packet has been resent `max_retransmits` times.
    pub fn on_tick(&mut self) -> Result<Option<Packet>, ConnError> {
        let Some(packet) = self.window.on_timer_tick() else {
            return Ok(None);
        };
        if self.window.oldest_tx_count() > self.max_retransmits + 1 {
            log::warn!(
                "[rcp] seq={} unacknowledged after {} retransmits; aborting",
                packet.sequence_number(),
                self.max_retransmits
            );
            self.abort();
            return Err(ConnError::PeerUnresponsive);
        }
        Ok(Some(packet))
    }

    /// Drop to `Closed` without a teardown exchange.
    pub fn abort(&mut self) {
        self.transition(ConnectionState::Closed);
    }

    // -----------------------------------------------------------------------
    // Application side
    // -----------------------------------------------------------------------

    /// Take every in-order byte received so far, if any.
    pub fn take_received(&mut self) -> Option<Vec<u8>> {
        if self.received.is_empty() {
            return None;
        }
        Some(self.received.drain(..).collect())
    }

    /// The peer's FIN has arrived and every byte before it has been taken.
    pub fn at_eof(&self) -> bool {
        self.peer_fin && self.received.is_empty()
    }

    /// Every queued packet, FIN included, has been acknowledged.
    pub fn is_flushed(&self) -> bool {
        self.window.is_idle()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("[rcp] {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
