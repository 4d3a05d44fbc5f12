//! One reliable byte stream to one peer.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send / recv / flush / close
//!      ▼
//!  Connection ──────────────────────────────┐
//!    ├── Tcb (state machine, window, cc)    │ transmit()
//!    ├── inbound: mpsc::Receiver<Packet> ◀──┼── Socket receive task
//!    └── Link (shared transport + pool) ◀───┘
//! ```
//!
//! A `Connection` is driven by whichever call is currently awaiting on it:
//! every suspending method loops over [`step`](Connection::step), which waits
//! for the first of an inbound packet, the retransmission deadline, or the
//! caller's own deadline, and feeds that event through the [`Tcb`].  There is
//! no background task per connection; `&mut self` gives each connection a
//! single logical flow of control.
//!
//! ```ignore
//! let socket = Socket::bind("0.0.0.0:0", Config::default()).await?;
//! let mut conn = socket.connect(server).await?;
//! conn.send(b"hello").await?;
//! let reply = conn.recv().await?;
//! conn.close().await?;
//! ```
//!
//! Every method is cancel-safe: state changes are applied between awaits,
//! and a packet whose transmission was cancelled is treated as lost.

use std::net::SocketAddr;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::config::Config;
use crate::error::ConnError;
use crate::packet::Packet;
use crate::seq::MAX_SEQ_NUM;
use crate::socket::{Link, Shared, Transport};
use crate::state::ConnectionState;
use crate::tcb::Tcb;

/// A reliable, ordered, bidirectional connection.
///
/// Obtained from [`Socket::connect`](crate::socket::Socket::connect) or
/// [`Listener::accept`](crate::listener::Listener::accept).  Dropping it
/// releases the peer's route on the socket without a teardown exchange; call
/// [`close`](Self::close) first for an orderly shutdown.
pub struct Connection<T: Transport = UdpSocket> {
    tcb: Tcb,
    peer: SocketAddr,
    link: Link<T>,
    inbound: mpsc::Receiver<Packet>,
    /// Identifies our entry in the socket's routing table.
    route: u64,
    config: Config,
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.tcb.state())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(
        link: Link<T>,
        peer: SocketAddr,
        route: u64,
        inbound: mpsc::Receiver<Packet>,
    ) -> Self {
        let config = link.shared.config.clone();
        Self {
            tcb: Tcb::new(&config),
            peer,
            link,
            inbound,
            route,
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.tcb.state()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.shared.local_addr()
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    pub(crate) async fn active_open(mut self) -> Result<Self, ConnError> {
        let isn = choose_isn();
        let syn = self.tcb.open_active(isn);
        log::debug!("[rcp] → SYN seq={isn} to {}", self.peer);
        self.handshake(syn).await?;
        log::info!("[rcp] connected to {}", self.peer);
        Ok(self)
    }

    pub(crate) async fn passive_open(mut self, syn: &Packet) -> Result<Self, ConnError> {
        let syn_ack = self.tcb.open_passive(syn, choose_isn());
        log::debug!("[rcp:listen] → {syn_ack} to {}", self.peer);
        self.handshake(syn_ack).await?;
        log::info!("[rcp:listen] accepted {}", self.peer);
        Ok(self)
    }

    /// Send `first` and retransmit the current handshake packet with a
    /// doubling timeout until the state machine leaves the SYN states.
    async fn handshake(&mut self, first: Packet) -> Result<(), ConnError> {
        let mut rto = self.config.initial_rto;
        let mut packet = Some(first);

        for attempt in 0..=self.config.handshake_retries {
            let Some(p) = packet.take() else {
                break;
            };
            if attempt > 0 {
                log::debug!(
                    "[rcp] handshake with {} retry {attempt}/{} (rto {rto:?})",
                    self.peer,
                    self.config.handshake_retries
                );
            }
            transmit(&self.link.shared, self.peer, &[p]).await;

            let deadline = Instant::now() + rto;
            while self.handshaking() {
                if !self.step(Some(deadline)).await? {
                    break;
                }
            }
            if self.tcb.state().is_synchronized() {
                return Ok(());
            }
            rto = (rto * 2).min(self.config.max_rto);
            packet = self.tcb.handshake_packet();
        }

        log::warn!("[rcp] no handshake response from {}; giving up", self.peer);
        self.tcb.abort();
        Err(ConnError::HandshakeTimeout)
    }

    fn handshaking(&self) -> bool {
        matches!(
            self.tcb.state(),
            ConnectionState::SynSent | ConnectionState::SynReceived
        )
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Queue `data` for delivery, split into payload-sized packets.
    ///
    /// Returns once every byte is queued, which may be before any of it is
    /// acknowledged; see [`flush`](Self::flush).  When the send backlog stays
    /// full for `backlog_timeout` the call fails with
    /// [`ConnError::CongestionCollapse`]; bytes queued before that are still
    /// delivered and the connection remains usable.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, ConnError> {
        self.tcb.check_can_send()?;
        let mut written = 0;
        while written < data.len() {
            if !self.tcb.has_room() {
                self.wait_for_room().await?;
            }
            let (n, admitted) = self.tcb.write(&data[written..])?;
            transmit(&self.link.shared, self.peer, &admitted).await;
            written += n;
        }
        Ok(written)
    }

    async fn wait_for_room(&mut self) -> Result<(), ConnError> {
        let deadline = Instant::now() + self.config.backlog_timeout;
        while !self.tcb.has_room() {
            if !self.step(Some(deadline)).await? {
                log::warn!(
                    "[rcp] send backlog to {} stuck for {:?}",
                    self.peer,
                    self.config.backlog_timeout
                );
                return Err(ConnError::CongestionCollapse);
            }
        }
        Ok(())
    }

    /// Receive the next in-order bytes.
    ///
    /// Returns `Ok(None)` once the peer has closed its side and everything it
    /// sent has been returned; further calls keep returning `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        loop {
            if let Some(data) = self.tcb.take_received() {
                return Ok(Some(data));
            }
            if self.tcb.at_eof() {
                return Ok(None);
            }
            match self.tcb.state() {
                ConnectionState::Closed => return Err(ConnError::ConnectionClosed),
                s if !s.is_synchronized() => return Err(ConnError::NotEstablished(s)),
                _ => {}
            }
            self.step(None).await?;
        }
    }

    /// Wait until everything sent so far, including a FIN, is acknowledged.
    pub async fn flush(&mut self) -> Result<(), ConnError> {
        while !self.tcb.is_flushed() {
            if self.tcb.state() == ConnectionState::Closed {
                return Err(ConnError::ConnectionClosed);
            }
            self.step(None).await?;
        }
        Ok(())
    }

    /// Orderly shutdown: queue a FIN behind any unsent data and wait for both
    /// directions to close.
    ///
    /// If the peer does not finish its side within `linger_timeout` the
    /// connection is closed anyway and [`ConnError::TeardownTimeout`] is
    /// returned.  Bytes the peer sends meanwhile are discarded.  Closing a
    /// closed connection is a no-op.
    ///
    /// When our ACK of the peer's FIN was the last packet of the exchange,
    /// `close` keeps answering retransmitted FINs until the peer has been
    /// quiet for two initial RTOs.
    pub async fn close(&mut self) -> Result<(), ConnError> {
        if self.tcb.state() == ConnectionState::Closed {
            return Ok(());
        }
        // The passive closer's last event is the ACK of its own FIN.
        let acks_last = matches!(
            self.tcb.state(),
            ConnectionState::Established
                | ConnectionState::FinWait1
                | ConnectionState::FinWait2
                | ConnectionState::Closing
        );
        let deadline = Instant::now() + self.config.linger_timeout;

        while !self.tcb.has_room() {
            if !self.step(Some(deadline)).await? {
                return self.force_close();
            }
        }
        let fin = self.tcb.close()?;
        transmit(&self.link.shared, self.peer, &fin).await;

        while self.tcb.state() != ConnectionState::Closed {
            if !self.step(Some(deadline)).await? {
                return self.force_close();
            }
        }
        if acks_last {
            self.drain_peer_fin().await;
        }
        log::debug!("[rcp] closed connection to {}", self.peer);
        Ok(())
    }

    /// Keep re-ACKing the peer's FIN until it stops resending.
    async fn drain_peer_fin(&mut self) {
        let quiet = self.config.initial_rto * 2;
        let give_up = Instant::now() + self.config.linger_timeout;
        loop {
            let until = (Instant::now() + quiet).min(give_up);
            match self.step(Some(until)).await {
                Ok(true) if Instant::now() < give_up => {}
                _ => break,
            }
        }
    }

    fn force_close(&mut self) -> Result<(), ConnError> {
        let state = self.tcb.state();
        log::warn!(
            "[rcp] teardown with {} unfinished in {state}; force-closing",
            self.peer
        );
        self.tcb.abort();
        Err(ConnError::TeardownTimeout(state))
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Wait for one event and apply it.  Returns `Ok(false)` when `until`
    /// passed first.
    async fn step(&mut self, until: Option<Instant>) -> Result<bool, ConnError> {
        let retransmit_at = self.tcb.retransmit_deadline();

        tokio::select! {
            received = self.inbound.recv() => {
                let Some(packet) = received else {
                    // The socket's receive task is gone.
                    self.tcb.abort();
                    return Err(ConnError::ConnectionClosed);
                };
                let replies = self.tcb.on_packet(&packet);
                transmit(&self.link.shared, self.peer, &replies).await;
                Ok(true)
            }
            _ = sleep_until_opt(retransmit_at) => {
                if let Some(packet) = self.tcb.on_tick()? {
                    log::debug!("[rcp] retransmit {packet} to {}", self.peer);
                    transmit(&self.link.shared, self.peer, &[packet]).await;
                }
                Ok(true)
            }
            _ = sleep_until_opt(until) => Ok(false),
        }
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.link.shared.deregister(self.peer, self.route);
    }
}

async fn transmit<T: Transport>(shared: &Shared<T>, peer: SocketAddr, packets: &[Packet]) {
    for packet in packets {
        shared.transmit(packet, peer).await;
    }
}

fn choose_isn() -> u16 {
    rand::thread_rng().gen_range(0..MAX_SEQ_NUM)
}

/// Sleep until `at`, or forever when there is no deadline.
async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
