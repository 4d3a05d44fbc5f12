//! Datagram transport and per-peer demultiplexing.
//!
//! [`Transport`] is the narrow interface the protocol needs from the network:
//! send one datagram, receive one datagram, report the local address.
//! `tokio::net::UdpSocket` implements it directly;
//! [`LossyTransport`](crate::simulator::LossyTransport) wraps any transport
//! with fault injection.
//!
//! A [`Socket`] owns one transport and a background receive task that
//! decodes every datagram and routes it by source address:
//!
//! ```text
//!                       ┌─────────────── Socket ───────────────┐
//!   transport.recv ───▶ │ decode ─▶ routes[peer] ─▶ mpsc ──────┼──▶ Connection
//!                       │    │                                 │
//!                       │    └─ unknown peer + SYN ─▶ handshake┼──▶ Listener::accept
//!                       └──────────────────────────────────────┘
//! ```
//!
//! Undecodable datagrams, datagrams from unknown peers that are not a SYN,
//! and receive errors are dropped: an unreliable transport gives no
//! guarantees, and the retransmission timers recover what matters.
//!
//! Connections send directly on the shared transport, so several
//! connections on one socket make progress in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::ConnError;
use crate::listener::Listener;
use crate::packet::Packet;
use crate::pool::BufferPool;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// An unreliable, unordered datagram service.
pub trait Transport: Send + Sync + 'static {
    /// Send `buf` as one datagram to `peer`.
    fn send_to(
        &self,
        buf: &[u8],
        peer: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive one datagram into `buf`, returning its length and source.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for UdpSocket {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, peer).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

// ---------------------------------------------------------------------------
// Shared socket state
// ---------------------------------------------------------------------------

type Accepted<T> = Result<Connection<T>, ConnError>;

/// Where the receive task delivers datagrams from one peer.
struct Route {
    id: u64,
    tx: mpsc::Sender<Packet>,
}

/// State shared by the receive task, every connection, and the listener.
pub(crate) struct Shared<T: Transport> {
    pub(crate) transport: T,
    pub(crate) pool: BufferPool,
    pub(crate) config: Config,
    local_addr: SocketAddr,
    routes: Mutex<HashMap<SocketAddr, Route>>,
    /// Set while a [`Listener`] exists.
    backlog: Mutex<Option<mpsc::Sender<Accepted<T>>>>,
    next_route: AtomicU64,
}

/// Keeps the receive task alive; aborts it when the last handle goes.
pub(crate) struct Driver {
    reader: JoinHandle<()>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// What every socket-bound handle holds.
pub(crate) struct Link<T: Transport> {
    pub(crate) shared: Arc<Shared<T>>,
    driver: Arc<Driver>,
}

impl<T: Transport> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            driver: Arc::clone(&self.driver),
        }
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Transport> Shared<T> {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Route datagrams from `peer` to a new inbound queue.
    fn register(&self, peer: SocketAddr) -> Result<(u64, mpsc::Receiver<Packet>), ConnError> {
        let mut routes = lock(&self.routes);
        if routes.contains_key(&peer) {
            return Err(ConnError::AlreadyConnected(peer));
        }
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.inbound_queue);
        routes.insert(peer, Route { id, tx });
        Ok((id, rx))
    }

    /// Remove the route for `peer` if it still belongs to connection `id`.
    pub(crate) fn deregister(&self, peer: SocketAddr, id: u64) {
        let mut routes = lock(&self.routes);
        if routes.get(&peer).is_some_and(|r| r.id == id) {
            routes.remove(&peer);
        }
    }

    pub(crate) fn open_backlog(&self) -> Result<mpsc::Receiver<Accepted<T>>, ConnError> {
        let mut backlog = lock(&self.backlog);
        if backlog.is_some() {
            return Err(ConnError::AlreadyListening);
        }
        let (tx, rx) = mpsc::channel(self.config.accept_backlog);
        *backlog = Some(tx);
        Ok(rx)
    }

    pub(crate) fn close_backlog(&self) {
        lock(&self.backlog).take();
    }

    /// Send one packet, logging rather than returning failures: a datagram
    /// that never left is indistinguishable from one lost in the network.
    pub(crate) async fn transmit(&self, packet: &Packet, peer: SocketAddr) {
        let mut buf = self.pool.acquire();
        let n = packet.encode_into(&mut buf[..]);
        log::trace!("[rcp] → {packet} to {peer}");
        if let Err(e) = self.transport.send_to(&buf[..n], peer).await {
            log::debug!("[rcp:sock] send to {peer} failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// One local transport endpoint, shared by any number of connections and at
/// most one [`Listener`].
///
/// Cloning is cheap; every clone refers to the same endpoint.
pub struct Socket<T: Transport = UdpSocket> {
    link: Link<T>,
}

impl<T: Transport> Clone for Socket<T> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
        }
    }
}

impl Socket<UdpSocket> {
    /// Bind a UDP socket.  Port 0 lets the OS choose.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self, ConnError> {
        let udp = UdpSocket::bind(addr).await?;
        Self::with_transport(udp, config)
    }
}

impl<T: Transport> Socket<T> {
    /// Run the protocol over an existing transport.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_transport(transport: T, config: Config) -> Result<Self, ConnError> {
        let local_addr = transport.local_addr()?;
        let shared = Arc::new(Shared {
            transport,
            pool: BufferPool::new(config.pool_capacity),
            local_addr,
            routes: Mutex::new(HashMap::new()),
            backlog: Mutex::new(None),
            next_route: AtomicU64::new(0),
            config,
        });
        let driver = Arc::new_cyclic(|weak: &Weak<Driver>| Driver {
            reader: tokio::spawn(receive_loop(Arc::clone(&shared), weak.clone())),
        });
        log::debug!("[rcp:sock] bound {local_addr}");
        Ok(Self {
            link: Link { shared, driver },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.shared.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.link.shared.config
    }

    /// Active open to `peer`.
    ///
    /// Resolves once the handshake completes, or fails with
    /// [`ConnError::HandshakeTimeout`] after `handshake_retries`
    /// retransmissions of the SYN.  Dropping the future abandons the attempt.
    pub async fn connect(&self, peer: SocketAddr) -> Result<Connection<T>, ConnError> {
        let (route, inbound) = self.link.shared.register(peer)?;
        let conn = Connection::new(self.link.clone(), peer, route, inbound);
        conn.active_open().await
    }

    /// Start accepting inbound handshakes.  Only one listener may exist per
    /// socket at a time.
    pub fn listen(&self) -> Result<Listener<T>, ConnError> {
        let accepted = self.link.shared.open_backlog()?;
        log::info!("[rcp:listen] listening on {}", self.local_addr());
        Ok(Listener::new(self.link.clone(), accepted))
    }
}

// ---------------------------------------------------------------------------
// Receive task
// ---------------------------------------------------------------------------

async fn receive_loop<T: Transport>(shared: Arc<Shared<T>>, driver: Weak<Driver>) {
    let mut packet = Packet::new();
    loop {
        let received = {
            let mut buf = shared.pool.acquire();
            match shared.transport.recv_from(&mut buf[..]).await {
                Ok((n, from)) => packet.decode_in_place(&buf[..], n).map(|()| from),
                Err(e) => {
                    log::trace!("[rcp:sock] recv failed: {e}");
                    tokio::task::yield_now().await;
                    continue;
                }
            }
        };
        match received {
            Ok(from) => dispatch(&shared, &driver, &packet, from),
            Err(e) => log::debug!("[rcp:sock] dropped malformed datagram: {e}"),
        }
    }
}

fn dispatch<T: Transport>(
    shared: &Arc<Shared<T>>,
    driver: &Weak<Driver>,
    packet: &Packet,
    from: SocketAddr,
) {
    log::trace!("[rcp] ← {packet} from {from}");

    if let Some(route) = lock(&shared.routes).get(&from) {
        match route.tx.try_send(packet.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("[rcp:sock] inbound queue for {from} full; dropped")
            }
            Err(TrySendError::Closed(_)) => {}
        }
        return;
    }

    if !packet.is_syn() || packet.is_ack() {
        log::trace!("[rcp:sock] no connection for {from}; dropped");
        return;
    }
    let Some(backlog) = lock(&shared.backlog).clone() else {
        log::debug!("[rcp:sock] SYN from {from} but not listening");
        return;
    };
    let Some(driver) = driver.upgrade() else {
        return;
    };
    let Ok((route, inbound)) = shared.register(from) else {
        return;
    };

    log::debug!("[rcp:listen] ← SYN from {from}");
    let link = Link {
        shared: Arc::clone(shared),
        driver,
    };
    let conn = Connection::new(link, from, route, inbound);
    let syn = packet.clone();
    tokio::spawn(async move {
        let result = conn.passive_open(&syn).await;
        if let Err(e) = &result {
            log::debug!("[rcp:listen] handshake with {from} failed: {e}");
        }
        // A closed backlog means the listener is gone; the connection is
        // dropped with the error.
        let _ = backlog.send(result).await;
    });
}
