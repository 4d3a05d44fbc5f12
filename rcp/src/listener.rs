//! Passive open.
//!
//! A [`Listener`] turns inbound SYNs on its socket into established
//! [`Connection`]s.  Each SYN from a new peer address gets its own
//! handshake task, so a slow or lossy peer never holds up the others;
//! completed handshakes queue up (at most `accept_backlog` of them) until
//! [`accept`](Listener::accept) takes them.

use std::net::SocketAddr;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::ConnError;
use crate::socket::{Link, Socket, Transport};

pub struct Listener<T: Transport = UdpSocket> {
    link: Link<T>,
    accepted: mpsc::Receiver<Result<Connection<T>, ConnError>>,
}

impl Listener<UdpSocket> {
    /// Bind a UDP socket and listen on it.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self, ConnError> {
        Socket::bind(addr, config).await?.listen()
    }
}

impl<T: Transport> Listener<T> {
    pub(crate) fn new(
        link: Link<T>,
        accepted: mpsc::Receiver<Result<Connection<T>, ConnError>>,
    ) -> Self {
        Self { link, accepted }
    }

    /// Wait for the next handshake to finish.
    ///
    /// A handshake that ran out of retries is reported as
    /// [`ConnError::HandshakeTimeout`]; the listener stays usable.
    pub async fn accept(&mut self) -> Result<Connection<T>, ConnError> {
        self.accepted
            .recv()
            .await
            .unwrap_or(Err(ConnError::ConnectionClosed))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.shared.local_addr()
    }
}

impl<T: Transport> Drop for Listener<T> {
    fn drop(&mut self) {
        self.link.shared.close_backlog();
    }
}
