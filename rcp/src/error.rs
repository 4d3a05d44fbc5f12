//! Errors surfaced to the application by connections and listeners.
//!
//! Malformed datagrams and transport send/receive failures never appear
//! here: they are logged and absorbed where they happen, and the
//! retransmission timer recovers whatever was lost.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::state::ConnectionState;
use crate::window::BacklogFull;

#[derive(Debug, Error)]
pub enum ConnError {
    /// No valid handshake response within the retry budget.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The connection has been torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// The send backlog stayed full with no forward progress.
    #[error("send backlog full with no forward progress")]
    CongestionCollapse,

    /// The operation needs a synchronized connection.
    #[error("connection not established (state {0})")]
    NotEstablished(ConnectionState),

    /// A packet was retransmitted too many times without being acknowledged.
    #[error("peer stopped acknowledging")]
    PeerUnresponsive,

    /// The socket already routes datagrams from this peer to a connection.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    /// `close` gave up waiting for the peer's half of the teardown; the
    /// connection was closed anyway.
    #[error("teardown unfinished in {0} after linger timeout")]
    TeardownTimeout(ConnectionState),

    /// A listener is already accepting on this socket.
    #[error("socket is already listening")]
    AlreadyListening,

    /// Binding or querying the local transport failed.
    #[error("transport: {0}")]
    Io(#[from] io::Error),
}

impl From<BacklogFull> for ConnError {
    fn from(_: BacklogFull) -> Self {
        Self::CongestionCollapse
    }
}
