//! `rcp`: a reliable, connection-oriented byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────────────────── Connection ──────────────────────────┐
//!  │  Tcb: handshake / teardown state machine, sequence cursors     │
//!  │   └── RetransmissionWindow: buffered ─▶ pending ─▶ acked       │
//!  │         └── Box<dyn CongestionControl>: FixedWindow | Aimd     │
//!  └───────────────┬──────────────────────────────▲─────────────────┘
//!                  │ Packet::encode_into          │ mpsc (per peer)
//!  ┌───────────────▼──────────────────────────────┴─────────────────┐
//!  │  Socket: Transport + BufferPool + receive task (demux by addr) │
//!  └───────────────┬──────────────────────────────▲─────────────────┘
//!                  │           UDP datagrams      │
//!                  ▼                              │
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     wire format (encode / decode)
//! - [`seq`]        sequence-number ring arithmetic
//! - [`timer`]      retransmission deadline with back-off
//! - [`congestion`] pluggable admission and retransmission policy
//! - [`window`]     buffered and in-flight packets
//! - [`state`]      connection FSM states
//! - [`tcb`]        I/O-free per-connection state machine
//! - [`connection`] async send / recv / flush / close
//! - [`socket`]     transport trait and datagram demultiplexing
//! - [`listener`]   passive open
//! - [`pool`]       shared datagram buffers
//! - [`simulator`]  lossy / reordering transport for tests
//! - [`config`]     tunable constants
//! - [`error`]      errors surfaced to the application

pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod listener;
pub mod packet;
pub mod pool;
pub mod seq;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod tcb;
pub mod timer;
pub mod window;

pub use config::Config;
pub use congestion::CongestionStrategy;
pub use connection::Connection;
pub use error::ConnError;
pub use listener::Listener;
pub use packet::{Packet, PacketError};
pub use socket::{Socket, Transport};
pub use state::ConnectionState;
