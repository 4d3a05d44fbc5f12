//! Connection finite-state machine (FSM) states.
//!
//! Transitions are driven by [`crate::tcb::Tcb`]; this module only names the
//! states and which of them can still move data.
//!
//! ```text
//!            active open                       passive open
//!  CLOSED ──SYN──▶ SYN_SENT            CLOSED ──SYN──▶ SYN_RECEIVED
//!                     │ SYN+ACK                            │ ACK
//!                     ▼                                    ▼
//!                 ESTABLISHED ◀────────────────────────────┘
//!        close()  │        │  peer FIN
//!                 ▼        ▼
//!          FIN_WAIT_1    CLOSE_WAIT
//!   ACK of FIN │  │ peer FIN   │ close()
//!              ▼  ▼            ▼
//!     FIN_WAIT_2  CLOSING     LAST_ACK
//!     peer FIN │    │ ACK of FIN │ ACK of FIN
//!              ▼    ▼            ▼
//!              └──▶ CLOSED ◀─────┘
//! ```
//!
//! There is no TIME_WAIT state: the side that sends the final ACK is
//! `CLOSED` at once, and its `close` call stays behind until the peer has
//! been quiet for two initial RTOs, re-ACKing any retransmitted FIN.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection; initial and terminal state.
    #[default]
    Closed,
    /// SYN sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received and SYN+ACK sent; waiting for the final ACK.
    SynReceived,
    /// Handshake complete; data flows both ways.
    Established,
    /// Local FIN sent; waiting for its ACK.
    FinWait1,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// Both sides sent FIN before either was acknowledged.
    Closing,
    /// Peer's FIN received; the local side may still send.
    CloseWait,
    /// Local FIN sent after the peer's; waiting for its ACK.
    LastAck,
}

impl ConnectionState {
    /// `true` while the local side may still queue data.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// `true` while the peer may still deliver data.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }

    /// `true` once the three-way handshake has completed.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, Self::Closed | Self::SynSent | Self::SynReceived)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::Closing => "CLOSING",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_capabilities_follow_half_close() {
        assert!(ConnectionState::Established.can_send());
        assert!(ConnectionState::CloseWait.can_send());
        assert!(!ConnectionState::FinWait1.can_send());

        assert!(ConnectionState::FinWait2.can_receive());
        assert!(!ConnectionState::CloseWait.can_receive());
        assert!(!ConnectionState::SynSent.is_synchronized());
        assert!(ConnectionState::LastAck.is_synchronized());
    }

    #[test]
    fn displays_rfc_names() {
        assert_eq!(ConnectionState::default().to_string(), "CLOSED");
        assert_eq!(ConnectionState::FinWait2.to_string(), "FIN_WAIT_2");
    }
}
