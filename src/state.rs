//! Connection finite-state machine (FSM) states.
//!
//! Transitions are driven by [`crate::connection`]; this module only names
//! the states.
//!
//! ```text
//!            connect()                 SYN+ACK
//!  CLOSED ─────────────▶ SYN_SENT ─────────────▶ ESTABLISHED
//!    │ listen()                                   ▲  │     │
//!    ▼                 SYN                        │  │     │ peer FIN
//!  LISTEN ────────────────────────────────────────┘  │     ▼
//!                                          close()   │  CLOSE_WAIT
//!                                                    ▼     │ close()
//!  CLOSED ◀──── peer FIN (or own FIN acked ──── FIN_WAIT ◀─┘
//!               after peer FIN)
//! ```
//!
//! Retry exhaustion forces any state to `Closed`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Initial and terminal state.
    #[default]
    Closed,
    /// Passive open; waiting for a SYN.
    Listen,
    /// SYN sent; waiting for SYN+ACK.
    SynSent,
    /// Handshake complete; data flows both ways.
    Established,
    /// Local close requested; FIN sent.
    FinWait,
    /// Peer sent FIN; no more data will arrive.
    CloseWait,
}

impl ConnectionState {
    /// `true` once the handshake wait is over, successfully or not.
    pub(crate) fn handshake_settled(self) -> bool {
        !matches!(self, ConnectionState::Listen | ConnectionState::SynSent)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait => "FIN_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
        };
        f.write_str(name)
    }
}
