//! The authentication state graph shared by both sides of the handshake.

use std::fmt;

/// Where a connection is in the handshake.
///
/// ```text
///   Connecting ──→ Pending ──→ TicketReceived ──→ Validated
///        │            │              │
///        └────────────┴──────────────┴──→ Failed
///
///   any state ──→ Closed
/// ```
///
/// - **Connecting**: the transport link is being set up.
/// - **Pending**: connected; the ticket hasn't arrived (server) or hasn't
///   been asked for yet (client).
/// - **TicketReceived**: a well-formed ticket is being validated.
/// - **Validated**: terminal success. Application traffic flows.
/// - **Failed**: terminal failure. The connection is being closed.
/// - **Closed**: absorbing. The connection is gone.
///
/// Transitions only move forward; see [`can_transition_to`](Self::can_transition_to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    Connecting,
    Pending,
    TicketReceived,
    Validated,
    Failed,
    Closed,
}

impl AuthState {
    /// Returns the next state on the success path, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Connecting => Some(Self::Pending),
            Self::Pending => Some(Self::TicketReceived),
            Self::TicketReceived => Some(Self::Validated),
            Self::Validated | Self::Failed | Self::Closed => None,
        }
    }

    /// Returns `true` if moving to `target` follows the graph.
    pub fn can_transition_to(self, target: Self) -> bool {
        match target {
            Self::Closed => self != Self::Closed,
            Self::Failed => self.is_handshaking(),
            _ => self.next() == Some(target),
        }
    }

    /// Returns `true` while the handshake is still in progress.
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Connecting | Self::Pending | Self::TicketReceived)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Pending => write!(f, "Pending"),
            Self::TicketReceived => write!(f, "TicketReceived"),
            Self::Validated => write!(f, "Validated"),
            Self::Failed => write!(f, "Failed"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
