//! The three control messages of the handshake.
//!
//! ```text
//! server                              client
//!   │ ── WELCOME_SEND_AUTH_TICKET ──→   │
//!   │ ←── [len: u32 BE][ticket] ────    │
//!   │ ── AUTH_SUCCESSFUL_WELCOME_PLAYER → │   (or AUTH_FAILED_VALIDATION)
//! ```
//!
//! Control messages carry no length and no payload. A receiver recognizes
//! one by prefix, so a server is free to append detail after the tag.

/// A server-to-client control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Sent once the server knows who the peer is. Asks for the ticket.
    Greeting,
    /// The identity service accepted the ticket.
    AuthSuccess,
    /// The ticket was rejected. The server closes right after sending it.
    AuthFailure,
}

impl ControlMessage {
    /// Every control message, in handshake order.
    pub const ALL: [Self; 3] = [Self::Greeting, Self::AuthSuccess, Self::AuthFailure];

    /// The bytes the server sends for this message.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Greeting => b"WELCOME_SEND_AUTH_TICKET",
            Self::AuthSuccess => b"AUTH_SUCCESSFUL_WELCOME_PLAYER",
            Self::AuthFailure => b"AUTH_FAILED_VALIDATION",
        }
    }

    /// The prefix a receiver matches on.
    pub fn prefix(self) -> &'static [u8] {
        match self {
            Self::Greeting => b"WELCOME",
            Self::AuthSuccess => b"AUTH_SUCCESSFUL",
            Self::AuthFailure => b"AUTH_FAILED",
        }
    }

    /// Returns the control message `data` starts with, if any.
    pub fn recognize(data: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|msg| data.starts_with(msg.prefix()))
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Greeting => write!(f, "greeting"),
            Self::AuthSuccess => write!(f, "auth success"),
            Self::AuthFailure => write!(f, "auth failure"),
        }
    }
}
