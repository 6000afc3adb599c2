//! Transport abstraction layer for Authgate.
//!
//! Provides the [`Transport`] trait: a reliable, ordered, message-oriented
//! network layer driven by polling. Connection-state changes are reported
//! as [`ConnectionEvent`]s and inbound messages are drained either per
//! connection or per poll group.
//!
//! Every method is synchronous and returns promptly. Implementations that
//! do real I/O (like [`WebSocketTransport`]) run it on background tasks and
//! feed internal queues; polling just drains those queues.
//!
//! # Close contract
//!
//! Calling [`Transport::close`] on a live connection emits exactly one
//! [`ConnectionEvent::Closed`] with [`EndReason::ClosedLocally`] on the next
//! poll. Closing a connection that is already closed, or that the transport
//! never knew about, is a no-op.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(feature = "websocket")]
pub use websocket::{DEFAULT_UPGRADE_TIMEOUT, IDENTITY_HEADER, WebSocketTransport};

use std::fmt;

/// Opaque identifier for a connection.
///
/// Handed out by the transport. Everyone else copies it around by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The identity of the remote peer, as negotiated by the transport.
///
/// This is what the identity service validates tickets against. A
/// transport only reports it once the connection is fully established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(pub u64);

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id-{}", self.0)
    }
}

/// Identifier for a poll group: a set of connections whose inbound
/// messages are drained together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollGroupId(u64);

impl PollGroupId {
    /// Creates a new `PollGroupId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PollGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Delivery guarantee requested for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Delivered, in order. All control messages use this.
    #[default]
    Reliable,
    /// May be dropped. Transports without an unreliable channel treat
    /// this as [`SendMode::Reliable`].
    Unreliable,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The remote side closed the connection.
    ClosedByPeer,
    /// The local transport detected a problem (timeout, refused, reset).
    ProblemDetectedLocally,
    /// This side called [`Transport::close`].
    ClosedLocally,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedByPeer => write!(f, "closed by peer"),
            Self::ProblemDetectedLocally => write!(f, "problem detected locally"),
            Self::ClosedLocally => write!(f, "closed locally"),
        }
    }
}

/// A connection-state change reported by [`Transport::poll_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A remote peer is attempting to connect to a listening transport.
    /// The connection must be [accepted](Transport::accept) or closed.
    Connecting {
        conn: ConnectionId,
        remote: String,
    },

    /// The connection is fully established. `identity` is the remote
    /// peer's identity if the transport could determine one.
    Connected {
        conn: ConnectionId,
        identity: Option<PeerIdentity>,
    },

    /// The connection ended. Reported at most once per connection.
    Closed {
        conn: ConnectionId,
        reason: EndReason,
        detail: String,
    },
}

impl ConnectionEvent {
    /// Returns the connection this event refers to.
    pub fn conn(&self) -> ConnectionId {
        match self {
            Self::Connecting { conn, .. }
            | Self::Connected { conn, .. }
            | Self::Closed { conn, .. } => *conn,
        }
    }
}

/// A message drained from a poll group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// The connection the message arrived on.
    pub conn: ConnectionId,
    /// The raw message bytes. One transport message is one protocol unit.
    pub data: Vec<u8>,
}

/// A reliable, ordered, message-boundary-preserving network layer.
///
/// # Trait bounds
///
/// `Send + Sync + 'static` because the server shares its transport
/// between the polling task and application handles.
pub trait Transport: Send + Sync + 'static {
    /// Starts connecting to `addr`. Returns immediately.
    ///
    /// # Errors
    /// [`TransportError::InvalidAddress`] if `addr` can't be parsed.
    /// Failures after that point arrive as a [`ConnectionEvent::Closed`].
    fn connect(&self, addr: &str) -> Result<ConnectionId, TransportError>;

    /// Accepts an inbound connection announced by
    /// [`ConnectionEvent::Connecting`].
    fn accept(&self, conn: ConnectionId) -> Result<(), TransportError>;

    /// Queues `data` for delivery. Fire-and-forget: `Ok` means queued.
    fn send(
        &self,
        conn: ConnectionId,
        data: &[u8],
        mode: SendMode,
    ) -> Result<(), TransportError>;

    /// Closes the connection with a human-readable reason. Idempotent.
    fn close(&self, conn: ConnectionId, reason: &str);

    /// Drains up to `max` pending connection events.
    fn poll_events(&self, max: usize) -> Vec<ConnectionEvent>;

    /// Creates a new, empty poll group.
    fn create_poll_group(&self) -> PollGroupId;

    /// Routes all future inbound messages of `conn` into `group`.
    ///
    /// Messages already waiting on the connection move with it.
    fn set_poll_group(
        &self,
        conn: ConnectionId,
        group: PollGroupId,
    ) -> Result<(), TransportError>;

    /// Drains up to `max` messages from every connection in `group`, in
    /// arrival order.
    fn poll_group_messages(
        &self,
        group: PollGroupId,
        max: usize,
    ) -> Vec<InboundMessage>;

    /// Drains up to `max` messages from a connection that has no poll group.
    fn poll_connection_messages(
        &self,
        conn: ConnectionId,
        max: usize,
    ) -> Vec<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_peer_identity_display() {
        assert_eq!(PeerIdentity(76561198).to_string(), "id-76561198");
    }

    #[test]
    fn test_connection_event_conn_accessor() {
        let conn = ConnectionId::new(3);
        let events = [
            ConnectionEvent::Connecting {
                conn,
                remote: "127.0.0.1:9".into(),
            },
            ConnectionEvent::Connected {
                conn,
                identity: None,
            },
            ConnectionEvent::Closed {
                conn,
                reason: EndReason::ClosedByPeer,
                detail: String::new(),
            },
        ];
        assert!(events.iter().all(|e| e.conn() == conn));
    }

    #[test]
    fn test_send_mode_defaults_to_reliable() {
        assert_eq!(SendMode::default(), SendMode::Reliable);
    }
}
