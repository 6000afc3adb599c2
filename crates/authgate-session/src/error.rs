//! Error types for the session layer.

use authgate_transport::{ConnectionId, PeerIdentity};

/// Errors that can occur while admitting or authenticating a connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The registry is at capacity. The connection is rejected, not queued.
    #[error("server full ({capacity} connections)")]
    ServerFull { capacity: usize },

    /// A record for this connection id already exists.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// The operation requires a validated session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The client already has a connection (or is attempting one).
    #[error("already connected")]
    AlreadyConnected,

    /// The client has no connection.
    #[error("not connected")]
    NotConnected,

    /// The server rejected the ticket.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// A validation response named an identity with no pending record.
    #[error("no connection awaiting validation for {0}")]
    IdentityMismatch(PeerIdentity),
}

/// Failures talking to the identity service.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No ticket could be obtained.
    #[error("ticket issuance failed: {0}")]
    IssueFailed(String),

    /// The service refused to start validating the ticket.
    #[error("validation refused: {0}")]
    ValidationRefused(String),

    /// The receiving end of the validation queue is gone.
    #[error("validation queue closed")]
    SinkClosed,

    /// The validation queue is full.
    #[error("validation queue full")]
    SinkFull,
}
