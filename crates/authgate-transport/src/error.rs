use crate::{ConnectionId, PollGroupId};

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The transport has no connection with this id (never existed, or
    /// already released).
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The connection exists but isn't waiting to be accepted.
    #[error("connection {0} is not awaiting accept")]
    NotConnecting(ConnectionId),

    /// The connection isn't established yet.
    #[error("connection {0} is not connected yet")]
    NotConnected(ConnectionId),

    /// The poll group doesn't exist on this transport.
    #[error("unknown poll group {0}")]
    UnknownPollGroup(PollGroupId),

    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The transport was shut down, or has no runtime to run on.
    #[error("transport shut down")]
    Shutdown,
}
