//! The application hook for authenticated sessions.
//!
//! Authgate owns the handshake; what happens after it is up to you.
//! Implement [`SessionHandler`] and the server calls it for three things
//! only: a session was established, a validated session sent a message,
//! and a validated session went away. Traffic from connections that
//! haven't authenticated never reaches the handler.

use authgate_transport::{ConnectionId, PeerIdentity};

/// Who an authenticated session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub conn: ConnectionId,
    /// The identity the identity service validated.
    pub identity: PeerIdentity,
}

/// Where a handler's reply goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// Back to the session that sent the message.
    Sender,
    /// A specific connection. Dropped unless it is validated.
    Connection(ConnectionId),
    /// Every validated session, sender included.
    AllValidated,
}

/// Application logic for authenticated sessions.
///
/// Called from the server's single event path, so methods take `&mut self`
/// and never run concurrently.
///
/// # Example
///
/// ```rust
/// use authgate::{Recipient, SessionHandler, SessionInfo};
///
/// struct Greeter;
///
/// impl SessionHandler for Greeter {
///     fn on_message(
///         &mut self,
///         _session: &SessionInfo,
///         data: &[u8],
///     ) -> Vec<(Recipient, Vec<u8>)> {
///         if data == b"HELLO_SERVER" {
///             vec![(Recipient::Sender, b"SERVER_SAYS_HI_CLIENT".to_vec())]
///         } else {
///             Vec::new()
///         }
///     }
/// }
/// ```
pub trait SessionHandler: Send + 'static {
    /// A connection finished the handshake.
    fn on_authenticated(&mut self, session: &SessionInfo) {
        let _ = session;
    }

    /// A validated session sent `data`. Returns the replies to send.
    fn on_message(&mut self, session: &SessionInfo, data: &[u8]) -> Vec<(Recipient, Vec<u8>)>;

    /// A validated session disconnected (or the server is shutting down).
    fn on_disconnected(&mut self, session: &SessionInfo) {
        let _ = session;
    }
}
