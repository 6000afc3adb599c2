//! # Authgate
//!
//! Ticket-authenticated client/server sessions over a polled message
//! transport.
//!
//! A client obtains a session ticket from an identity service and
//! connects. The server greets it, receives the length-prefixed ticket,
//! asks the identity service to validate it, and either welcomes the
//! client or closes the connection. Only then does application traffic
//! flow, through a [`SessionHandler`] you implement.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use authgate::prelude::*;
//!
//! struct Hello;
//!
//! impl SessionHandler for Hello {
//!     fn on_message(&mut self, _: &SessionInfo, data: &[u8]) -> Vec<(Recipient, Vec<u8>)> {
//!         if data == b"HELLO_SERVER" {
//!             vec![(Recipient::Sender, b"SERVER_SAYS_HI_CLIENT".to_vec())]
//!         } else {
//!             Vec::new()
//!         }
//!     }
//! }
//!
//! # async fn start() -> Result<(), AuthgateError> {
//! let authority = LocalAuthority::new();
//! let server = ServerBuilder::new()
//!     .bind("127.0.0.1:1234")
//!     .build_websocket(Some(PeerIdentity(1)), authority.clone(), Hello)
//!     .await?;
//! server.run().await;
//! # Ok(())
//! # }
//! ```

mod adapter;
mod client;
mod config;
mod dispatcher;
mod error;
mod handler;
mod server;

pub use client::{Client, ClientEvent, DISCONNECT_REASON};
pub use config::{ClientConfig, OwnerMismatchPolicy, ServerConfig};
pub use error::{AuthgateError, ConfigError};
pub use handler::{Recipient, SessionHandler, SessionInfo};
pub use server::{Server, ServerBuilder, ServerHandle};

pub use authgate_protocol as protocol;
pub use authgate_session as session;
pub use authgate_transport as transport;

/// Installs a `tracing` subscriber that logs to stderr.
///
/// The filter comes from `RUST_LOG` when set, else `default_directive`
/// (e.g. `"info"` or `"authgate=debug"`). Returns `false` if a global
/// subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// Everything needed to run a server or client.
pub mod prelude {
    pub use crate::{
        AuthgateError, Client, ClientConfig, ClientEvent, OwnerMismatchPolicy, Recipient,
        Server, ServerBuilder, ServerConfig, ServerHandle, SessionHandler, SessionInfo,
        init_tracing,
    };
    pub use authgate_protocol::ControlMessage;
    pub use authgate_session::{
        AuthFailureReason, AuthState, AuthTicket, LocalAuthority, LocalIssuer,
        SessionError, TicketHandle, TicketIssuer, TicketValidator, ValidationResponse,
        ValidationSink,
    };
    pub use authgate_transport::{
        ConnectionId, EndReason, MemoryNetwork, MemoryTransport, PeerIdentity,
        Transport, WebSocketTransport,
    };
}
