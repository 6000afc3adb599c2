//! Authentication sessions for Authgate.
//!
//! This crate turns a raw transport connection into an authenticated
//! session:
//!
//! 1. **State**: the [`AuthState`] graph every connection moves along
//! 2. **Handshakes**: [`ServerHandshake`] and [`ClientHandshake`], pure
//!    state machines: `(state, input) → (new state, effects)`
//! 3. **Registry**: [`ConnectionRegistry`], the server's thread-safe
//!    table of per-connection handshakes, with atomic admission control
//! 4. **Identity service**: [`TicketIssuer`] / [`TicketValidator`]
//!    traits and [`LocalAuthority`], an in-process implementation
//!
//! # How it fits in the stack
//!
//! ```text
//! Server / Client (above)  ← execute effects: send, close, call the identity service
//!     ↕
//! Session Layer (this crate)  ← decides what each event means for a connection
//!     ↕
//! Protocol Layer (below)  ← control tags, ticket frames
//! ```
//!
//! Nothing in here does I/O. The state machines return effects and the
//! caller carries them out, which keeps every transition testable without a
//! transport.

mod authority;
mod client_handshake;
mod error;
mod identity;
mod registry;
mod server_handshake;
mod state;

pub use authority::{LocalAuthority, LocalIssuer};
pub use client_handshake::{ClientEffect, ClientHandshake, ClientInput, ClientPhase};
pub use error::{IdentityError, SessionError};
pub use identity::{
    AuthFailureReason, AuthTicket, TicketHandle, TicketIssuer, TicketValidator,
    ValidationResponse, ValidationSink,
};
pub use registry::{ConnectionRegistry, ConnectionSnapshot};
pub use server_handshake::{
    ServerEffect, ServerHandshake, ServerInput, ServerPhase, close_reason,
};
pub use state::AuthState;
