//! Wire protocol for Authgate.
//!
//! This crate defines the bytes that travel during the handshake:
//!
//! - **Control messages** ([`ControlMessage`]): the literal tags the
//!   server sends for the greeting and the verdict. Receivers match them
//!   by prefix.
//! - **Ticket frame** ([`encode_ticket_frame`], [`decode_ticket_frame`]):
//!   the one message the client sends before it is validated: a 4-byte
//!   big-endian length followed by exactly that many ticket bytes.
//! - **Errors** ([`FramingError`]).
//!
//! # Architecture
//!
//! The protocol layer knows nothing about connections or state. The
//! session layer decides *when* a message is a ticket frame and when it
//! is application payload; this crate only knows how to read and write
//! each of them.
//!
//! ```text
//! Transport (bytes) → Protocol (ControlMessage / ticket) → Session (AuthState)
//! ```
//!
//! Each transport message is one protocol unit, so there is no stream
//! reassembly here.

mod control;
mod error;
mod frame;

pub use control::ControlMessage;
pub use error::FramingError;
pub use frame::{LENGTH_PREFIX_LEN, decode_ticket_frame, encode_ticket_frame};
