//! Error type for the protocol layer.
//!
//! The session layer treats framing problems specially: a malformed ticket
//! frame is logged and dropped, and the connection stays where it was.

/// A ticket frame could not be decoded (or a ticket could not be framed).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// Fewer bytes than the 4-byte length prefix.
    #[error("frame too short: {len} bytes, need at least 4")]
    TooShort { len: usize },

    /// The declared length doesn't match the bytes after the prefix.
    #[error("declared ticket length {declared} but {actual} bytes follow")]
    LengthMismatch { declared: usize, actual: usize },

    /// A zero-length ticket.
    #[error("empty ticket")]
    EmptyTicket,

    /// The ticket is longer than the receiver accepts (or than a `u32`
    /// length can describe).
    #[error("ticket of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

