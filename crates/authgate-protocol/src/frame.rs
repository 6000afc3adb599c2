//! Ticket frame codec.
//!
//! A ticket frame is the whole transport message:
//!
//! ```text
//! ┌──────────────┬───────────────────────┐
//! │ len: u32 BE  │ ticket bytes (len)    │
//! └──────────────┴───────────────────────┘
//! ```
//!
//! Decoding is strict. The declared length must equal the number of bytes
//! that follow; a frame with trailing garbage is as malformed as a
//! truncated one.

use crate::FramingError;

/// Size of the big-endian length header.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Wraps `ticket` in a length-prefixed frame.
///
/// # Errors
/// - [`FramingError::EmptyTicket`] if `ticket` is empty.
/// - [`FramingError::TooLarge`] if its length doesn't fit in a `u32`.
pub fn encode_ticket_frame(ticket: &[u8]) -> Result<Vec<u8>, FramingError> {
    if ticket.is_empty() {
        return Err(FramingError::EmptyTicket);
    }
    let len = u32::try_from(ticket.len()).map_err(|_| FramingError::TooLarge {
        len: ticket.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + ticket.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(ticket);
    Ok(frame)
}

/// Extracts the ticket bytes from a frame, borrowing from `frame`.
///
/// `max_len` bounds the declared ticket length; anything longer is
/// rejected before the payload is looked at.
///
/// # Errors
/// `TooShort`, `EmptyTicket`, `TooLarge`, or `LengthMismatch`, checked in
/// that order.
pub fn decode_ticket_frame(frame: &[u8], max_len: usize) -> Result<&[u8], FramingError> {
    let Some((header, payload)) = frame.split_first_chunk::<LENGTH_PREFIX_LEN>() else {
        return Err(FramingError::TooShort { len: frame.len() });
    };
    let declared = u32::from_be_bytes(*header) as usize;

    if declared == 0 {
        return Err(FramingError::EmptyTicket);
    }
    if declared > max_len {
        return Err(FramingError::TooLarge {
            len: declared,
            max: max_len,
        });
    }
    if declared != payload.len() {
        return Err(FramingError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok(payload)
}
