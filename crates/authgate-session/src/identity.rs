//! The identity service seam.
//!
//! Authgate doesn't decide who a peer is. A third-party authority does:
//! it hands the client an opaque [`AuthTicket`], and later tells the
//! server whether that ticket really belongs to the identity the transport
//! reported. Two traits split that authority by side:
//!
//! - [`TicketIssuer`] (client): obtain and cancel tickets
//! - [`TicketValidator`] (server): validate tickets and end sessions
//!
//! Validation is asynchronous. The server passes a [`ValidationSink`] into
//! [`TicketValidator::begin_validation`] and the service pushes a
//! [`ValidationResponse`] into it whenever it is ready, from whatever task
//! or thread it likes. The server drains the other end of that queue on
//! its own event path, so responses never race with transport events.

use std::fmt;

use authgate_transport::PeerIdentity;
use tokio::sync::mpsc;

use crate::IdentityError;

/// An opaque credential proving the client's identity to the service.
///
/// The bytes are never interpreted by Authgate. `Debug` prints only the
/// length so tickets don't end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthTicket(Vec<u8>);

impl AuthTicket {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AuthTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthTicket({} bytes)", self.0.len())
    }
}

/// Handle for cancelling an issued ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketHandle(pub u64);

impl fmt::Display for TicketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

/// Why the identity service rejected a ticket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailureReason {
    /// The ticket is unknown or malformed.
    #[error("invalid ticket")]
    InvalidTicket,

    /// The client cancelled the ticket before it was validated.
    #[error("ticket canceled")]
    TicketCanceled,

    /// The ticket was issued to a different identity.
    #[error("ticket issued for another identity")]
    TicketForOtherIdentity,

    /// The identity already has a validated session.
    #[error("duplicate request")]
    DuplicateRequest,

    /// The ticket is valid, but the license belongs to someone else.
    #[error("owner mismatch (owner {owner})")]
    OwnerMismatch { owner: PeerIdentity },

    #[error("{0}")]
    Other(String),
}

/// The identity service's verdict on one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResponse {
    /// The identity that was validated (the one passed to
    /// [`TicketValidator::begin_validation`]).
    pub identity: PeerIdentity,
    /// Who owns the license the ticket grants. Usually `identity`.
    pub owner: PeerIdentity,
    pub outcome: Result<(), AuthFailureReason>,
}

impl ValidationResponse {
    /// A success where the identity owns its own license.
    pub fn approved(identity: PeerIdentity) -> Self {
        Self {
            identity,
            owner: identity,
            outcome: Ok(()),
        }
    }

    pub fn rejected(identity: PeerIdentity, reason: AuthFailureReason) -> Self {
        Self {
            identity,
            owner: identity,
            outcome: Err(reason),
        }
    }

    /// Sets the license owner.
    pub fn with_owner(mut self, owner: PeerIdentity) -> Self {
        self.owner = owner;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Where the identity service delivers [`ValidationResponse`]s.
///
/// A bounded `mpsc` sender. Cheap to clone; usable from async tasks
/// ([`deliver`](Self::deliver)), from synchronous code that must not
/// block ([`try_deliver`](Self::try_deliver)), or from plain OS threads
/// ([`blocking_deliver`](Self::blocking_deliver)).
#[derive(Debug, Clone)]
pub struct ValidationSink {
    tx: mpsc::Sender<ValidationResponse>,
}

impl ValidationSink {
    /// Creates a sink and the receiver the server drains.
    ///
    /// # Panics
    /// If `depth` is zero (as [`mpsc::channel`] does).
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<ValidationResponse>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Delivers a response, waiting for queue space.
    pub async fn deliver(&self, response: ValidationResponse) -> Result<(), IdentityError> {
        self.tx
            .send(response)
            .await
            .map_err(|_| IdentityError::SinkClosed)
    }

    /// Delivers a response without waiting.
    pub fn try_deliver(&self, response: ValidationResponse) -> Result<(), IdentityError> {
        self.tx.try_send(response).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IdentityError::SinkFull,
            mpsc::error::TrySendError::Closed(_) => IdentityError::SinkClosed,
        })
    }

    /// Delivers a response from a thread outside the Tokio runtime.
    ///
    /// # Panics
    /// If called from within an async context (as
    /// [`mpsc::Sender::blocking_send`] does).
    pub fn blocking_deliver(&self, response: ValidationResponse) -> Result<(), IdentityError> {
        self.tx
            .blocking_send(response)
            .map_err(|_| IdentityError::SinkClosed)
    }
}

/// Client half of the identity service.
///
/// # Trait bounds
///
/// `Send + Sync + 'static` so a client can be moved into a task.
pub trait TicketIssuer: Send + Sync + 'static {
    /// Obtains a ticket for the local identity.
    ///
    /// # Errors
    /// [`IdentityError::IssueFailed`] if no ticket is available. Callers
    /// treat this as fatal to starting a session.
    fn issue_ticket(&self) -> Result<(TicketHandle, AuthTicket), IdentityError>;

    /// Cancels a ticket. Cancelling an unknown handle is a no-op.
    fn cancel_ticket(&self, handle: TicketHandle);
}

/// Server half of the identity service.
pub trait TicketValidator: Send + Sync + 'static {
    /// Starts validating `ticket` for `identity`.
    ///
    /// Returns promptly. Exactly one [`ValidationResponse`] for `identity`
    /// is later delivered to `sink`, unless this returns an error.
    ///
    /// # Errors
    /// [`IdentityError::ValidationRefused`] if validation can't start.
    fn begin_validation(
        &self,
        identity: PeerIdentity,
        ticket: AuthTicket,
        sink: ValidationSink,
    ) -> Result<(), IdentityError>;

    /// Ends the identity's session (or abandons an in-flight validation).
    ///
    /// Must tolerate identities it has no session for.
    fn end_session(&self, identity: PeerIdentity);
}
