//! An in-process identity authority.
//!
//! [`LocalAuthority`] plays both halves of the identity service: it issues
//! random tickets bound to an identity (through a [`LocalIssuer`]) and
//! validates them for the server. It is what the tests and the demo run
//! against, and a reference for what a real service adapter has to do.
//!
//! Validation answers are computed immediately but delivered on a spawned
//! task, optionally after a configured latency, so the server always sees
//! them arrive asynchronously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use authgate_transport::PeerIdentity;
use rand::Rng;

use crate::{
    AuthFailureReason, AuthTicket, IdentityError, TicketHandle, TicketIssuer,
    TicketValidator, ValidationResponse, ValidationSink,
};

/// Random bytes per issued ticket.
const TICKET_LEN: usize = 32;

/// In-memory identity authority. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct LocalAuthority {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<AuthorityState>,
    latency: Duration,
}

#[derive(Default)]
struct AuthorityState {
    next_handle: u64,
    tickets: HashMap<Vec<u8>, IssuedTicket>,
    /// License owner per identity, when it isn't the identity itself.
    owners: HashMap<PeerIdentity, PeerIdentity>,
    /// Validated sessions and the ticket each was opened with.
    sessions: HashMap<PeerIdentity, Vec<u8>>,
}

struct IssuedTicket {
    handle: TicketHandle,
    identity: PeerIdentity,
    canceled: bool,
}

impl LocalAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an authority that delays every validation answer.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                latency,
            }),
        }
    }

    /// Returns an issuer that requests tickets for `identity`.
    pub fn issuer(&self, identity: PeerIdentity) -> LocalIssuer {
        LocalIssuer {
            authority: self.clone(),
            identity,
        }
    }

    /// Makes `owner` the license owner reported for `identity`.
    pub fn grant_owner(&self, identity: PeerIdentity, owner: PeerIdentity) {
        self.lock().owners.insert(identity, owner);
    }

    /// Returns `true` if `identity` has a validated, un-ended session.
    pub fn has_session(&self, identity: PeerIdentity) -> bool {
        self.lock().sessions.contains_key(&identity)
    }

    /// Number of validated, un-ended sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of tickets the authority still remembers, cancelled or not.
    pub fn ticket_count(&self) -> usize {
        self.lock().tickets.len()
    }

    /// Number of issued tickets that haven't been cancelled.
    pub fn live_ticket_count(&self) -> usize {
        self.lock().tickets.values().filter(|t| !t.canceled).count()
    }

    fn lock(&self) -> MutexGuard<'_, AuthorityState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(&self, identity: PeerIdentity, ticket: &AuthTicket) -> ValidationResponse {
        let mut state = self.lock();
        let owner = state.owners.get(&identity).copied().unwrap_or(identity);
        let outcome = match state.tickets.get(ticket.as_bytes()) {
            None => Err(AuthFailureReason::InvalidTicket),
            Some(issued) if issued.canceled => Err(AuthFailureReason::TicketCanceled),
            Some(issued) if issued.identity != identity => {
                Err(AuthFailureReason::TicketForOtherIdentity)
            }
            Some(_) if state.sessions.contains_key(&identity) => {
                Err(AuthFailureReason::DuplicateRequest)
            }
            Some(_) => Ok(()),
        };
        if outcome.is_ok() {
            state.sessions.insert(identity, ticket.as_bytes().to_vec());
        }
        ValidationResponse {
            identity,
            owner,
            outcome,
        }
    }
}

impl TicketValidator for LocalAuthority {
    fn begin_validation(
        &self,
        identity: PeerIdentity,
        ticket: AuthTicket,
        sink: ValidationSink,
    ) -> Result<(), IdentityError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| IdentityError::ValidationRefused("no async runtime".into()))?;
        let response = self.validate(identity, &ticket);
        tracing::debug!(%identity, ok = response.is_success(), "local authority validated ticket");

        let latency = self.inner.latency;
        runtime.spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if let Err(e) = sink.deliver(response).await {
                tracing::debug!(%identity, error = %e, "validation response dropped");
            }
        });
        Ok(())
    }

    /// Ends the session and forgets its ticket, along with any cancelled
    /// tickets issued to the same identity.
    fn end_session(&self, identity: PeerIdentity) {
        let mut state = self.lock();
        let ended = state.sessions.remove(&identity);
        if let Some(ticket) = &ended {
            state.tickets.remove(ticket);
        }
        state
            .tickets
            .retain(|_, t| !(t.canceled && t.identity == identity));
        if ended.is_some() {
            tracing::debug!(%identity, tickets = state.tickets.len(), "local authority ended session");
        }
    }
}

/// Issues tickets for one identity from a [`LocalAuthority`].
#[derive(Clone)]
pub struct LocalIssuer {
    authority: LocalAuthority,
    identity: PeerIdentity,
}

impl LocalIssuer {
    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }
}

impl TicketIssuer for LocalIssuer {
    fn issue_ticket(&self) -> Result<(TicketHandle, AuthTicket), IdentityError> {
        let bytes: [u8; TICKET_LEN] = rand::rng().random();
        let mut state = self.authority.lock();
        state.next_handle += 1;
        let handle = TicketHandle(state.next_handle);
        state.tickets.insert(
            bytes.to_vec(),
            IssuedTicket {
                handle,
                identity: self.identity,
                canceled: false,
            },
        );
        tracing::debug!(identity = %self.identity, %handle, "ticket issued");
        Ok((handle, AuthTicket::new(bytes)))
    }

    fn cancel_ticket(&self, handle: TicketHandle) {
        let mut state = self.authority.lock();
        if let Some(issued) = state.tickets.values_mut().find(|t| t.handle == handle) {
            issued.canceled = true;
            tracing::debug!(%handle, "ticket canceled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn validate(
        authority: &LocalAuthority,
        identity: PeerIdentity,
        ticket: AuthTicket,
    ) -> ValidationResponse {
        let (sink, mut rx) = ValidationSink::channel(4);
        authority.begin_validation(identity, ticket, sink).unwrap();
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_issued_ticket_validates_for_its_identity() {
        let authority = LocalAuthority::new();
        let (_, ticket) = authority.issuer(PeerIdentity(1)).issue_ticket().unwrap();

        let resp = validate(&authority, PeerIdentity(1), ticket).await;

        assert_eq!(resp, ValidationResponse::approved(PeerIdentity(1)));
        assert!(authority.has_session(PeerIdentity(1)));
    }

    #[tokio::test]
    async fn test_ticket_for_other_identity_is_rejected() {
        let authority = LocalAuthority::new();
        let (_, ticket) = authority.issuer(PeerIdentity(1)).issue_ticket().unwrap();

        let resp = validate(&authority, PeerIdentity(2), ticket).await;

        assert_eq!(resp.outcome, Err(AuthFailureReason::TicketForOtherIdentity));
        assert_eq!(authority.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_canceled_tickets_are_rejected() {
        let authority = LocalAuthority::new();
        let issuer = authority.issuer(PeerIdentity(1));
        let (handle, ticket) = issuer.issue_ticket().unwrap();
        issuer.cancel_ticket(handle);

        let canceled = validate(&authority, PeerIdentity(1), ticket).await;
        let unknown =
            validate(&authority, PeerIdentity(1), AuthTicket::new(vec![1, 2, 3])).await;

        assert_eq!(canceled.outcome, Err(AuthFailureReason::TicketCanceled));
        assert_eq!(unknown.outcome, Err(AuthFailureReason::InvalidTicket));
        assert_eq!(authority.live_ticket_count(), 0);
    }

    #[tokio::test]
    async fn test_second_session_is_duplicate_until_ended() {
        let authority = LocalAuthority::new();
        let issuer = authority.issuer(PeerIdentity(1));
        let (_, first) = issuer.issue_ticket().unwrap();
        let (_, second) = issuer.issue_ticket().unwrap();

        validate(&authority, PeerIdentity(1), first).await;
        let dup = validate(&authority, PeerIdentity(1), second).await;
        assert_eq!(dup.outcome, Err(AuthFailureReason::DuplicateRequest));

        authority.end_session(PeerIdentity(1));
        let (_, third) = issuer.issue_ticket().unwrap();
        let again = validate(&authority, PeerIdentity(1), third).await;
        assert!(again.is_success());
    }

    #[tokio::test]
    async fn test_end_session_forgets_its_tickets() {
        let authority = LocalAuthority::new();
        let issuer = authority.issuer(PeerIdentity(1));
        let other = authority.issuer(PeerIdentity(2));
        let (_, ticket) = issuer.issue_ticket().unwrap();
        let (stale, _) = issuer.issue_ticket().unwrap();
        other.issue_ticket().unwrap();
        issuer.cancel_ticket(stale);
        validate(&authority, PeerIdentity(1), ticket.clone()).await;
        assert_eq!(authority.ticket_count(), 3);

        authority.end_session(PeerIdentity(1));

        assert_eq!(authority.ticket_count(), 1);
        let replay = validate(&authority, PeerIdentity(1), ticket).await;
        assert_eq!(replay.outcome, Err(AuthFailureReason::InvalidTicket));
    }

    #[tokio::test]
    async fn test_granted_owner_is_reported() {
        let authority = LocalAuthority::new();
        authority.grant_owner(PeerIdentity(1), PeerIdentity(99));
        let (_, ticket) = authority.issuer(PeerIdentity(1)).issue_ticket().unwrap();

        let resp = validate(&authority, PeerIdentity(1), ticket).await;

        assert_eq!(resp.owner, PeerIdentity(99));
        assert!(resp.is_success());
    }

    #[test]
    fn test_begin_validation_outside_runtime_is_refused() {
        let authority = LocalAuthority::new();
        let (sink, _rx) = ValidationSink::channel(1);

        let result =
            authority.begin_validation(PeerIdentity(1), AuthTicket::new(vec![1]), sink);

        assert!(matches!(result, Err(IdentityError::ValidationRefused(_))));
    }

    #[test]
    fn test_end_session_tolerates_unknown_identity() {
        LocalAuthority::new().end_session(PeerIdentity(5));
    }
}
