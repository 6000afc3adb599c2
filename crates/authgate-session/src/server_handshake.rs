//! Server side of the handshake, as a pure state machine.
//!
//! One [`ServerHandshake`] exists per connection record. Feeding it a
//! [`ServerInput`] moves it along the [`AuthState`] graph and returns the
//! [`ServerEffect`]s the server must carry out: messages to send,
//! connections to close, identity-service calls. Nothing here touches the
//! network, which is why the registry can run transitions under its lock
//! and execute the effects after releasing it.
//!
//! ```text
//! Connecting ─Accepted→ Pending ─PeerIdentified→ (greeting sent)
//!     ─TicketFrame→ TicketReceived ─Verdict(ok)→ Validated
//!                                  ─Verdict(err)→ Failed
//! ```

use std::time::Instant;

use authgate_protocol::{ControlMessage, FramingError, decode_ticket_frame};
use authgate_transport::PeerIdentity;

use crate::{AuthFailureReason, AuthState, AuthTicket};

/// Close reasons the server hands to the transport.
pub mod close_reason {
    pub const SERVER_FULL: &str = "server full";
    pub const ACCEPT_FAILED: &str = "accept failed";
    pub const INVALID_IDENTITY: &str = "invalid identity";
    pub const DUPLICATE_IDENTITY: &str = "duplicate identity";
    pub const VALIDATION_UNAVAILABLE: &str = "validation unavailable";
    pub const AUTH_FAILED: &str = "Auth validation failed";
    pub const TIMED_OUT: &str = "handshake timed out";
    pub const SHUTTING_DOWN: &str = "server shutting down";
}

/// Server-side handshake phase, carrying the data each step needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPhase {
    /// Inbound attempt, not yet accepted.
    Connecting,
    /// Accepted. `identity` is `None` until the transport reports it;
    /// the greeting goes out at that moment.
    Pending { identity: Option<PeerIdentity> },
    /// A well-formed ticket is with the identity service.
    TicketReceived {
        identity: PeerIdentity,
        ticket: AuthTicket,
    },
    Validated { identity: PeerIdentity },
    Failed {
        identity: Option<PeerIdentity>,
        reason: String,
    },
    Closed,
}

impl ServerPhase {
    pub fn auth_state(&self) -> AuthState {
        match self {
            Self::Connecting => AuthState::Connecting,
            Self::Pending { .. } => AuthState::Pending,
            Self::TicketReceived { .. } => AuthState::TicketReceived,
            Self::Validated { .. } => AuthState::Validated,
            Self::Failed { .. } => AuthState::Failed,
            Self::Closed => AuthState::Closed,
        }
    }

    pub fn identity(&self) -> Option<PeerIdentity> {
        match self {
            Self::Pending { identity } | Self::Failed { identity, .. } => *identity,
            Self::TicketReceived { identity, .. } | Self::Validated { identity } => {
                Some(*identity)
            }
            Self::Connecting | Self::Closed => None,
        }
    }
}

/// Something that happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInput<'a> {
    /// The transport accepted the connection.
    Accepted,
    /// The transport refused to accept it.
    AcceptFailed,
    /// The transport finished connecting and reported the peer's identity,
    /// if it has one.
    PeerIdentified(Option<PeerIdentity>),
    /// A message arrived while the connection was expected to send its
    /// ticket. `identity_in_use` is `true` when another connection already
    /// holds a session (or a validation) for the same identity.
    TicketFrame {
        frame: &'a [u8],
        max_len: usize,
        identity_in_use: bool,
    },
    /// [`TicketValidator::begin_validation`](crate::TicketValidator::begin_validation)
    /// returned an error.
    ValidatorRefused,
    /// The identity service answered.
    Verdict(Result<(), AuthFailureReason>),
    /// The current step took longer than the handshake timeout.
    TimedOut,
    /// The transport reported the connection closed.
    Closed,
}

/// Work the server must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEffect {
    /// Send a control message to the peer.
    Send(ControlMessage),
    /// Hand the ticket to the identity service.
    BeginValidation {
        identity: PeerIdentity,
        ticket: AuthTicket,
    },
    /// Close the connection.
    Close { reason: &'static str },
    /// Call [`TicketValidator::end_session`](crate::TicketValidator::end_session).
    EndSession(PeerIdentity),
    /// The connection is now an authenticated session.
    SessionEstablished(PeerIdentity),
    /// An authenticated session is gone.
    SessionEnded(PeerIdentity),
    /// A ticket frame was malformed and discarded.
    FramingViolation(FramingError),
    /// The input was dropped; the string says why.
    Ignored(&'static str),
}

/// Per-connection server handshake.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    phase: ServerPhase,
    entered_at: Instant,
}

impl ServerHandshake {
    /// A fresh handshake for an inbound connection attempt.
    pub fn new(now: Instant) -> Self {
        Self {
            phase: ServerPhase::Connecting,
            entered_at: now,
        }
    }

    pub fn phase(&self) -> &ServerPhase {
        &self.phase
    }

    pub fn state(&self) -> AuthState {
        self.phase.auth_state()
    }

    pub fn identity(&self) -> Option<PeerIdentity> {
        self.phase.identity()
    }

    /// When the current phase was entered.
    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    /// Applies one input and returns the effects to execute, in order.
    pub fn apply(&mut self, input: ServerInput<'_>, now: Instant) -> Vec<ServerEffect> {
        if self.phase == ServerPhase::Closed {
            return Vec::new();
        }
        match input {
            ServerInput::Accepted => self.on_accepted(now),
            ServerInput::AcceptFailed if self.phase == ServerPhase::Connecting => {
                self.fail(None, close_reason::ACCEPT_FAILED, now)
            }
            ServerInput::AcceptFailed => vec![ServerEffect::Ignored("already accepted")],
            ServerInput::PeerIdentified(identity) => self.on_identified(identity, now),
            ServerInput::TicketFrame {
                frame,
                max_len,
                identity_in_use,
            } => self.on_ticket(frame, max_len, identity_in_use, now),
            ServerInput::ValidatorRefused => self.on_validator_refused(now),
            ServerInput::Verdict(outcome) => self.on_verdict(outcome, now),
            ServerInput::TimedOut => self.on_timeout(now),
            ServerInput::Closed => self.on_closed(now),
        }
    }

    fn enter(&mut self, phase: ServerPhase, now: Instant) {
        debug_assert!(
            self.state().can_transition_to(phase.auth_state()),
            "illegal transition {} -> {}",
            self.state(),
            phase.auth_state()
        );
        self.phase = phase;
        self.entered_at = now;
    }

    fn on_accepted(&mut self, now: Instant) -> Vec<ServerEffect> {
        if self.phase != ServerPhase::Connecting {
            return vec![ServerEffect::Ignored("already accepted")];
        }
        self.enter(ServerPhase::Pending { identity: None }, now);
        Vec::new()
    }

    fn on_identified(
        &mut self,
        identity: Option<PeerIdentity>,
        now: Instant,
    ) -> Vec<ServerEffect> {
        if self.phase != (ServerPhase::Pending { identity: None }) {
            return vec![ServerEffect::Ignored("identity already known")];
        }
        match identity {
            Some(identity) => {
                // Stays Pending; only the stored identity changes.
                self.phase = ServerPhase::Pending {
                    identity: Some(identity),
                };
                vec![ServerEffect::Send(ControlMessage::Greeting)]
            }
            None => self.fail(None, close_reason::INVALID_IDENTITY, now),
        }
    }

    fn on_ticket(
        &mut self,
        frame: &[u8],
        max_len: usize,
        identity_in_use: bool,
        now: Instant,
    ) -> Vec<ServerEffect> {
        let identity = match self.phase {
            ServerPhase::Pending {
                identity: Some(identity),
            } => identity,
            ServerPhase::Pending { identity: None } => {
                return vec![ServerEffect::Ignored("peer identity not yet known")];
            }
            ServerPhase::TicketReceived { .. } => {
                return vec![ServerEffect::Ignored("validation already in flight")];
            }
            _ => return vec![ServerEffect::Ignored("not expecting a ticket")],
        };

        let ticket = match decode_ticket_frame(frame, max_len) {
            Ok(bytes) => AuthTicket::new(bytes),
            Err(e) => return vec![ServerEffect::FramingViolation(e)],
        };
        if identity_in_use {
            let mut effects = vec![ServerEffect::Send(ControlMessage::AuthFailure)];
            effects.extend(self.fail(Some(identity), close_reason::DUPLICATE_IDENTITY, now));
            return effects;
        }

        self.enter(
            ServerPhase::TicketReceived {
                identity,
                ticket: ticket.clone(),
            },
            now,
        );
        vec![ServerEffect::BeginValidation { identity, ticket }]
    }

    fn on_validator_refused(&mut self, now: Instant) -> Vec<ServerEffect> {
        let ServerPhase::TicketReceived { identity, .. } = self.phase else {
            return vec![ServerEffect::Ignored("no validation in flight")];
        };
        let mut effects = vec![ServerEffect::Send(ControlMessage::AuthFailure)];
        effects.extend(self.fail(Some(identity), close_reason::VALIDATION_UNAVAILABLE, now));
        effects
    }

    fn on_verdict(
        &mut self,
        outcome: Result<(), AuthFailureReason>,
        now: Instant,
    ) -> Vec<ServerEffect> {
        let ServerPhase::TicketReceived { identity, .. } = self.phase else {
            return vec![ServerEffect::Ignored("no validation in flight")];
        };
        match outcome {
            Ok(()) => {
                // The buffered ticket is dropped here.
                self.enter(ServerPhase::Validated { identity }, now);
                vec![
                    ServerEffect::Send(ControlMessage::AuthSuccess),
                    ServerEffect::SessionEstablished(identity),
                ]
            }
            Err(_) => {
                let mut effects = vec![
                    ServerEffect::EndSession(identity),
                    ServerEffect::Send(ControlMessage::AuthFailure),
                ];
                effects.extend(self.fail(Some(identity), close_reason::AUTH_FAILED, now));
                effects
            }
        }
    }

    fn on_timeout(&mut self, now: Instant) -> Vec<ServerEffect> {
        let mut effects = Vec::new();
        match self.phase {
            ServerPhase::TicketReceived { identity, .. } => {
                effects.push(ServerEffect::EndSession(identity));
            }
            ServerPhase::Connecting | ServerPhase::Pending { .. } => {}
            _ => return vec![ServerEffect::Ignored("handshake already finished")],
        }
        let identity = self.identity();
        effects.extend(self.fail(identity, close_reason::TIMED_OUT, now));
        effects
    }

    fn on_closed(&mut self, now: Instant) -> Vec<ServerEffect> {
        let effects = match self.phase {
            ServerPhase::Validated { identity } => vec![
                ServerEffect::EndSession(identity),
                ServerEffect::SessionEnded(identity),
            ],
            ServerPhase::TicketReceived { identity, .. } => {
                vec![ServerEffect::EndSession(identity)]
            }
            _ => Vec::new(),
        };
        self.enter(ServerPhase::Closed, now);
        effects
    }

    fn fail(
        &mut self,
        identity: Option<PeerIdentity>,
        reason: &'static str,
        now: Instant,
    ) -> Vec<ServerEffect> {
        self.enter(
            ServerPhase::Failed {
                identity,
                reason: reason.to_string(),
            },
            now,
        );
        vec![ServerEffect::Close { reason }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use authgate_protocol::encode_ticket_frame;

    const MAX: usize = 1024;
    const ID: PeerIdentity = PeerIdentity(76561198);

    fn frame(ticket: &[u8]) -> Vec<u8> {
        encode_ticket_frame(ticket).unwrap()
    }

    /// A handshake that has been accepted and greeted.
    fn greeted() -> ServerHandshake {
        let now = Instant::now();
        let mut hs = ServerHandshake::new(now);
        hs.apply(ServerInput::Accepted, now);
        hs.apply(ServerInput::PeerIdentified(Some(ID)), now);
        hs
    }

    fn submit(hs: &mut ServerHandshake, data: &[u8]) -> Vec<ServerEffect> {
        hs.apply(
            ServerInput::TicketFrame {
                frame: data,
                max_len: MAX,
                identity_in_use: false,
            },
            Instant::now(),
        )
    }

    // =========================================================================
    // Admission and greeting
    // =========================================================================

    #[test]
    fn test_accept_then_identity_sends_greeting() {
        let now = Instant::now();
        let mut hs = ServerHandshake::new(now);
        assert_eq!(hs.state(), AuthState::Connecting);

        assert!(hs.apply(ServerInput::Accepted, now).is_empty());
        assert_eq!(hs.phase(), &ServerPhase::Pending { identity: None });

        let effects = hs.apply(ServerInput::PeerIdentified(Some(ID)), now);
        assert_eq!(effects, vec![ServerEffect::Send(ControlMessage::Greeting)]);
        assert_eq!(hs.identity(), Some(ID));
        assert_eq!(hs.state(), AuthState::Pending);
    }

    #[test]
    fn test_missing_identity_fails_connection() {
        let now = Instant::now();
        let mut hs = ServerHandshake::new(now);
        hs.apply(ServerInput::Accepted, now);

        let effects = hs.apply(ServerInput::PeerIdentified(None), now);

        assert_eq!(
            effects,
            vec![ServerEffect::Close {
                reason: close_reason::INVALID_IDENTITY
            }]
        );
        assert_eq!(hs.state(), AuthState::Failed);
    }

    #[test]
    fn test_accept_failure_fails_connection() {
        let now = Instant::now();
        let mut hs = ServerHandshake::new(now);

        let effects = hs.apply(ServerInput::AcceptFailed, now);

        assert_eq!(
            effects,
            vec![ServerEffect::Close {
                reason: close_reason::ACCEPT_FAILED
            }]
        );
    }

    // =========================================================================
    // Ticket frames
    // =========================================================================

    #[test]
    fn test_well_formed_ticket_starts_validation() {
        let mut hs = greeted();

        let effects = submit(&mut hs, &frame(b"0123456789"));

        assert_eq!(
            effects,
            vec![ServerEffect::BeginValidation {
                identity: ID,
                ticket: AuthTicket::new(b"0123456789".to_vec()),
            }]
        );
        assert_eq!(hs.state(), AuthState::TicketReceived);
    }

    #[test]
    fn test_malformed_frame_leaves_state_unchanged() {
        let mut hs = greeted();
        let before = hs.phase().clone();
        let mut bad = frame(b"0123456789");
        bad.pop();

        let effects = submit(&mut hs, &bad);

        assert!(matches!(
            effects.as_slice(),
            [ServerEffect::FramingViolation(FramingError::LengthMismatch { .. })]
        ));
        assert_eq!(hs.phase(), &before);
    }

    #[test]
    fn test_oversized_ticket_is_framing_violation() {
        let mut hs = greeted();
        let effects = hs.apply(
            ServerInput::TicketFrame {
                frame: &frame(&[1u8; 64]),
                max_len: 16,
                identity_in_use: false,
            },
            Instant::now(),
        );

        assert!(matches!(
            effects.as_slice(),
            [ServerEffect::FramingViolation(FramingError::TooLarge { len: 64, max: 16 })]
        ));
        assert_eq!(hs.state(), AuthState::Pending);
    }

    #[test]
    fn test_ticket_before_identity_is_ignored() {
        let now = Instant::now();
        let mut hs = ServerHandshake::new(now);
        hs.apply(ServerInput::Accepted, now);

        let effects = submit(&mut hs, &frame(b"abc"));

        assert!(matches!(effects.as_slice(), [ServerEffect::Ignored(_)]));
        assert_eq!(hs.state(), AuthState::Pending);
    }

    #[test]
    fn test_second_frame_during_validation_is_ignored() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"first"));

        let effects = submit(&mut hs, &frame(b"second"));

        assert!(matches!(effects.as_slice(), [ServerEffect::Ignored(_)]));
        assert!(matches!(
            hs.phase(),
            ServerPhase::TicketReceived { ticket, .. } if ticket.as_bytes() == b"first"
        ));
    }

    #[test]
    fn test_identity_in_use_rejects_ticket() {
        let mut hs = greeted();

        let effects = hs.apply(
            ServerInput::TicketFrame {
                frame: &frame(b"ticket"),
                max_len: MAX,
                identity_in_use: true,
            },
            Instant::now(),
        );

        assert_eq!(
            effects,
            vec![
                ServerEffect::Send(ControlMessage::AuthFailure),
                ServerEffect::Close {
                    reason: close_reason::DUPLICATE_IDENTITY
                },
            ]
        );
        assert_eq!(hs.state(), AuthState::Failed);
    }

    // =========================================================================
    // Verdicts
    // =========================================================================

    #[test]
    fn test_approval_validates_and_sends_success() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"ticket"));

        let effects = hs.apply(ServerInput::Verdict(Ok(())), Instant::now());

        assert_eq!(
            effects,
            vec![
                ServerEffect::Send(ControlMessage::AuthSuccess),
                ServerEffect::SessionEstablished(ID),
            ]
        );
        assert_eq!(hs.phase(), &ServerPhase::Validated { identity: ID });
    }

    #[test]
    fn test_rejection_ends_session_sends_failure_then_closes() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"ticket"));

        let effects = hs.apply(
            ServerInput::Verdict(Err(AuthFailureReason::InvalidTicket)),
            Instant::now(),
        );

        assert_eq!(
            effects,
            vec![
                ServerEffect::EndSession(ID),
                ServerEffect::Send(ControlMessage::AuthFailure),
                ServerEffect::Close {
                    reason: close_reason::AUTH_FAILED
                },
            ]
        );
        assert_eq!(hs.state(), AuthState::Failed);
    }

    #[test]
    fn test_verdict_without_ticket_is_ignored() {
        let mut hs = greeted();

        let effects = hs.apply(ServerInput::Verdict(Ok(())), Instant::now());

        assert!(matches!(effects.as_slice(), [ServerEffect::Ignored(_)]));
        assert_eq!(hs.state(), AuthState::Pending);
    }

    #[test]
    fn test_validator_refusal_fails_connection() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"ticket"));

        let effects = hs.apply(ServerInput::ValidatorRefused, Instant::now());

        assert_eq!(
            effects,
            vec![
                ServerEffect::Send(ControlMessage::AuthFailure),
                ServerEffect::Close {
                    reason: close_reason::VALIDATION_UNAVAILABLE
                },
            ]
        );
    }

    // =========================================================================
    // Timeout and teardown
    // =========================================================================

    #[test]
    fn test_timeout_while_validating_ends_session() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"ticket"));

        let effects = hs.apply(ServerInput::TimedOut, Instant::now());

        assert_eq!(
            effects,
            vec![
                ServerEffect::EndSession(ID),
                ServerEffect::Close {
                    reason: close_reason::TIMED_OUT
                },
            ]
        );
    }

    #[test]
    fn test_timeout_after_validation_is_ignored() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"ticket"));
        hs.apply(ServerInput::Verdict(Ok(())), Instant::now());

        let effects = hs.apply(ServerInput::TimedOut, Instant::now());

        assert!(matches!(effects.as_slice(), [ServerEffect::Ignored(_)]));
        assert_eq!(hs.state(), AuthState::Validated);
    }

    #[test]
    fn test_close_of_validated_session_ends_it_once() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"ticket"));
        hs.apply(ServerInput::Verdict(Ok(())), Instant::now());

        let first = hs.apply(ServerInput::Closed, Instant::now());
        let second = hs.apply(ServerInput::Closed, Instant::now());

        assert_eq!(
            first,
            vec![ServerEffect::EndSession(ID), ServerEffect::SessionEnded(ID)]
        );
        assert!(second.is_empty());
        assert_eq!(hs.state(), AuthState::Closed);
    }

    #[test]
    fn test_close_after_failure_does_not_end_session_again() {
        let mut hs = greeted();
        submit(&mut hs, &frame(b"ticket"));
        hs.apply(
            ServerInput::Verdict(Err(AuthFailureReason::InvalidTicket)),
            Instant::now(),
        );

        assert!(hs.apply(ServerInput::Closed, Instant::now()).is_empty());
    }

    #[test]
    fn test_close_while_pending_has_no_identity_effects() {
        let mut hs = greeted();

        assert!(hs.apply(ServerInput::Closed, Instant::now()).is_empty());
        assert_eq!(hs.state(), AuthState::Closed);
    }
}
