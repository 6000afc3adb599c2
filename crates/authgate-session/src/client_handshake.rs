//! Client side of the handshake.
//!
//! The client's part is small: wait for the greeting, answer with the
//! ticket frame, wait for the verdict. Until the verdict arrives every
//! other message is ignored, never treated as application data.

use std::time::Instant;

use authgate_protocol::{ControlMessage, encode_ticket_frame};

use crate::{AuthState, AuthTicket, TicketHandle};

/// Client-side handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientPhase {
    Connecting,
    /// Connected, waiting for the greeting.
    Connected,
    /// Ticket sent, waiting for the verdict.
    TicketSent,
    Validated,
    Failed,
    Closed,
}

impl ClientPhase {
    /// The [`AuthState`] this phase corresponds to.
    pub fn auth_state(self) -> AuthState {
        match self {
            Self::Connecting => AuthState::Connecting,
            Self::Connected => AuthState::Pending,
            Self::TicketSent => AuthState::TicketReceived,
            Self::Validated => AuthState::Validated,
            Self::Failed => AuthState::Failed,
            Self::Closed => AuthState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInput<'a> {
    /// The transport finished connecting.
    Connected,
    /// A message from the server.
    Message(&'a [u8]),
    /// The connection ended, for any reason.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEffect {
    /// Send this ticket frame to the server.
    SendTicket(Vec<u8>),
    /// The server accepted the ticket.
    Authenticated,
    /// The server rejected the ticket (or it couldn't be framed).
    Rejected,
    /// Application payload for the caller.
    Deliver(Vec<u8>),
    /// Cancel the session ticket with the identity service.
    CancelTicket(TicketHandle),
    /// The input was dropped; the string says why.
    Ignored(&'static str),
}

/// The client's handshake for one connection.
///
/// Owns the session ticket until the connection closes, at which point it
/// hands the handle back for cancellation exactly once.
#[derive(Debug)]
pub struct ClientHandshake {
    phase: ClientPhase,
    ticket: AuthTicket,
    handle: Option<TicketHandle>,
    entered_at: Instant,
}

impl ClientHandshake {
    pub fn new(handle: TicketHandle, ticket: AuthTicket, now: Instant) -> Self {
        Self {
            phase: ClientPhase::Connecting,
            ticket,
            handle: Some(handle),
            entered_at: now,
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn state(&self) -> AuthState {
        self.phase.auth_state()
    }

    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn apply(&mut self, input: ClientInput<'_>, now: Instant) -> Vec<ClientEffect> {
        match (self.phase, input) {
            (ClientPhase::Closed, _) => Vec::new(),
            (_, ClientInput::Closed) => {
                self.enter(ClientPhase::Closed, now);
                self.handle
                    .take()
                    .map(ClientEffect::CancelTicket)
                    .into_iter()
                    .collect()
            }
            (ClientPhase::Connecting, ClientInput::Connected) => {
                self.enter(ClientPhase::Connected, now);
                Vec::new()
            }
            (_, ClientInput::Connected) => vec![ClientEffect::Ignored("already connected")],
            (ClientPhase::Validated, ClientInput::Message(data)) => {
                vec![ClientEffect::Deliver(data.to_vec())]
            }
            (phase, ClientInput::Message(data)) => self.on_control(phase, data, now),
        }
    }

    fn on_control(
        &mut self,
        phase: ClientPhase,
        data: &[u8],
        now: Instant,
    ) -> Vec<ClientEffect> {
        match (phase, ControlMessage::recognize(data)) {
            (ClientPhase::Connected, Some(ControlMessage::Greeting)) => {
                match encode_ticket_frame(self.ticket.as_bytes()) {
                    Ok(frame) => {
                        self.enter(ClientPhase::TicketSent, now);
                        vec![ClientEffect::SendTicket(frame)]
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "session ticket cannot be framed");
                        self.enter(ClientPhase::Failed, now);
                        vec![ClientEffect::Rejected]
                    }
                }
            }
            (ClientPhase::TicketSent, Some(ControlMessage::Greeting)) => {
                vec![ClientEffect::Ignored("ticket already sent")]
            }
            (ClientPhase::TicketSent, Some(ControlMessage::AuthSuccess)) => {
                self.enter(ClientPhase::Validated, now);
                vec![ClientEffect::Authenticated]
            }
            (ClientPhase::Connected, Some(ControlMessage::AuthSuccess)) => {
                vec![ClientEffect::Ignored("success before ticket was sent")]
            }
            (
                ClientPhase::Connected | ClientPhase::TicketSent,
                Some(ControlMessage::AuthFailure),
            ) => {
                self.enter(ClientPhase::Failed, now);
                vec![ClientEffect::Rejected]
            }
            (ClientPhase::Failed, _) => vec![ClientEffect::Ignored("authentication failed")],
            _ => vec![ClientEffect::Ignored("not yet authenticated")],
        }
    }

    fn enter(&mut self, phase: ClientPhase, now: Instant) {
        debug_assert!(
            self.state().can_transition_to(phase.auth_state()),
            "illegal transition {:?} -> {:?}",
            self.phase,
            phase
        );
        self.phase = phase;
        self.entered_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ClientHandshake {
        let now = Instant::now();
        let mut hs = ClientHandshake::new(TicketHandle(7), AuthTicket::new(*b"0123456789"), now);
        hs.apply(ClientInput::Connected, now);
        hs
    }

    fn feed(hs: &mut ClientHandshake, msg: ControlMessage) -> Vec<ClientEffect> {
        hs.apply(ClientInput::Message(msg.as_bytes()), Instant::now())
    }

    #[test]
    fn test_greeting_sends_ticket_frame_once() {
        let mut hs = connected();
        assert_eq!(hs.state(), AuthState::Pending);

        let effects = feed(&mut hs, ControlMessage::Greeting);
        let again = feed(&mut hs, ControlMessage::Greeting);

        let [ClientEffect::SendTicket(frame)] = effects.as_slice() else {
            panic!("expected SendTicket, got {effects:?}");
        };
        assert_eq!(frame.len(), 14);
        assert_eq!(&frame[..4], &[0, 0, 0, 10]);
        assert_eq!(hs.phase(), ClientPhase::TicketSent);
        assert!(matches!(again.as_slice(), [ClientEffect::Ignored(_)]));
    }

    #[test]
    fn test_success_after_ticket_validates() {
        let mut hs = connected();
        feed(&mut hs, ControlMessage::Greeting);

        let effects = feed(&mut hs, ControlMessage::AuthSuccess);

        assert_eq!(effects, vec![ClientEffect::Authenticated]);
        assert_eq!(hs.state(), AuthState::Validated);
    }

    #[test]
    fn test_success_before_ticket_is_ignored() {
        let mut hs = connected();

        let effects = feed(&mut hs, ControlMessage::AuthSuccess);

        assert!(matches!(effects.as_slice(), [ClientEffect::Ignored(_)]));
        assert_eq!(hs.phase(), ClientPhase::Connected);
    }

    #[test]
    fn test_failure_message_fails_handshake() {
        let mut hs = connected();
        feed(&mut hs, ControlMessage::Greeting);

        let effects = feed(&mut hs, ControlMessage::AuthFailure);

        assert_eq!(effects, vec![ClientEffect::Rejected]);
        assert_eq!(hs.state(), AuthState::Failed);
    }

    #[test]
    fn test_payload_before_validation_is_not_delivered() {
        let mut hs = connected();

        let effects = hs.apply(ClientInput::Message(b"SERVER_SAYS_HI_CLIENT"), Instant::now());

        assert!(matches!(effects.as_slice(), [ClientEffect::Ignored(_)]));
    }

    #[test]
    fn test_payload_after_validation_is_delivered_verbatim() {
        let mut hs = connected();
        feed(&mut hs, ControlMessage::Greeting);
        feed(&mut hs, ControlMessage::AuthSuccess);

        // Even bytes that look like a control tag are payload now.
        let effects = hs.apply(ClientInput::Message(b"WELCOME back"), Instant::now());

        assert_eq!(effects, vec![ClientEffect::Deliver(b"WELCOME back".to_vec())]);
    }

    #[test]
    fn test_close_cancels_ticket_exactly_once() {
        let mut hs = connected();

        let first = hs.apply(ClientInput::Closed, Instant::now());
        let second = hs.apply(ClientInput::Closed, Instant::now());

        assert_eq!(first, vec![ClientEffect::CancelTicket(TicketHandle(7))]);
        assert!(second.is_empty());
        assert_eq!(hs.state(), AuthState::Closed);
    }

    #[test]
    fn test_close_while_connecting_cancels_ticket() {
        let now = Instant::now();
        let mut hs = ClientHandshake::new(TicketHandle(1), AuthTicket::new(vec![1]), now);

        let effects = hs.apply(ClientInput::Closed, now);

        assert_eq!(effects, vec![ClientEffect::CancelTicket(TicketHandle(1))]);
    }
}
