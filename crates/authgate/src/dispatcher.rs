//! Inbound message routing.
//!
//! What a message means depends on the sender's auth state:
//!
//! | State            | Message is                                   |
//! |------------------|----------------------------------------------|
//! | `Pending`        | the ticket frame                             |
//! | `TicketReceived` | dropped with a warning (validation pending)  |
//! | `Validated`      | application payload for the handler          |
//! | anything else    | dropped with a warning                       |
//!
//! Unauthenticated traffic never reaches the [`SessionHandler`].

use std::time::Instant;

use authgate_session::{AuthState, TicketValidator};
use authgate_transport::{ConnectionId, SendMode, Transport};

use crate::adapter::ServerCore;
use crate::{Recipient, SessionHandler, SessionInfo};

impl<T, V, H> ServerCore<T, V, H>
where
    T: Transport,
    V: TicketValidator,
    H: SessionHandler,
{
    pub(crate) fn dispatch(&mut self, conn: ConnectionId, data: &[u8], now: Instant) {
        let Some(snapshot) = self.registry.get(conn) else {
            tracing::debug!(%conn, len = data.len(), "message from unregistered connection dropped");
            return;
        };

        match (snapshot.state, snapshot.identity) {
            (AuthState::Pending, _) => {
                let max_len = self.config.max_ticket_len;
                if let Some(effects) = self.registry.submit_ticket(conn, data, max_len, now) {
                    self.execute(conn, effects, now);
                }
            }
            (AuthState::TicketReceived, _) => {
                tracing::warn!(%conn, len = data.len(), "message during validation dropped");
            }
            (AuthState::Validated, Some(identity)) => {
                let session = SessionInfo { conn, identity };
                let replies = self.handler.on_message(&session, data);
                for (recipient, payload) in replies {
                    self.route(&session, recipient, &payload);
                }
            }
            (state, _) => {
                tracing::warn!(%conn, %state, len = data.len(), "unexpected message dropped");
            }
        }
    }

    /// Sends one handler reply. Only validated sessions receive payload.
    fn route(&self, from: &SessionInfo, recipient: Recipient, payload: &[u8]) {
        let targets = match recipient {
            Recipient::Sender => vec![from.conn],
            Recipient::Connection(conn) if self.is_validated(conn) => vec![conn],
            Recipient::Connection(conn) => {
                tracing::warn!(%conn, "reply to unauthenticated connection dropped");
                return;
            }
            Recipient::AllValidated => self
                .registry
                .select(|s| s.state == AuthState::Validated),
        };
        for conn in targets {
            if let Err(e) = self.transport.send(conn, payload, SendMode::Reliable) {
                tracing::warn!(%conn, error = %e, "failed to send reply");
            }
        }
    }
}
