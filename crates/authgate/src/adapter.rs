//! The transport event adapter: the server's single event path.
//!
//! Two sources feed the server: transport connection events (polled) and
//! validation responses (pushed by the identity service into a queue).
//! [`ServerCore`] handles both, one at a time, on whichever task owns it.
//! For every event it
//!
//! 1. runs the lookup and transition inside one registry call (one lock
//!    acquisition), then
//! 2. executes the returned effects with the lock released.
//!
//! Message routing lives in [`dispatcher`](crate::dispatcher).

use std::sync::Arc;
use std::time::Instant;

use authgate_protocol::ControlMessage;
use authgate_session::{
    AuthFailureReason, AuthState, ConnectionRegistry, ServerEffect, ServerInput,
    SessionError, TicketValidator, ValidationResponse, ValidationSink, close_reason,
};
use authgate_transport::{
    ConnectionEvent, ConnectionId, EndReason, PollGroupId, SendMode, Transport,
};

use crate::{OwnerMismatchPolicy, ServerConfig, SessionHandler, SessionInfo};

pub(crate) struct ServerCore<T, V, H> {
    pub(crate) transport: Arc<T>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) validator: V,
    pub(crate) handler: H,
    pub(crate) config: ServerConfig,
    pub(crate) group: PollGroupId,
    pub(crate) sink: ValidationSink,
}

impl<T, V, H> ServerCore<T, V, H>
where
    T: Transport,
    V: TicketValidator,
    H: SessionHandler,
{
    /// One polling cycle: connection events, then messages, then timeouts.
    ///
    /// Events go first so a peer's identity is recorded before any of its
    /// messages are looked at.
    pub(crate) fn pump(&mut self, now: Instant) {
        let budget = self.config.max_messages_per_poll;
        for event in self.transport.poll_events(budget) {
            self.handle_event(event, now);
        }
        for msg in self.transport.poll_group_messages(self.group, budget) {
            self.dispatch(msg.conn, &msg.data, now);
        }
        self.sweep_timeouts(now);
    }

    pub(crate) fn handle_event(&mut self, event: ConnectionEvent, now: Instant) {
        match event {
            ConnectionEvent::Connecting { conn, remote } => self.on_connecting(conn, &remote, now),
            ConnectionEvent::Connected { conn, identity } => {
                match self
                    .registry
                    .apply(conn, ServerInput::PeerIdentified(identity), now)
                {
                    Some(effects) => {
                        match identity {
                            Some(identity) => tracing::info!(
                                %conn, %identity, "connection established, waiting for ticket"
                            ),
                            None => tracing::warn!(%conn, "connected without a peer identity"),
                        }
                        self.execute(conn, effects, now);
                    }
                    None => tracing::warn!(%conn, "connected event for unregistered connection"),
                }
            }
            ConnectionEvent::Closed {
                conn,
                reason,
                detail,
            } => self.on_closed(conn, reason, &detail, now),
        }
    }

    fn on_connecting(&mut self, conn: ConnectionId, remote: &str, now: Instant) {
        match self.registry.register(conn, now) {
            Ok(()) => {}
            Err(SessionError::ServerFull { capacity }) => {
                tracing::warn!(%conn, %remote, capacity, "max connections reached, rejecting");
                self.transport.close(conn, close_reason::SERVER_FULL);
                return;
            }
            Err(e) => {
                tracing::warn!(%conn, %remote, error = %e, "cannot register connection");
                return;
            }
        }

        let input = match self.transport.accept(conn) {
            Ok(()) => ServerInput::Accepted,
            Err(e) => {
                tracing::error!(%conn, error = %e, "accept failed");
                ServerInput::AcceptFailed
            }
        };
        let accepted = input == ServerInput::Accepted;
        if let Some(effects) = self.registry.apply(conn, input, now) {
            self.execute(conn, effects, now);
        }
        if accepted {
            if let Err(e) = self.transport.set_poll_group(conn, self.group) {
                tracing::warn!(%conn, error = %e, "failed to add connection to poll group");
            }
            tracing::info!(
                %conn, %remote, clients = self.registry.len(), "accepted connection"
            );
        }
    }

    /// The single teardown path: the transport says the connection is gone.
    fn on_closed(&mut self, conn: ConnectionId, reason: EndReason, detail: &str, now: Instant) {
        let Some(snapshot) = self.registry.get(conn) else {
            tracing::debug!(%conn, %reason, "close for unregistered connection");
            self.transport.close(conn, "");
            return;
        };
        let Some(effects) = self.registry.teardown(conn, now) else {
            return;
        };
        tracing::info!(
            %conn,
            identity = ?snapshot.identity,
            state = %snapshot.state,
            %reason,
            detail,
            clients = self.registry.len(),
            "client disconnected, removed from registry"
        );
        self.execute(conn, effects, now);
        // Releases the handle; a no-op if it's already gone.
        self.transport.close(conn, "");
    }

    /// Routes one validation response to the connection awaiting it.
    pub(crate) fn handle_validation(&mut self, response: ValidationResponse, now: Instant) {
        let identity = response.identity;
        let verdict = self.verdict_for(&response);
        match self.registry.resolve_validation(identity, verdict.clone(), now) {
            Some((conn, effects)) => {
                match &verdict {
                    Ok(()) => tracing::info!(%conn, %identity, owner = %response.owner, "ticket validated"),
                    Err(reason) => tracing::warn!(%conn, %identity, %reason, "ticket rejected"),
                }
                self.execute(conn, effects, now);
            }
            None => {
                let err = SessionError::IdentityMismatch(identity);
                tracing::warn!(error = %err, ok = response.is_success(), "late or unmatched validation response");
                if !response.is_success() {
                    self.validator.end_session(identity);
                    tracing::info!(%identity, "ended session for unmatched failed validation");
                }
            }
        }
    }

    /// Applies the owner-mismatch policy to an identity-service answer.
    fn verdict_for(&self, response: &ValidationResponse) -> Result<(), AuthFailureReason> {
        response.outcome.clone()?;
        if response.owner == response.identity {
            return Ok(());
        }
        match self.config.owner_mismatch {
            OwnerMismatchPolicy::Reject => {
                tracing::warn!(
                    identity = %response.identity, owner = %response.owner,
                    "license owner differs from validated identity, rejecting"
                );
                Err(AuthFailureReason::OwnerMismatch {
                    owner: response.owner,
                })
            }
            OwnerMismatchPolicy::Allow => {
                tracing::warn!(
                    identity = %response.identity, owner = %response.owner,
                    "license owner differs from validated identity, allowing"
                );
                Ok(())
            }
        }
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let Some(timeout) = self.config.handshake_timeout else {
            return;
        };
        for conn in self.registry.expired(now, timeout) {
            let Some(effects) = self.registry.apply(conn, ServerInput::TimedOut, now) else {
                continue;
            };
            tracing::warn!(%conn, ?timeout, "handshake timed out");
            self.execute(conn, effects, now);
        }
    }

    /// Carries out effects for `conn`. Never called with the registry locked.
    pub(crate) fn execute(&mut self, conn: ConnectionId, effects: Vec<ServerEffect>, now: Instant) {
        for effect in effects {
            match effect {
                ServerEffect::Send(msg) => self.send_control(conn, msg),
                ServerEffect::BeginValidation { identity, ticket } => {
                    tracing::info!(%conn, %identity, ticket_len = ticket.len(), "auth ticket received, validating");
                    if let Err(e) =
                        self.validator
                            .begin_validation(identity, ticket, self.sink.clone())
                    {
                        tracing::error!(%conn, %identity, error = %e, "could not start validation");
                        if let Some(more) =
                            self.registry.apply(conn, ServerInput::ValidatorRefused, now)
                        {
                            self.execute(conn, more, now);
                        }
                    }
                }
                ServerEffect::Close { reason } => {
                    tracing::info!(%conn, reason, "closing connection");
                    self.transport.close(conn, reason);
                }
                ServerEffect::EndSession(identity) => {
                    self.validator.end_session(identity);
                    tracing::info!(%conn, %identity, "ended auth session");
                }
                ServerEffect::SessionEstablished(identity) => {
                    self.handler.on_authenticated(&SessionInfo { conn, identity });
                }
                ServerEffect::SessionEnded(identity) => {
                    self.handler.on_disconnected(&SessionInfo { conn, identity });
                }
                ServerEffect::FramingViolation(e) => {
                    tracing::warn!(%conn, error = %e, "protocol violation: malformed auth ticket frame");
                }
                ServerEffect::Ignored(why) => tracing::debug!(%conn, why, "input ignored"),
            }
        }
    }

    fn send_control(&self, conn: ConnectionId, msg: ControlMessage) {
        match self.transport.send(conn, msg.as_bytes(), SendMode::Reliable) {
            Ok(()) => tracing::debug!(%conn, %msg, "sent control message"),
            Err(e) => tracing::error!(%conn, %msg, error = %e, "failed to send control message"),
        }
    }

    /// Ends every session and closes every connection.
    pub(crate) fn shutdown_all(&mut self, now: Instant) {
        let torn = self.registry.teardown_all(now);
        tracing::info!(clients = torn.len(), "server shutting down");
        for (conn, effects) in torn {
            self.execute(conn, effects, now);
            self.transport.close(conn, close_reason::SHUTTING_DOWN);
        }
    }

    pub(crate) fn is_validated(&self, conn: ConnectionId) -> bool {
        self.registry
            .get(conn)
            .is_some_and(|s| s.state == AuthState::Validated)
    }
}
