//! The authenticating client.
//!
//! A [`Client`] holds one session ticket and at most one connection. On
//! connect it waits for the server's greeting, answers with the ticket
//! frame and reports the verdict as a [`ClientEvent`]. Once authenticated,
//! every server message is handed to the caller verbatim.
//!
//! ```rust,ignore
//! let mut client = Client::new(transport, issuer, ClientConfig::default())?;
//! client.connect("127.0.0.1:1234")?;
//! client.authenticate().await?;
//! client.send(b"HELLO_SERVER")?;
//! ```

use std::collections::VecDeque;
use std::time::Instant;

use authgate_session::{
    AuthState, AuthTicket, ClientEffect, ClientHandshake, ClientInput, ClientPhase,
    IdentityError, SessionError, TicketHandle, TicketIssuer,
};
use authgate_transport::{ConnectionEvent, ConnectionId, EndReason, SendMode, Transport};
use tokio::time::MissedTickBehavior;

use crate::{AuthgateError, ClientConfig};

/// Close reason the client sends when it hangs up.
pub const DISCONNECT_REASON: &str = "client disconnecting";

/// Something that happened to the client's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport connected. The handshake starts now.
    Connected,
    /// The server accepted the ticket.
    Authenticated,
    /// The server rejected the ticket.
    Rejected,
    /// Application payload from the server.
    Message(Vec<u8>),
    /// The connection is gone. `detail` is the close reason, if any.
    Disconnected { reason: EndReason, detail: String },
}

/// An Authgate client.
pub struct Client<T: Transport, I: TicketIssuer> {
    transport: T,
    issuer: I,
    config: ClientConfig,
    /// A ticket not yet bound to a connection.
    ticket: Option<(TicketHandle, AuthTicket)>,
    conn: Option<(ConnectionId, ClientHandshake)>,
    events: VecDeque<ClientEvent>,
}

impl<T: Transport, I: TicketIssuer> Client<T, I> {
    /// Creates a client and obtains its session ticket.
    ///
    /// # Errors
    /// - [`ConfigError::Invalid`](crate::ConfigError::Invalid) for bad limits.
    /// - [`IdentityError::IssueFailed`] if no ticket could be issued, or the
    ///   issued ticket is empty. Without one there is nothing to
    ///   authenticate with.
    pub fn new(transport: T, issuer: I, config: ClientConfig) -> Result<Self, AuthgateError> {
        config.validate()?;
        let (handle, ticket) = fetch_ticket(&issuer)?;
        Ok(Self {
            transport,
            issuer,
            config,
            ticket: Some((handle, ticket)),
            conn: None,
            events: VecDeque::new(),
        })
    }

    /// Starts connecting to `addr`. Progress arrives as events.
    ///
    /// Reuses the held ticket, or issues a fresh one if the previous
    /// connection consumed it.
    ///
    /// # Errors
    /// - [`SessionError::AlreadyConnected`] while a connection exists.
    /// - [`TransportError::InvalidAddress`](authgate_transport::TransportError::InvalidAddress)
    ///   if `addr` can't be parsed.
    /// - [`IdentityError::IssueFailed`] if a fresh ticket was needed and
    ///   none (or an empty one) was issued.
    pub fn connect(&mut self, addr: &str) -> Result<ConnectionId, AuthgateError> {
        if self.conn.is_some() {
            return Err(SessionError::AlreadyConnected.into());
        }
        let (handle, ticket) = match self.ticket.take() {
            Some(held) => held,
            None => fetch_ticket(&self.issuer)?,
        };
        match self.transport.connect(addr) {
            Ok(conn) => {
                tracing::info!(%conn, %addr, "connecting");
                self.conn = Some((conn, ClientHandshake::new(handle, ticket, Instant::now())));
                Ok(conn)
            }
            Err(e) => {
                self.ticket = Some((handle, ticket));
                Err(e.into())
            }
        }
    }

    /// Closes the connection, if any, and cancels its ticket.
    pub fn disconnect(&mut self) {
        let Some((conn, _)) = &self.conn else {
            return;
        };
        let conn = *conn;
        tracing::info!(%conn, "disconnecting");
        self.transport.close(conn, DISCONNECT_REASON);
        self.step(ClientInput::Closed, Instant::now());
        self.conn = None;
        self.events.push_back(ClientEvent::Disconnected {
            reason: EndReason::ClosedLocally,
            detail: DISCONNECT_REASON.to_string(),
        });
    }

    /// Runs one polling cycle and returns everything that happened.
    pub fn poll(&mut self) -> Vec<ClientEvent> {
        self.pump(Instant::now());
        self.events.drain(..).collect()
    }

    /// Waits for the next event, polling every `poll_interval`.
    ///
    /// Returns `None` once there is no connection and nothing queued.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.conn.is_none() {
                return None;
            }
            ticker.tick().await;
            self.pump(Instant::now());
        }
    }

    /// Waits until the server accepts or rejects the ticket.
    ///
    /// Events other than the verdict are consumed.
    ///
    /// # Errors
    /// - [`SessionError::NotConnected`] if there is no connection or it
    ///   drops first.
    /// - [`SessionError::AuthRejected`] if the server rejects the ticket.
    /// - [`AuthgateError::AuthTimeout`] after `auth_timeout`.
    pub async fn authenticate(&mut self) -> Result<(), AuthgateError> {
        if self.state() == AuthState::Validated {
            return Ok(());
        }
        if self.conn.is_none() {
            return Err(SessionError::NotConnected.into());
        }
        let deadline = self.config.auth_timeout;
        let verdict = async {
            loop {
                match self.next_event().await {
                    Some(ClientEvent::Authenticated) => return Ok::<(), AuthgateError>(()),
                    Some(ClientEvent::Rejected) => {
                        return Err(AuthgateError::from(SessionError::AuthRejected(
                            "server rejected the session ticket".into(),
                        )));
                    }
                    Some(ClientEvent::Disconnected { .. }) | None => {
                        return Err(AuthgateError::from(SessionError::NotConnected));
                    }
                    Some(ClientEvent::Connected | ClientEvent::Message(_)) => {}
                }
            }
        };
        tokio::time::timeout(deadline, verdict)
            .await
            .map_err(|_| AuthgateError::AuthTimeout)?
    }

    /// Sends application data to the server.
    ///
    /// # Errors
    /// [`SessionError::NotAuthenticated`] before the handshake completes.
    pub fn send(&self, data: &[u8]) -> Result<(), AuthgateError> {
        let Some((conn, hs)) = &self.conn else {
            return Err(SessionError::NotConnected.into());
        };
        if hs.phase() != ClientPhase::Validated {
            return Err(SessionError::NotAuthenticated.into());
        }
        self.transport.send(*conn, data, SendMode::Reliable)?;
        Ok(())
    }

    /// `true` once the connection is up, authenticated or not.
    pub fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|(_, hs)| !matches!(hs.phase(), ClientPhase::Connecting | ClientPhase::Closed))
    }

    /// `true` while the transport is still connecting.
    pub fn is_attempting_connection(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|(_, hs)| hs.phase() == ClientPhase::Connecting)
    }

    /// The handshake state. `Closed` when there is no connection.
    pub fn state(&self) -> AuthState {
        self.conn
            .as_ref()
            .map_or(AuthState::Closed, |(_, hs)| hs.state())
    }

    pub fn conn_id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(|(conn, _)| *conn)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn pump(&mut self, now: Instant) {
        for event in self.transport.poll_events(self.config.max_messages_per_poll) {
            self.handle_event(event, now);
        }
        if let Some(conn) = self.conn_id() {
            self.drain_messages(conn, now);
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent, now: Instant) {
        if self.conn_id() != Some(event.conn()) {
            tracing::debug!(conn = %event.conn(), "event for stale connection ignored");
            return;
        }
        match event {
            ConnectionEvent::Connected { conn, identity } => {
                tracing::info!(%conn, server = ?identity, "connected, waiting for greeting");
                self.step(ClientInput::Connected, now);
                self.events.push_back(ClientEvent::Connected);
            }
            ConnectionEvent::Closed {
                conn,
                reason,
                detail,
            } => {
                // The verdict may be queued right behind the close.
                self.drain_messages(conn, now);
                tracing::info!(%conn, %reason, %detail, "connection closed");
                self.step(ClientInput::Closed, now);
                self.conn = None;
                self.transport.close(conn, "");
                self.events
                    .push_back(ClientEvent::Disconnected { reason, detail });
            }
            ConnectionEvent::Connecting { conn, .. } => {
                tracing::debug!(%conn, "client transport ignores inbound connections");
            }
        }
    }

    fn drain_messages(&mut self, conn: ConnectionId, now: Instant) {
        let budget = self.config.max_messages_per_poll;
        for data in self.transport.poll_connection_messages(conn, budget) {
            self.step(ClientInput::Message(&data), now);
        }
    }

    fn step(&mut self, input: ClientInput<'_>, now: Instant) {
        let Some((conn, hs)) = self.conn.as_mut() else {
            return;
        };
        let conn = *conn;
        for effect in hs.apply(input, now) {
            self.execute(conn, effect);
        }
    }

    fn execute(&mut self, conn: ConnectionId, effect: ClientEffect) {
        match effect {
            ClientEffect::SendTicket(frame) => {
                tracing::info!(%conn, frame_len = frame.len(), "greeting received, sending auth ticket");
                if let Err(e) = self.transport.send(conn, &frame, SendMode::Reliable) {
                    tracing::error!(%conn, error = %e, "failed to send auth ticket");
                }
            }
            ClientEffect::Authenticated => {
                tracing::info!(%conn, "authentication successful");
                self.events.push_back(ClientEvent::Authenticated);
            }
            ClientEffect::Rejected => {
                tracing::warn!(%conn, "authentication failed");
                self.events.push_back(ClientEvent::Rejected);
            }
            ClientEffect::Deliver(data) => self.events.push_back(ClientEvent::Message(data)),
            ClientEffect::CancelTicket(handle) => {
                self.issuer.cancel_ticket(handle);
                tracing::debug!(%conn, %handle, "session ticket canceled");
            }
            ClientEffect::Ignored(why) => tracing::debug!(%conn, why, "server message ignored"),
        }
    }
}

/// Issues a ticket, refusing an empty one: it could never be framed, and
/// the server would wait on a ticket that never comes.
fn fetch_ticket<I: TicketIssuer>(issuer: &I) -> Result<(TicketHandle, AuthTicket), IdentityError> {
    let (handle, ticket) = issuer.issue_ticket()?;
    if ticket.is_empty() {
        issuer.cancel_ticket(handle);
        tracing::error!(%handle, "identity service issued an empty session ticket");
        return Err(IdentityError::IssueFailed("empty session ticket".into()));
    }
    tracing::info!(%handle, ticket_len = ticket.len(), "session ticket obtained");
    Ok((handle, ticket))
}

impl<T: Transport, I: TicketIssuer> Drop for Client<T, I> {
    fn drop(&mut self) {
        self.disconnect();
        if let Some((handle, _)) = self.ticket.take() {
            self.issuer.cancel_ticket(handle);
        }
    }
}
