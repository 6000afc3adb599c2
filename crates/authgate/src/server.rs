//! `Server` builder and server loop.
//!
//! This is the entry point for running an Authgate server. It ties
//! together all the layers: transport → protocol → session → handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use authgate_session::{
    AuthState, ConnectionRegistry, SessionError, TicketValidator, ValidationResponse,
    ValidationSink,
};
use authgate_transport::{
    ConnectionId, DEFAULT_UPGRADE_TIMEOUT, PeerIdentity, SendMode, Transport, WebSocketTransport,
};
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;

use crate::adapter::ServerCore;
use crate::{AuthgateError, OwnerMismatchPolicy, ServerConfig, SessionHandler};

/// Builder for configuring and starting an Authgate server.
///
/// # Example
///
/// ```rust,ignore
/// use authgate::prelude::*;
///
/// let authority = LocalAuthority::new();
/// let server = ServerBuilder::new()
///     .bind("0.0.0.0:1234")
///     .max_connections(100)
///     .build_websocket(Some(PeerIdentity(1)), authority, MyHandler)
///     .await?;
/// server.run().await;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address the WebSocket listener binds to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn max_ticket_len(mut self, max: usize) -> Self {
        self.config.max_ticket_len = max;
        self
    }

    /// `None` disables the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn owner_mismatch(mut self, policy: OwnerMismatchPolicy) -> Self {
        self.config.owner_mismatch = policy;
        self
    }

    /// Builds a server on an existing transport.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`](crate::ConfigError::Invalid) if a limit
    /// is unusable.
    pub fn build<T, V, H>(
        self,
        transport: T,
        validator: V,
        handler: H,
    ) -> Result<Server<T, V, H>, AuthgateError>
    where
        T: Transport,
        V: TicketValidator,
        H: SessionHandler,
    {
        self.config.validate()?;
        let transport = Arc::new(transport);
        let registry = Arc::new(ConnectionRegistry::new(self.config.max_connections));
        let group = transport.create_poll_group();
        let (sink, responses) = ValidationSink::channel(self.config.event_queue_depth);

        let shutdown = Arc::new(Shutdown::default());
        let handle = ServerHandle {
            transport: Arc::clone(&transport),
            registry: Arc::clone(&registry),
            shutdown: Arc::clone(&shutdown),
        };
        let core = ServerCore {
            transport,
            registry,
            validator,
            handler,
            config: self.config,
            group,
            sink,
        };
        Ok(Server {
            core,
            responses,
            handle,
            stopped: false,
        })
    }

    /// Binds a WebSocket listener on the configured address and builds a
    /// server on it. `identity` is the server's own identity, announced to
    /// clients during the upgrade.
    ///
    /// The upgrade itself is bounded by `handshake_timeout`, or by
    /// [`DEFAULT_UPGRADE_TIMEOUT`] when that is disabled.
    pub async fn build_websocket<V, H>(
        self,
        identity: Option<PeerIdentity>,
        validator: V,
        handler: H,
    ) -> Result<Server<WebSocketTransport, V, H>, AuthgateError>
    where
        V: TicketValidator,
        H: SessionHandler,
    {
        self.config.validate()?;
        let upgrade_timeout = self
            .config
            .handshake_timeout
            .unwrap_or(DEFAULT_UPGRADE_TIMEOUT);
        let transport = WebSocketTransport::listen_with_upgrade_timeout(
            &self.config.bind_addr,
            identity,
            upgrade_timeout,
        )
        .await?;
        self.build(transport, validator, handler)
    }
}

#[derive(Debug, Default)]
struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// An Authgate server.
///
/// Drive it with [`run()`](Self::run), or call [`poll()`](Self::poll)
/// from your own loop.
pub struct Server<T, V, H> {
    core: ServerCore<T, V, H>,
    responses: mpsc::Receiver<ValidationResponse>,
    handle: ServerHandle<T>,
    stopped: bool,
}

impl<T, V, H> Server<T, V, H>
where
    T: Transport,
    V: TicketValidator,
    H: SessionHandler,
{
    /// Returns a cloneable handle for sending and shutting down from
    /// other tasks.
    pub fn handle(&self) -> ServerHandle<T> {
        self.handle.clone()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.core.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    pub fn handler(&self) -> &H {
        &self.core.handler
    }

    /// Runs one cycle now. Returns `false` once the server has shut down.
    pub fn poll(&mut self) -> bool {
        self.poll_at(Instant::now())
    }

    /// Runs one cycle as if the time were `now`: drains queued validation
    /// responses, then polls the transport and expires stale handshakes.
    pub fn poll_at(&mut self, now: Instant) -> bool {
        if self.stopped {
            return false;
        }
        if self.handle.shutdown.is_requested() {
            self.stop(now);
            return false;
        }
        while let Ok(response) = self.responses.try_recv() {
            self.core.handle_validation(response, now);
        }
        self.core.pump(now);
        true
    }

    /// Runs the server loop until [`ServerHandle::shutdown`] is called.
    ///
    /// Polls the transport every `poll_interval` and handles validation
    /// responses as soon as they arrive. On shutdown every session is
    /// ended and every connection closed.
    pub async fn run(mut self) {
        tracing::info!(
            max_connections = self.core.config.max_connections,
            "Authgate server running"
        );
        let mut ticker = tokio::time::interval(self.core.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = Arc::clone(&self.handle.shutdown);
        while !shutdown.is_requested() {
            tokio::select! {
                _ = ticker.tick() => self.core.pump(Instant::now()),
                Some(response) = self.responses.recv() => {
                    self.core.handle_validation(response, Instant::now());
                }
                () = shutdown.notify.notified() => {}
            }
        }
        self.stop(Instant::now());
    }

    fn stop(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.core.shutdown_all(now);
    }
}

impl<V, H> Server<WebSocketTransport, V, H> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.transport.local_addr()
    }
}

/// A cloneable handle to a running [`Server`].
pub struct ServerHandle<T> {
    transport: Arc<T>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<Shutdown>,
}

impl<T> Clone for ServerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<T: Transport> ServerHandle<T> {
    /// Sends `data` to one validated session.
    ///
    /// # Errors
    /// [`SessionError::NotAuthenticated`] unless `conn` is validated.
    pub fn send_to(&self, conn: ConnectionId, data: &[u8]) -> Result<(), AuthgateError> {
        if !self.is_authenticated(conn) {
            return Err(SessionError::NotAuthenticated.into());
        }
        self.transport.send(conn, data, SendMode::Reliable)?;
        Ok(())
    }

    /// Sends `data` to every validated session. Returns how many it was
    /// queued for.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let targets = self.registry.select(|s| s.state == AuthState::Validated);
        targets
            .into_iter()
            .filter(|conn| match self.transport.send(*conn, data, SendMode::Reliable) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(%conn, error = %e, "broadcast send failed");
                    false
                }
            })
            .count()
    }

    /// Closes a connection. Its record goes away when the transport
    /// reports the close.
    pub fn close(&self, conn: ConnectionId, reason: &str) {
        self.transport.close(conn, reason);
    }

    pub fn is_authenticated(&self, conn: ConnectionId) -> bool {
        self.registry
            .get(conn)
            .is_some_and(|s| s.state == AuthState::Validated)
    }

    /// The connection carrying the validated session for `identity`.
    pub fn session_for(&self, identity: PeerIdentity) -> Option<ConnectionId> {
        self.registry.find_by_identity(identity, AuthState::Validated)
    }

    /// Number of live connection records, in any state.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Asks the server loop to stop.
    pub fn shutdown(&self) {
        tracing::info!("server shutdown requested");
        self.shutdown.request();
    }
}
