//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Socket I/O runs on Tokio tasks. Each task pushes what it observes
//! (new peers, messages, disconnects) into one shared, mutex-guarded
//! state; the [`Transport`] methods only touch that state and an
//! unbounded outbound channel per connection, so none of them block.
//!
//! The dialing side announces its identity in the [`IDENTITY_HEADER`]
//! upgrade header. The listening side may announce one back in the
//! upgrade response.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::{
    ConnectionEvent, ConnectionId, EndReason, InboundMessage, PeerIdentity,
    PollGroupId, SendMode, Transport, TransportError,
};

/// Upgrade header carrying the sender's [`PeerIdentity`] as a decimal `u64`.
pub const IDENTITY_HEADER: &str = "x-authgate-identity";

/// How long an inbound peer may take to finish the WebSocket upgrade when
/// [`listen`](WebSocketTransport::listen) is used without an explicit limit.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Counter for generating unique connection and poll group ids.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A WebSocket-based [`Transport`].
///
/// Created either listening ([`listen`](Self::listen)) or dial-only
/// ([`client`](Self::client)). Both can [`connect`](Transport::connect).
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    identity: Option<PeerIdentity>,
    runtime: Handle,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    events: VecDeque<ConnectionEvent>,
    conns: HashMap<ConnectionId, WsConn>,
    groups: HashMap<PollGroupId, VecDeque<InboundMessage>>,
}

struct WsConn {
    phase: Phase,
    /// Server-side stream parked until the connection is accepted.
    pending: Option<WebSocketStream<TcpStream>>,
    /// Identity the peer announced during the upgrade (server side).
    remote_identity: Option<PeerIdentity>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    group: Option<PollGroupId>,
    inbox: VecDeque<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    /// The Closed event is already queued; waiting for `close`.
    Dead,
}

enum Outbound {
    Data(Vec<u8>),
    Close(String),
}

impl WsConn {
    fn new(
        pending: Option<WebSocketStream<TcpStream>>,
        remote_identity: Option<PeerIdentity>,
    ) -> Self {
        Self {
            phase: Phase::Connecting,
            pending,
            remote_identity,
            outbound: None,
            group: None,
            inbox: VecDeque::new(),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, conn: ConnectionId, data: Vec<u8>) {
        let mut state = self.lock();
        let State { conns, groups, .. } = &mut *state;
        let Some(entry) = conns.get_mut(&conn) else {
            return;
        };
        match entry.group {
            Some(group) => groups
                .entry(group)
                .or_default()
                .push_back(InboundMessage { conn, data }),
            None => entry.inbox.push_back(data),
        }
    }

    fn connected(
        &self,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
        identity: Option<PeerIdentity>,
    ) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.conns.get_mut(&conn) else {
            return false;
        };
        entry.phase = Phase::Connected;
        entry.outbound = Some(outbound);
        state
            .events
            .push_back(ConnectionEvent::Connected { conn, identity });
        true
    }

    /// Records a remote close or I/O failure, once.
    fn ended(&self, conn: ConnectionId, reason: EndReason, detail: String) {
        let mut state = self.lock();
        let Some(entry) = state.conns.get_mut(&conn) else {
            return;
        };
        if entry.phase == Phase::Dead {
            return;
        }
        entry.phase = Phase::Dead;
        entry.outbound = None;
        state.events.push_back(ConnectionEvent::Closed {
            conn,
            reason,
            detail,
        });
    }
}

impl WebSocketTransport {
    /// Binds a listening WebSocket transport to the given address.
    ///
    /// `identity` is announced to peers in the upgrade response. Peers get
    /// [`DEFAULT_UPGRADE_TIMEOUT`] to complete the upgrade.
    pub async fn listen(
        addr: &str,
        identity: Option<PeerIdentity>,
    ) -> Result<Self, TransportError> {
        Self::listen_with_upgrade_timeout(addr, identity, DEFAULT_UPGRADE_TIMEOUT).await
    }

    /// Like [`listen`](Self::listen), but drops any peer that hasn't
    /// finished the upgrade within `upgrade_timeout`. Until then a peer
    /// holds a task but no connection id.
    pub async fn listen_with_upgrade_timeout(
        addr: &str,
        identity: Option<PeerIdentity>,
        upgrade_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        let local_addr = listener.local_addr().map_err(TransportError::AcceptFailed)?;
        tracing::info!(%local_addr, ?upgrade_timeout, "WebSocket transport listening");

        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
        });
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            identity,
            upgrade_timeout,
        ));

        Ok(Self {
            shared,
            identity,
            runtime: Handle::current(),
            local_addr: Some(local_addr),
            accept_task: Some(accept_task),
        })
    }

    /// Creates a dial-only transport that presents `identity` to servers.
    ///
    /// # Errors
    /// [`TransportError::Shutdown`] if called outside a Tokio runtime.
    pub fn client(identity: PeerIdentity) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|_| TransportError::Shutdown)?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
            }),
            identity: Some(identity),
            runtime,
            local_addr: None,
            accept_task: None,
        })
    }

    /// Returns the address the listener is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        // Dropping the outbound senders ends every connection task.
        self.shared.lock().conns.clear();
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, addr: &str) -> Result<ConnectionId, TransportError> {
        let target: SocketAddr = addr
            .parse()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
        let mut request = format!("ws://{target}/")
            .into_client_request()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
        if let Some(identity) = self.identity {
            request
                .headers_mut()
                .insert(IDENTITY_HEADER, HeaderValue::from(identity.0));
        }

        let conn = ConnectionId::new(next_id());
        self.shared.lock().conns.insert(conn, WsConn::new(None, None));
        tracing::debug!(%conn, %target, "WebSocket connect started");

        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(async move {
            match tokio_tungstenite::connect_async(request).await {
                Ok((ws, response)) => {
                    let identity = identity_from_headers(response.headers());
                    let (tx, rx) = mpsc::unbounded_channel();
                    if shared.connected(conn, tx, identity) {
                        drive(shared, conn, ws, rx).await;
                    }
                }
                Err(e) => shared.ended(
                    conn,
                    EndReason::ProblemDetectedLocally,
                    e.to_string(),
                ),
            }
        });
        Ok(conn)
    }

    fn accept(&self, conn: ConnectionId) -> Result<(), TransportError> {
        let (ws, identity) = {
            let mut state = self.shared.lock();
            let entry = state
                .conns
                .get_mut(&conn)
                .ok_or(TransportError::UnknownConnection(conn))?;
            if entry.phase != Phase::Connecting {
                return Err(TransportError::NotConnecting(conn));
            }
            let ws = entry.pending.take().ok_or(TransportError::NotConnecting(conn))?;
            (ws, entry.remote_identity)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.connected(conn, tx, identity);
        self.runtime
            .spawn(drive(Arc::clone(&self.shared), conn, ws, rx));
        Ok(())
    }

    fn send(
        &self,
        conn: ConnectionId,
        data: &[u8],
        _mode: SendMode,
    ) -> Result<(), TransportError> {
        let state = self.shared.lock();
        let entry = state
            .conns
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        match (entry.phase, &entry.outbound) {
            (Phase::Connected, Some(tx)) => {
                tx.send(Outbound::Data(data.to_vec())).map_err(|_| {
                    TransportError::SendFailed(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        format!("{conn} writer has stopped"),
                    ))
                })
            }
            (Phase::Connecting, _) => Err(TransportError::NotConnected(conn)),
            _ => Err(TransportError::ConnectionClosed(format!("{conn} is closed"))),
        }
    }

    fn close(&self, conn: ConnectionId, reason: &str) {
        let mut state = self.shared.lock();
        let Some(entry) = state.conns.remove(&conn) else {
            return;
        };
        let State { events, groups, .. } = &mut *state;
        for queue in groups.values_mut() {
            queue.retain(|m| m.conn != conn);
        }
        if entry.phase == Phase::Dead {
            return;
        }

        if let Some(tx) = &entry.outbound {
            let _ = tx.send(Outbound::Close(reason.to_string()));
        }
        if let Some(mut ws) = entry.pending {
            let frame = close_frame(reason);
            self.runtime.spawn(async move {
                let _ = ws.close(Some(frame)).await;
            });
        }
        events.push_back(ConnectionEvent::Closed {
            conn,
            reason: EndReason::ClosedLocally,
            detail: reason.to_string(),
        });
    }

    fn poll_events(&self, max: usize) -> Vec<ConnectionEvent> {
        let mut state = self.shared.lock();
        let n = max.min(state.events.len());
        state.events.drain(..n).collect()
    }

    fn create_poll_group(&self) -> PollGroupId {
        let group = PollGroupId::new(next_id());
        self.shared.lock().groups.insert(group, VecDeque::new());
        group
    }

    fn set_poll_group(
        &self,
        conn: ConnectionId,
        group: PollGroupId,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        let State { conns, groups, .. } = &mut *state;
        let queue = groups
            .get_mut(&group)
            .ok_or(TransportError::UnknownPollGroup(group))?;
        let entry = conns
            .get_mut(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        entry.group = Some(group);
        queue.extend(
            entry
                .inbox
                .drain(..)
                .map(|data| InboundMessage { conn, data }),
        );
        Ok(())
    }

    fn poll_group_messages(
        &self,
        group: PollGroupId,
        max: usize,
    ) -> Vec<InboundMessage> {
        let mut state = self.shared.lock();
        let Some(queue) = state.groups.get_mut(&group) else {
            return Vec::new();
        };
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    fn poll_connection_messages(
        &self,
        conn: ConnectionId,
        max: usize,
    ) -> Vec<Vec<u8>> {
        let mut state = self.shared.lock();
        let Some(entry) = state.conns.get_mut(&conn) else {
            return Vec::new();
        };
        let n = max.min(entry.inbox.len());
        entry.inbox.drain(..n).collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    identity: Option<PeerIdentity>,
    upgrade_timeout: Duration,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "TCP accept failed");
                continue;
            }
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut remote_identity = None;
            let callback = |request: &Request, mut response: Response| {
                remote_identity = identity_from_headers(request.headers());
                if let Some(own) = identity {
                    response
                        .headers_mut()
                        .insert(IDENTITY_HEADER, HeaderValue::from(own.0));
                }
                Ok::<Response, ErrorResponse>(response)
            };
            let upgrade = tokio_tungstenite::accept_hdr_async(stream, callback);
            let ws = match tokio::time::timeout(upgrade_timeout, upgrade).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    tracing::debug!(%addr, error = %e, "WebSocket upgrade failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(%addr, ?upgrade_timeout, "WebSocket upgrade timed out");
                    return;
                }
            };

            let conn = ConnectionId::new(next_id());
            let mut state = shared.lock();
            state
                .conns
                .insert(conn, WsConn::new(Some(ws), remote_identity));
            state.events.push_back(ConnectionEvent::Connecting {
                conn,
                remote: addr.to_string(),
            });
            tracing::debug!(%conn, %addr, "WebSocket peer connecting");
        });
    }
}

/// Pumps one WebSocket until either side ends it.
async fn drive<S>(
    shared: Arc<Shared>,
    conn: ConnectionId,
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Data(data)) => {
                    if let Err(e) = sink.send(Message::Binary(data.into())).await {
                        shared.ended(conn, EndReason::ProblemDetectedLocally, e.to_string());
                        break;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    let _ = sink.send(Message::Close(Some(close_frame(&reason)))).await;
                    let _ = sink.close().await;
                    break;
                }
                // Transport dropped or handle released.
                None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => shared.deliver(conn, data.into()),
                Some(Ok(Message::Text(text))) => {
                    shared.deliver(conn, text.as_bytes().to_vec());
                }
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    shared.ended(conn, EndReason::ClosedByPeer, detail);
                    break;
                }
                None => {
                    shared.ended(conn, EndReason::ClosedByPeer, "stream ended".into());
                    break;
                }
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    shared.ended(conn, EndReason::ProblemDetectedLocally, e.to_string());
                    break;
                }
            },
        }
    }
    tracing::debug!(%conn, "WebSocket connection task exiting");
}

fn close_frame(reason: &str) -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: reason.to_string().into(),
    }
}

fn identity_from_headers(headers: &HeaderMap) -> Option<PeerIdentity> {
    headers
        .get(IDENTITY_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(PeerIdentity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_headers_parses_decimal() {
        let mut headers = HeaderMap::new();
        headers.insert(IDENTITY_HEADER, HeaderValue::from(42u64));

        assert_eq!(identity_from_headers(&headers), Some(PeerIdentity(42)));
    }

    #[test]
    fn test_identity_from_headers_rejects_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(IDENTITY_HEADER, HeaderValue::from_static("alice"));

        assert_eq!(identity_from_headers(&headers), None);
        assert_eq!(identity_from_headers(&HeaderMap::new()), None);
    }
}
