//! In-process transport.
//!
//! A [`MemoryNetwork`] is a hub that any number of [`MemoryTransport`]
//! endpoints attach to. Listening endpoints claim a socket address;
//! connecting endpoints dial it. Nothing touches the OS network stack,
//! so tests can drive both sides of a handshake deterministically by
//! alternating polls.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    ConnectionEvent, ConnectionId, EndReason, InboundMessage, PeerIdentity,
    PollGroupId, SendMode, Transport, TransportError,
};

type EndpointId = u64;

/// Shared hub for in-process endpoints. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a listening endpoint bound to `addr`.
    ///
    /// # Errors
    /// - [`TransportError::InvalidAddress`] if `addr` isn't `ip:port`
    /// - [`TransportError::AcceptFailed`] if another endpoint holds `addr`
    pub fn listen(&self, addr: &str) -> Result<MemoryTransport, TransportError> {
        let addr = parse_addr(addr)?;
        let mut hub = lock(&self.hub);
        if hub.listeners.contains_key(&addr) {
            return Err(TransportError::AcceptFailed(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                addr.to_string(),
            )));
        }
        let endpoint = hub.add_endpoint(None);
        hub.listeners.insert(addr, endpoint);
        tracing::info!(%addr, "memory transport listening");
        Ok(MemoryTransport {
            hub: Arc::clone(&self.hub),
            endpoint,
        })
    }

    /// Creates a dialing endpoint. Peers it connects to will see
    /// `identity` in their [`ConnectionEvent::Connected`] event.
    pub fn endpoint(&self, identity: Option<PeerIdentity>) -> MemoryTransport {
        let endpoint = lock(&self.hub).add_endpoint(identity);
        MemoryTransport {
            hub: Arc::clone(&self.hub),
            endpoint,
        }
    }
}

/// One endpoint attached to a [`MemoryNetwork`].
///
/// Dropping the endpoint closes all of its connections; peers observe
/// [`EndReason::ClosedByPeer`].
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
    endpoint: EndpointId,
}

#[derive(Default)]
struct Hub {
    /// Shared counter for connection, group, and endpoint ids.
    next_id: u64,
    endpoints: HashMap<EndpointId, Endpoint>,
    listeners: HashMap<SocketAddr, EndpointId>,
    /// Both ends of every link, keyed by their own connection id.
    links: HashMap<ConnectionId, LinkEnd>,
}

struct Endpoint {
    identity: Option<PeerIdentity>,
    events: VecDeque<ConnectionEvent>,
    groups: HashMap<PollGroupId, VecDeque<InboundMessage>>,
}

struct LinkEnd {
    owner: EndpointId,
    /// The other end. `None` when nobody was listening.
    peer: Option<ConnectionId>,
    phase: LinkPhase,
    group: Option<PollGroupId>,
    inbox: VecDeque<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Connecting,
    Connected,
    /// The Closed event was already reported; waiting for `close` to
    /// release the handle.
    Dead,
}

impl LinkEnd {
    fn new(owner: EndpointId, peer: Option<ConnectionId>) -> Self {
        Self {
            owner,
            peer,
            phase: LinkPhase::Connecting,
            group: None,
            inbox: VecDeque::new(),
        }
    }
}

impl Hub {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_endpoint(&mut self, identity: Option<PeerIdentity>) -> EndpointId {
        let id = self.next_id();
        self.endpoints.insert(
            id,
            Endpoint {
                identity,
                events: VecDeque::new(),
                groups: HashMap::new(),
            },
        );
        id
    }

    fn push_event(&mut self, endpoint: EndpointId, event: ConnectionEvent) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.events.push_back(event);
        }
    }

    /// Returns the link end if `endpoint` owns it.
    fn owned(&self, endpoint: EndpointId, conn: ConnectionId) -> Option<&LinkEnd> {
        self.links.get(&conn).filter(|end| end.owner == endpoint)
    }

    fn deliver(&mut self, conn: ConnectionId, data: Vec<u8>) {
        let Some(end) = self.links.get_mut(&conn) else {
            return;
        };
        match end.group {
            Some(group) => {
                if let Some(ep) = self.endpoints.get_mut(&end.owner) {
                    ep.groups
                        .entry(group)
                        .or_default()
                        .push_back(InboundMessage { conn, data });
                }
            }
            None => end.inbox.push_back(data),
        }
    }

    /// Marks the far end of a closed link dead and tells its owner.
    fn peer_gone(&mut self, peer: ConnectionId, detail: &str) {
        let Some(end) = self.links.get_mut(&peer) else {
            return;
        };
        if end.phase == LinkPhase::Dead {
            return;
        }
        end.phase = LinkPhase::Dead;
        let owner = end.owner;
        self.push_event(
            owner,
            ConnectionEvent::Closed {
                conn: peer,
                reason: EndReason::ClosedByPeer,
                detail: detail.to_string(),
            },
        );
    }

    /// Releases a link end, reporting the close to both sides as needed.
    fn release(&mut self, conn: ConnectionId, detail: &str) {
        let Some(end) = self.links.remove(&conn) else {
            return;
        };
        if let Some(ep) = self.endpoints.get_mut(&end.owner) {
            for queue in ep.groups.values_mut() {
                queue.retain(|m| m.conn != conn);
            }
        }
        if end.phase == LinkPhase::Dead {
            return;
        }
        self.push_event(
            end.owner,
            ConnectionEvent::Closed {
                conn,
                reason: EndReason::ClosedLocally,
                detail: detail.to_string(),
            },
        );
        if let Some(peer) = end.peer {
            self.peer_gone(peer, detail);
        }
    }
}

impl MemoryTransport {
    fn lock(&self) -> MutexGuard<'_, Hub> {
        lock(&self.hub)
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, addr: &str) -> Result<ConnectionId, TransportError> {
        let target = parse_addr(addr)?;
        let mut hub = self.lock();
        let local = ConnectionId::new(hub.next_id());

        match hub.listeners.get(&target).copied() {
            Some(listener) => {
                let remote = ConnectionId::new(hub.next_id());
                hub.links.insert(local, LinkEnd::new(self.endpoint, Some(remote)));
                hub.links.insert(remote, LinkEnd::new(listener, Some(local)));
                hub.push_event(
                    listener,
                    ConnectionEvent::Connecting {
                        conn: remote,
                        remote: format!("memory:{}", self.endpoint),
                    },
                );
                tracing::debug!(%local, %target, "memory connect started");
            }
            None => {
                let mut end = LinkEnd::new(self.endpoint, None);
                end.phase = LinkPhase::Dead;
                hub.links.insert(local, end);
                hub.push_event(
                    self.endpoint,
                    ConnectionEvent::Closed {
                        conn: local,
                        reason: EndReason::ProblemDetectedLocally,
                        detail: format!("no listener at {target}"),
                    },
                );
            }
        }
        Ok(local)
    }

    fn accept(&self, conn: ConnectionId) -> Result<(), TransportError> {
        let mut hub = self.lock();
        let end = hub
            .owned(self.endpoint, conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        if end.phase != LinkPhase::Connecting {
            return Err(TransportError::NotConnecting(conn));
        }
        let peer = end.peer.ok_or(TransportError::NotConnecting(conn))?;
        let peer_owner = match hub.links.get(&peer) {
            Some(p) if p.phase == LinkPhase::Connecting => p.owner,
            _ => {
                return Err(TransportError::ConnectionClosed(format!(
                    "{conn}: peer went away before accept"
                )));
            }
        };

        for id in [conn, peer] {
            if let Some(end) = hub.links.get_mut(&id) {
                end.phase = LinkPhase::Connected;
            }
        }

        let client_identity = hub.endpoints.get(&peer_owner).and_then(|e| e.identity);
        let server_identity = hub.endpoints.get(&self.endpoint).and_then(|e| e.identity);
        hub.push_event(
            self.endpoint,
            ConnectionEvent::Connected {
                conn,
                identity: client_identity,
            },
        );
        hub.push_event(
            peer_owner,
            ConnectionEvent::Connected {
                conn: peer,
                identity: server_identity,
            },
        );
        Ok(())
    }

    fn send(
        &self,
        conn: ConnectionId,
        data: &[u8],
        _mode: SendMode,
    ) -> Result<(), TransportError> {
        let mut hub = self.lock();
        let end = hub
            .owned(self.endpoint, conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        let peer = match (end.phase, end.peer) {
            (LinkPhase::Connected, Some(peer)) => peer,
            (LinkPhase::Connecting, _) => {
                return Err(TransportError::NotConnected(conn));
            }
            _ => {
                return Err(TransportError::ConnectionClosed(format!(
                    "{conn} is closed"
                )));
            }
        };
        hub.deliver(peer, data.to_vec());
        Ok(())
    }

    fn close(&self, conn: ConnectionId, reason: &str) {
        let mut hub = self.lock();
        if hub.owned(self.endpoint, conn).is_none() {
            return;
        }
        hub.release(conn, reason);
    }

    fn poll_events(&self, max: usize) -> Vec<ConnectionEvent> {
        let mut hub = self.lock();
        let Some(ep) = hub.endpoints.get_mut(&self.endpoint) else {
            return Vec::new();
        };
        let n = max.min(ep.events.len());
        ep.events.drain(..n).collect()
    }

    fn create_poll_group(&self) -> PollGroupId {
        let mut hub = self.lock();
        let group = PollGroupId::new(hub.next_id());
        if let Some(ep) = hub.endpoints.get_mut(&self.endpoint) {
            ep.groups.insert(group, VecDeque::new());
        }
        group
    }

    fn set_poll_group(
        &self,
        conn: ConnectionId,
        group: PollGroupId,
    ) -> Result<(), TransportError> {
        let mut hub = self.lock();
        if hub.owned(self.endpoint, conn).is_none() {
            return Err(TransportError::UnknownConnection(conn));
        }
        let group_exists = hub
            .endpoints
            .get(&self.endpoint)
            .is_some_and(|ep| ep.groups.contains_key(&group));
        if !group_exists {
            return Err(TransportError::UnknownPollGroup(group));
        }

        let waiting: Vec<Vec<u8>> = match hub.links.get_mut(&conn) {
            Some(end) => {
                end.group = Some(group);
                end.inbox.drain(..).collect()
            }
            None => Vec::new(),
        };
        for data in waiting {
            hub.deliver(conn, data);
        }
        Ok(())
    }

    fn poll_group_messages(
        &self,
        group: PollGroupId,
        max: usize,
    ) -> Vec<InboundMessage> {
        let mut hub = self.lock();
        let Some(queue) = hub
            .endpoints
            .get_mut(&self.endpoint)
            .and_then(|ep| ep.groups.get_mut(&group))
        else {
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
        let mut hub = self.lock();
        match hub.links.get_mut(&conn) {
            Some(end) if end.owner == self.endpoint => {
                let n = max.min(end.inbox.len());
                end.inbox.drain(..n).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut hub = lock(&self.hub);
        let owned: Vec<ConnectionId> = hub
            .links
            .iter()
            .filter(|(_, end)| end.owner == self.endpoint)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in owned {
            hub.release(conn, "endpoint dropped");
        }
        hub.endpoints.remove(&self.endpoint);
        let endpoint = self.endpoint;
        hub.listeners.retain(|_, owner| *owner != endpoint);
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_addr(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.parse()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "127.0.0.1:1234";

    fn connecting_conn(events: &[ConnectionEvent]) -> ConnectionId {
        match events {
            [ConnectionEvent::Connecting { conn, .. }] => *conn,
            other => panic!("expected one Connecting event, got {other:?}"),
        }
    }

    /// Dials the listener and accepts; returns (server conn, client conn).
    fn establish(
        server: &MemoryTransport,
        client: &MemoryTransport,
    ) -> (ConnectionId, ConnectionId) {
        let client_conn = client.connect(ADDR).expect("connect");
        let server_conn = connecting_conn(&server.poll_events(8));
        server.accept(server_conn).expect("accept");
        (server_conn, client_conn)
    }

    // =====================================================================
    // connect / accept
    // =====================================================================

    #[test]
    fn test_connect_rejects_malformed_address() {
        let net = MemoryNetwork::new();
        let client = net.endpoint(None);

        let result = client.connect("not-an-address");

        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[test]
    fn test_connect_without_listener_reports_problem() {
        let net = MemoryNetwork::new();
        let client = net.endpoint(None);

        let conn = client.connect(ADDR).expect("address is valid");

        let events = client.poll_events(8);
        assert!(matches!(
            events.as_slice(),
            [ConnectionEvent::Closed { conn: c, reason: EndReason::ProblemDetectedLocally, .. }]
                if *c == conn
        ));
    }

    #[test]
    fn test_listen_twice_on_same_address_fails() {
        let net = MemoryNetwork::new();
        let _first = net.listen(ADDR).unwrap();

        assert!(matches!(
            net.listen(ADDR),
            Err(TransportError::AcceptFailed(_))
        ));
    }

    #[test]
    fn test_accept_reports_identities_to_both_sides() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(Some(PeerIdentity(7)));

        let (server_conn, client_conn) = establish(&server, &client);

        assert_eq!(
            server.poll_events(8),
            vec![ConnectionEvent::Connected {
                conn: server_conn,
                identity: Some(PeerIdentity(7)),
            }]
        );
        assert_eq!(
            client.poll_events(8),
            vec![ConnectionEvent::Connected {
                conn: client_conn,
                identity: None,
            }]
        );
    }

    #[test]
    fn test_accept_twice_fails() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let (server_conn, _) = establish(&server, &client);

        assert!(matches!(
            server.accept(server_conn),
            Err(TransportError::NotConnecting(_))
        ));
    }

    // =====================================================================
    // send / poll
    // =====================================================================

    #[test]
    fn test_send_before_connected_fails() {
        let net = MemoryNetwork::new();
        let _server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let conn = client.connect(ADDR).unwrap();

        assert!(matches!(
            client.send(conn, b"early", SendMode::Reliable),
            Err(TransportError::NotConnected(_))
        ));
    }

    #[test]
    fn test_messages_follow_poll_group_in_order() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let (server_conn, client_conn) = establish(&server, &client);

        // One message before the group is assigned, one after.
        client.send(client_conn, b"first", SendMode::Reliable).unwrap();
        let group = server.create_poll_group();
        server.set_poll_group(server_conn, group).unwrap();
        client.send(client_conn, b"second", SendMode::Reliable).unwrap();

        let msgs = server.poll_group_messages(group, 32);
        let data: Vec<&[u8]> = msgs.iter().map(|m| m.data.as_slice()).collect();
        assert_eq!(data, vec![&b"first"[..], &b"second"[..]]);
        assert!(msgs.iter().all(|m| m.conn == server_conn));
    }

    #[test]
    fn test_poll_respects_max() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let (server_conn, client_conn) = establish(&server, &client);

        for i in 0..5u8 {
            server.send(server_conn, &[i], SendMode::Reliable).unwrap();
        }

        assert_eq!(client.poll_connection_messages(client_conn, 3).len(), 3);
        assert_eq!(client.poll_connection_messages(client_conn, 3).len(), 2);
    }

    #[test]
    fn test_set_poll_group_unknown_group_fails() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let (server_conn, _) = establish(&server, &client);

        assert!(matches!(
            server.set_poll_group(server_conn, PollGroupId::new(999)),
            Err(TransportError::UnknownPollGroup(_))
        ));
    }

    // =====================================================================
    // close
    // =====================================================================

    #[test]
    fn test_close_reports_once_to_each_side() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let (server_conn, client_conn) = establish(&server, &client);
        server.poll_events(8);
        client.poll_events(8);

        server.close(server_conn, "bye");
        server.close(server_conn, "bye again");

        assert!(matches!(
            server.poll_events(8).as_slice(),
            [ConnectionEvent::Closed { reason: EndReason::ClosedLocally, .. }]
        ));
        assert!(matches!(
            client.poll_events(8).as_slice(),
            [ConnectionEvent::Closed { conn, reason: EndReason::ClosedByPeer, detail }]
                if *conn == client_conn && detail == "bye"
        ));
    }

    #[test]
    fn test_close_after_peer_closed_is_silent() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let (server_conn, client_conn) = establish(&server, &client);
        server.poll_events(8);

        client.close(client_conn, "leaving");
        assert_eq!(server.poll_events(8).len(), 1);

        // Releasing the dead handle must not produce another event.
        server.close(server_conn, "cleanup");
        assert!(server.poll_events(8).is_empty());
        assert!(matches!(
            server.send(server_conn, b"x", SendMode::Reliable),
            Err(TransportError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_reject_before_accept_reaches_client() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let client_conn = client.connect(ADDR).unwrap();
        let server_conn = connecting_conn(&server.poll_events(8));

        server.close(server_conn, "Server full");

        assert!(matches!(
            client.poll_events(8).as_slice(),
            [ConnectionEvent::Closed { conn, reason: EndReason::ClosedByPeer, detail }]
                if *conn == client_conn && detail == "Server full"
        ));
    }

    #[test]
    fn test_close_unknown_connection_is_noop() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();

        server.close(ConnectionId::new(404), "nothing here");

        assert!(server.poll_events(8).is_empty());
    }

    #[test]
    fn test_dropping_endpoint_closes_its_connections() {
        let net = MemoryNetwork::new();
        let server = net.listen(ADDR).unwrap();
        let client = net.endpoint(None);
        let (server_conn, _) = establish(&server, &client);
        server.poll_events(8);

        drop(client);

        assert!(matches!(
            server.poll_events(8).as_slice(),
            [ConnectionEvent::Closed { conn, reason: EndReason::ClosedByPeer, .. }]
                if *conn == server_conn
        ));
    }
}
