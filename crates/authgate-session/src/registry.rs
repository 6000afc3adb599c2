//! The server's connection registry.
//!
//! One [`ServerHandshake`] per live connection, behind a single mutex.
//! Every read-modify-write (look up, transition, maybe remove) happens
//! under one acquisition of that lock, so a broadcast iterating the
//! registry can never observe a half-applied transition. The lock is never
//! held across I/O: operations return [`ServerEffect`]s and the caller
//! executes them after the guard is dropped.
//!
//! Records are removed only by [`teardown`](ConnectionRegistry::teardown)
//! (and [`teardown_all`](ConnectionRegistry::teardown_all) at shutdown),
//! which the server calls when the transport reports a connection closed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use authgate_transport::{ConnectionId, PeerIdentity};

use crate::{
    AuthFailureReason, AuthState, ServerEffect, ServerHandshake, ServerInput,
    SessionError,
};

/// A copy of one record, taken under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub conn: ConnectionId,
    pub state: AuthState,
    pub identity: Option<PeerIdentity>,
    /// When the record entered `state`.
    pub since: Instant,
}

impl ConnectionSnapshot {
    fn of(conn: ConnectionId, hs: &ServerHandshake) -> Self {
        Self {
            conn,
            state: hs.state(),
            identity: hs.identity(),
            since: hs.entered_at(),
        }
    }
}

/// Thread-safe map from connection to handshake, with a fixed capacity.
pub struct ConnectionRegistry {
    capacity: usize,
    records: Mutex<HashMap<ConnectionId, ServerHandshake>>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ServerHandshake>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a new inbound connection in `Connecting`.
    ///
    /// The capacity check and the insert happen under the same lock, so
    /// two simultaneous attempts can't both squeeze into the last slot.
    ///
    /// # Errors
    /// - [`SessionError::ServerFull`] at capacity.
    /// - [`SessionError::DuplicateConnection`] if `conn` is already live.
    pub fn register(&self, conn: ConnectionId, now: Instant) -> Result<(), SessionError> {
        let mut records = self.lock();
        if records.contains_key(&conn) {
            return Err(SessionError::DuplicateConnection(conn));
        }
        if records.len() >= self.capacity {
            return Err(SessionError::ServerFull {
                capacity: self.capacity,
            });
        }
        records.insert(conn, ServerHandshake::new(now));
        Ok(())
    }

    pub fn get(&self, conn: ConnectionId) -> Option<ConnectionSnapshot> {
        self.lock()
            .get(&conn)
            .map(|hs| ConnectionSnapshot::of(conn, hs))
    }

    /// Runs `f` on the record under the lock. `None` if `conn` is unknown.
    pub fn update<R>(
        &self,
        conn: ConnectionId,
        f: impl FnOnce(&mut ServerHandshake) -> R,
    ) -> Option<R> {
        self.lock().get_mut(&conn).map(f)
    }

    /// Applies `input` to the record for `conn`.
    pub fn apply(
        &self,
        conn: ConnectionId,
        input: ServerInput<'_>,
        now: Instant,
    ) -> Option<Vec<ServerEffect>> {
        self.update(conn, |hs| hs.apply(input, now))
    }

    /// Applies a ticket frame, checking under the same lock whether another
    /// connection already holds a session or validation for this identity.
    pub fn submit_ticket(
        &self,
        conn: ConnectionId,
        frame: &[u8],
        max_len: usize,
        now: Instant,
    ) -> Option<Vec<ServerEffect>> {
        let mut records = self.lock();
        let identity = records.get(&conn)?.identity();
        let identity_in_use = identity.is_some_and(|identity| {
            records.iter().any(|(other, hs)| {
                *other != conn
                    && hs.identity() == Some(identity)
                    && matches!(hs.state(), AuthState::TicketReceived | AuthState::Validated)
            })
        });
        let hs = records.get_mut(&conn)?;
        Some(hs.apply(
            ServerInput::TicketFrame {
                frame,
                max_len,
                identity_in_use,
            },
            now,
        ))
    }

    /// Routes a validation verdict to the record awaiting it.
    ///
    /// Only a record in `TicketReceived` for `identity` matches. `None`
    /// means the response is stale or unsolicited, and nothing changed.
    pub fn resolve_validation(
        &self,
        identity: PeerIdentity,
        outcome: Result<(), AuthFailureReason>,
        now: Instant,
    ) -> Option<(ConnectionId, Vec<ServerEffect>)> {
        let mut records = self.lock();
        let (conn, hs) = records.iter_mut().find(|(_, hs)| {
            hs.state() == AuthState::TicketReceived && hs.identity() == Some(identity)
        })?;
        Some((*conn, hs.apply(ServerInput::Verdict(outcome), now)))
    }

    /// Returns the connection holding `identity` in `state`, if any.
    pub fn find_by_identity(
        &self,
        identity: PeerIdentity,
        state: AuthState,
    ) -> Option<ConnectionId> {
        self.lock()
            .iter()
            .find(|(_, hs)| hs.state() == state && hs.identity() == Some(identity))
            .map(|(conn, _)| *conn)
    }

    /// Calls `action` for every record matching `predicate`, under the lock.
    ///
    /// `action` must not call back into the registry or do I/O. To
    /// send to a set of connections, collect them with
    /// [`select`](Self::select) first.
    pub fn for_each(
        &self,
        predicate: impl Fn(&ConnectionSnapshot) -> bool,
        mut action: impl FnMut(&ConnectionSnapshot),
    ) {
        for (conn, hs) in self.lock().iter() {
            let snapshot = ConnectionSnapshot::of(*conn, hs);
            if predicate(&snapshot) {
                action(&snapshot);
            }
        }
    }

    /// Returns the connections matching `predicate`, sorted by id.
    pub fn select(&self, predicate: impl Fn(&ConnectionSnapshot) -> bool) -> Vec<ConnectionId> {
        let mut matched = Vec::new();
        self.for_each(predicate, |s| matched.push(s.conn));
        matched.sort();
        matched
    }

    /// Returns handshaking connections whose current step started at least
    /// `timeout` before `now`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.select(|s| {
            s.state.is_handshaking() && now.saturating_duration_since(s.since) >= timeout
        })
    }

    fn remove(&self, conn: ConnectionId) -> Option<ServerHandshake> {
        self.lock().remove(&conn)
    }

    /// Removes the record for a closed connection and returns the effects
    /// of closing it (`EndSession`, `SessionEnded`).
    ///
    /// `None` if the record was already gone, which makes repeated
    /// teardown harmless.
    pub fn teardown(&self, conn: ConnectionId, now: Instant) -> Option<Vec<ServerEffect>> {
        let mut hs = self.remove(conn)?;
        Some(hs.apply(ServerInput::Closed, now))
    }

    /// Removes every record. Used at shutdown.
    pub fn teardown_all(&self, now: Instant) -> Vec<(ConnectionId, Vec<ServerEffect>)> {
        let drained: Vec<_> = self.lock().drain().collect();
        let mut effects: Vec<_> = drained
            .into_iter()
            .map(|(conn, mut hs)| (conn, hs.apply(ServerInput::Closed, now)))
            .collect();
        effects.sort_by_key(|(conn, _)| *conn);
        effects
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use authgate_protocol::{ControlMessage, encode_ticket_frame};

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::new(n)
    }

    /// Registers `n`, accepts it, and identifies it as `identity`.
    fn greeted(registry: &ConnectionRegistry, n: u64, identity: u64) {
        let now = Instant::now();
        registry.register(conn(n), now).unwrap();
        registry.apply(conn(n), ServerInput::Accepted, now);
        registry.apply(
            conn(n),
            ServerInput::PeerIdentified(Some(PeerIdentity(identity))),
            now,
        );
    }

    fn submit(registry: &ConnectionRegistry, n: u64) -> Vec<ServerEffect> {
        let frame = encode_ticket_frame(b"ticket").unwrap();
        registry
            .submit_ticket(conn(n), &frame, 1024, Instant::now())
            .unwrap()
    }

    // =========================================================================
    // Admission
    // =========================================================================

    #[test]
    fn test_register_rejects_over_capacity() {
        let registry = ConnectionRegistry::new(2);
        let now = Instant::now();

        registry.register(conn(1), now).unwrap();
        registry.register(conn(2), now).unwrap();

        assert!(matches!(
            registry.register(conn(3), now),
            Err(SessionError::ServerFull { capacity: 2 })
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let registry = ConnectionRegistry::new(4);
        let now = Instant::now();
        registry.register(conn(1), now).unwrap();

        assert!(matches!(
            registry.register(conn(1), now),
            Err(SessionError::DuplicateConnection(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_slot_frees_after_teardown() {
        let registry = ConnectionRegistry::new(1);
        let now = Instant::now();
        registry.register(conn(1), now).unwrap();
        assert!(registry.register(conn(2), now).is_err());

        registry.teardown(conn(1), now);

        registry.register(conn(3), now).unwrap();
        assert!(registry.get(conn(1)).is_none());
    }

    #[test]
    fn test_concurrent_register_never_exceeds_capacity() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let handles: Vec<_> = (0..32)
            .map(|n| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.register(conn(n), Instant::now()).is_ok())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 8);
        assert_eq!(registry.len(), 8);
    }

    // =========================================================================
    // Tickets and validation
    // =========================================================================

    #[test]
    fn test_submit_ticket_unknown_connection_is_none() {
        let registry = ConnectionRegistry::new(4);

        assert!(registry
            .submit_ticket(conn(9), &[0, 0, 0, 1, 1], 1024, Instant::now())
            .is_none());
    }

    #[test]
    fn test_second_connection_for_same_identity_is_rejected() {
        let registry = ConnectionRegistry::new(4);
        greeted(&registry, 1, 42);
        greeted(&registry, 2, 42);
        submit(&registry, 1);

        let effects = submit(&registry, 2);

        assert_eq!(effects[0], ServerEffect::Send(ControlMessage::AuthFailure));
        assert_eq!(registry.get(conn(2)).unwrap().state, AuthState::Failed);
        assert_eq!(
            registry.get(conn(1)).unwrap().state,
            AuthState::TicketReceived
        );
    }

    #[test]
    fn test_resolve_validation_matches_ticket_received_only() {
        let registry = ConnectionRegistry::new(4);
        greeted(&registry, 1, 42);

        // Still Pending: nothing to resolve.
        assert!(registry
            .resolve_validation(PeerIdentity(42), Ok(()), Instant::now())
            .is_none());

        submit(&registry, 1);
        let (matched, effects) = registry
            .resolve_validation(PeerIdentity(42), Ok(()), Instant::now())
            .unwrap();

        assert_eq!(matched, conn(1));
        assert!(effects.contains(&ServerEffect::SessionEstablished(PeerIdentity(42))));
        assert_eq!(
            registry.find_by_identity(PeerIdentity(42), AuthState::Validated),
            Some(conn(1))
        );
    }

    #[test]
    fn test_late_verdict_does_not_touch_registry() {
        let registry = ConnectionRegistry::new(4);
        greeted(&registry, 1, 42);
        let before = registry.get(conn(1));

        let result = registry.resolve_validation(
            PeerIdentity(7),
            Err(AuthFailureReason::InvalidTicket),
            Instant::now(),
        );

        assert!(result.is_none());
        assert_eq!(registry.get(conn(1)), before);
        assert_eq!(registry.len(), 1);
    }

    // =========================================================================
    // Teardown, iteration, timeouts
    // =========================================================================

    #[test]
    fn test_teardown_twice_ends_session_once() {
        let registry = ConnectionRegistry::new(4);
        greeted(&registry, 1, 42);
        submit(&registry, 1);
        registry.resolve_validation(PeerIdentity(42), Ok(()), Instant::now());

        let first = registry.teardown(conn(1), Instant::now()).unwrap();
        let second = registry.teardown(conn(1), Instant::now());

        assert_eq!(
            first,
            vec![
                ServerEffect::EndSession(PeerIdentity(42)),
                ServerEffect::SessionEnded(PeerIdentity(42)),
            ]
        );
        assert!(second.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_select_returns_only_matching_sorted() {
        let registry = ConnectionRegistry::new(8);
        for n in [3, 1, 2] {
            greeted(&registry, n, n * 10);
            submit(&registry, n);
        }
        registry.resolve_validation(PeerIdentity(30), Ok(()), Instant::now());
        registry.resolve_validation(PeerIdentity(10), Ok(()), Instant::now());

        let validated = registry.select(|s| s.state == AuthState::Validated);

        assert_eq!(validated, vec![conn(1), conn(3)]);
    }

    #[test]
    fn test_expired_finds_stale_handshakes() {
        let registry = ConnectionRegistry::new(4);
        let start = Instant::now();
        registry.register(conn(1), start).unwrap();
        greeted(&registry, 2, 20);
        submit(&registry, 2);
        registry.resolve_validation(PeerIdentity(20), Ok(()), Instant::now());

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(registry.expired(later, Duration::from_secs(10)), vec![conn(1)]);

        registry.apply(conn(1), ServerInput::TimedOut, later).unwrap();
        assert_eq!(registry.get(conn(1)).unwrap().state, AuthState::Failed);
        assert!(registry.expired(later, Duration::from_secs(10)).is_empty());
        // Timed out, not removed: teardown still owns removal.
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_teardown_all_drains_registry() {
        let registry = ConnectionRegistry::new(4);
        greeted(&registry, 1, 10);
        greeted(&registry, 2, 20);

        let torn = registry.teardown_all(Instant::now());

        assert_eq!(torn.len(), 2);
        assert!(registry.is_empty());
    }
}
