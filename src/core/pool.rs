// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Bounded connection pool (C2): a map of live transport sessions keyed by
//! session id, with lookup by remote address.

use crate::core::types::{now_ms, Address};
use crate::networking::peer_score::{Decision, PeerScore, ScoreParams};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};

/// Pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is at `MaxConnections` capacity.
    #[error("pool full")]
    PoolFull,
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, handshake not yet attempted.
    Connected,
    /// Handshake (`READY_REQUEST`) in flight.
    Handshaking,
    /// Handshake complete; steady-state traffic flows.
    Ready,
    /// Session has been closed; retained briefly for cleanup bookkeeping.
    Closed,
}

/// Direction in which the session was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionType {
    /// We accepted the connection.
    Incoming,
    /// We dialed the connection.
    Outgoing,
}

/// A unique session identifier, stamped by the pool on insertion.
pub type SessionId = u64;

/// A live transport session plus its protocol-level bookkeeping.
pub struct Session {
    /// Session id, assigned by the pool.
    pub id: SessionId,
    /// Remote node address, once known via handshake. Starts `None` for a
    /// freshly accepted inbound connection and is filled in by
    /// [`ConnectionPool::bind_address`] once the handshake resolves it, so
    /// it's kept behind a mutex rather than a plain field.
    pub peer_address: std::sync::Mutex<Option<Address>>,
    /// Remote `host:port`.
    pub network_address: String,
    /// Lifecycle state. Interior-mutable: the owning read/write loop and the
    /// pool's own cleanup sweep both need to update it without a `&mut
    /// Session` (sessions are always shared as `Arc<Session>`).
    state: std::sync::Mutex<SessionState>,
    /// Direction.
    pub session_type: SessionType,
    /// Creation time (ms since epoch).
    pub created_at: u64,
    /// Last observed activity (ms since epoch).
    pub last_activity: u64,
    /// Buffered read half, owned by whichever task runs this session's read
    /// loop. Held behind a mutex only so the pool can hand it out uniformly;
    /// in practice exactly one task ever locks it (§5: one task per session).
    /// Buffering is persistent across calls so bytes read ahead of a `\n`
    /// boundary are never discarded between reads.
    pub reader: Mutex<BufReader<OwnedReadHalf>>,
    /// Write half, serialized behind a mutex so writes from any task remain
    /// FIFO per session without blocking the read loop.
    pub writer: Mutex<OwnedWriteHalf>,
}

impl Session {
    /// Touch the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = now_ms();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Transition to a new lifecycle state.
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }
}

struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_address: HashMap<Address, SessionId>,
    max_connections: usize,
}

/// Bounded map of live sessions. Mutation takes an exclusive lock; lookups
/// take a shared lock (enforced by using a single `tokio::sync::RwLock` over
/// the whole map, since the map itself — not transport I/O — is the guarded
/// resource).
pub struct ConnectionPool {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    peer_inactive_timeout_ms: u64,
    /// Gates repeated protocol violations (§7: a session is closed only on
    /// repeated or security-relevant violations, never on a single malformed
    /// frame). Keyed by whatever identity is known at the time of the
    /// violation — the joiner's address once handshaken, otherwise its
    /// remote `host:port`.
    peer_score: std::sync::Mutex<PeerScore>,
    ban_threshold: i32,
}

impl ConnectionPool {
    /// Construct an empty pool.
    pub fn new(max_connections: usize, peer_inactive_timeout_ms: u64) -> Self {
        let score_params = ScoreParams::default();
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                by_address: HashMap::new(),
                max_connections,
            }),
            next_id: AtomicU64::new(1),
            peer_inactive_timeout_ms,
            ban_threshold: score_params.ban_threshold,
            peer_score: std::sync::Mutex::new(PeerScore::new(score_params)),
        }
    }

    /// Record a protocol violation (malformed/oversized frame, unexpected
    /// message type) from `key` and return the resulting decision. Callers
    /// close the session on `Decision::Ban`.
    pub fn record_violation(&self, key: &[u8]) -> Decision {
        self.peer_score
            .lock()
            .unwrap()
            .observe_bad(key.to_vec(), Instant::now(), 1)
    }

    /// Record well-formed traffic from `key`, slowly offsetting past
    /// violations.
    pub fn record_good(&self, key: &[u8]) {
        let _ = self
            .peer_score
            .lock()
            .unwrap()
            .observe_good(key.to_vec(), Instant::now(), 1);
    }

    /// Whether `key` is currently banned, checked before admitting a new
    /// session from a remote that has already accumulated enough violations.
    /// A pure read: does not itself record an observation or apply decay.
    pub fn is_banned(&self, key: &[u8]) -> bool {
        self.peer_score.lock().unwrap().score_of(key) <= -self.ban_threshold
    }

    /// Move reputation accumulated under `from` (e.g. a pre-handshake
    /// `ip:port`) onto `to` (e.g. the now-known protocol `Address`), so a
    /// ban survives the identity switch instead of starting over at zero.
    pub fn migrate_reputation(&self, from: &[u8], to: &[u8]) {
        self.peer_score.lock().unwrap().migrate(from, to);
    }

    /// Insert a new session, stamping its id. Rejects when at capacity.
    pub async fn add(
        &self,
        peer_address: Option<Address>,
        network_address: String,
        session_type: SessionType,
        transport: TcpStream,
    ) -> Result<Arc<Session>, PoolError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.len() >= inner.max_connections {
            return Err(PoolError::PoolFull);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = now_ms();
        let (read_half, write_half) = transport.into_split();
        let session = Arc::new(Session {
            id,
            peer_address: std::sync::Mutex::new(peer_address),
            network_address,
            state: std::sync::Mutex::new(SessionState::Connected),
            session_type,
            created_at: now,
            last_activity: now,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
        });
        inner.sessions.insert(id, session.clone());
        if let Some(addr) = peer_address {
            inner.by_address.insert(addr, id);
        }
        Ok(session)
    }

    /// Look up by session id.
    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(&id).cloned()
    }

    /// Look up by remote address.
    pub async fn get_by_address(&self, addr: Address) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        let id = *inner.by_address.get(&addr)?;
        inner.sessions.get(&id).cloned()
    }

    /// Associate a session with a now-known peer address (post-handshake).
    pub async fn bind_address(&self, id: SessionId, addr: Address) {
        let mut inner = self.inner.write().await;
        inner.by_address.insert(addr, id);
        if let Some(session) = inner.sessions.get(&id) {
            *session.peer_address.lock().unwrap() = Some(addr);
        }
    }

    /// Remove a session by id. Idempotent.
    pub async fn remove(&self, id: SessionId) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.remove(&id) {
            session.set_state(SessionState::Closed);
            if let Some(addr) = *session.peer_address.lock().unwrap() {
                inner.by_address.remove(&addr);
            }
        }
    }

    /// Mark a session `Closed` without removing it from the map. Used by
    /// callers that can't afford the write lock inline (e.g. a broadcast
    /// fan-out holding several session writer locks at once); the next
    /// [`Self::cleanup`] pass reaps it.
    pub async fn mark_closed(&self, id: SessionId) {
        let inner = self.inner.read().await;
        if let Some(session) = inner.sessions.get(&id) {
            session.set_state(SessionState::Closed);
        }
    }

    /// Remove a session by remote address. Idempotent.
    pub async fn remove_by_address(&self, addr: Address) {
        let id = { self.inner.read().await.by_address.get(&addr).copied() };
        if let Some(id) = id {
            self.remove(id).await;
        }
    }

    /// All live sessions, as a snapshot vector (for broadcast fan-out).
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Whether the pool currently holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove any session that's `Closed` or whose `lastActivity` predates
    /// `PeerInactiveTimeout`. Run periodically (§5).
    pub async fn cleanup(&self) {
        let now = now_ms();
        let stale: Vec<SessionId> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .values()
                .filter(|s| {
                    s.state() == SessionState::Closed
                        || now.saturating_sub(s.last_activity) > self.peer_inactive_timeout_ms
                })
                .map(|s| s.id)
                .collect()
        };
        for id in stale {
            self.remove(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn dummy_stream() -> TcpStream {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let _ = connect.await.unwrap();
        accepted
    }

    #[tokio::test]
    async fn add_and_get_roundtrip() {
        let pool = ConnectionPool::new(4, 60_000);
        let a = Address::from_bytes([9u8; 20]);
        let s = pool
            .add(Some(a), "127.0.0.1:1".into(), SessionType::Incoming, dummy_stream().await)
            .await
            .unwrap();
        assert_eq!(pool.get(s.id).await.unwrap().id, s.id);
        assert_eq!(pool.get_by_address(a).await.unwrap().id, s.id);
    }

    #[tokio::test]
    async fn pool_full_rejects() {
        let pool = ConnectionPool::new(1, 60_000);
        let _ = pool
            .add(None, "x".into(), SessionType::Incoming, dummy_stream().await)
            .await
            .unwrap();
        let err = pool
            .add(None, "y".into(), SessionType::Incoming, dummy_stream().await)
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::PoolFull);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let pool = ConnectionPool::new(4, 60_000);
        let s = pool
            .add(None, "x".into(), SessionType::Incoming, dummy_stream().await)
            .await
            .unwrap();
        pool.remove(s.id).await;
        pool.remove(s.id).await;
        assert!(pool.get(s.id).await.is_none());
    }

    #[tokio::test]
    async fn repeated_violations_eventually_ban() {
        let pool = ConnectionPool::new(4, 60_000);
        let key = b"10.0.0.1:4000";
        assert!(!pool.is_banned(key));
        let mut decision = Decision::Allow;
        for _ in 0..100 {
            decision = pool.record_violation(key);
            if decision == Decision::Ban {
                break;
            }
        }
        assert_eq!(decision, Decision::Ban);
        assert!(pool.is_banned(key));
    }

    #[tokio::test]
    async fn record_good_does_not_ban() {
        let pool = ConnectionPool::new(4, 60_000);
        let key = b"10.0.0.2:4000";
        for _ in 0..50 {
            pool.record_good(key);
        }
        assert!(!pool.is_banned(key));
    }

    #[tokio::test]
    async fn new_session_starts_connected() {
        let pool = ConnectionPool::new(4, 60_000);
        let s = pool
            .add(None, "x".into(), SessionType::Incoming, dummy_stream().await)
            .await
            .unwrap();
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn cleanup_reaps_closed_sessions_even_when_fresh() {
        let pool = ConnectionPool::new(4, 60_000);
        let s = pool
            .add(None, "x".into(), SessionType::Incoming, dummy_stream().await)
            .await
            .unwrap();
        pool.mark_closed(s.id).await;
        assert_eq!(pool.get(s.id).await.unwrap().state(), SessionState::Closed);
        pool.cleanup().await;
        assert!(pool.get(s.id).await.is_none());
    }

    #[tokio::test]
    async fn remove_marks_the_session_closed() {
        let pool = ConnectionPool::new(4, 60_000);
        let s = pool
            .add(None, "x".into(), SessionType::Incoming, dummy_stream().await)
            .await
            .unwrap();
        let handle = s.clone();
        pool.remove(s.id).await;
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn is_banned_is_a_pure_read() {
        let pool = ConnectionPool::new(4, 60_000);
        let key = b"10.0.0.3:4000";
        while pool.record_violation(key) != Decision::Ban {}
        assert!(pool.is_banned(key));
        for _ in 0..10 {
            assert!(pool.is_banned(key));
        }
    }
}
