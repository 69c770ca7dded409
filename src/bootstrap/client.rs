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

//! Bootstrap Client (C5): runs on every non-bootstrap node. Holds one
//! persistent session to the bootstrap coordinator, reconnecting with
//! exponential backoff, and resolves unknown peers via `WHO_IS` (§4.5).

use crate::core::codec::{self, WireMessage};
use crate::core::membership::MembershipStore;
use crate::core::pool::{ConnectionPool, Session, SessionState, SessionType};
use crate::core::types::{Address, BootstrapSettings, NetworkAddress};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{info, warn};

/// Persistent outbound session to the bootstrap coordinator.
pub struct BootstrapClient {
    self_address: Address,
    self_net: NetworkAddress,
    bootstrap_addr: String,
    membership: Arc<MembershipStore>,
    pool: Arc<ConnectionPool>,
    settings: BootstrapSettings,
    block_tx: mpsc::Sender<String>,
    /// False until a `REQ` snapshot has been ingested; reset to false on any
    /// read error, so callers (e.g. the block producer) can gate on it.
    ready: Arc<AtomicBool>,
    /// The live session to the bootstrap, if currently connected. Lets
    /// [`Self::broadcast_block`] reach the session from outside the
    /// reconnect loop without threading a channel through it.
    current_session: Arc<AsyncMutex<Option<Arc<Session>>>>,
}

impl BootstrapClient {
    /// Construct a new client targeting `settings.bootstrap_addr`.
    pub fn new(
        self_address: Address,
        self_net: NetworkAddress,
        membership: Arc<MembershipStore>,
        pool: Arc<ConnectionPool>,
        settings: BootstrapSettings,
        block_tx: mpsc::Sender<String>,
    ) -> Self {
        let bootstrap_addr = settings.bootstrap_addr.clone();
        Self {
            self_address,
            self_net,
            bootstrap_addr,
            membership,
            pool,
            settings,
            block_tx,
            ready: Arc::new(AtomicBool::new(false)),
            current_session: Arc::new(AsyncMutex::new(None)),
        }
    }

    /// Whether the last `REQ` snapshot was ingested and no read error has
    /// occurred since.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    async fn write_frame(&self, writer: &mut (impl tokio::io::AsyncWrite + Unpin), bytes: &[u8]) -> bool {
        matches!(
            tokio::time::timeout(
                Duration::from_secs(self.settings.write_timeout_secs),
                writer.write_all(bytes),
            )
            .await,
            Ok(Ok(()))
        )
    }

    /// Emit `BLOCK|<json>` on the current bootstrap session, the
    /// direct-dissemination counterpart to the gossip publish `main.rs` does
    /// for the same block (§1/§2/§4.7). No-op (returns `false`) while not
    /// connected.
    pub async fn broadcast_block(&self, json: String) -> bool {
        let session = self.current_session.lock().await.clone();
        let Some(session) = session else {
            return false;
        };
        let mut writer = session.writer.lock().await;
        self.write_frame(&mut *writer, codec::encode_frame(&WireMessage::Block(json)).as_bytes())
            .await
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff_base_secs;
        let cap = self.settings.backoff_cap_secs;
        let shifted = base.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX).max(1));
        Duration::from_secs(shifted.min(cap))
    }

    /// Reconnect loop: dial, join, run the session to completion, then retry
    /// with exponential backoff until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.connect_and_join().await {
                Ok(session) => {
                    attempt = 0;
                    self.steady_state(session, &mut shutdown).await;
                    self.ready.store(false, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(err = %e, attempt, "bootstrap join failed");
                }
            }
            if *shutdown.borrow() {
                return;
            }
            let delay = self.backoff_delay(attempt.min(self.settings.max_retries));
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.changed() => if *shutdown.borrow() { return },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_and_join(&self) -> Result<Arc<Session>, String> {
        let stream = tokio::time::timeout(
            Duration::from_secs(self.settings.connect_timeout_secs),
            TcpStream::connect(&self.bootstrap_addr),
        )
        .await
        .map_err(|_| "connect timed out".to_string())?
        .map_err(|e| format!("connect failed: {e}"))?;

        let session = self
            .pool
            .add(
                None,
                self.bootstrap_addr.clone(),
                SessionType::Outgoing,
                stream,
            )
            .await
            .map_err(|e| format!("pool rejected session: {e}"))?;
        session.set_state(SessionState::Handshaking);

        let ready_req = WireMessage::Ready {
            addr: self.self_address,
            net_addr: self.self_net.clone(),
        };
        {
            let mut writer = session.writer.lock().await;
            tokio::time::timeout(
                Duration::from_secs(self.settings.write_timeout_secs),
                writer.write_all(codec::encode_frame(&ready_req).as_bytes()),
            )
            .await
            .map_err(|_| "write of READY_REQUEST timed out".to_string())?
            .map_err(|e| format!("write of READY_REQUEST failed: {e}"))?;
        }

        let mut line = String::new();
        {
            let mut reader = session.reader.lock().await;
            loop {
                line.clear();
                let n = tokio::time::timeout(
                    Duration::from_secs(self.settings.read_timeout_secs),
                    reader.read_line(&mut line),
                )
                .await
                .map_err(|_| "read of REQ snapshot timed out".to_string())?
                .map_err(|e| format!("read of REQ snapshot failed: {e}"))?;
                if n == 0 {
                    return Err("connection closed before REQ snapshot".to_string());
                }
                if line.trim_start().starts_with("REQ") {
                    // Multi-line snapshot: keep reading until NONCE| closes it.
                    while !line.contains("NONCE|") {
                        let mut more = String::new();
                        let n = tokio::time::timeout(
                            Duration::from_secs(self.settings.read_timeout_secs),
                            reader.read_line(&mut more),
                        )
                        .await
                        .map_err(|_| "read of REQ snapshot timed out".to_string())?
                        .map_err(|e| format!("read of REQ snapshot failed: {e}"))?;
                        if n == 0 {
                            return Err("connection closed mid-REQ snapshot".to_string());
                        }
                        line.push_str(&more);
                    }
                    break;
                }
                // Ignore any stray frame (e.g. a leftover PING) before REQ.
            }
        }

        let sanitized = codec::sanitize(line.as_bytes());
        let sanitized = String::from_utf8_lossy(&sanitized).to_string();
        let msg = codec::decode_frame(&sanitized).map_err(|e| format!("malformed REQ: {e}"))?;
        let (bootstrap_addr, bootstrap_net, nodes, nonce) = match msg {
            WireMessage::Req {
                self_addr,
                self_net,
                nodes,
                nonce,
            } => (self_addr, self_net, nodes, nonce),
            _ => return Err("expected REQ snapshot as first frame".to_string()),
        };

        self.pool.bind_address(session.id, bootstrap_addr).await;
        session.set_state(SessionState::Ready);
        self.membership
            .add_node(bootstrap_addr, bootstrap_net)
            .await
            .map_err(|e| format!("invalid bootstrap address: {e}"))?;
        for entry in nodes {
            self.membership
                .add_node(entry.address, entry.network_address)
                .await
                .map_err(|e| format!("invalid node entry: {e}"))?;
        }
        // Bootstrap's asserted nonce is authoritative and always overwrites the
        // local advisory value, even if numerically smaller (§4.5, §9).
        self.membership.set_nonce(nonce).await;
        self.ready.store(true, Ordering::Relaxed);
        info!(%bootstrap_addr, nonce, "joined via bootstrap");
        Ok(session)
    }

    async fn steady_state(&self, session: Arc<Session>, shutdown: &mut watch::Receiver<bool>) {
        *self.current_session.lock().await = Some(session.clone());
        let keepalive = tokio::spawn(Self::keepalive_task(
            session.clone(),
            self.settings.keepalive_interval_secs,
            shutdown.clone(),
        ));
        let node_ok = tokio::spawn(Self::node_ok_task(
            session.clone(),
            self.membership.clone(),
            self.settings.node_ok_interval_secs,
            shutdown.clone(),
        ));
        let who_is = tokio::spawn(Self::who_is_task(
            session.clone(),
            self.membership.clone(),
            self.settings.node_ok_interval_secs,
            shutdown.clone(),
        ));

        self.read_loop(&session, shutdown).await;

        keepalive.abort();
        node_ok.abort();
        who_is.abort();
        *self.current_session.lock().await = None;
        if let Some(addr) = *session.peer_address.lock().unwrap() {
            self.membership.mark_disconnected(addr).await;
        }
        self.pool.remove(session.id).await;
    }

    async fn keepalive_task(session: Arc<Session>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let mut writer = session.writer.lock().await;
                    if writer.write_all(codec::encode_frame(&WireMessage::KeepAlive).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn node_ok_task(
        session: Arc<Session>,
        membership: Arc<MembershipStore>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let count = membership.node_count().await as u32;
                    let nonce = membership.get_nonce().await;
                    let msg = WireMessage::NodeOk { count, nonce };
                    let mut writer = session.writer.lock().await;
                    if writer.write_all(codec::encode_frame(&msg).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Periodically scan for nodes with an unresolved network address and
    /// issue `WHO_IS` for each (§4.5).
    async fn who_is_task(
        session: Arc<Session>,
        membership: Arc<MembershipStore>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let unresolved: Vec<Address> = membership
                        .get_nodes()
                        .await
                        .into_iter()
                        .filter(|r| r.network_address.is_empty())
                        .map(|r| r.address)
                        .collect();
                    for addr in unresolved {
                        let msg = WireMessage::WhoIs(addr);
                        let mut writer = session.writer.lock().await;
                        if writer.write_all(codec::encode_frame(&msg).as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn read_loop(&self, session: &Arc<Session>, shutdown: &mut watch::Receiver<bool>) {
        loop {
            let mut line = String::new();
            let read_result = {
                let mut reader = session.reader.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => return,
                    r = tokio::time::timeout(
                        Duration::from_secs(self.settings.read_timeout_secs * 3),
                        reader.read_line(&mut line),
                    ) => r,
                }
            };
            match read_result {
                Ok(Ok(n)) if n > 0 => {}
                _ => return,
            }

            let sanitized = codec::sanitize(line.as_bytes());
            let sanitized = String::from_utf8_lossy(&sanitized).to_string();
            let msg = match codec::decode_frame(&sanitized) {
                Ok(m) => m,
                Err(e) => {
                    warn!(err = ?e, "dropping malformed frame from bootstrap");
                    // The bootstrap is a trusted, statically-configured peer,
                    // but a corrupted link still shouldn't retry forever
                    // without being noticed (§7).
                    let _ = self.pool.record_violation(self.bootstrap_addr.as_bytes());
                    continue;
                }
            };
            self.pool.record_good(self.bootstrap_addr.as_bytes());

            match msg {
                WireMessage::Nodes { entries } => {
                    for e in entries {
                        let _ = self.membership.add_node(e.address, e.network_address).await;
                    }
                }
                WireMessage::NodesCount(_) => {}
                WireMessage::ConsensusStatus {
                    status,
                    voters,
                    nodes,
                    nonce,
                } => {
                    self.membership.set_status(status).await;
                    self.membership.set_nonce(nonce).await;
                    for v in voters {
                        let _ = self.membership.add_voter(v).await;
                    }
                    for n in nodes {
                        let _ = self
                            .membership
                            .add_node(n, NetworkAddress::empty())
                            .await;
                    }
                }
                WireMessage::BroadcastNonce { nonce, .. } => {
                    self.membership.set_nonce(nonce).await;
                }
                WireMessage::WhoIsResponse { addr, net_addr } => {
                    if !net_addr.is_empty() {
                        let _ = self.membership.add_node(addr, net_addr).await;
                    }
                }
                WireMessage::Block(json) => {
                    let _ = self.block_tx.send(json).await;
                }
                WireMessage::Ping | WireMessage::KeepAlive => {}
                _ => {
                    warn!("unexpected message type from bootstrap; ignoring");
                    let _ = self.pool.record_violation(self.bootstrap_addr.as_bytes());
                }
            }
        }
    }
}
