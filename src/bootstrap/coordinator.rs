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

//! Bootstrap Coordinator (C4): runs only on the node whose listening port
//! equals the configured bootstrap port. Admits joiners, maintains the
//! fan-out, and broadcasts snapshots (§4.4).

use crate::core::codec::{self, NodeEntry, WireMessage};
use crate::core::membership::MembershipStore;
use crate::core::pool::{ConnectionPool, SessionState, SessionType};
use crate::core::types::{Address, BootstrapSettings, NetworkAddress};
use crate::networking::peer_score::Decision;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Coordinates joiner admission and fan-out broadcast.
pub struct BootstrapCoordinator {
    self_address: Address,
    self_net: NetworkAddress,
    membership: Arc<MembershipStore>,
    pool: Arc<ConnectionPool>,
    settings: BootstrapSettings,
    /// Raw `BLOCK` JSON payloads are handed off here; the embedder's concrete
    /// `BlockPipeline<B>` consumes them (the core holds no concrete block
    /// type, §9 cyclic-reference cut).
    block_tx: mpsc::Sender<String>,
}

impl BootstrapCoordinator {
    /// Construct a new coordinator.
    pub fn new(
        self_address: Address,
        self_net: NetworkAddress,
        membership: Arc<MembershipStore>,
        pool: Arc<ConnectionPool>,
        settings: BootstrapSettings,
        block_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            self_address,
            self_net,
            membership,
            pool,
            settings,
            block_tx,
        }
    }

    /// Accept loop: spawns one handler task per incoming connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("bootstrap coordinator shutting down");
                        return;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let this = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                this.handle_session(stream, peer.to_string(), shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(err = ?e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn write_frame(&self, writer: &mut (impl tokio::io::AsyncWrite + Unpin), bytes: &[u8], secs: u64) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(secs), writer.write_all(bytes)).await,
            Ok(Ok(()))
        )
    }

    async fn handle_session(
        self: Arc<Self>,
        stream: TcpStream,
        peer_label: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.pool.is_banned(peer_label.as_bytes()) {
            warn!(peer = %peer_label, "refusing connection from banned remote");
            return;
        }

        // The handshake read and the steady-state read loop must share one
        // persistent `BufReader` (the one the pool hands back on `add`), or
        // any bytes the joiner pipelines right after READY_REQUEST in the
        // same TCP segment are buffered into a throwaway reader and lost.
        let session = match self
            .pool
            .add(None, peer_label.clone(), SessionType::Incoming, stream)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %peer_label, err = ?e, "pool full; closing session");
                return;
            }
        };
        session.set_state(SessionState::Handshaking);

        let mut line = String::new();
        {
            let mut reader = session.reader.lock().await;
            let read = tokio::time::timeout(
                Duration::from_secs(self.settings.read_timeout_secs),
                reader.read_line(&mut line),
            )
            .await;
            match read {
                Ok(Ok(n)) if n > 0 => {}
                _ => {
                    warn!(peer = %peer_label, "no READY_REQUEST within read deadline");
                    self.pool.remove(session.id).await;
                    return;
                }
            }
        }

        let sanitized = codec::sanitize(line.as_bytes());
        let sanitized = String::from_utf8_lossy(&sanitized).to_string();
        let msg = match codec::decode_frame(&sanitized) {
            Ok(m) => m,
            Err(e) => {
                self.pool.record_violation(peer_label.as_bytes());
                warn!(peer = %peer_label, err = ?e, "malformed join; closing session");
                self.pool.remove(session.id).await;
                return;
            }
        };
        let (addr, net_addr) = match msg {
            WireMessage::Ready { addr, net_addr } => (addr, net_addr),
            _ => {
                warn!(peer = %peer_label, "expected READY_REQUEST; closing session");
                self.pool.remove(session.id).await;
                return;
            }
        };
        if addr.is_zero() {
            warn!(peer = %peer_label, "zero address in READY_REQUEST; closing session");
            self.pool.remove(session.id).await;
            return;
        }

        // The pre-admission ban check above is keyed by `ip:port`, the only
        // identity available before a handshake; now that the protocol
        // `Address` is known, fold any reputation accrued under the ephemeral
        // `ip:port` onto it and re-check by `Address`, which is what
        // survives a reconnect from a different port (§14).
        self.pool.migrate_reputation(peer_label.as_bytes(), &addr.0);
        if self.pool.is_banned(&addr.0) {
            warn!(peer = %peer_label, %addr, "refusing join from banned address");
            self.pool.remove(session.id).await;
            return;
        }

        // Atomic admit under C3's single-writer lock, then a self-consistent
        // snapshot taken before the lock is released.
        let nonce = match self.membership.admit(addr, net_addr.clone()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %peer_label, err = ?e, "admit failed; closing session");
                self.pool.remove(session.id).await;
                return;
            }
        };
        let nodes = self.membership.get_nodes().await;
        self.pool.bind_address(session.id, addr).await;
        session.set_state(SessionState::Ready);

        info!(%addr, %net_addr, nonce, "joiner admitted");

        let entries: Vec<NodeEntry> = nodes
            .iter()
            .map(|r| NodeEntry {
                address: r.address,
                network_address: r.network_address.clone(),
            })
            .collect();
        let req = WireMessage::Req {
            self_addr: self.self_address,
            self_net: self.self_net.clone(),
            nodes: entries,
            nonce,
        };
        {
            let mut writer = session.writer.lock().await;
            if !self
                .write_frame(
                    &mut *writer,
                    codec::encode_frame(&req).as_bytes(),
                    self.settings.write_timeout_secs,
                )
                .await
            {
                warn!(%addr, "failed to send initial REQ snapshot");
            }
        }

        self.broadcast_snapshot().await;

        self.read_loop(session.id, addr, &mut shutdown).await;

        self.membership.mark_disconnected(addr).await;
        self.pool.remove(session.id).await;
        info!(%addr, "joiner session closed");
    }

    async fn read_loop(
        &self,
        session_id: crate::core::pool::SessionId,
        addr: Address,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            let Some(session) = self.pool.get(session_id).await else {
                return;
            };
            let mut line = String::new();
            let read_result = {
                let mut reader = session.reader.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => return,
                    r = tokio::time::timeout(
                        Duration::from_secs(self.settings.read_timeout_secs),
                        reader.read_line(&mut line),
                    ) => r,
                }
            };
            match read_result {
                Ok(Ok(0)) | Err(_) => return,
                Ok(Err(_)) => return,
                Ok(Ok(_)) => {}
            }

            let sanitized = codec::sanitize(line.as_bytes());
            let sanitized = String::from_utf8_lossy(&sanitized).to_string();
            let msg = match codec::decode_frame(&sanitized) {
                Ok(m) => m,
                Err(e) => {
                    warn!(%addr, err = ?e, "dropping malformed frame from joiner");
                    if self.pool.record_violation(&addr.0) == Decision::Ban {
                        warn!(%addr, "closing session after repeated protocol violations");
                        return;
                    }
                    continue;
                }
            };
            self.pool.record_good(&addr.0);
            self.membership.update_last_seen(addr).await;

            match msg {
                WireMessage::WhoIs(who) => {
                    if let Some(record) = self.membership.get_node(who).await {
                        if !record.network_address.is_empty() {
                            let resp = WireMessage::WhoIsResponse {
                                addr: who,
                                net_addr: record.network_address,
                            };
                            let mut writer = session.writer.lock().await;
                            let _ = self
                                .write_frame(
                                    &mut *writer,
                                    codec::encode_frame(&resp).as_bytes(),
                                    self.settings.write_timeout_secs,
                                )
                                .await;
                        }
                    }
                }
                WireMessage::NodeOk { count, nonce } => {
                    let authoritative = self.membership.get_nonce().await;
                    if nonce != authoritative {
                        warn!(%addr, reported = nonce, authoritative, count, "NODE_OK nonce divergence");
                    }
                }
                WireMessage::Block(json) => {
                    let _ = self.block_tx.send(json).await;
                }
                WireMessage::Ping | WireMessage::KeepAlive => {}
                _ => {
                    warn!(%addr, "unexpected message type from joiner; ignoring");
                    if self.pool.record_violation(&addr.0) == Decision::Ban {
                        warn!(%addr, "closing session after repeated protocol violations");
                        return;
                    }
                }
            }
        }
    }

    /// Broadcast `CONSENSUS_STATUS` and `NODES`/`NODES_COUNT` to every live
    /// session. Per-session write failures are logged and trigger that
    /// session's removal (§4.4).
    pub async fn broadcast_snapshot(&self) {
        let info = self.membership.get_info().await;
        let voters = self.membership.get_voters().await;
        let nodes_records = self.membership.get_nodes().await;
        let node_addrs: Vec<Address> = nodes_records.iter().map(|r| r.address).collect();
        let entries: Vec<NodeEntry> = nodes_records
            .iter()
            .map(|r| NodeEntry {
                address: r.address,
                network_address: r.network_address.clone(),
            })
            .collect();

        let status_msg = WireMessage::ConsensusStatus {
            status: info.status,
            voters,
            nodes: node_addrs,
            nonce: info.nonce,
        };
        let nodes_msg = WireMessage::Nodes {
            entries: entries.clone(),
        };
        let count_msg = WireMessage::NodesCount(entries.len() as u32);

        let status_bytes = codec::encode_frame(&status_msg);
        let nodes_bytes = codec::encode_frame(&nodes_msg);
        let count_bytes = codec::encode_frame(&count_msg);

        let sessions = self.pool.snapshot().await;
        for session in sessions {
            let mut writer = session.writer.lock().await;
            let ok = self.write_frame(&mut *writer, status_bytes.as_bytes(), 5).await
                && self.write_frame(&mut *writer, nodes_bytes.as_bytes(), 5).await
                && self.write_frame(&mut *writer, count_bytes.as_bytes(), 5).await;
            drop(writer);
            if !ok {
                warn!(session = session.id, "broadcast write failed; closing session");
                if let Some(addr) = *session.peer_address.lock().unwrap() {
                    self.membership.mark_disconnected(addr).await;
                }
                self.pool.mark_closed(session.id).await;
            }
        }
    }

    /// Emit `BLOCK|<json>` on every connected session, the direct-dissemination
    /// counterpart to the gossip publish `main.rs` does for the same block
    /// (§1/§2/§4.7). Per-session write failures are handled the same way as
    /// [`Self::broadcast_snapshot`].
    pub async fn broadcast_block(&self, json: String) {
        let bytes = codec::encode_frame(&WireMessage::Block(json));
        let sessions = self.pool.snapshot().await;
        for session in sessions {
            let mut writer = session.writer.lock().await;
            let ok = self
                .write_frame(&mut *writer, bytes.as_bytes(), self.settings.write_timeout_secs)
                .await;
            drop(writer);
            if !ok {
                warn!(session = session.id, "block broadcast write failed; closing session");
                if let Some(addr) = *session.peer_address.lock().unwrap() {
                    self.membership.mark_disconnected(addr).await;
                }
                self.pool.mark_closed(session.id).await;
            }
        }
    }
}
