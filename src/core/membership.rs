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

//! Membership Store (C3): the single authoritative source of `MembershipView`.
//!
//! An explicit value, not a process-wide singleton — callers wire an
//! `Arc<MembershipStore>` through whatever context needs it, so tests can
//! instantiate several independent stores in one process.

use crate::core::types::{now_ms, Address, NetworkAddress};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::RwLock;

/// Membership errors. Rejected at the boundary; never mutate the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// The zero address was used as a member key.
    #[error("zero address")]
    ZeroAddress,
}

/// A single known node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    /// Node address.
    pub address: Address,
    /// Last known `host:port`. Empty if unresolved (triggers WHO_IS).
    pub network_address: NetworkAddress,
    /// Last-seen wall clock, ms since epoch.
    pub last_seen_unix: u64,
    /// Whether a session to this node is currently live.
    pub connected: bool,
}

/// Defensive-copy snapshot of the membership view, returned by `getInfo`.
#[derive(Clone, Debug)]
pub struct MembershipInfo {
    /// Opaque status code (mirrors `ConsensusStatus.status`).
    pub status: i32,
    /// This node's own address.
    pub address: Address,
    /// Voter count.
    pub voters: usize,
    /// Node count.
    pub nodes: usize,
    /// Current epoch.
    pub nonce: u64,
}

struct Inner {
    nodes: BTreeMap<Address, NodeRecord>,
    voters: BTreeSet<Address>,
    nonce: u64,
    status: i32,
}

/// Authoritative membership state, single-writer discipline enforced by
/// holding the entire `Inner` behind one `RwLock`: mutations take the write
/// half, reads take the read half, and every compound mutation (e.g. admit =
/// addNode + addVoter + nonce bump) happens inside one write-guard so it is
/// observed atomically by readers.
pub struct MembershipStore {
    inner: RwLock<Inner>,
    self_address: Address,
}

impl MembershipStore {
    /// Construct a fresh, empty store for `self_address`.
    pub fn new(self_address: Address) -> Self {
        let mut voters = BTreeSet::new();
        voters.insert(self_address);
        Self {
            inner: RwLock::new(Inner {
                nodes: BTreeMap::new(),
                voters,
                nonce: 0,
                status: 0,
            }),
            self_address,
        }
    }

    /// This node's own address.
    pub fn self_address(&self) -> Address {
        self.self_address
    }

    /// Add or update a node record; idempotent.
    pub async fn add_node(
        &self,
        addr: Address,
        net_addr: NetworkAddress,
    ) -> Result<(), MembershipError> {
        if addr.is_zero() {
            return Err(MembershipError::ZeroAddress);
        }
        let mut inner = self.inner.write().await;
        let now = now_ms();
        inner
            .nodes
            .entry(addr)
            .and_modify(|r| {
                if !net_addr.is_empty() {
                    r.network_address = net_addr.clone();
                }
                r.last_seen_unix = now;
                r.connected = true;
            })
            .or_insert(NodeRecord {
                address: addr,
                network_address: net_addr,
                last_seen_unix: now,
                connected: true,
            });
        Ok(())
    }

    /// Mark `addr` eligible to grant votes; idempotent.
    pub async fn add_voter(&self, addr: Address) -> Result<(), MembershipError> {
        if addr.is_zero() {
            return Err(MembershipError::ZeroAddress);
        }
        self.inner.write().await.voters.insert(addr);
        Ok(())
    }

    /// Admit a joiner atomically: register it, grant it a vote, and advance
    /// the epoch, all under one write-guard so the snapshot handed back to
    /// the caller is self-consistent (§4.4).
    pub async fn admit(
        &self,
        addr: Address,
        net_addr: NetworkAddress,
    ) -> Result<u64, MembershipError> {
        if addr.is_zero() {
            return Err(MembershipError::ZeroAddress);
        }
        let mut inner = self.inner.write().await;
        let now = now_ms();
        inner
            .nodes
            .entry(addr)
            .and_modify(|r| {
                r.network_address = net_addr.clone();
                r.last_seen_unix = now;
                r.connected = true;
            })
            .or_insert(NodeRecord {
                address: addr,
                network_address: net_addr,
                last_seen_unix: now,
                connected: true,
            });
        inner.voters.insert(addr);
        inner.nonce += 1;
        Ok(inner.nonce)
    }

    /// Refresh `lastSeenUnix` for a known node; idempotent, no-op if unknown.
    pub async fn update_last_seen(&self, addr: Address) {
        let mut inner = self.inner.write().await;
        if let Some(r) = inner.nodes.get_mut(&addr) {
            r.last_seen_unix = now_ms();
        }
    }

    /// Mark a node's session gone without deleting its record (records are
    /// retained for informational purposes within an epoch, per §3).
    pub async fn mark_disconnected(&self, addr: Address) {
        let mut inner = self.inner.write().await;
        if let Some(r) = inner.nodes.get_mut(&addr) {
            r.connected = false;
        }
    }

    /// Defensive copy of all known nodes.
    pub async fn get_nodes(&self) -> Vec<NodeRecord> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    /// Look up a single node record.
    pub async fn get_node(&self, addr: Address) -> Option<NodeRecord> {
        self.inner.read().await.nodes.get(&addr).cloned()
    }

    /// Defensive copy of the voter set.
    pub async fn get_voters(&self) -> Vec<Address> {
        self.inner.read().await.voters.iter().copied().collect()
    }

    /// Current node count (for election quorum).
    pub async fn node_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    /// Explicitly set the epoch counter. Used when bootstrap's authoritative
    /// value must overwrite a local advisory value, even if smaller (§4.5).
    pub async fn set_nonce(&self, n: u64) {
        self.inner.write().await.nonce = n;
    }

    /// Current epoch value.
    pub async fn get_nonce(&self) -> u64 {
        self.inner.read().await.nonce
    }

    /// Advance the epoch by one and return the new value. Only meaningful on
    /// the bootstrap node; on other nodes this is an advisory hint that will
    /// be overwritten by the next authoritative message (§4.5, §9 open
    /// question on nonce semantics).
    pub async fn get_and_increment(&self) -> u64 {
        let mut inner = self.inner.write().await;
        inner.nonce += 1;
        inner.nonce
    }

    /// Set the opaque status code.
    pub async fn set_status(&self, status: i32) {
        self.inner.write().await.status = status;
    }

    /// Snapshot summary, as returned over the wire by `CONSENSUS_STATUS`.
    pub async fn get_info(&self) -> MembershipInfo {
        let inner = self.inner.read().await;
        MembershipInfo {
            status: inner.status,
            address: self.self_address,
            voters: inner.voters.len(),
            nodes: inner.nodes.len(),
            nonce: inner.nonce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    #[tokio::test]
    async fn admit_is_atomic_and_bumps_nonce() {
        let store = MembershipStore::new(addr(1));
        let net = NetworkAddress::parse("10.0.0.2:31000").unwrap();
        let nonce = store.admit(addr(2), net.clone()).await.unwrap();
        assert_eq!(nonce, 1);
        assert_eq!(store.get_nonce().await, 1);
        let nodes = store.get_nodes().await;
        assert_eq!(nodes.len(), 1);
        let voters = store.get_voters().await;
        assert!(voters.contains(&addr(2)));
    }

    #[tokio::test]
    async fn zero_address_rejected() {
        let store = MembershipStore::new(addr(1));
        let net = NetworkAddress::parse("10.0.0.2:31000").unwrap();
        assert_eq!(
            store.admit(Address::zero(), net).await,
            Err(MembershipError::ZeroAddress)
        );
    }

    #[tokio::test]
    async fn authoritative_nonce_overwrites_advisory() {
        let store = MembershipStore::new(addr(1));
        let _ = store.get_and_increment().await;
        let _ = store.get_and_increment().await;
        assert_eq!(store.get_nonce().await, 2);
        // Bootstrap asserts a smaller value; this models reset/resync (§4.5).
        store.set_nonce(1).await;
        assert_eq!(store.get_nonce().await, 1);
    }

    #[tokio::test]
    async fn add_node_idempotent() {
        let store = MembershipStore::new(addr(1));
        let net = NetworkAddress::parse("10.0.0.2:31000").unwrap();
        store.add_node(addr(2), net.clone()).await.unwrap();
        store.add_node(addr(2), net).await.unwrap();
        assert_eq!(store.get_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn mark_disconnected_retains_record() {
        let store = MembershipStore::new(addr(1));
        let net = NetworkAddress::parse("10.0.0.2:31000").unwrap();
        store.add_node(addr(2), net).await.unwrap();
        store.mark_disconnected(addr(2)).await;
        let rec = store.get_node(addr(2)).await.unwrap();
        assert!(!rec.connected);
    }
}
