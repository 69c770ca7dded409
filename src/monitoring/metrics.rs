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

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container, covering the bootstrap mesh, election engine, block
/// pipeline, and gossip transport.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Connected gossip peers gauge.
    pub p2p_peers: IntGauge,
    /// Dropped replay messages.
    pub p2p_replay_dropped_total: IntCounter,
    /// Invalid decoded messages.
    pub p2p_invalid_msg_total: IntCounter,

    /// Known node count (C3).
    pub membership_nodes: IntGauge,
    /// Known voter count (C3).
    pub membership_voters: IntGauge,
    /// Current membership epoch (C3).
    pub membership_nonce: IntGauge,
    /// Live sessions in the connection pool (C2).
    pub pool_sessions: IntGauge,

    /// Current election term (C6).
    pub election_term: IntGauge,
    /// Current role: 0=follower, 1=candidate, 2=leader (C6).
    pub election_role: IntGauge,

    /// Blocks received by the pipeline (C7).
    pub chain_received_total: IntCounter,
    /// Blocks admitted by the pipeline (C7).
    pub chain_processed_total: IntCounter,
    /// Blocks rejected, labeled by reason (C7).
    pub chain_rejected_total: IntCounterVec,
    /// Blocks broadcast, labeled by target (C7).
    pub chain_broadcast_total: IntCounterVec,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let p2p_peers =
            IntGauge::new("meshcore_p2p_peers", "Connected gossip peers").map_err(|_| MetricsError::Prom)?;
        let p2p_replay_dropped_total = IntCounter::new(
            "meshcore_p2p_replay_dropped_total",
            "Gossip messages dropped as replays",
        )
        .map_err(|_| MetricsError::Prom)?;
        let p2p_invalid_msg_total = IntCounter::new(
            "meshcore_p2p_invalid_msg_total",
            "Gossip messages dropped as invalid",
        )
        .map_err(|_| MetricsError::Prom)?;

        let membership_nodes =
            IntGauge::new("meshcore_membership_nodes", "Known node count").map_err(|_| MetricsError::Prom)?;
        let membership_voters =
            IntGauge::new("meshcore_membership_voters", "Known voter count").map_err(|_| MetricsError::Prom)?;
        let membership_nonce =
            IntGauge::new("meshcore_membership_nonce", "Current membership epoch").map_err(|_| MetricsError::Prom)?;
        let pool_sessions =
            IntGauge::new("meshcore_pool_sessions", "Live connection pool sessions").map_err(|_| MetricsError::Prom)?;

        let election_term =
            IntGauge::new("meshcore_election_term", "Current election term").map_err(|_| MetricsError::Prom)?;
        let election_role = IntGauge::new(
            "meshcore_election_role",
            "Current role (0=follower, 1=candidate, 2=leader)",
        )
        .map_err(|_| MetricsError::Prom)?;

        let chain_received_total = IntCounter::new("meshcore_chain_received_total", "Blocks received")
            .map_err(|_| MetricsError::Prom)?;
        let chain_processed_total = IntCounter::new("meshcore_chain_processed_total", "Blocks admitted")
            .map_err(|_| MetricsError::Prom)?;
        let chain_rejected_total = IntCounterVec::new(
            Opts::new("meshcore_chain_rejected_total", "Blocks rejected, by reason"),
            &["reason"],
        )
        .map_err(|_| MetricsError::Prom)?;
        let chain_broadcast_total = IntCounterVec::new(
            Opts::new("meshcore_chain_broadcast_total", "Blocks broadcast, by target"),
            &["target"],
        )
        .map_err(|_| MetricsError::Prom)?;

        registry.register(Box::new(p2p_peers.clone())).map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(p2p_replay_dropped_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(p2p_invalid_msg_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(membership_nodes.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(membership_voters.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(membership_nonce.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(pool_sessions.clone()))
            .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(election_term.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(election_role.clone()))
            .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(chain_received_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(chain_processed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(chain_rejected_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(chain_broadcast_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            p2p_peers,
            p2p_replay_dropped_total,
            p2p_invalid_msg_total,
            membership_nodes,
            membership_voters,
            membership_nonce,
            pool_sessions,
            election_term,
            election_role,
            chain_received_total,
            chain_processed_total,
            chain_rejected_total,
            chain_broadcast_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_registers_without_panicking() {
        let m = Metrics::new().unwrap();
        m.chain_rejected_total.with_label_values(&["duplicate"]).inc();
        m.chain_broadcast_total.with_label_values(&["gossip"]).inc();
        assert_eq!(
            m.chain_rejected_total.with_label_values(&["duplicate"]).get(),
            1
        );
    }
}
