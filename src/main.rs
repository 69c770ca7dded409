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

//! meshcore node entrypoint (systemd-friendly).
//!
//! Loads a `NodeConfig` from TOML, wires the bootstrap mesh, the election
//! engine, the gossip transport, and a minimal demonstration chain, then
//! keeps the process alive until `SIGINT`/`SIGTERM`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{info, warn};

use meshcore::bootstrap::{client::BootstrapClient, coordinator::BootstrapCoordinator};
use meshcore::chain::{Block, BlockPipeline, ChainError, ChainFacade};
use meshcore::core::membership::MembershipStore;
use meshcore::core::pool::ConnectionPool;
use meshcore::core::types::{now_ms, Address, Hash32, NetworkAddress, NodeConfig};
use meshcore::election::{ElectionEngine, ElectionEvent, ElectionMessage, Role};
use meshcore::gossip::{spawn_gossip, GossipConfig, GossipTopic, PermissiveValidation};
use meshcore::monitoring::metrics::Metrics;

/// Minimal demonstration block so the binary is runnable standalone; real
/// deployments supply their own `Block`/`ChainFacade` implementation and
/// drive `BlockPipeline` directly instead of linking this module.
mod demo {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DemoBlock {
        pub hash_hex: String,
        pub prev_hash_hex: String,
        pub height: u64,
        pub difficulty: u64,
        pub chain_id: u64,
    }

    fn hash_from_hex(s: &str) -> Hash32 {
        let mut out = [0u8; 32];
        if let Ok(bytes) = hex::decode(s) {
            if bytes.len() == 32 {
                out.copy_from_slice(&bytes);
            }
        }
        Hash32(out)
    }

    impl Block for DemoBlock {
        fn hash(&self) -> Hash32 {
            hash_from_hex(&self.hash_hex)
        }
        fn prev_hash(&self) -> Hash32 {
            hash_from_hex(&self.prev_hash_hex)
        }
        fn height(&self) -> u64 {
            self.height
        }
        fn difficulty(&self) -> u64 {
            self.difficulty
        }
        fn chain_id(&self) -> u64 {
            self.chain_id
        }
        fn to_json(&self) -> String {
            serde_json::to_string(self).unwrap_or_default()
        }
    }

    pub struct DemoFacade {
        tip: AsyncMutex<Option<DemoBlock>>,
        chain_id: u64,
    }

    impl DemoFacade {
        pub fn new(chain_id: u64) -> Self {
            Self {
                tip: AsyncMutex::new(None),
                chain_id,
            }
        }
    }

    #[async_trait]
    impl ChainFacade<DemoBlock> for DemoFacade {
        async fn get_latest(&self) -> Option<DemoBlock> {
            self.tip.lock().await.clone()
        }
        async fn add(&self, block: DemoBlock) -> Result<(), ChainError> {
            *self.tip.lock().await = Some(block);
            Ok(())
        }
        fn compute_hash(&self, block: &DemoBlock) -> Hash32 {
            let mut data = Vec::new();
            data.extend_from_slice(block.prev_hash_hex.as_bytes());
            data.extend_from_slice(&block.height.to_be_bytes());
            data.extend_from_slice(&block.chain_id.to_be_bytes());
            Hash32::digest(&data)
        }
        async fn validate_block(&self, block: &DemoBlock) -> Result<(), ChainError> {
            if block.chain_id != self.chain_id {
                return Err(ChainError::InvalidStructure);
            }
            Ok(())
        }
        async fn chain_work(&self, block: &DemoBlock) -> u64 {
            block.height.saturating_mul(block.difficulty.max(1))
        }
    }
}

fn load_config() -> Result<NodeConfig> {
    let path = std::env::var("MESH_CONFIG").unwrap_or_else(|_| "./meshcore.toml".to_string());
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config from {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing config from {path}"))
}

fn init_tracing() {
    let filter = std::env::var("MESH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = load_config()?;
    let self_address =
        Address::from_hex(&cfg.node.address_hex).context("node.address_hex must be valid")?;
    let self_net =
        NetworkAddress::parse(&cfg.node.listen_addr).context("node.listen_addr must be host:port")?;

    info!(node = %cfg.node.name, %self_address, %self_net, "meshcore node starting");

    let metrics = Arc::new(Metrics::new().context("metrics init")?);
    let membership = Arc::new(MembershipStore::new(self_address));
    let pool = Arc::new(ConnectionPool::new(
        cfg.bootstrap.max_connections,
        cfg.bootstrap.peer_inactive_timeout_secs * 1_000,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let (block_tx, mut block_rx) = mpsc::channel::<String>(256);

    let mut direct_coordinator: Option<Arc<BootstrapCoordinator>> = None;
    let mut direct_client: Option<Arc<BootstrapClient>> = None;

    let is_bootstrap = cfg.bootstrap.bootstrap_addr == cfg.node.listen_addr;
    if is_bootstrap {
        let listener = TcpListener::bind(&cfg.node.listen_addr)
            .await
            .with_context(|| format!("binding bootstrap listener on {}", cfg.node.listen_addr))?;
        let coordinator = Arc::new(BootstrapCoordinator::new(
            self_address,
            self_net.clone(),
            membership.clone(),
            pool.clone(),
            cfg.bootstrap.clone(),
            block_tx.clone(),
        ));
        tokio::spawn(coordinator.clone().run(listener, shutdown_rx.clone()));
        let broadcast_coordinator = coordinator.clone();
        let mut broadcast_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = broadcast_shutdown.changed() => if *broadcast_shutdown.borrow() { return },
                    _ = ticker.tick() => broadcast_coordinator.broadcast_snapshot().await,
                }
            }
        });
        direct_coordinator = Some(coordinator);
        info!("running as bootstrap coordinator");
    } else {
        let client = Arc::new(BootstrapClient::new(
            self_address,
            self_net.clone(),
            membership.clone(),
            pool.clone(),
            cfg.bootstrap.clone(),
            block_tx.clone(),
        ));
        tokio::spawn(client.clone().run(shutdown_rx.clone()));
        direct_client = Some(client);
        info!(bootstrap = %cfg.bootstrap.bootstrap_addr, "running as bootstrap client");
    }

    {
        let pool = pool.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => pool.cleanup().await,
                }
            }
        });
    }

    let gossip_cfg = GossipConfig {
        listen_addr: cfg.gossip.listen_addr.clone(),
        bootstrap_peers: cfg.gossip.bootstrap_peers.clone(),
        topic_prefix: cfg.gossip.topic_prefix.clone(),
        max_message_age: Duration::from_secs(cfg.gossip.max_message_age_secs),
        flood_publish: cfg.gossip.flood_publish,
        data_dir: cfg.node.data_dir.clone(),
        self_address,
    };
    let (mut gossip_node, gossip_handle) =
        spawn_gossip(gossip_cfg, metrics.clone(), Arc::new(PermissiveValidation))
            .context("gossip transport init")?;
    let gossip_outbound = gossip_node.outbound();

    let (election_out_tx, mut election_out_rx) = mpsc::channel::<ElectionMessage>(256);
    let (election_evt_tx, mut election_evt_rx) = mpsc::channel::<ElectionEvent>(64);
    let engine = Arc::new(ElectionEngine::new(
        self_address,
        cfg.election.clone(),
        membership.clone(),
        election_out_tx,
        election_evt_tx,
    ));

    {
        let engine = engine.clone();
        let mut shutdown = shutdown_rx.clone();
        let tick_ms = cfg.election.tick_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => engine.tick().await,
                }
            }
        });
    }
    {
        let gossip_outbound = gossip_outbound.clone();
        tokio::spawn(async move {
            while let Some(msg) = election_out_rx.recv().await {
                if let Ok(bytes) = meshcore::core::types::encode_canonical(&msg) {
                    let _ = gossip_outbound.send((GossipTopic::Consensus, bytes)).await;
                }
            }
        });
    }
    tokio::spawn(async move {
        while let Some(evt) = election_evt_rx.recv().await {
            info!(?evt, "election event");
        }
    });

    let facade = Arc::new(demo::DemoFacade::new(1));
    let pipeline = Arc::new(BlockPipeline::new(facade.clone()));

    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            while let Some(json) = block_rx.recv().await {
                match serde_json::from_str::<demo::DemoBlock>(&json) {
                    Ok(block) => {
                        if let Err(e) = pipeline.ingest(block).await {
                            warn!(?e, "direct-session block rejected");
                        }
                    }
                    Err(e) => warn!(?e, "malformed direct-session block payload"),
                }
            }
        });
    }

    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            loop {
                match gossip_node.inbound().recv().await {
                    Some(envelope) => match envelope.topic {
                        GossipTopic::Blocks => {
                            if let Ok(block) =
                                serde_json::from_slice::<demo::DemoBlock>(&envelope.payload)
                            {
                                if let Err(e) = pipeline.ingest(block).await {
                                    warn!(?e, "gossip block rejected");
                                }
                            }
                        }
                        GossipTopic::Consensus => {
                            if let Ok(msg) = meshcore::core::types::decode_canonical_limited::<
                                ElectionMessage,
                            >(&envelope.payload, 65_536)
                            {
                                engine.handle_message(msg).await;
                            }
                        }
                        GossipTopic::Txs => {}
                    },
                    None => return,
                }
            }
        });
    }

    {
        let pipeline = pipeline.clone();
        let gossip_outbound = gossip_outbound.clone();
        let direct_coordinator = direct_coordinator.clone();
        let direct_client = direct_client.clone();
        let poll_secs = cfg.bootstrap.block_poll_interval_secs;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => {
                        if let Some(block) = pipeline.poll_outbound().await {
                            let json = block.to_json();
                            // Both dissemination paths are best-effort and
                            // independent (§1/§2/§4.7): gossip for nodes this
                            // one isn't directly sessioned with, the direct
                            // session(s) for immediate fan-out.
                            let _ = gossip_outbound
                                .send((GossipTopic::Blocks, json.clone().into_bytes()))
                                .await;
                            if let Some(coordinator) = &direct_coordinator {
                                coordinator.broadcast_block(json.clone()).await;
                            }
                            if let Some(client) = &direct_client {
                                let _ = client.broadcast_block(json).await;
                            }
                        }
                    }
                }
            }
        });
    }

    {
        let membership = membership.clone();
        let pool = pool.clone();
        let engine = engine.clone();
        let metrics = metrics.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => {
                        let info = membership.get_info().await;
                        metrics.membership_nodes.set(info.nodes as i64);
                        metrics.membership_voters.set(info.voters as i64);
                        metrics.membership_nonce.set(info.nonce as i64);
                        metrics.pool_sessions.set(pool.len().await as i64);
                        metrics.election_term.set(engine.current_term().await);
                        metrics.election_role.set(match engine.role().await {
                            Role::Follower => 0,
                            Role::Candidate => 1,
                            Role::Leader => 2,
                        });
                    }
                }
            }
        });
    }

    info!(uptime = now_ms(), "meshcore node running");
    let _ = gossip_handle.await;
    Ok(())
}
