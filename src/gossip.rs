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

//! Gossip / PubSub (C8): topic-based broadcast over libp2p gossipsub, with
//! content-addressed message-id dedup and an age filter on top of the
//! transport's own delivery.

use crate::core::types::{now_ms, Address, Hash32};
use crate::monitoring::metrics::Metrics;
use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use libp2p::{
    core::upgrade,
    gossipsub::{self, IdentTopic, MessageAuthenticity},
    identify, noise, ping,
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, Transport,
};

use libp2p::futures::StreamExt;
use libp2p::swarm::Config as SwarmConfig;

/// The three broadcast topics (§4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GossipTopic {
    /// Newly produced/received blocks.
    Blocks,
    /// Transactions (out of scope for validation logic; carried opaquely).
    Txs,
    /// Election traffic (`ElectionMessage`, bincode-encoded).
    Consensus,
}

impl GossipTopic {
    fn suffix(self) -> &'static str {
        match self {
            GossipTopic::Blocks => "blocks",
            GossipTopic::Txs => "txs",
            GossipTopic::Consensus => "consensus",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(GossipTopic::Blocks),
            "txs" => Some(GossipTopic::Txs),
            "consensus" => Some(GossipTopic::Consensus),
            _ => None,
        }
    }
}

/// Envelope wrapping every published payload (§4.8).
#[derive(Clone, Debug)]
pub struct GossipEnvelope {
    /// Topic this envelope was published on.
    pub topic: GossipTopic,
    /// Publish time, nanoseconds since epoch.
    pub timestamp_ns: u64,
    /// Publisher's address.
    pub from: Address,
    /// Opaque payload (block JSON, tx bytes, or bincode-encoded election message).
    pub payload: Vec<u8>,
}

impl GossipEnvelope {
    fn message_id(&self) -> Hash32 {
        Hash32::digest(&self.payload)
    }

    /// Serialize to the bytes published on the wire: `timestamp_ns (8B BE) ||
    /// from (20B) || payload`. The topic itself is carried out-of-band by the
    /// gossipsub topic the bytes were published/received on.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 36);
        buf.extend_from_slice(&self.timestamp_ns.to_be_bytes());
        buf.extend_from_slice(&self.from.0);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode bytes received on `topic`. `None` on any malformed input;
    /// never panics.
    pub fn decode(topic: GossipTopic, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 28 {
            return None;
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[0..8]);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&bytes[8..28]);
        Some(Self {
            topic,
            timestamp_ns: u64::from_be_bytes(ts),
            from: Address::from_bytes(addr),
            payload: bytes[28..].to_vec(),
        })
    }
}

/// Validation hooks supplied by the embedder; invalid messages are dropped
/// without the callback being invoked again (they simply never reach the
/// inbound channel).
pub trait ValidationHooks: Send + Sync {
    /// Validate a candidate block payload before delivery.
    fn validate_block(&self, payload: &[u8]) -> bool;
    /// Validate a candidate transaction payload before delivery.
    fn validate_tx(&self, payload: &[u8]) -> bool;
}

/// Accepts everything; used when the embedder has no validation concerns
/// beyond what the block pipeline itself performs downstream.
pub struct PermissiveValidation;

impl ValidationHooks for PermissiveValidation {
    fn validate_block(&self, _payload: &[u8]) -> bool {
        true
    }
    fn validate_tx(&self, _payload: &[u8]) -> bool {
        true
    }
}

/// Gossip configuration (§4.8, SPEC_FULL §12).
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Listen multiaddr, e.g. `/ip4/0.0.0.0/tcp/4001`.
    pub listen_addr: String,
    /// Bootstrap peers to dial at startup (multiaddrs).
    pub bootstrap_peers: Vec<String>,
    /// Topic name prefix.
    pub topic_prefix: String,
    /// Sliding-window age after which a seen message-id is forgotten.
    pub max_message_age: Duration,
    /// Deliver local publishes back to the local subscriber.
    pub flood_publish: bool,
    /// Data directory for the persistent libp2p identity.
    pub data_dir: String,
    /// This node's address, stamped into every envelope.
    pub self_address: Address,
}

/// Gossip errors.
#[derive(Debug, Error)]
pub enum GossipError {
    /// I/O failure (identity persistence, data dir creation).
    #[error("io")]
    Io,
    /// Malformed configuration (bad listen address, bad gossipsub config).
    #[error("config")]
    Config,
}

/// Handle for publishing/consuming gossip traffic.
pub struct GossipNode {
    inbound_rx: mpsc::Receiver<GossipEnvelope>,
    outbound_tx: mpsc::Sender<(GossipTopic, Vec<u8>)>,
}

impl GossipNode {
    /// Inbound, deduplicated, validated envelopes.
    pub fn inbound(&mut self) -> &mut mpsc::Receiver<GossipEnvelope> {
        &mut self.inbound_rx
    }

    /// Publish a payload on a topic.
    pub fn outbound(&self) -> mpsc::Sender<(GossipTopic, Vec<u8>)> {
        self.outbound_tx.clone()
    }
}

/// Sliding-window, content-addressed dedup set (§4.8).
struct Dedup {
    seen: HashMap<Hash32, u64>,
    max_age_ms: u64,
}

impl Dedup {
    fn new(max_age: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            max_age_ms: max_age.as_millis() as u64,
        }
    }

    /// Returns true if this is the first time `id` has been seen within the
    /// window (and records it); false if it is a duplicate or stale.
    fn observe(&mut self, id: Hash32, envelope_ts_ns: u64) -> bool {
        let now = now_ms();
        let envelope_ms = envelope_ts_ns / 1_000_000;
        if now.saturating_sub(envelope_ms) > self.max_age_ms {
            return false;
        }
        self.seen.retain(|_, t| now.saturating_sub(*t) <= self.max_age_ms);
        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id, now);
        true
    }
}

#[derive(Debug)]
enum BehaviourEvent {
    Gossipsub(gossipsub::Event),
    Identify(()),
    Ping(()),
}
impl From<gossipsub::Event> for BehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        Self::Gossipsub(e)
    }
}
impl From<identify::Event> for BehaviourEvent {
    fn from(_e: identify::Event) -> Self {
        Self::Identify(())
    }
}
impl From<ping::Event> for BehaviourEvent {
    fn from(_e: ping::Event) -> Self {
        Self::Ping(())
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

fn ensure_dir(path: &str) -> Result<(), GossipError> {
    let p = Path::new(path);
    if !p.exists() {
        std::fs::create_dir_all(p).map_err(|_| GossipError::Io)?;
    }
    Ok(())
}

/// Spawn the gossip swarm task.
pub fn spawn_gossip(
    cfg: GossipConfig,
    metrics: Arc<Metrics>,
    hooks: Arc<dyn ValidationHooks>,
) -> Result<(GossipNode, tokio::task::JoinHandle<()>), GossipError> {
    ensure_dir(&cfg.data_dir)?;

    let (local_peer_id, id_keys) =
        crate::networking::p2p_identity::load_or_create_identity(&cfg.data_dir)
            .map_err(|_| GossipError::Io)?;

    let (in_tx, in_rx) = mpsc::channel::<GossipEnvelope>(1024);
    let (out_tx, mut out_rx) = mpsc::channel::<(GossipTopic, Vec<u8>)>(1024);

    let listen_addr = cfg.listen_addr.clone();
    let bootstrap = cfg.bootstrap_peers.clone();
    let prefix = cfg.topic_prefix.clone();
    let self_address = cfg.self_address;
    let flood_publish = cfg.flood_publish;
    let max_age = cfg.max_message_age;

    let join = tokio::spawn(async move {
        let noise_keys = match noise::Config::new(&id_keys) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to build noise config");
                return;
            }
        };

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_keys)
            .multiplex(yamux::Config::default())
            .boxed();

        let gcfg = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .unwrap_or_else(|_| gossipsub::Config::default());

        let mut gossipsub = match gossipsub::Behaviour::new(MessageAuthenticity::Signed(id_keys.clone()), gcfg) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to create gossipsub behaviour");
                return;
            }
        };

        let topics: Vec<(GossipTopic, IdentTopic)> = [
            GossipTopic::Blocks,
            GossipTopic::Txs,
            GossipTopic::Consensus,
        ]
        .into_iter()
        .map(|t| (t, IdentTopic::new(format!("{prefix}-{}", t.suffix()))))
        .collect();

        for (_, topic) in &topics {
            if let Err(e) = gossipsub.subscribe(topic) {
                warn!(err = ?e, "failed to subscribe topic");
            }
        }

        let identify = identify::Behaviour::new(identify::Config::new(
            "meshcore/1.0.0".to_string(),
            id_keys.public(),
        ));

        let ping = ping::Behaviour::new(
            ping::Config::new()
                .with_interval(Duration::from_secs(10))
                .with_timeout(Duration::from_secs(20)),
        );

        let behaviour = Behaviour {
            gossipsub,
            identify,
            ping,
        };

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            SwarmConfig::with_tokio_executor(),
        );

        let listen: Multiaddr = match listen_addr.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(addr = %listen_addr, "bad listen_addr");
                return;
            }
        };
        if let Err(e) = swarm.listen_on(listen) {
            warn!(err = ?e, "listen_on failed");
            return;
        }

        for b in bootstrap.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
            match b.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma.clone()) {
                        warn!(boot = %b, err = ?e, "dial bootstrap failed");
                    } else {
                        info!(boot = %b, "dialing gossip bootstrap");
                    }
                }
                Err(_) => warn!(boot = %b, "bad bootstrap addr; skipping"),
            }
        }

        info!(%local_peer_id, "gossip loop started");
        metrics.p2p_peers.set(0);

        let dedup = Mutex::new(Dedup::new(max_age));

        loop {
            tokio::select! {
                maybe_msg = out_rx.recv() => {
                    match maybe_msg {
                        Some((topic_kind, payload)) => {
                            let envelope = GossipEnvelope {
                                topic: topic_kind,
                                timestamp_ns: now_ms() * 1_000_000,
                                from: self_address,
                                payload,
                            };
                            let id = envelope.message_id();
                            if flood_publish {
                                let mut d = dedup.lock().await;
                                d.observe(id, envelope.timestamp_ns);
                                let _ = in_tx.send(envelope.clone()).await;
                            }
                            if let Some((_, topic)) = topics.iter().find(|(t, _)| *t == topic_kind) {
                                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic.clone(), envelope.encode()) {
                                    warn!(err=?e, "gossipsub publish failed");
                                }
                            }
                        }
                        None => {
                            warn!("outbound channel closed; stopping gossip task");
                            break;
                        }
                    }
                }

                ev = swarm.select_next_some() => {
                    match ev {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr=%address, "listening");
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            metrics.p2p_peers.inc();
                            info!(%peer_id, "gossip peer connected");
                        }
                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            metrics.p2p_peers.dec();
                            info!(%peer_id, "gossip peer disconnected");
                        }
                        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                            let topic_str = message.topic.as_str();
                            let suffix = topic_str.rsplit('-').next().unwrap_or("");
                            let Some(topic_kind) = GossipTopic::from_suffix(suffix) else {
                                metrics.p2p_invalid_msg_total.inc();
                                continue;
                            };
                            let Some(envelope) = GossipEnvelope::decode(topic_kind, &message.data) else {
                                metrics.p2p_invalid_msg_total.inc();
                                continue;
                            };

                            let valid = match topic_kind {
                                GossipTopic::Blocks => hooks.validate_block(&envelope.payload),
                                GossipTopic::Txs => hooks.validate_tx(&envelope.payload),
                                GossipTopic::Consensus => true,
                            };
                            if !valid {
                                metrics.p2p_invalid_msg_total.inc();
                                continue;
                            }

                            let id = envelope.message_id();
                            let fresh = dedup.lock().await.observe(id, envelope.timestamp_ns);
                            if !fresh {
                                metrics.p2p_replay_dropped_total.inc();
                                continue;
                            }

                            let _ = in_tx.send(envelope).await;
                        }
                        SwarmEvent::Behaviour(BehaviourEvent::Identify(_)) => {}
                        SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}
                        _ => {}
                    }
                }
            }
        }
    });

    Ok((
        GossipNode {
            inbound_rx: in_rx,
            outbound_tx: out_tx,
        },
        join,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_rejects_replays_within_window() {
        let mut d = Dedup::new(Duration::from_secs(300));
        let id = Hash32::digest(b"payload");
        let ts = now_ms() * 1_000_000;
        assert!(d.observe(id, ts));
        assert!(!d.observe(id, ts));
    }

    #[test]
    fn dedup_drops_stale_envelopes() {
        let mut d = Dedup::new(Duration::from_secs(1));
        let id = Hash32::digest(b"payload");
        let old_ts_ns = (now_ms().saturating_sub(5_000)) * 1_000_000;
        assert!(!d.observe(id, old_ts_ns));
    }

    #[test]
    fn envelope_roundtrip() {
        let env = GossipEnvelope {
            topic: GossipTopic::Blocks,
            timestamp_ns: 123_000_000,
            from: Address::from_bytes([3u8; 20]),
            payload: vec![1, 2, 3],
        };
        let bytes = env.encode();
        let back = GossipEnvelope::decode(GossipTopic::Blocks, &bytes).unwrap();
        assert_eq!(back.timestamp_ns, env.timestamp_ns);
        assert_eq!(back.from, env.from);
        assert_eq!(back.payload, env.payload);
    }
}
