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

//! meshcore - a p2p bootstrap mesh and leader-election core for embedding in
//! a blockchain node.
//!
//! This crate provides:
//! - A line-oriented bootstrap/membership protocol (C1-C5): wire codec,
//!   connection pool, membership store, and the bootstrap coordinator/client
//!   pair that admits and fans out joiners.
//! - A Raft-like leader election engine (C6) driven over the same membership
//!   view.
//! - A generic block ingestion pipeline (C7) decoupled from any concrete
//!   chain type via the `ChainFacade`/`BlockProducer` traits.
//! - An encrypted gossip/pubsub transport (C8, libp2p Noise + Yamux +
//!   gossipsub) for block/tx/consensus fan-out.
//! - Monitoring via Prometheus metrics and structured logging.

/// Bootstrap mesh: coordinator (C4) and client (C5).
pub mod bootstrap;
/// Generic block ingestion pipeline (C7).
pub mod chain;
/// Core protocol primitives: wire codec, connection pool, membership store,
/// canonical types.
pub mod core;
/// Raft-like leader election engine (C6).
pub mod election;
/// Gossip/pubsub transport (C8).
pub mod gossip;
/// Observability (metrics, structured logging helpers).
pub mod monitoring;
/// Networking support: persistent libp2p identity, peer reputation.
pub mod networking;
