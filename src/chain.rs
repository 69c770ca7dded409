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

//! Block Pipeline (C7): outbound production polling and inbound validation,
//! de-duplication, fork handling, and at-most-once admission.
//!
//! Block production, transaction validation, and persistent storage are
//! external collaborators (non-goals, §1); this module only drives the
//! pipeline against the `ChainFacade`/`BlockProducer` traits an embedder
//! supplies.

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::types::Hash32;

/// Opaque block fields the core must inspect. Everything else about the
/// block's representation is up to the embedder.
pub trait Block: Send + Sync + 'static {
    /// Canonical block hash.
    fn hash(&self) -> Hash32;
    /// Hash of the block this one extends.
    fn prev_hash(&self) -> Hash32;
    /// Chain height.
    fn height(&self) -> u64;
    /// Proof-of-work difficulty target.
    fn difficulty(&self) -> u64;
    /// Chain identifier, to reject cross-chain replay.
    fn chain_id(&self) -> u64;
    /// Serialize to the JSON payload carried by `BLOCK` frames / envelopes.
    fn to_json(&self) -> String;
}

/// Chain pipeline errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The JSON payload did not parse into a well-formed block.
    #[error("parse error")]
    ParseError,
    /// Structural validation failed (height/chainId/difficulty).
    #[error("structural validation failed")]
    InvalidStructure,
    /// Recomputed hash did not match the claimed hash.
    #[error("hash mismatch")]
    HashMismatch,
    /// Block hash already admitted or broadcast.
    #[error("duplicate")]
    Duplicate,
    /// Competing chain is not better under the fork rule.
    #[error("fork inferior")]
    ForkInferior,
    /// The external chain façade rejected the block.
    #[error("facade rejected")]
    FacadeRejected,
}

/// External collaborator owning chain state. The core never stores blocks
/// itself; it only reads through this interface (§6, §9 cyclic-reference
/// cut).
#[async_trait]
pub trait ChainFacade<B: Block>: Send + Sync {
    /// The current chain tip, or `None` if the chain is empty.
    async fn get_latest(&self) -> Option<B>;
    /// Append a validated block, attempting reorg if it does not extend the
    /// current tip directly.
    async fn add(&self, block: B) -> Result<(), ChainError>;
    /// Recompute a block's canonical hash (used to validate claimed hashes).
    fn compute_hash(&self, block: &B) -> Hash32;
    /// Deep structural/semantic validation delegated to the embedder.
    async fn validate_block(&self, block: &B) -> Result<(), ChainError>;
    /// Cumulative work of the chain ending at `block`, used for fork
    /// tie-breaking. Left entirely to the façade (§9 open question).
    async fn chain_work(&self, block: &B) -> u64;
}

/// Locally produced blocks, pushed into the outbound broadcast queue.
#[async_trait]
pub trait BlockProducer<B: Block>: Send + Sync {
    /// Poll for the latest locally produced block, if any.
    async fn latest(&self) -> Option<B>;
}

/// Outbound counters (§4.7's abstract metrics).
#[derive(Default, Debug)]
pub struct PipelineCounters {
    /// Total inbound blocks received.
    pub received: u64,
    /// Total blocks admitted.
    pub processed: u64,
    /// Total rejections, by reason string.
    pub rejected: std::collections::HashMap<&'static str, u64>,
    /// Total outbound broadcasts, by target ("gossip" / "direct").
    pub broadcast: std::collections::HashMap<&'static str, u64>,
}

/// Drives C7: holds the de-duplication set and counters, and implements the
/// inbound acceptance algorithm of §4.7.
pub struct BlockPipeline<B: Block> {
    seen: Mutex<HashSet<Hash32>>,
    facade: std::sync::Arc<dyn ChainFacade<B>>,
    counters: Mutex<PipelineCounters>,
    last_sent_hash: Mutex<Option<Hash32>>,
}

impl<B: Block> BlockPipeline<B> {
    /// Construct a new pipeline against the given façade.
    pub fn new(facade: std::sync::Arc<dyn ChainFacade<B>>) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            facade,
            counters: Mutex::new(PipelineCounters::default()),
            last_sent_hash: Mutex::new(None),
        }
    }

    async fn reject(&self, reason: &'static str) {
        let mut c = self.counters.lock().await;
        *c.rejected.entry(reason).or_insert(0) += 1;
    }

    /// Poll the producer; if the tip changed since the last broadcast,
    /// return the block to send (the caller performs the actual send — over
    /// gossip and/or the direct bootstrap session).
    pub async fn poll_outbound(&self) -> Option<B> {
        let latest = self.facade.get_latest().await?;
        let hash = latest.hash();
        let mut last = self.last_sent_hash.lock().await;
        if *last == Some(hash) {
            return None;
        }
        *last = Some(hash);
        let mut c = self.counters.lock().await;
        *c.broadcast.entry("gossip").or_insert(0) += 1;
        Some(latest)
    }

    /// Run the full inbound acceptance algorithm of §4.7 on a received
    /// block. Returns `Ok(())` on acceptance (the block has already been
    /// `propose`d/`add`ed to the façade).
    pub async fn ingest(&self, block: B) -> Result<(), ChainError> {
        {
            let mut c = self.counters.lock().await;
            c.received += 1;
        }

        if block.difficulty() < 1 || block.chain_id() == 0 {
            self.reject("invalid_structure").await;
            return Err(ChainError::InvalidStructure);
        }

        let claimed = block.hash();
        let recomputed = self.facade.compute_hash(&block);
        if claimed != recomputed {
            self.reject("hash_mismatch").await;
            return Err(ChainError::HashMismatch);
        }

        {
            let seen = self.seen.lock().await;
            if seen.contains(&claimed) {
                self.reject("duplicate").await;
                return Err(ChainError::Duplicate);
            }
        }

        let latest = self.facade.get_latest().await;
        match latest {
            None => {
                if block.height() != 0 {
                    self.reject("not_genesis").await;
                    return Err(ChainError::InvalidStructure);
                }
            }
            Some(ref tip) => {
                if block.prev_hash() != tip.hash() {
                    // Fork handling: longer wins; ties broken by cumulative work.
                    let local_height = tip.height();
                    let remote_height = block.height();
                    let local_work = self.facade.chain_work(tip).await;
                    let remote_work = self.facade.chain_work(&block).await;
                    let remote_better = (remote_height, remote_work) > (local_height, local_work);
                    if !remote_better {
                        self.reject("fork_inferior").await;
                        return Err(ChainError::ForkInferior);
                    }
                    if let Err(e) = self.facade.validate_block(&block).await {
                        self.reject("facade_rejected").await;
                        return Err(e);
                    }
                }
            }
        }

        self.seen.lock().await.insert(claimed);
        if let Err(e) = self.facade.add(block).await {
            warn!(?e, "facade rejected block after acceptance checks passed");
            self.reject("facade_rejected").await;
            return Err(e);
        }

        let mut c = self.counters.lock().await;
        c.processed += 1;
        Ok(())
    }

    /// Snapshot of the pipeline's counters (for metrics export).
    pub async fn counters_snapshot(&self) -> PipelineCounters {
        let c = self.counters.lock().await;
        PipelineCounters {
            received: c.received,
            processed: c.processed,
            rejected: c.rejected.clone(),
            broadcast: c.broadcast.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct TestBlock {
        h: u64,
        height: u64,
        prev: u64,
        difficulty: u64,
        chain_id: u64,
        work: u64,
    }

    impl Block for TestBlock {
        fn hash(&self) -> Hash32 {
            Hash32::digest(&self.h.to_be_bytes())
        }
        fn prev_hash(&self) -> Hash32 {
            Hash32::digest(&self.prev.to_be_bytes())
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
            format!("{{\"h\":{}}}", self.h)
        }
    }

    struct TestFacade {
        tip: StdMutex<Option<TestBlock>>,
        add_calls: AtomicU64,
    }

    #[async_trait]
    impl ChainFacade<TestBlock> for TestFacade {
        async fn get_latest(&self) -> Option<TestBlock> {
            self.tip.lock().unwrap().clone()
        }
        async fn add(&self, block: TestBlock) -> Result<(), ChainError> {
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            *self.tip.lock().unwrap() = Some(block);
            Ok(())
        }
        fn compute_hash(&self, block: &TestBlock) -> Hash32 {
            block.hash()
        }
        async fn validate_block(&self, _block: &TestBlock) -> Result<(), ChainError> {
            Ok(())
        }
        async fn chain_work(&self, block: &TestBlock) -> u64 {
            block.work
        }
    }

    fn genesis() -> TestBlock {
        TestBlock {
            h: 0,
            height: 0,
            prev: 0,
            difficulty: 1,
            chain_id: 1,
            work: 10,
        }
    }

    #[tokio::test]
    async fn accepts_genesis_on_empty_chain() {
        let facade = std::sync::Arc::new(TestFacade {
            tip: StdMutex::new(None),
            add_calls: AtomicU64::new(0),
        });
        let pipeline = BlockPipeline::new(facade.clone());
        pipeline.ingest(genesis()).await.unwrap();
        assert_eq!(facade.add_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_block_rejected_and_added_once() {
        let facade = std::sync::Arc::new(TestFacade {
            tip: StdMutex::new(None),
            add_calls: AtomicU64::new(0),
        });
        let pipeline = BlockPipeline::new(facade.clone());
        pipeline.ingest(genesis()).await.unwrap();
        let err = pipeline.ingest(genesis()).await.unwrap_err();
        assert_eq!(err, ChainError::Duplicate);
        assert_eq!(facade.add_calls.load(Ordering::SeqCst), 1);
        let counters = pipeline.counters_snapshot().await;
        assert_eq!(counters.received, 2);
        assert_eq!(counters.processed, 1);
        assert_eq!(*counters.rejected.get("duplicate").unwrap(), 1);
    }

    #[tokio::test]
    async fn fork_inferior_rejected() {
        let tip = TestBlock {
            h: 10,
            height: 10,
            prev: 9,
            difficulty: 1,
            chain_id: 1,
            work: 100,
        };
        let facade = std::sync::Arc::new(TestFacade {
            tip: StdMutex::new(Some(tip)),
            add_calls: AtomicU64::new(0),
        });
        let pipeline = BlockPipeline::new(facade.clone());
        let competitor = TestBlock {
            h: 11,
            height: 10,
            prev: 7,
            difficulty: 1,
            chain_id: 1,
            work: 90,
        };
        let err = pipeline.ingest(competitor).await.unwrap_err();
        assert_eq!(err, ChainError::ForkInferior);
        assert_eq!(facade.add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn straight_extension_accepted() {
        let tip = genesis();
        let tip_hash = tip.h;
        let facade = std::sync::Arc::new(TestFacade {
            tip: StdMutex::new(Some(tip)),
            add_calls: AtomicU64::new(0),
        });
        let pipeline = BlockPipeline::new(facade.clone());
        let next = TestBlock {
            h: 1,
            height: 1,
            prev: tip_hash,
            difficulty: 1,
            chain_id: 1,
            work: 20,
        };
        pipeline.ingest(next).await.unwrap();
        assert_eq!(facade.add_calls.load(Ordering::SeqCst), 1);
    }
}
