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

use async_trait::async_trait;
use meshcore::chain::{Block, BlockPipeline, ChainError, ChainFacade};
use meshcore::core::types::Hash32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

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
    validate_calls: AtomicU64,
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
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
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
async fn superior_fork_reorgs_through_facade_validation() {
    let tip = TestBlock {
        h: 10,
        height: 10,
        prev: 9,
        difficulty: 1,
        chain_id: 1,
        work: 100,
    };
    let facade = Arc::new(TestFacade {
        tip: StdMutex::new(Some(tip)),
        add_calls: AtomicU64::new(0),
        validate_calls: AtomicU64::new(0),
    });
    let pipeline = BlockPipeline::new(facade.clone());

    // Same height, competing prev, but strictly more cumulative work: this
    // fork should win and go through façade validation before being added.
    let competitor = TestBlock {
        h: 11,
        height: 10,
        prev: 7,
        difficulty: 1,
        chain_id: 1,
        work: 150,
    };
    pipeline.ingest(competitor.clone()).await.unwrap();

    assert_eq!(facade.validate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(facade.add_calls.load(Ordering::SeqCst), 1);
    assert_eq!(facade.get_latest().await.unwrap(), competitor);
}

#[tokio::test]
async fn facade_rejection_during_fork_validation_is_surfaced() {
    struct RejectingFacade {
        tip: StdMutex<Option<TestBlock>>,
    }
    #[async_trait]
    impl ChainFacade<TestBlock> for RejectingFacade {
        async fn get_latest(&self) -> Option<TestBlock> {
            self.tip.lock().unwrap().clone()
        }
        async fn add(&self, block: TestBlock) -> Result<(), ChainError> {
            *self.tip.lock().unwrap() = Some(block);
            Ok(())
        }
        fn compute_hash(&self, block: &TestBlock) -> Hash32 {
            block.hash()
        }
        async fn validate_block(&self, _block: &TestBlock) -> Result<(), ChainError> {
            Err(ChainError::FacadeRejected)
        }
        async fn chain_work(&self, block: &TestBlock) -> u64 {
            block.work
        }
    }

    let tip = TestBlock {
        h: 10,
        height: 10,
        prev: 9,
        difficulty: 1,
        chain_id: 1,
        work: 100,
    };
    let facade = Arc::new(RejectingFacade {
        tip: StdMutex::new(Some(tip)),
    });
    let pipeline = BlockPipeline::new(facade.clone());

    let competitor = TestBlock {
        h: 11,
        height: 10,
        prev: 7,
        difficulty: 1,
        chain_id: 1,
        work: 150,
    };
    let err = pipeline.ingest(competitor).await.unwrap_err();
    assert_eq!(err, ChainError::FacadeRejected);
    // Rejected blocks must never enter the seen-set as accepted, nor change the tip.
    assert_eq!(facade.get_latest().await.unwrap().h, 10);
}

#[tokio::test]
async fn poll_outbound_only_reports_tip_changes() {
    let facade = Arc::new(TestFacade {
        tip: StdMutex::new(Some(genesis())),
        add_calls: AtomicU64::new(0),
        validate_calls: AtomicU64::new(0),
    });
    let pipeline = BlockPipeline::new(facade.clone());

    let first = pipeline.poll_outbound().await;
    assert_eq!(first.unwrap().h, 0);

    // Tip unchanged: second poll must not re-announce it.
    let second = pipeline.poll_outbound().await;
    assert!(second.is_none());

    *facade.tip.lock().unwrap() = Some(TestBlock {
        h: 1,
        height: 1,
        prev: 0,
        difficulty: 1,
        chain_id: 1,
        work: 20,
    });
    let third = pipeline.poll_outbound().await;
    assert_eq!(third.unwrap().h, 1);
}
