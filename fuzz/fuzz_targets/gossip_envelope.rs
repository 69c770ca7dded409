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

#![no_main]
#![forbid(unsafe_code)]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshcore::gossip::{GossipEnvelope, GossipTopic};

#[derive(Clone, Copy, Debug, Arbitrary)]
enum TopicChoice {
    Blocks,
    Txs,
    Consensus,
}

impl From<TopicChoice> for GossipTopic {
    fn from(t: TopicChoice) -> Self {
        match t {
            TopicChoice::Blocks => GossipTopic::Blocks,
            TopicChoice::Txs => GossipTopic::Txs,
            TopicChoice::Consensus => GossipTopic::Consensus,
        }
    }
}

#[derive(Debug, Arbitrary)]
struct Input {
    topic: TopicChoice,
    bytes: Vec<u8>,
}

fuzz_target!(|inp: Input| {
    if let Some(envelope) = GossipEnvelope::decode(inp.topic.into(), &inp.bytes) {
        // A successfully decoded envelope must always re-encode to the same
        // bytes it was decoded from (the wire format is a direct byte split,
        // not self-describing, so round-trip equality is the only invariant
        // that holds for arbitrary input).
        let re = envelope.encode();
        assert_eq!(re, inp.bytes);
    }
});
