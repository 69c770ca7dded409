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

//! Election Engine (C6): a Raft-like follower/candidate/leader state machine
//! running over pub-sub envelopes (§4.6).

use crate::core::membership::MembershipStore;
use crate::core::types::{Address, ElectionSettings};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Election traffic, carried as the payload of gossip envelopes on the
/// `consensus` topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ElectionMessage {
    /// Leader heartbeat.
    Hb {
        /// Sender's term.
        term: i64,
        /// Sender's address (the leader).
        leader: Address,
    },
    /// Candidacy announcement.
    VoteReq {
        /// Candidate's term.
        term: i64,
        /// Candidate's address.
        candidate: Address,
    },
    /// Vote grant/deny.
    VoteResp {
        /// Term the vote pertains to.
        term: i64,
        /// Voter's address.
        voter: Address,
        /// Whether the vote was granted.
        granted: bool,
    },
    /// Leader announcement, broadcast once per election.
    LeaderAnn {
        /// Leader's term.
        term: i64,
        /// Leader's address.
        leader: Address,
    },
    /// Membership-churn notification; forces a term bump and re-election.
    Topology {
        /// Sender's term.
        term: i64,
        /// Address of the node reporting the change.
        node_id: Address,
        /// Peer count observed by the sender.
        peer_count: usize,
    },
}

/// Role in the Raft-like state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Awaiting heartbeats from a leader.
    Follower,
    /// Campaigning for votes.
    Candidate,
    /// Committing the request queue and issuing heartbeats.
    Leader,
}

/// Per-node election state (§3).
pub struct ElectionState {
    /// Current role.
    pub role: Role,
    /// Strictly non-decreasing term counter.
    pub current_term: i64,
    /// Candidate this node voted for in `current_term`, if any.
    pub voted_for: Option<Address>,
    /// Most recent term in which this node cast a vote.
    pub last_voted_term: i64,
    /// Address of the node currently believed to be leader.
    pub leader: Option<Address>,
    /// Last time a valid heartbeat (or this node's own election) was seen.
    pub last_heartbeat: Instant,
    /// Votes collected so far this candidacy.
    pub votes_received: BTreeSet<Address>,
    /// Operations queued for commit once this node becomes leader.
    pub request_queue: VecDeque<String>,
    /// Index of the last committed operation.
    pub commit_index: i64,
    election_deadline: Instant,
}

impl ElectionState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            last_voted_term: -1,
            leader: None,
            last_heartbeat: now,
            votes_received: BTreeSet::new(),
            request_queue: VecDeque::new(),
            commit_index: -1,
            election_deadline: now,
        }
    }

    fn reset_volatile(&mut self) {
        self.votes_received.clear();
        self.leader = None;
    }
}

/// Events the engine surfaces to the embedder (logged at `info`, never
/// propagated as errors — election conditions are steady-state, §7).
#[derive(Clone, Debug)]
pub enum ElectionEvent {
    /// This node became leader at `term`.
    BecameLeader(i64),
    /// This node stepped down to follower.
    LeaderLost,
    /// A queued operation was committed.
    Committed(String),
}

/// Majority threshold over a cluster of `total_nodes` (self included).
fn quorum(total_nodes: usize) -> usize {
    std::cmp::max(2, total_nodes / 2 + 1)
}

fn randomized_timeout(baseline: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..baseline.as_millis().max(1) as u64);
    baseline + Duration::from_millis(jitter_ms)
}

/// Drives the election state machine: ticks, message handling, and outbound
/// gossip publication.
pub struct ElectionEngine {
    self_address: Address,
    settings: ElectionSettings,
    membership: Arc<MembershipStore>,
    state: Mutex<ElectionState>,
    outbound: mpsc::Sender<ElectionMessage>,
    events: mpsc::Sender<ElectionEvent>,
}

impl ElectionEngine {
    /// Construct a new engine for `self_address`.
    pub fn new(
        self_address: Address,
        settings: ElectionSettings,
        membership: Arc<MembershipStore>,
        outbound: mpsc::Sender<ElectionMessage>,
        events: mpsc::Sender<ElectionEvent>,
    ) -> Self {
        Self {
            self_address,
            settings,
            membership,
            state: Mutex::new(ElectionState::new()),
            outbound,
            events,
        }
    }

    /// Current term (for diagnostics/metrics).
    pub async fn current_term(&self) -> i64 {
        self.state.lock().await.current_term
    }

    /// Current role (for diagnostics/metrics).
    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    /// Enqueue an operation for commit once this node becomes (or remains)
    /// leader.
    pub async fn enqueue(&self, op: String) {
        self.state.lock().await.request_queue.push_back(op);
    }

    fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.election_timeout_ms)
    }

    async fn become_follower(&self, state: &mut ElectionState, term: i64) {
        state.role = Role::Follower;
        state.current_term = term;
        state.voted_for = None;
        state.reset_volatile();
        state.last_heartbeat = Instant::now();
    }

    async fn become_candidate(&self, state: &mut ElectionState) {
        state.role = Role::Candidate;
        state.current_term += 1;
        state.voted_for = Some(self.self_address);
        state.last_voted_term = state.current_term;
        state.reset_volatile();
        state.votes_received.insert(self.self_address);
        state.election_deadline = Instant::now() + randomized_timeout(self.election_timeout());
        let term = state.current_term;
        debug!(term, "becoming candidate");
        let _ = self
            .outbound
            .send(ElectionMessage::VoteReq {
                term,
                candidate: self.self_address,
            })
            .await;
    }

    async fn become_leader(&self, state: &mut ElectionState) {
        state.role = Role::Leader;
        state.leader = Some(self.self_address);
        let term = state.current_term;
        info!(term, "became leader");
        let _ = self
            .outbound
            .send(ElectionMessage::LeaderAnn {
                term,
                leader: self.self_address,
            })
            .await;
        let _ = self.events.send(ElectionEvent::BecameLeader(term)).await;
    }

    /// Advance one tick (50 ms default, §5). Called from the owning task's
    /// select loop.
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.role {
            Role::Follower => {
                if now.duration_since(state.last_heartbeat) > self.election_timeout() {
                    self.become_candidate(&mut state).await;
                }
            }
            Role::Candidate => {
                if now >= state.election_deadline {
                    // Split vote or lost quorum race: retry as a fresh candidacy.
                    self.become_candidate(&mut state).await;
                }
            }
            Role::Leader => {
                if now.duration_since(state.last_heartbeat)
                    >= Duration::from_millis(self.settings.heartbeat_interval_ms)
                {
                    state.last_heartbeat = now;
                    let term = state.current_term;
                    let _ = self
                        .outbound
                        .send(ElectionMessage::Hb {
                            term,
                            leader: self.self_address,
                        })
                        .await;
                    if let Some(op) = state.request_queue.pop_front() {
                        state.commit_index += 1;
                        let _ = self.events.send(ElectionEvent::Committed(op)).await;
                    }
                }
            }
        }
    }

    /// Handle an inbound election message.
    pub async fn handle_message(&self, msg: ElectionMessage) {
        match msg {
            ElectionMessage::Hb { term, leader } => self.on_heartbeat(term, leader).await,
            ElectionMessage::VoteReq { term, candidate } => {
                self.on_vote_request(term, candidate).await
            }
            ElectionMessage::VoteResp {
                term,
                voter,
                granted,
            } => self.on_vote_response(term, voter, granted).await,
            ElectionMessage::LeaderAnn { term, leader } => {
                self.on_heartbeat(term, leader).await
            }
            ElectionMessage::Topology {
                term, peer_count, ..
            } => self.on_topology(term, peer_count).await,
        }
    }

    async fn on_heartbeat(&self, term: i64, leader: Address) {
        let mut state = self.state.lock().await;
        if term < state.current_term {
            return;
        }
        if term > state.current_term {
            self.become_follower(&mut state, term).await;
        }
        match state.role {
            Role::Leader if leader != self.self_address => {
                warn!(term, "observed foreign leader at current term; stepping down");
                self.become_follower(&mut state, term).await;
                let _ = self.events.send(ElectionEvent::LeaderLost).await;
            }
            Role::Leader => {}
            _ => {
                state.role = Role::Follower;
                state.leader = Some(leader);
                state.last_heartbeat = Instant::now();
            }
        }
    }

    async fn on_vote_request(&self, term: i64, candidate: Address) {
        let mut state = self.state.lock().await;
        if term < state.current_term {
            return;
        }
        if term > state.current_term {
            self.become_follower(&mut state, term).await;
        }
        let granted = state.last_voted_term != term;
        if granted {
            state.voted_for = Some(candidate);
            state.last_voted_term = term;
            state.leader = None;
        }
        let _ = self
            .outbound
            .send(ElectionMessage::VoteResp {
                term,
                voter: self.self_address,
                granted,
            })
            .await;
    }

    async fn on_vote_response(&self, term: i64, voter: Address, granted: bool) {
        let mut state = self.state.lock().await;
        if state.role != Role::Candidate || term != state.current_term || !granted {
            return;
        }
        state.votes_received.insert(voter);
        // `node_count()` is peers only (self is tracked in `voters`, never in
        // `nodes`, see membership.rs) — add 1 back for the full cluster size
        // a true majority must be taken over.
        let total_nodes = self.membership.node_count().await + 1;
        if state.votes_received.len() >= quorum(total_nodes) {
            self.become_leader(&mut state).await;
        }
    }

    async fn on_topology(&self, term: i64, _peer_count: usize) {
        let mut state = self.state.lock().await;
        if term < state.current_term {
            return;
        }
        let was_leader = state.role == Role::Leader;
        let new_term = std::cmp::max(state.current_term + 1, term);
        self.become_follower(&mut state, new_term).await;
        if was_leader {
            let _ = self.events.send(ElectionEvent::LeaderLost).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    fn settings() -> ElectionSettings {
        ElectionSettings {
            tick_ms: 50,
            heartbeat_interval_ms: 1_000,
            election_timeout_ms: 3_000,
        }
    }

    async fn engine() -> (
        ElectionEngine,
        mpsc::Receiver<ElectionMessage>,
        mpsc::Receiver<ElectionEvent>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let (etx, erx) = mpsc::channel(16);
        let membership = Arc::new(MembershipStore::new(addr(1)));
        membership
            .add_node(addr(2), crate::core::types::NetworkAddress::empty())
            .await
            .unwrap();
        let eng = ElectionEngine::new(addr(1), settings(), membership, tx, etx);
        (eng, rx, erx)
    }

    #[tokio::test]
    fn quorum_never_shrinks_below_two() {
        // Arguments here are total cluster size (self included).
        assert_eq!(quorum(1), 2);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(5), 3);
    }

    #[tokio::test]
    async fn single_vote_req_does_not_elect_without_quorum() {
        let (eng, mut rx, _erx) = engine().await;
        {
            let mut s = eng.state.lock().await;
            eng.become_candidate(&mut s).await;
        }
        assert!(matches!(rx.recv().await, Some(ElectionMessage::VoteReq { .. })));
        assert_eq!(eng.role().await, Role::Candidate);
    }

    #[tokio::test]
    async fn higher_term_forces_follower() {
        let (eng, _rx, _erx) = engine().await;
        eng.on_heartbeat(5, addr(9)).await;
        assert_eq!(eng.current_term().await, 5);
        assert_eq!(eng.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn grants_at_most_one_vote_per_term() {
        let (eng, mut rx, _erx) = engine().await;
        eng.on_vote_request(1, addr(2)).await;
        eng.on_vote_request(1, addr(3)).await;
        let mut granted_count = 0;
        while let Ok(msg) = rx.try_recv() {
            if let ElectionMessage::VoteResp { granted: true, .. } = msg {
                granted_count += 1;
            }
        }
        assert_eq!(granted_count, 1);
    }
}
