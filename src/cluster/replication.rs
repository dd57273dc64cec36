//! Log replication and commit propagation.
//!
//! The leader sends every peer the entries from that peer's `next_index`
//! together with its term and commit index. The heartbeat doubles as the
//! append RPC; an empty entry list is a plain liveness signal.

use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::node::ConsensusNode;
use super::state::{quorum, NodeState, Role};
use crate::metrics::PEER_RPC_FAILURES_TOTAL;
use crate::protocol::{HeartbeatReply, HeartbeatRequest};

/// Upper bound on entries carried by one heartbeat.
const MAX_ENTRIES_PER_HEARTBEAT: usize = 128;

impl NodeState {
    /// Follower side of the heartbeat RPC.
    pub fn handle_heartbeat(&mut self, request: &HeartbeatRequest) -> HeartbeatReply {
        if let Err(err) = self.check_term(request.term) {
            debug!("ignoring heartbeat from {}: {err}", request.leader);
            return self.heartbeat_reply(false, self.last_index());
        }
        if request.term > self.term || self.role != Role::Follower {
            self.step_down(request.term);
        }
        self.leader = Some(request.leader.clone());
        self.reset_election_deadline();

        if request.prev_idx > self.last_index() {
            return self.heartbeat_reply(false, self.last_index());
        }
        if request.prev_idx > 0 && self.term_at(request.prev_idx) != request.prev_term {
            // Everything up to our commit index matches any current leader.
            return self.heartbeat_reply(false, self.commit_index.min(request.prev_idx - 1));
        }

        for (offset, entry) in request.entries.iter().enumerate() {
            let index = request.prev_idx + offset as u64 + 1;
            if index <= self.last_index() {
                if self.term_at(index) == entry.term {
                    continue;
                }
                if index <= self.commit_index {
                    warn!("leader {} conflicts with committed entry {index}", request.leader);
                    return self.heartbeat_reply(false, self.commit_index);
                }
                self.truncate_after(index - 1);
            }
            self.log.push(entry.clone());
        }

        let last_new = request.prev_idx + request.entries.len() as u64;
        self.commit_through(request.commit_idx.min(last_new));
        self.heartbeat_reply(true, last_new)
    }

    fn heartbeat_reply(&self, success: bool, match_idx: u64) -> HeartbeatReply {
        HeartbeatReply {
            term: self.term,
            commit_idx: self.commit_index,
            success,
            match_idx,
        }
    }

    /// Build the heartbeat for the peer at `peer`.
    pub(crate) fn heartbeat_for(&self, peer: usize, me: &str) -> HeartbeatRequest {
        let next_index = self.progress[peer].next_index.clamp(1, self.last_index() + 1);
        let prev_idx = next_index - 1;
        let entries = self
            .log
            .iter()
            .skip(prev_idx as usize)
            .take(MAX_ENTRIES_PER_HEARTBEAT)
            .cloned()
            .collect();
        HeartbeatRequest {
            term: self.term,
            commit_idx: self.commit_index,
            leader: me.to_string(),
            prev_idx,
            prev_term: self.term_at(prev_idx),
            entries,
        }
    }

    /// Fold a heartbeat reply from `peer` into the leader's progress.
    ///
    /// Returns `false` once this node is no longer leader of `term`.
    pub(crate) fn record_heartbeat_reply(
        &mut self,
        term: u64,
        peer: usize,
        sent: &HeartbeatRequest,
        reply: &HeartbeatReply,
    ) -> bool {
        if reply.term > self.term {
            self.step_down(reply.term);
            return false;
        }
        if self.role != Role::Leader || self.term != term {
            return false;
        }
        let progress = &mut self.progress[peer];
        if reply.success {
            let matched = sent.prev_idx + sent.entries.len() as u64;
            progress.match_index = progress.match_index.max(matched);
            progress.next_index = progress.match_index + 1;
            self.advance_commit();
        } else {
            progress.next_index = (reply.match_idx + 1).min(sent.prev_idx).max(1);
        }
        true
    }

    /// Advance the commit index to the highest entry of the current term
    /// held by a strict majority.
    pub(crate) fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matched: Vec<u64> = self.progress.iter().map(|p| p.match_index).collect();
        matched.push(self.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[quorum(matched.len()) - 1];
        if candidate > self.commit_index && self.term_at(candidate) == self.term {
            self.commit_through(candidate);
        }
    }
}

impl ConsensusNode {
    /// Send one heartbeat to every peer and fold in the replies.
    pub(crate) async fn replicate_round(&self) {
        let (term, batch) = {
            let state = self.read_state();
            if state.role != Role::Leader {
                return;
            }
            let batch: Vec<_> = (0..self.peers.len())
                .map(|i| (i, state.heartbeat_for(i, &self.address)))
                .collect();
            (state.term, batch)
        };

        let mut calls = JoinSet::new();
        for (index, request) in batch {
            let transport = self.transport.clone();
            let peer = self.peers[index].clone();
            let timeout = self.timing.rpc_timeout;
            calls.spawn(async move {
                let outcome =
                    tokio::time::timeout(timeout, transport.heartbeat(&peer, request.clone()))
                        .await;
                (index, peer, request, outcome)
            });
        }

        while let Some(joined) = calls.join_next().await {
            let Ok((index, peer, request, outcome)) = joined else {
                continue;
            };
            let reply = match outcome {
                Ok(Ok(reply)) => reply,
                Ok(Err(err)) => {
                    debug!("heartbeat to {peer} failed: {err:#}");
                    metrics::counter!(PEER_RPC_FAILURES_TOTAL, "rpc" => "heartbeat")
                        .increment(1);
                    continue;
                }
                Err(_) => {
                    debug!("heartbeat to {peer} timed out");
                    metrics::counter!(PEER_RPC_FAILURES_TOTAL, "rpc" => "heartbeat")
                        .increment(1);
                    continue;
                }
            };
            let still_leader =
                self.write_state()
                    .record_heartbeat_reply(term, index, &request, &reply);
            if !still_leader {
                return;
            }
        }
    }
}
