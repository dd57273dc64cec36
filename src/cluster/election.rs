//! Leader election.
//!
//! A follower whose election deadline passes becomes a candidate, bumps its
//! term, votes for itself and asks every peer in parallel. A strict majority
//! of grants (self included) makes it leader; a reply with a higher term
//! ends the candidacy at once.

use tokio::task::JoinSet;
use tracing::{debug, info};

use super::node::ConsensusNode;
use super::state::{quorum, Command, LogEntry, NodeState, PeerProgress, Role};
use crate::metrics::{CURRENT_TERM, ELECTIONS_TOTAL, LEADER_ELECTED_TOTAL, PEER_RPC_FAILURES_TOTAL};
use crate::protocol::{VoteReply, VoteRequest};

/// What a vote reply did to an ongoing election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Continue,
    Won,
    Abandoned,
}

impl NodeState {
    /// Decide whether to grant a vote.
    ///
    /// At most one candidate per term gets a grant, and only if its log is at
    /// least as up to date as ours: last log term first, then total log
    /// length, then commit index.
    pub fn decide_vote(&mut self, request: &VoteRequest) -> VoteReply {
        if let Err(err) = self.check_term(request.term) {
            debug!("refusing vote: {err}");
            return VoteReply {
                choice: false,
                term: self.term,
            };
        }
        if request.term > self.term {
            self.step_down(request.term);
        }

        let already_voted = match (&self.voted_for, &request.candidate) {
            (None, _) => false,
            (Some(voted), Some(candidate)) => voted != candidate,
            (Some(_), None) => true,
        };

        let theirs = (
            request.last_term,
            request.commit_idx + request.staged,
            request.commit_idx,
        );
        let ours = (self.last_term(), self.last_index(), self.commit_index);
        let up_to_date = theirs >= ours;

        let choice = !already_voted && up_to_date;
        if choice {
            self.voted_for = Some(request.candidate.clone().unwrap_or_default());
            self.reset_election_deadline();
        }
        debug!(
            "vote for {:?} in term {}: granted={} (already_voted={}, up_to_date={})",
            request.candidate, self.term, choice, already_voted, up_to_date
        );
        VoteReply {
            choice,
            term: self.term,
        }
    }

    /// Become a candidate for the next term and build the vote request.
    pub(crate) fn begin_candidacy(&mut self, me: &str) -> VoteRequest {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(me.to_string());
        self.leader = None;
        self.progress.clear();
        self.reset_election_deadline();
        metrics::gauge!(CURRENT_TERM).set(self.term as f64);
        info!("starting election for term {}", self.term);

        VoteRequest {
            term: self.term,
            commit_idx: self.commit_index,
            staged: self.staged_len(),
            last_term: self.last_term(),
            candidate: Some(me.to_string()),
        }
    }

    /// Take leadership of the current term.
    ///
    /// Appends a barrier entry so entries staged in earlier terms can commit
    /// under this leader.
    pub(crate) fn become_leader(&mut self, me: &str, peer_count: usize) {
        self.role = Role::Leader;
        self.leader = Some(me.to_string());
        self.log.push(LogEntry {
            term: self.term,
            command: Command::Barrier,
        });
        let next_index = self.last_index();
        self.progress = vec![
            PeerProgress {
                next_index,
                match_index: 0,
            };
            peer_count
        ];
        metrics::counter!(LEADER_ELECTED_TOTAL).increment(1);
        info!("became leader for term {}", self.term);
        self.advance_commit();
    }
}

impl ConsensusNode {
    /// Run one election round if the deadline has passed.
    pub(crate) async fn run_election(&self) {
        let request = {
            let mut state = self.write_state();
            if !state.election_due() {
                return;
            }
            state.begin_candidacy(&self.address)
        };
        metrics::counter!(ELECTIONS_TOTAL).increment(1);

        let term = request.term;
        let needed = quorum(self.peers.len() + 1);
        let mut granted = 1;
        if granted >= needed {
            self.tally(term, None, &mut granted, needed);
            return;
        }

        let mut calls = JoinSet::new();
        for peer in &self.peers {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let request = request.clone();
            let timeout = self.timing.rpc_timeout;
            calls.spawn(async move {
                let outcome =
                    tokio::time::timeout(timeout, transport.request_vote(&peer, request)).await;
                (peer, outcome)
            });
        }

        // Dropping `calls` on return aborts the outstanding requests.
        while let Some(joined) = calls.join_next().await {
            let Ok((peer, outcome)) = joined else {
                continue;
            };
            let reply = match outcome {
                Ok(Ok(reply)) => reply,
                Ok(Err(err)) => {
                    debug!("vote request to {peer} failed: {err:#}");
                    metrics::counter!(PEER_RPC_FAILURES_TOTAL, "rpc" => "vote").increment(1);
                    continue;
                }
                Err(_) => {
                    debug!("vote request to {peer} timed out");
                    metrics::counter!(PEER_RPC_FAILURES_TOTAL, "rpc" => "vote").increment(1);
                    continue;
                }
            };
            match self.tally(term, Some(reply), &mut granted, needed) {
                Tally::Continue => {}
                Tally::Won | Tally::Abandoned => return,
            }
        }
        debug!("election for term {term} ended with {granted}/{needed} votes");
    }

    /// Fold one vote reply into the election for `term`.
    fn tally(
        &self,
        term: u64,
        reply: Option<VoteReply>,
        granted: &mut usize,
        needed: usize,
    ) -> Tally {
        let mut state = self.write_state();
        if let Some(reply) = reply {
            if reply.term > state.term {
                state.step_down(reply.term);
                return Tally::Abandoned;
            }
            if reply.choice {
                *granted += 1;
            }
        }
        if state.role != Role::Candidate || state.term != term {
            return Tally::Abandoned;
        }
        if *granted >= needed {
            state.become_leader(&self.address, self.peers.len());
            drop(state);
            self.wake.notify_one();
            return Tally::Won;
        }
        Tally::Continue
    }
}
