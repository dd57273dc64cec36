//! Mutable consensus state of a single node.
//!
//! Everything a state transition touches lives in [`NodeState`], which the
//! node keeps behind one lock. Log positions are 1-based: index `i` is
//! `log[i - 1]`, index 0 means "before the first entry", and
//! `commit_index` is the number of committed entries.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::info;

use crate::errors::NodeError;
use crate::metrics::{COMMIT_INDEX, CURRENT_TERM};
use crate::store::{ReplicatedStore, WriteValue};

/// The three roles a node can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Follows the leader's heartbeats and votes when asked.
    #[default]
    Follower,
    /// Soliciting votes for the current term.
    Candidate,
    /// Serves clients and drives replication.
    Leader,
}

/// A replicated command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// A staged key mutation. `version` is the version the write produces
    /// (the superseded version for a tombstone).
    Write {
        key: String,
        value: WriteValue,
        version: u64,
    },
    /// Empty entry appended by a new leader so earlier-term entries commit.
    Barrier,
}

/// A single log entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Command,
}

/// Replication progress of one peer, tracked by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    /// Next log index to send.
    pub next_index: u64,
    /// Highest index known to be stored on the peer.
    pub match_index: u64,
}

/// A client write waiting for its entry to commit.
#[derive(Debug)]
pub(crate) struct Waiter {
    term: u64,
    tx: oneshot::Sender<()>,
}

/// Strict majority of a cluster of `cluster_size` members.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

#[derive(Debug)]
pub struct NodeState {
    pub(crate) role: Role,
    pub(crate) term: u64,
    pub(crate) voted_for: Option<String>,
    pub(crate) leader: Option<String>,
    pub(crate) log: Vec<LogEntry>,
    pub(crate) commit_index: u64,
    pub(crate) store: ReplicatedStore,
    /// Per-peer progress, aligned with the node's peer list. Leader only.
    pub(crate) progress: Vec<PeerProgress>,
    pub(crate) election_deadline: Instant,
    election_window: (Duration, Duration),
    pending: BTreeMap<u64, Waiter>,
}

impl NodeState {
    pub fn new(election_window: (Duration, Duration)) -> Self {
        let mut state = Self {
            role: Role::Follower,
            term: 0,
            voted_for: None,
            leader: None,
            log: Vec::new(),
            commit_index: 0,
            store: ReplicatedStore::new(),
            progress: Vec::new(),
            election_deadline: Instant::now(),
            election_window,
            pending: BTreeMap::new(),
        };
        state.reset_election_deadline();
        state
    }

    pub fn last_index(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`, 0 for index 0 or an index past the end.
    pub fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.log
            .get(index as usize - 1)
            .map(|e| e.term)
            .unwrap_or(0)
    }

    /// Number of entries appended but not yet committed.
    pub fn staged_len(&self) -> u64 {
        self.last_index() - self.commit_index
    }

    pub fn staged(&self) -> &[LogEntry] {
        &self.log[self.commit_index as usize..]
    }

    /// Pick a fresh randomized election deadline.
    pub fn reset_election_deadline(&mut self) {
        let (min, max) = self.election_window;
        let timeout = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        self.election_deadline = Instant::now() + timeout;
    }

    pub fn election_due(&self) -> bool {
        self.role != Role::Leader && Instant::now() >= self.election_deadline
    }

    /// Refuse an RPC from an earlier term.
    pub fn check_term(&self, received: u64) -> Result<(), NodeError> {
        if received < self.term {
            return Err(NodeError::StaleTerm {
                received,
                current: self.term,
            });
        }
        Ok(())
    }

    /// Adopt `term` if it is newer and become a follower.
    ///
    /// Leader progress is discarded and pending client writes are dropped;
    /// their callers observe the write as not confirmed.
    pub fn step_down(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            metrics::gauge!(CURRENT_TERM).set(term as f64);
        }
        if self.role != Role::Follower {
            info!("stepping down to follower in term {}", self.term);
        }
        self.role = Role::Follower;
        self.progress.clear();
        self.pending.clear();
        self.reset_election_deadline();
    }

    /// Register a waiter for the entry at `index`.
    pub(crate) fn wait_for_commit(&mut self, index: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            index,
            Waiter {
                term: self.term,
                tx,
            },
        );
        rx
    }

    /// Drop every entry after `index`. Committed entries are never removed.
    pub(crate) fn truncate_after(&mut self, index: u64) {
        let index = index.max(self.commit_index);
        self.log.truncate(index as usize);
        let _ = self.pending.split_off(&(index + 1));
    }

    /// Commit and apply every entry up to `new_commit`, in log order.
    pub(crate) fn commit_through(&mut self, new_commit: u64) {
        let new_commit = new_commit.min(self.last_index());
        if new_commit <= self.commit_index {
            return;
        }
        for entry in &self.log[self.commit_index as usize..new_commit as usize] {
            if let Command::Write {
                key,
                value,
                version,
            } = &entry.command
            {
                self.store.apply(key, value, *version);
            }
        }
        self.commit_index = new_commit;
        metrics::gauge!(COMMIT_INDEX).set(new_commit as f64);

        let still_pending = self.pending.split_off(&(new_commit + 1));
        let committed = std::mem::replace(&mut self.pending, still_pending);
        for (index, waiter) in committed {
            if self.term_at(index) == waiter.term {
                let _ = waiter.tx.send(());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
