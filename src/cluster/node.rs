//! The consensus node: one lock around [`NodeState`], the request handlers
//! the HTTP layer calls, and the timer task that drives elections and
//! replication.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info};

use super::state::{Command, LogEntry, NodeState, Role};
use super::transport::PeerTransport;
use crate::config::ClusterConfig;
use crate::errors::NodeError;
use crate::protocol::{HeartbeatReply, HeartbeatRequest, VoteReply, VoteRequest};
use crate::store::{resolve_version, Record, Write, WriteValue};

/// Consensus timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub election_min: Duration,
    pub election_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub replication_timeout: Duration,
}

impl Timing {
    pub fn from_config(cluster: &ClusterConfig) -> Self {
        let (election_min, election_max) = cluster.election_timeout();
        Self {
            election_min,
            election_max,
            heartbeat_interval: Duration::from_millis(cluster.heartbeat_interval_ms),
            rpc_timeout: Duration::from_millis(cluster.rpc_timeout_ms),
            replication_timeout: Duration::from_millis(cluster.replication_timeout_ms),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            election_min: Duration::from_millis(150),
            election_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(30),
            rpc_timeout: Duration::from_millis(50),
            replication_timeout: Duration::from_millis(1000),
        }
    }
}

/// Point-in-time view of a node, served by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub role: Role,
    pub term: u64,
    pub leader: Option<String>,
    pub commit_idx: u64,
    pub log_len: u64,
}

pub struct ConsensusNode {
    pub(crate) address: String,
    pub(crate) peers: Vec<String>,
    pub(crate) timing: Timing,
    state: RwLock<NodeState>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    /// Wakes the timer task after a staged write or a role change.
    pub(crate) wake: Notify,
}

impl ConsensusNode {
    pub fn new(
        address: String,
        peers: Vec<String>,
        timing: Timing,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let state = NodeState::new((timing.election_min, timing.election_max));
        Self {
            address,
            peers,
            timing,
            state: RwLock::new(state),
            transport,
            wake: Notify::new(),
        }
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().expect("rwlock poisoned")
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().expect("rwlock poisoned")
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.read_state();
        NodeStatus {
            role: state.role,
            term: state.term,
            leader: state.leader.clone(),
            commit_idx: state.commit_index,
            log_len: state.last_index(),
        }
    }

    /// Fail with `NotLeader` unless this node leads the current term.
    pub fn ensure_leader(&self) -> Result<(), NodeError> {
        self.read_state().ensure_leader()
    }

    /// Read a committed record. Leader only.
    pub fn handle_get(&self, key: &str) -> Result<Option<Record>, NodeError> {
        let state = self.read_state();
        state.ensure_leader()?;
        Ok(state.store.get(key).cloned())
    }

    /// Stage a write and wait until it commits.
    ///
    /// Returns the record as committed. A write the node could not confirm
    /// within the replication timeout, or lost by stepping down, yields
    /// `ReplicationTimeout`.
    pub async fn handle_put(&self, key: &str, write: Write) -> Result<Record, NodeError> {
        let (record, committed) = self.write_state().stage_write(key, write)?;
        self.wake.notify_one();

        match tokio::time::timeout(self.timing.replication_timeout, committed).await {
            Ok(Ok(())) => Ok(record),
            Ok(Err(_)) => {
                debug!("write to {key} dropped before commit");
                Err(NodeError::ReplicationTimeout)
            }
            Err(_) => {
                debug!("write to {key} not committed within {:?}", self.timing.replication_timeout);
                Err(NodeError::ReplicationTimeout)
            }
        }
    }

    pub fn decide_vote(&self, request: &VoteRequest) -> VoteReply {
        let (reply, stepped_down) = {
            let mut state = self.write_state();
            let was_leader = state.role == Role::Leader;
            let reply = state.decide_vote(request);
            (reply, was_leader && state.role != Role::Leader)
        };
        if stepped_down {
            self.wake.notify_one();
        }
        reply
    }

    pub fn handle_heartbeat(&self, request: &HeartbeatRequest) -> HeartbeatReply {
        let (reply, stepped_down) = {
            let mut state = self.write_state();
            let was_leader = state.role == Role::Leader;
            let reply = state.handle_heartbeat(request);
            (reply, was_leader && state.role != Role::Leader)
        };
        if stepped_down {
            self.wake.notify_one();
        }
        reply
    }

    /// Drive elections and replication until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "consensus node {} started with {} peers",
            self.address,
            self.peers.len()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let (role, deadline) = {
                let state = self.read_state();
                (state.role, state.election_deadline)
            };

            if role == Role::Leader {
                self.replicate_round().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.timing.heartbeat_interval) => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => self.run_election().await,
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!("consensus node {} stopped", self.address);
    }

    #[cfg(test)]
    pub(crate) fn committed_log(&self) -> Vec<LogEntry> {
        let state = self.read_state();
        state.log[..state.commit_index as usize].to_vec()
    }

    #[cfg(test)]
    pub(crate) fn committed_record(&self, key: &str) -> Option<Record> {
        self.read_state().store.get(key).cloned()
    }
}

impl NodeState {
    pub(crate) fn ensure_leader(&self) -> Result<(), NodeError> {
        if self.role == Role::Leader {
            Ok(())
        } else {
            Err(NodeError::NotLeader {
                leader: self.leader.clone(),
            })
        }
    }

    /// The record `key` will hold once every staged entry commits.
    fn projected(&self, key: &str) -> Option<Record> {
        let staged = self.staged().iter().rev().find_map(|entry| match &entry.command {
            Command::Write {
                key: k,
                value,
                version,
            } if k == key => Some(record_of(value, *version)),
            _ => None,
        });
        staged.or_else(|| self.store.get(key).cloned())
    }

    /// Version-check `write` and append it to the log.
    ///
    /// The check runs against the projected record, so two writers with the
    /// same base version cannot both be staged.
    pub(crate) fn stage_write(
        &mut self,
        key: &str,
        write: Write,
    ) -> Result<(Record, oneshot::Receiver<()>), NodeError> {
        self.ensure_leader()?;
        let current = self.projected(key);
        let version = resolve_version(current.as_ref(), &write).map_err(|current| {
            let supplied = match &write {
                Write::Upsert {
                    expected_version, ..
                } => *expected_version,
                Write::Delete => current,
            };
            NodeError::VersionMismatch { current, supplied }
        })?;

        let value = match &write {
            Write::Delete => WriteValue::Tombstone,
            Write::Upsert { document, .. } => WriteValue::Live(document.render(version)),
        };
        let record = record_of(&value, version);
        self.log.push(LogEntry {
            term: self.term,
            command: Command::Write {
                key: key.to_string(),
                value,
                version,
            },
        });
        let index = self.last_index();
        let committed = self.wait_for_commit(index);
        debug!("staged {key} at index {index} term {} version {version}", self.term);
        self.advance_commit();
        Ok((record, committed))
    }
}

fn record_of(value: &WriteValue, version: u64) -> Record {
    match value {
        WriteValue::Live(value) => Record::Live {
            value: value.clone(),
            version,
        },
        WriteValue::Tombstone => Record::Tombstone,
    }
}
