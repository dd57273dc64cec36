//! In-memory cluster harness with partition control.
//!
//! Nodes exchange RPCs by calling each other's handlers directly. An
//! isolated node can neither send nor receive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::node::{ConsensusNode, Timing};
use super::state::Role;
use super::transport::PeerTransport;
use crate::protocol::{HeartbeatReply, HeartbeatRequest, VoteReply, VoteRequest};

#[derive(Default)]
struct Registry {
    nodes: HashMap<String, Weak<ConsensusNode>>,
    isolated: HashSet<String>,
}

#[derive(Clone, Default)]
pub(crate) struct SimNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl SimNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn transport(&self, from: &str) -> Arc<dyn PeerTransport> {
        Arc::new(SimTransport {
            from: from.to_string(),
            net: self.clone(),
        })
    }

    pub(crate) fn register(&self, node: &Arc<ConsensusNode>) {
        let mut registry = self.registry.write().unwrap();
        registry
            .nodes
            .insert(node.address().to_string(), Arc::downgrade(node));
    }

    pub(crate) fn isolate(&self, address: &str) {
        self.registry
            .write()
            .unwrap()
            .isolated
            .insert(address.to_string());
    }

    pub(crate) fn heal(&self, address: &str) {
        self.registry.write().unwrap().isolated.remove(address);
    }

    fn route(&self, from: &str, to: &str) -> anyhow::Result<Arc<ConsensusNode>> {
        let registry = self.registry.read().unwrap();
        if registry.isolated.contains(from) || registry.isolated.contains(to) {
            return Err(anyhow!("{from} -> {to}: partitioned"));
        }
        registry
            .nodes
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow!("{to}: unreachable"))
    }
}

struct SimTransport {
    from: String,
    net: SimNetwork,
}

impl PeerTransport for SimTransport {
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<VoteReply>> + Send + '_>> {
        let peer = peer.to_string();
        Box::pin(async move {
            tokio::task::yield_now().await;
            let node = self.net.route(&self.from, &peer)?;
            Ok(node.decide_vote(&request))
        })
    }

    fn heartbeat(
        &self,
        peer: &str,
        request: HeartbeatRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HeartbeatReply>> + Send + '_>> {
        let peer = peer.to_string();
        Box::pin(async move {
            tokio::task::yield_now().await;
            let node = self.net.route(&self.from, &peer)?;
            Ok(node.handle_heartbeat(&request))
        })
    }
}

/// A running simulated cluster. Dropping it stops every node.
pub(crate) struct SimCluster {
    pub(crate) net: SimNetwork,
    pub(crate) nodes: Vec<Arc<ConsensusNode>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimCluster {
    pub(crate) fn start(size: usize) -> Self {
        Self::start_with(vec![Timing::for_tests(); size])
    }

    pub(crate) fn start_with(timings: Vec<Timing>) -> Self {
        let net = SimNetwork::new();
        let addresses: Vec<String> = (0..timings.len())
            .map(|i| format!("http://node-{i}"))
            .collect();
        let (shutdown, rx) = watch::channel(false);

        let mut nodes = Vec::new();
        let mut tasks = Vec::new();
        for (i, timing) in timings.into_iter().enumerate() {
            let peers = addresses
                .iter()
                .filter(|a| **a != addresses[i])
                .cloned()
                .collect();
            let node = Arc::new(ConsensusNode::new(
                addresses[i].clone(),
                peers,
                timing,
                net.transport(&addresses[i]),
            ));
            net.register(&node);
            tasks.push(tokio::spawn(node.clone().run(rx.clone())));
            nodes.push(node);
        }
        Self {
            net,
            nodes,
            shutdown,
            tasks,
        }
    }

    /// Index of the current leader with the highest term, if any.
    pub(crate) fn leader_index(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (i, n.status()))
            .filter(|(_, s)| s.role == Role::Leader)
            .max_by_key(|(_, s)| s.term)
            .map(|(i, _)| i)
    }

    pub(crate) async fn wait_for_leader(&self) -> usize {
        for _ in 0..400 {
            if let Some(i) = self.leader_index() {
                return i;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    /// Leaders observed right now, keyed by term.
    pub(crate) fn leaders_by_term(&self) -> BTreeMap<u64, HashSet<String>> {
        let mut seen: BTreeMap<u64, HashSet<String>> = BTreeMap::new();
        for node in &self.nodes {
            let status = node.status();
            if status.role == Role::Leader {
                seen.entry(status.term)
                    .or_default()
                    .insert(node.address().to_string());
            }
        }
        seen
    }
}

impl Drop for SimCluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub(crate) async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::state::Command;
    use crate::errors::NodeError;
    use crate::store::{Document, Record, Write};

    fn upsert(expected_version: u64, data: &str) -> Write {
        let mut fields = serde_json::Map::new();
        fields.insert("data".into(), serde_json::json!(data));
        Write::Upsert {
            expected_version,
            document: Document::new(fields),
        }
    }

    /// Retry `write` against whichever node currently leads until it stops
    /// failing with `NotLeader`.
    async fn put_via_leader(cluster: &SimCluster, key: &str, write: Write) -> Result<Record, NodeError> {
        for _ in 0..50 {
            let leader = cluster.wait_for_leader().await;
            match cluster.nodes[leader].handle_put(key, write.clone()).await {
                Err(NodeError::NotLeader { .. }) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => return other,
            }
        }
        Err(NodeError::NotLeader { leader: None })
    }

    fn is_prefix(a: &[crate::cluster::LogEntry], b: &[crate::cluster::LogEntry]) -> bool {
        let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        long[..short.len()] == *short
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_elects_exactly_one_leader() {
        let cluster = SimCluster::start(3);
        cluster.wait_for_leader().await;

        let mut history: BTreeMap<u64, HashSet<String>> = BTreeMap::new();
        for _ in 0..100 {
            for (term, leaders) in cluster.leaders_by_term() {
                history.entry(term).or_default().extend(leaders);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for (term, leaders) in &history {
            assert!(leaders.len() <= 1, "term {term} had leaders {leaders:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_create_then_stale_create_mismatches() {
        let cluster = SimCluster::start(3);
        let leader = cluster.wait_for_leader().await;
        let node = &cluster.nodes[leader];

        let created = node.handle_put("u1:/f", upsert(0, "a")).await.unwrap();
        assert_eq!(created.version(), Some(1));
        let err = node.handle_put("u1:/f", upsert(0, "b")).await.unwrap_err();
        assert!(matches!(err, NodeError::VersionMismatch { current: 1, .. }));

        let converged = eventually(Duration::from_secs(2), || {
            cluster
                .nodes
                .iter()
                .all(|n| n.committed_record("u1:/f") == Some(created.clone()))
        })
        .await;
        assert!(converged);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_follower_redirects_without_mutation() {
        let cluster = SimCluster::start(3);
        let leader = cluster.wait_for_leader().await;
        let follower = (leader + 1) % 3;
        assert!(
            eventually(Duration::from_secs(1), || {
                cluster.nodes[follower].status().leader.as_deref()
                    == Some(cluster.nodes[leader].address())
            })
            .await
        );
        let before = cluster.nodes[follower].status().log_len;

        let err = cluster.nodes[follower]
            .handle_put("u1:/f", upsert(0, "a"))
            .await
            .unwrap_err();
        match err {
            NodeError::NotLeader { leader: Some(addr) } => {
                assert_eq!(addr, cluster.nodes[leader].address())
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cluster.nodes[follower].status().log_len, before);
        assert_eq!(cluster.nodes[leader].handle_get("u1:/f").unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_isolated_leader_write_times_out_and_is_discarded() {
        let cluster = SimCluster::start(3);
        let old = cluster.wait_for_leader().await;
        let old_address = cluster.nodes[old].address().to_string();
        let old_term = cluster.nodes[old].status().term;

        cluster.net.isolate(&old_address);
        let err = cluster.nodes[old]
            .handle_put("u1:/lost", upsert(0, "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ReplicationTimeout));

        // The majority side elects a new leader in a later term.
        assert!(
            eventually(Duration::from_secs(3), || {
                cluster.nodes.iter().enumerate().any(|(i, n)| {
                    let s = n.status();
                    i != old && s.role == Role::Leader && s.term > old_term
                })
            })
            .await
        );

        cluster.net.heal(&old_address);
        assert!(
            eventually(Duration::from_secs(3), || {
                let s = cluster.nodes[old].status();
                s.role == Role::Follower && s.term > old_term
            })
            .await
        );
        let new = cluster.wait_for_leader().await;
        let target = cluster.nodes[new].status().commit_idx;
        assert!(
            eventually(Duration::from_secs(3), || {
                cluster.nodes[old].status().commit_idx >= target
            })
            .await
        );

        for node in &cluster.nodes {
            assert_eq!(node.committed_record("u1:/lost"), None);
        }
        assert!(cluster.nodes[old].committed_log().iter().all(|e| !matches!(
            &e.command,
            Command::Write { key, .. } if key == "u1:/lost"
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_committed_logs_share_a_prefix() {
        let cluster = Arc::new(SimCluster::start(3));
        cluster.wait_for_leader().await;

        let mut writers = Vec::new();
        for w in 0..4 {
            let cluster = cluster.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..5 {
                    let key = format!("u{w}:/file-{i}");
                    let _ = put_via_leader(&cluster, &key, upsert(0, "x")).await;
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let logs: Vec<_> = cluster.nodes.iter().map(|n| n.committed_log()).collect();
        for a in &logs {
            for b in &logs {
                assert!(is_prefix(a, b));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_contended_versions_increase_by_one() {
        let cluster = Arc::new(SimCluster::start(3));
        cluster.wait_for_leader().await;
        put_via_leader(&cluster, "u1:/hot", upsert(0, "seed"))
            .await
            .unwrap();

        let mut contenders = Vec::new();
        for c in 0..4 {
            let cluster = cluster.clone();
            contenders.push(tokio::spawn(async move {
                let mut won = Vec::new();
                for _ in 0..8 {
                    let leader = cluster.wait_for_leader().await;
                    let current = match cluster.nodes[leader].handle_get("u1:/hot") {
                        Ok(Some(record)) => record.version().unwrap_or(0),
                        _ => continue,
                    };
                    let write = upsert(current, &format!("c{c}"));
                    if let Ok(record) = cluster.nodes[leader].handle_put("u1:/hot", write).await {
                        won.extend(record.version());
                    }
                }
                won
            }));
        }
        let mut successes = Vec::new();
        for contender in contenders {
            successes.extend(contender.await.unwrap());
        }
        successes.sort_unstable();
        let before_dedup = successes.len();
        successes.dedup();
        assert_eq!(successes.len(), before_dedup, "a version was granted twice");

        let leader = cluster.wait_for_leader().await;
        let versions: Vec<u64> = cluster.nodes[leader]
            .committed_log()
            .iter()
            .filter_map(|e| match &e.command {
                Command::Write { key, version, .. } if key == "u1:/hot" => Some(*version),
                _ => None,
            })
            .collect();
        let expected: Vec<u64> = (1..=versions.len() as u64).collect();
        assert_eq!(versions, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tombstone_is_idempotent_and_create_restarts() {
        let cluster = SimCluster::start(3);
        cluster.wait_for_leader().await;

        put_via_leader(&cluster, "u1:/f", upsert(0, "a")).await.unwrap();
        put_via_leader(&cluster, "u1:/f", upsert(1, "b")).await.unwrap();
        let first = put_via_leader(&cluster, "u1:/f", Write::Delete).await.unwrap();
        let second = put_via_leader(&cluster, "u1:/f", Write::Delete).await.unwrap();
        assert_eq!(first, Record::Tombstone);
        assert_eq!(second, Record::Tombstone);

        let stale = put_via_leader(&cluster, "u1:/f", upsert(2, "c")).await;
        assert!(matches!(stale, Err(NodeError::VersionMismatch { current: 0, .. })));
        let reborn = put_via_leader(&cluster, "u1:/f", upsert(0, "d")).await.unwrap();
        assert_eq!(reborn.version(), Some(1));

        assert!(
            eventually(Duration::from_secs(2), || {
                cluster
                    .nodes
                    .iter()
                    .all(|n| n.committed_record("u1:/f") == Some(reborn.clone()))
            })
            .await
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_node_elects_itself() {
        let cluster = SimCluster::start(1);
        let leader = cluster.wait_for_leader().await;
        assert_eq!(leader, 0);
        let record = cluster.nodes[0]
            .handle_put("u1:/f", upsert(0, "a"))
            .await
            .unwrap();
        assert_eq!(record.version(), Some(1));
    }
}
