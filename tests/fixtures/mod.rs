//! In-memory storage, transport and convergence-polling harness used by the
//! integration tests in this directory. Not part of the published crate;
//! grounded on the teacher's own `RaftRouter`/`MemStore` test fixtures,
//! generalized to this crate's single-`Configuration` membership model.

#![allow(dead_code)]

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use little_raft_core::config::Config;
use little_raft_core::configuration::Configuration;
use little_raft_core::network::RaftNetwork;
use little_raft_core::raft::AppendEntriesRequest;
use little_raft_core::raft::AppendEntriesResponse;
use little_raft_core::raft::Entry;
use little_raft_core::raft::EntryPayload;
use little_raft_core::raft::InstallSnapshotRequest;
use little_raft_core::raft::InstallSnapshotResponse;
use little_raft_core::raft::SnapshotMeta;
use little_raft_core::raft::VoteRequest;
use little_raft_core::raft::VoteResponse;
use little_raft_core::storage::HardState;
use little_raft_core::storage::InitialState;
use little_raft_core::storage::RaftStorage;
use little_raft_core::storage::Snapshot;
use little_raft_core::LogId;
use little_raft_core::NodeId;
use little_raft_core::Raft;
use little_raft_core::RaftMetrics;
use little_raft_core::State;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context as TaskContext;
use std::task::Poll;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// The application payload this harness exercises the core with: a command
/// string applied to an append-only log state machine.
pub type TestData = String;
/// The index of the state machine entry each command produced.
pub type TestResponse = u64;
pub type MemRaft = Raft<TestData, TestResponse, RaftRouter, MemStore>;

// ---------------------------------------------------------------------
// MemStore: an in-memory `RaftStorage` impl.
// ---------------------------------------------------------------------

struct MemStoreState {
    log: BTreeMap<u64, Entry<TestData>>,
    hard_state: HardState,
    last_applied: LogId,
    state_machine: Vec<TestData>,
    snapshot: Option<(SnapshotMeta, Vec<u8>)>,
}

/// A `tokio::io::{AsyncRead,AsyncWrite,AsyncSeek}` handle backed by a plain
/// `Vec<u8>`, standing in for the file/segment handle a real storage engine
/// would hand back for snapshot transfer.
#[derive(Debug, Default)]
pub struct MemSnapshot {
    data: Vec<u8>,
    position: u64,
}

impl AsyncRead for MemSnapshot {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let pos = this.position as usize;
        if pos >= this.data.len() {
            return Poll::Ready(Ok(()));
        }
        let n = buf.remaining().min(this.data.len() - pos);
        buf.put_slice(&this.data[pos..pos + n]);
        this.position += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemSnapshot {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let pos = this.position as usize;
        if pos + buf.len() > this.data.len() {
            this.data.resize(pos + buf.len(), 0);
        }
        this.data[pos..pos + buf.len()].copy_from_slice(buf);
        this.position += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemSnapshot {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let new_pos = match position {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(p) => this.data.len() as i64 + p,
            SeekFrom::Current(p) => this.position as i64 + p,
        };
        this.position = new_pos.max(0) as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

pub struct MemStore {
    id: NodeId,
    initial_membership: Configuration,
    state: RwLock<MemStoreState>,
}

impl MemStore {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            initial_membership: Configuration::new_initial(id, format!("node-{}", id)),
            state: RwLock::new(MemStoreState {
                log: BTreeMap::new(),
                hard_state: HardState::default(),
                last_applied: LogId::default(),
                state_machine: Vec::new(),
                snapshot: None,
            }),
        }
    }

    /// Test-only introspection of the applied state machine contents.
    pub async fn applied_commands(&self) -> Vec<TestData> {
        self.state.read().await.state_machine.clone()
    }
}

#[async_trait::async_trait]
impl RaftStorage<TestData, TestResponse> for MemStore {
    type SnapshotData = MemSnapshot;
    type ShutdownError = std::convert::Infallible;

    async fn get_membership_config(&self) -> Result<Configuration> {
        let state = self.state.read().await;
        for entry in state.log.values().rev() {
            if let EntryPayload::Change(conf) = &entry.payload {
                return Ok(conf.clone());
            }
        }
        Ok(self.initial_membership.clone())
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let state = self.state.read().await;
        let last_log_id = state.log.values().last().map(|e| e.log_id).unwrap_or_default();
        drop(state);
        let membership = self.get_membership_config().await?;
        let state = self.state.read().await;
        Ok(InitialState {
            last_log_id,
            last_applied_log: state.last_applied,
            hard_state: state.hard_state.clone(),
            membership,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        self.state.write().await.hard_state = hs.clone();
        Ok(())
    }

    async fn get_log_entries<RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<TestData>>> {
        let state = self.state.read().await;
        Ok(state.log.range(range).map(|(_, e)| e.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<TestData>>> {
        Ok(self.state.read().await.log.get(&log_index).cloned())
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        Ok(self.state.read().await.log.values().last().map(|e| e.log_id).unwrap_or_default())
    }

    async fn delete_logs_from<RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let keys: Vec<u64> = state.log.range(range).map(|(k, _)| *k).collect();
        for k in keys {
            state.log.remove(&k);
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<TestData>]) -> Result<()> {
        let mut state = self.state.write().await;
        for entry in entries {
            state.log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<TestData>]) -> Result<Vec<TestResponse>> {
        let mut state = self.state.write().await;
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            if let EntryPayload::Command(cmd) = &entry.payload {
                state.state_machine.push(cmd.clone());
            }
            state.last_applied = entry.log_id;
            results.push(state.state_machine.len() as u64);
        }
        Ok(results)
    }

    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let mut state = self.state.write().await;
        let data = serde_json::to_vec(&state.state_machine)?;
        let membership = {
            drop(state);
            let m = self.get_membership_config().await?;
            state = self.state.write().await;
            m
        };
        let meta = SnapshotMeta {
            last_log_id: state.last_applied,
            membership,
            snapshot_id: format!("{}-{}", state.last_applied.term, state.last_applied.index),
        };
        state.snapshot = Some((meta.clone(), data.clone()));
        Ok(Snapshot {
            meta,
            snapshot: Box::new(MemSnapshot { data, position: 0 }),
        })
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(MemSnapshot::default()))
    }

    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()> {
        let mut state = self.state.write().await;
        let stale: Vec<u64> = state.log.range(..=meta.last_log_id.index).map(|(k, _)| *k).collect();
        for k in stale {
            state.log.remove(&k);
        }
        state.last_applied = meta.last_log_id;
        if let Ok(sm) = serde_json::from_slice::<Vec<TestData>>(&snapshot.data) {
            state.state_machine = sm;
        }
        state.snapshot = Some((meta.clone(), snapshot.data));
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        let state = self.state.read().await;
        Ok(state.snapshot.clone().map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(MemSnapshot { data, position: 0 }),
        }))
    }
}

// ---------------------------------------------------------------------
// RaftRouter: an in-process `RaftNetwork` that dispatches by looking the
// target up in a shared routing table, simulating a transport.
// ---------------------------------------------------------------------

struct RegisteredNode {
    raft: MemRaft,
    storage: Arc<MemStore>,
    ticker: JoinHandle<()>,
}

pub struct RaftRouter {
    config: Arc<Config>,
    routing_table: RwLock<BTreeMap<NodeId, RegisteredNode>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            routing_table: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
        })
    }

    /// Creates a new node, registers it, and starts a background task
    /// calling `tick()` on it every `heartbeat_interval` — standing in for
    /// the embedder's I/O-backend tick driver (§4.6).
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let storage = Arc::new(MemStore::new(id));
        let raft = Raft::new(id, self.config.clone(), self.clone(), storage.clone());
        let ticking = raft.clone();
        let interval = Duration::from_millis(self.config.heartbeat_interval);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                ticking.tick().await;
            }
        });
        self.routing_table.write().await.insert(id, RegisteredNode { raft, storage, ticker });
    }

    pub async fn remove_node(&self, id: NodeId) {
        if let Some(node) = self.routing_table.write().await.remove(&id) {
            node.ticker.abort();
        }
        self.isolated.write().await.remove(&id);
    }

    pub async fn raft(&self, id: NodeId) -> MemRaft {
        self.routing_table.read().await.get(&id).expect("node registered").raft.clone()
    }

    pub async fn storage(&self, id: NodeId) -> Arc<MemStore> {
        self.routing_table.read().await.get(&id).expect("node registered").storage.clone()
    }

    pub async fn initialize_from_single_node(&self, node: NodeId) -> Result<()> {
        let rt = self.routing_table.read().await;
        let ids: BTreeSet<NodeId> = rt.keys().copied().collect();
        let target = rt.get(&node).ok_or_else(|| anyhow!("node {} not registered", node))?;
        let mut first = None;
        let mut members = Configuration::empty();
        for id in ids {
            if first.is_none() {
                first = Some(id);
                members = Configuration::new_initial(id, format!("node-{}", id));
            } else {
                members = members.with_added(id, format!("node-{}", id))?;
                members = members.with_promoted(id)?;
            }
        }
        target.raft.initialize(members).await?;
        Ok(())
    }

    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    pub async fn restore_node(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut out = Vec::with_capacity(rt.len());
        for node in rt.values() {
            out.push(node.raft.metrics().borrow().clone());
        }
        out
    }

    pub async fn wait(&self, id: NodeId, timeout: Duration) -> Wait {
        let rx = self.routing_table.read().await.get(&id).expect("node registered").raft.metrics();
        Wait { rx, timeout }
    }

    pub async fn wait_for_state(&self, ids: &BTreeSet<NodeId>, want: State, timeout: Duration, msg: &str) -> Result<()> {
        for id in ids {
            self.wait(*id, timeout).await.state(want, msg).await?;
        }
        Ok(())
    }

    pub async fn wait_for_log(&self, ids: &BTreeSet<NodeId>, want_index: u64, timeout: Duration, msg: &str) -> Result<()> {
        for id in ids {
            self.wait(*id, timeout).await.log(want_index, msg).await?;
        }
        Ok(())
    }

    pub async fn client_write(&self, target: NodeId, payload: TestData) -> Result<TestResponse> {
        let raft = self.raft(target).await;
        Ok(raft.client_write(payload).await?.result)
    }

    pub async fn add_member(&self, target: NodeId, id: NodeId, address: String) -> Result<()> {
        self.raft(target).await.add_member(id, address).await?;
        Ok(())
    }

    pub async fn promote_member(&self, target: NodeId, id: NodeId) -> Result<()> {
        self.raft(target).await.promote_member(id).await?;
        Ok(())
    }

    pub async fn remove_member(&self, target: NodeId, id: NodeId) -> Result<()> {
        self.raft(target).await.remove_member(id).await?;
        Ok(())
    }

    pub async fn current_leader(&self, ids: &BTreeSet<NodeId>) -> Option<NodeId> {
        for id in ids {
            if let Some(leader) = self.raft(*id).await.current_leader().await {
                return Some(leader);
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl RaftNetwork<TestData> for RaftRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<TestData>) -> anyhow::Result<AppendEntriesResponse> {
        if self.isolated.read().await.contains(&target) {
            return Err(anyhow!("node {} is isolated", target));
        }
        let raft = self.raft(target).await;
        raft.append_entries(rpc).await.map_err(Into::into)
    }

    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> anyhow::Result<InstallSnapshotResponse> {
        if self.isolated.read().await.contains(&target) {
            return Err(anyhow!("node {} is isolated", target));
        }
        let raft = self.raft(target).await;
        raft.install_snapshot(rpc).await.map_err(Into::into)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse> {
        if self.isolated.read().await.contains(&target) {
            return Err(anyhow!("node {} is isolated", target));
        }
        let raft = self.raft(target).await;
        raft.vote(rpc).await.map_err(Into::into)
    }
}

// ---------------------------------------------------------------------
// Wait: polls a node's metrics watch channel until a predicate holds.
// ---------------------------------------------------------------------

pub struct Wait {
    rx: watch::Receiver<RaftMetrics>,
    timeout: Duration,
}

impl Wait {
    pub async fn metrics<T: Fn(&RaftMetrics) -> bool>(&mut self, func: T, msg: &str) -> Result<RaftMetrics> {
        let mut rx = self.rx.clone();
        let poll = async {
            loop {
                let m = rx.borrow().clone();
                if func(&m) {
                    return m;
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };
        tokio::time::timeout(self.timeout, poll).await.with_context(|| format!("timed out waiting for: {}", msg))
    }

    pub async fn state(&mut self, want: State, msg: &str) -> Result<RaftMetrics> {
        self.metrics(move |m| m.state == want, msg).await
    }

    pub async fn log(&mut self, want_index: u64, msg: &str) -> Result<RaftMetrics> {
        self.metrics(move |m| m.last_log_id.index >= want_index, msg).await
    }
}

/// A cluster of `n` freshly registered, not-yet-initialized nodes `1..=n`,
/// using the default timing configuration.
pub async fn new_cluster(n: u64) -> Arc<RaftRouter> {
    let config = Arc::new(Config::build().validate().expect("default config is valid"));
    new_cluster_with_config(n, config).await
}

/// As [`new_cluster`], but with a caller-supplied configuration — tests that
/// need a short election timeout or a low snapshot threshold use this.
pub async fn new_cluster_with_config(n: u64, config: Arc<Config>) -> Arc<RaftRouter> {
    let router = RaftRouter::new(config);
    for id in 1..=n {
        router.new_raft_node(id).await;
    }
    router
}

/// `ids` as a `BTreeSet`, for passing to `wait_for_state`/`wait_for_log`.
pub fn ids(range: std::ops::RangeInclusive<u64>) -> BTreeSet<NodeId> {
    range.collect()
}
