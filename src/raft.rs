//! The public `Raft` handle and the wire message types it exchanges with
//! peers (§6).

use crate::config::Config;
use crate::configuration::Configuration;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::raft_types::SnapshotId;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use serde::Deserialize;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------
// Wire message bodies (§6)
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_id: LogId) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index: last_log_id.index,
            last_log_term: last_log_id.term,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// The payload an [`Entry`] carries (§3). `Barrier` entries never reach the
/// FSM; `Change` entries carry a new [`Configuration`] and are intercepted
/// by the membership subsystem (§4.5) rather than applied as business data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    Command(D),
    Barrier,
    Change(Configuration),
}

/// A single log entry: a term/index pair plus its payload (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    pub payload: EntryPayload<D>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_id: LogId,
    pub entries: Vec<Entry<D>>,
    pub leader_commit: u64,
}

/// §6: `rejected` is the rejected `prev_log_index` (zero means accepted,
/// since index 0 can never be a legitimate rejection target), and
/// `last_log_index` is always the responder's hint for fast back-off (§4.3
/// scenario 4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub rejected: u64,
    pub last_log_index: u64,
}

impl AppendEntriesResponse {
    pub fn is_success(&self) -> bool {
        self.rejected == 0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_log_id: LogId,
    pub membership: Configuration,
    pub snapshot_id: SnapshotId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

// ---------------------------------------------------------------------
// Client-facing request/response types
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    pub payload: D,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub index: u64,
    pub result: R,
}

pub type ClientWriteResponseTx<R> = oneshot::Sender<RaftResult<ClientWriteResponse<R>>>;
pub type ClientWriteResponseRx<R> = oneshot::Receiver<RaftResult<ClientWriteResponse<R>>>;

pub(crate) type ResponseTx = oneshot::Sender<RaftResult<()>>;

/// The internal channel of commands accepted by [`RaftCore`]'s main loop;
/// constructing one of these and sending it over `tx_api` is how every
/// public method on [`Raft`] actually talks to the core.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    ClientWrite {
        payload: D,
        tx: ClientWriteResponseTx<R>,
    },
    ClientBarrier {
        tx: oneshot::Sender<RaftResult<u64>>,
    },
    Initialize {
        members: Configuration,
        tx: ResponseTx,
    },
    AddMember {
        id: NodeId,
        address: String,
        tx: ResponseTx,
    },
    PromoteMember {
        id: NodeId,
        tx: ResponseTx,
    },
    RemoveMember {
        id: NodeId,
        tx: ResponseTx,
    },
    CurrentLeader {
        tx: oneshot::Sender<Option<NodeId>>,
    },
    Tick,
}

/// The public handle to a running Raft node. Cloning it is cheap: it is a
/// thin wrapper over channels into the [`RaftCore`] task that owns all
/// mutable consensus state, matching the teacher's `Raft`/`RaftInner` split.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: tokio::sync::Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: tokio::sync::Mutex<Option<oneshot::Sender<()>>>,
    marker_n: PhantomData<N>,
    marker_s: PhantomData<S>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Spawns a new [`RaftCore`] task and returns a handle to it. The node
    /// starts in `State::Unavailable`; call [`Raft::initialize`] (fresh
    /// cluster) or rely on `storage`'s persisted state (restart) to reach
    /// `Follower`.
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: tokio::sync::Mutex::new(Some(raft_handle)),
            tx_shutdown: tokio::sync::Mutex::new(Some(tx_shutdown)),
            marker_n: PhantomData,
            marker_s: PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    async fn send(&self, msg: RaftMsg<D, R>) {
        // An unbounded_send error means the core task has already exited;
        // callers observe this as their response channel being dropped, so
        // silently discarding the send mirrors the teacher's own handling.
        let _ = self.inner.tx_api.send(msg);
    }

    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::AppendEntries { rpc, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::RequestVote { rpc, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::InstallSnapshot { rpc, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::CurrentLeader { tx }).await;
        rx.await.unwrap_or(None)
    }

    /// Submits `payload` for replication (§4.1 `append`, §4.3 client request
    /// completion). Resolves once the entry has been applied, or with an
    /// error if it could not be (not leader, leadership lost, shutdown).
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn client_write(&self, payload: D) -> RaftResult<ClientWriteResponse<R>> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ClientWrite { payload, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Issues a BARRIER entry and waits for it to commit and apply,
    /// confirming every prior write on this leader is durable and visible
    /// (§3 log entry types, §4.3 apply pipeline).
    pub async fn client_barrier(&self) -> RaftResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ClientBarrier { tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Bootstraps a brand-new cluster with `members` (§3 `bootstrap`, §8
    /// scenario 1). Only valid on a pristine node.
    pub async fn initialize(&self, members: Configuration) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::Initialize { members, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// §4.5 "Add": inserts `id` as a new non-voting member.
    pub async fn add_member(&self, id: NodeId, address: String) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::AddMember { id, address, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// §4.5 "Promote": starts the bounded catch-up sequence for `id` and
    /// resolves once that has been accepted. The CHANGE entry marking it
    /// voting is appended later, once catch-up actually converges; watch
    /// [`Raft::metrics`] to observe that happening.
    pub async fn promote_member(&self, id: NodeId) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::PromoteMember { id, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// §4.5 "Remove".
    pub async fn remove_member(&self, id: NodeId) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::RemoveMember { id, tx }).await;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Drives one tick of §4.6's dispatcher. The embedder's I/O backend is
    /// expected to call this roughly every `heartbeat_interval`
    /// milliseconds; the handler is idempotent under duplicate or early
    /// calls (§4.6).
    pub async fn tick(&self) {
        self.send(RaftMsg::Tick).await;
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Requests a graceful shutdown (§5 "Cancellation") and waits for the
    /// core task to finish draining.
    pub async fn shutdown(&self) -> RaftResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            match handle.await {
                Ok(res) => res,
                Err(_) => Err(RaftError::Shutdown),
            }
        } else {
            Ok(())
        }
    }
}
