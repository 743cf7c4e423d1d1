//! `RaftCore`: the single-threaded, cooperative state machine described in
//! §4.2-§4.6 and §5. One `RaftCore` is spawned per [`crate::raft::Raft`]
//! handle and owns every byte of mutable consensus state; it is never
//! shared behind a `Mutex` — everything else talks to it over channels.

mod append_entries;
pub(crate) mod client;
mod election;
mod install_snapshot;
mod leader;
mod membership;

use crate::config::Config;
use crate::configuration::Configuration;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Log;
use crate::metrics::RaftMetrics;
use crate::metrics::State;
use crate::metrics::Update;
use crate::network::RaftNetwork;
use crate::raft::ClientWriteResponseTx;
use crate::raft::RaftMsg;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use futures::stream::FuturesOrdered;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;

/// What to do with a pending request once its entry is applied or
/// abandoned: reply to an external client, or confirm a barrier.
pub(crate) enum PendingResponder<R: AppDataResponse> {
    ClientWrite(ClientWriteResponseTx<R>),
    Barrier(oneshot::Sender<RaftResult<u64>>),
}

/// A request awaiting application, keyed by the log index it was assigned.
pub(crate) struct PendingRequest<R: AppDataResponse> {
    pub responder: PendingResponder<R>,
}

/// How the leader is currently tracking a single peer's replication
/// progress plus the handle to its background `ReplicationCore` task
/// (§3 "Leader state", §4.3).
pub(crate) struct ReplicationHandle<D: AppData> {
    pub stream: ReplicationStream<D>,
    pub matched: LogId,
    pub last_contact: Option<Instant>,
}

/// Bookkeeping for an in-progress §4.5 "Promote" catch-up sequence.
pub(crate) struct CatchUpState {
    pub target_id: NodeId,
    pub round: u64,
    pub round_target_index: u64,
    pub round_deadline: Instant,
}

/// At most one outstanding membership change may exist at a time (§4.5
/// "At-most-one rule"). This tracks which kind is in flight and the index
/// of its (possibly still uncommitted) CHANGE entry.
pub(crate) enum PendingMembershipChange {
    AddOrRemove { change_index: u64 },
    Promote { change_index: u64, catch_up: CatchUpState },
}

pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) network: Arc<N>,
    pub(crate) storage: Arc<S>,

    pub(crate) target_state: State,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) membership: Configuration,

    pub(crate) log: Log<D>,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: LogId,
    pub(crate) last_stored: u64,

    pub(crate) current_leader: Option<NodeId>,

    /// §3 "Configuration index invariants".
    pub(crate) configuration_index: u64,
    pub(crate) configuration_uncommitted_index: u64,

    pub(crate) last_heartbeat: Option<Instant>,
    pub(crate) next_election_timeout: Option<Instant>,

    pub(crate) snapshot_state: Option<SnapshotState<S::SnapshotData>>,
    pub(crate) snapshot_last_log_id: LogId,

    pub(crate) replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<LogId>>>>,
    pub(crate) has_completed_initial_replication_to_sm: bool,

    pub(crate) pending_requests: BTreeMap<u64, PendingRequest<R>>,

    /// Leader-only: per-peer replication state. Empty unless
    /// `target_state == State::Leader`.
    pub(crate) nodes: BTreeMap<NodeId, ReplicationHandle<D>>,
    pub(crate) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent<S::SnapshotData>, tracing::Span)>,
    pub(crate) replication_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, tracing::Span)>,

    pub(crate) pending_membership_change: Option<PendingMembershipChange>,

    pub(crate) rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    pub(crate) tx_metrics: watch::Sender<RaftMetrics>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,
}

/// Tracks an in-flight snapshot, either one this node is building for
/// itself (§4.3 "start a snapshot") or one it is receiving from a leader
/// (§4.4's InstallSnapshot path), mirroring the teacher's `SnapshotState`.
pub(crate) enum SnapshotState<SD> {
    Snapshotting {
        handle: JoinHandle<anyhow::Result<crate::raft::SnapshotMeta>>,
    },
    Streaming {
        offset: u64,
        id: crate::raft_types::SnapshotId,
        snapshot: Box<SD>,
    },
}

/// Distinguishes "the leader stepped down while we were the one being
/// updated" from an ordinary term-driven leader change, matching the
/// teacher's `UpdateCurrentLeader` split.
pub(crate) enum UpdateCurrentLeader {
    ThisNode,
    OtherNode(NodeId),
    Unknown,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        let this = Self {
            id,
            config,
            network,
            storage,
            target_state: State::Unavailable,
            current_term: 0,
            voted_for: None,
            membership: Configuration::empty(),
            log: Log::new(),
            commit_index: 0,
            last_applied: LogId::default(),
            last_stored: 0,
            current_leader: None,
            configuration_index: 0,
            configuration_uncommitted_index: 0,
            last_heartbeat: None,
            next_election_timeout: None,
            snapshot_state: None,
            snapshot_last_log_id: LogId::default(),
            replicate_to_sm_handle: FuturesOrdered::new(),
            has_completed_initial_replication_to_sm: false,
            pending_requests: BTreeMap::new(),
            nodes: BTreeMap::new(),
            replication_rx,
            replication_tx,
            pending_membership_change: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn main(mut self) -> RaftResult<()> {
        let state = self
            .storage
            .get_initial_state()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership;
        self.last_applied = state.last_applied_log;
        self.commit_index = state.last_applied_log.index;
        self.last_stored = state.last_log_id.index;
        self.snapshot_last_log_id = state.last_applied_log;
        self.log.restore(state.last_applied_log);
        self.update_membership_bookkeeping();

        if self.membership.voter_count() == 0 {
            self.set_target_state(State::Unavailable);
        } else {
            self.set_target_state(State::Follower);
        }
        self.report_metrics(Update::Update);

        loop {
            match self.target_state {
                State::Unavailable => self.run_unavailable().await?,
                State::Follower | State::Candidate => self.run_follower_or_candidate().await?,
                State::Leader => self.run_leader().await?,
                State::Shutdown => return Ok(()),
            }
        }
    }

    async fn run_unavailable(&mut self) -> RaftResult<()> {
        tokio::select! {
            _ = &mut self.rx_shutdown => self.set_target_state(State::Shutdown),
            msg = self.rx_api.recv() => match msg {
                Some(msg) => self.dispatch_api_msg(msg).await?,
                None => self.set_target_state(State::Shutdown),
            },
        }
        Ok(())
    }

    /// Dispatches one message from the public API. Request kinds which only
    /// make sense for a particular role (client writes, membership changes)
    /// reject with `RaftError::NotLeader`/`Shutdown` outside of that role,
    /// per §7 "client-programming errors surface synchronously ... without
    /// mutating core state".
    #[tracing::instrument(level = "trace", skip(self, msg))]
    pub(crate) async fn dispatch_api_msg(&mut self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let res = self.handle_append_entries_request(rpc).await;
                let _ = tx.send(res);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let res = self.handle_vote_request(rpc).await;
                let _ = tx.send(res);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let res = self.handle_install_snapshot_request(rpc).await;
                let _ = tx.send(res);
            }
            RaftMsg::ClientWrite { payload, tx } => {
                self.handle_client_write_request(payload, tx).await;
            }
            RaftMsg::ClientBarrier { tx } => {
                self.handle_client_barrier_request(tx).await;
            }
            RaftMsg::Initialize { members, tx } => {
                let res = self.handle_initialize(members).await;
                let _ = tx.send(res);
            }
            RaftMsg::AddMember { id, address, tx } => {
                let res = self.handle_add_member(id, address).await;
                let _ = tx.send(res);
            }
            RaftMsg::PromoteMember { id, tx } => {
                let res = self.handle_promote_member(id).await;
                let _ = tx.send(res);
            }
            RaftMsg::RemoveMember { id, tx } => {
                let res = self.handle_remove_member(id).await;
                let _ = tx.send(res);
            }
            RaftMsg::CurrentLeader { tx } => {
                let _ = tx.send(self.current_leader);
            }
            RaftMsg::Tick => {
                self.tick().await?;
            }
        }
        Ok(())
    }

    /// The tick dispatcher of §4.6, invoked once per `heartbeat_interval`
    /// by the embedder. Idempotent under duplicate calls: every check below
    /// is a monotonic-time comparison, not an edge trigger.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn tick(&mut self) -> RaftResult<()> {
        match self.target_state {
            State::Follower | State::Candidate => {
                if self.election_timed_out() {
                    self.become_candidate().await?;
                }
            }
            State::Leader => {
                self.leader_tick().await?;
            }
            State::Unavailable | State::Shutdown => {}
        }
        self.trigger_log_compaction_if_needed().await?;
        self.client_apply_pipeline_tick().await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn set_target_state(&mut self, state: State) {
        if state == State::Follower && self.membership.voter_count() == 1 && self.membership.contains(self.id) {
            // Sole voter: fast-path straight to leader via an implicit
            // candidacy, per §4.2 "start → FOLLOWER (unless sole voter)".
            self.target_state = State::Candidate;
        } else {
            self.target_state = state;
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn update_next_election_timeout(&mut self, reset: bool) {
        if reset || self.next_election_timeout.is_none() {
            let timeout = rand::Rng::gen_range(
                &mut rand::thread_rng(),
                self.config.election_timeout_min..self.config.election_timeout_max,
            );
            self.next_election_timeout = Some(Instant::now() + Duration::from_millis(timeout));
        }
    }

    pub(crate) fn election_timed_out(&self) -> bool {
        match self.next_election_timeout {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn update_current_term(&mut self, term: u64, voted_for: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = voted_for;
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        self.current_leader = match update {
            UpdateCurrentLeader::ThisNode => Some(self.id),
            UpdateCurrentLeader::OtherNode(id) => Some(id),
            UpdateCurrentLeader::Unknown => None,
        };
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = crate::storage::HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    pub(crate) fn map_fatal_storage_error(&self, err: anyhow::Error) -> RaftError {
        tracing::error!(error = %err, "fatal storage error, node will shut down");
        RaftError::Fatal(err.to_string())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn report_metrics(&self, _update: Update) {
        let metrics = RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_id: self.log.last_log_id(),
            last_applied: self.last_applied.index,
            commit_index: self.commit_index,
            current_leader: self.current_leader,
            membership: self.membership.clone(),
        };
        let _ = self.tx_metrics.send(metrics);
    }

    /// Reconciles `configuration_index`/`configuration_uncommitted_index`
    /// with the log's most recent CHANGE entry (§3). Called after loading
    /// from storage and after any truncation.
    pub(crate) fn update_membership_bookkeeping(&mut self) {
        if let Some(entry) = self.log.last_configuration_entry() {
            if entry.log_id.index <= self.commit_index {
                self.configuration_index = entry.log_id.index;
                self.configuration_uncommitted_index = 0;
            } else {
                self.configuration_uncommitted_index = entry.log_id.index;
            }
        }
    }

    /// Applies a newly observed [`Configuration`] (from a log append,
    /// AppendEntries or snapshot install) to in-memory state (§4.4
    /// `append_log_entries`, §4.5).
    pub(crate) fn update_membership(&mut self, membership: Configuration) {
        self.membership = membership;
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.target_state.is_leader()
    }
}
