//! Leader-side per-peer replication (§4.3): one `ReplicationCore` task per
//! peer, driven by events pushed from `RaftCore` (new local append,
//! heartbeat tick, catch-up step) and reporting back match-index
//! advancement, term races and snapshot needs.

use crate::config::Config;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;

/// Per-peer replication mode (§3, §4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressState {
    /// Exploring for the match point: send one entry (or an empty
    /// heartbeat) at a time, do not advance `next_index` until a reply
    /// arrives.
    Probe,
    /// Streaming entries in batches, advancing `next_index` optimistically
    /// ahead of acknowledgement.
    Pipeline,
    /// A snapshot transfer is in flight; AppendEntries is suppressed except
    /// for heartbeats.
    Snapshot,
}

/// The leader's view of one peer's replication state (§3 "Leader state").
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    pub state: ProgressState,
    pub next_index: u64,
    pub match_index: u64,
    pub snapshot_index: u64,
    pub last_send: Option<Instant>,
    pub recent_recv: bool,
}

impl Progress {
    pub fn new(next_index: u64) -> Self {
        Self {
            state: ProgressState::Probe,
            next_index,
            match_index: 0,
            snapshot_index: 0,
            last_send: None,
            recent_recv: false,
        }
    }
}

/// Events `RaftCore` pushes down to a peer's `ReplicationCore` task. No
/// entry payloads travel over this channel — the replication task reads
/// entries directly from storage by index, the same store the leader
/// itself appended to.
pub(crate) enum RaftEvent {
    /// A new entry was appended locally, or a heartbeat/catch-up tick fired;
    /// re-evaluate what to send this peer.
    Replicate { last_log_index: u64 },
    UpdateCommitIndex { commit_index: u64 },
    Terminate,
}

/// Events reported back up to `RaftCore` from a peer's replication task.
pub(crate) enum ReplicaEvent<SD> {
    UpdateMatchIndex { target: NodeId, match_index: u64 },
    /// Any response (accepted or rejected) was received from `target`;
    /// used to detect majority-contact-loss (§4.2, §4.6) independent of
    /// whether the peer is caught up.
    Contact { target: NodeId },
    RevertToFollower { term: u64 },
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<Option<Snapshot<SD>>>,
    },
    Shutdown { target: NodeId },
}

/// A handle to a running per-peer replication task.
pub struct ReplicationStream<D: AppData> {
    repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
    _marker: std::marker::PhantomData<D>,
}

impl<D: AppData> ReplicationStream<D> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<R, N, S>(
        leader_id: NodeId,
        target: NodeId,
        term: u64,
        next_index: u64,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        core_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    ) -> Self
    where
        R: AppDataResponse,
        N: RaftNetwork<D>,
        S: RaftStorage<D, R>,
    {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let core = ReplicationCore {
            leader_id,
            target,
            term,
            progress: Progress::new(next_index),
            config,
            network,
            storage,
            repl_rx,
            core_tx,
            last_log_index: next_index.saturating_sub(1),
            commit_index: 0,
        };
        tokio::spawn(core.main());
        Self {
            repl_tx,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn replicate(&self, last_log_index: u64) {
        let _ = self.repl_tx.send((RaftEvent::Replicate { last_log_index }, Span::current()));
    }

    pub fn update_commit_index(&self, commit_index: u64) {
        let _ = self.repl_tx.send((RaftEvent::UpdateCommitIndex { commit_index }, Span::current()));
    }

    pub fn terminate(&self) {
        let _ = self.repl_tx.send((RaftEvent::Terminate, Span::current()));
    }
}

struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    leader_id: NodeId,
    target: NodeId,
    term: u64,
    progress: Progress,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,
    core_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    last_log_index: u64,
    commit_index: u64,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    #[tracing::instrument(level = "trace", skip(self), fields(target = self.target))]
    async fn main(mut self) {
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval);
        loop {
            let wait = tokio::time::sleep(heartbeat);
            tokio::select! {
                _ = wait => {}
                msg = self.repl_rx.recv() => {
                    match msg {
                        Some((RaftEvent::Replicate { last_log_index }, _span)) => {
                            self.last_log_index = last_log_index;
                        }
                        Some((RaftEvent::UpdateCommitIndex { commit_index }, _span)) => {
                            self.commit_index = commit_index;
                        }
                        Some((RaftEvent::Terminate, _span)) | None => return,
                    }
                }
            }
            if let Err(()) = self.send_append_entries().await {
                return;
            }
        }
    }

    /// Builds and sends one AppendEntries (or InstallSnapshot) according to
    /// the peer's current `ProgressState` (§4.3 "Per-peer send decision"),
    /// then applies §4.3 "Result handling" to the response.
    async fn send_append_entries(&mut self) -> Result<(), ()> {
        if self.progress.next_index > self.last_log_index && self.progress.last_send.map_or(true, |t| {
            t.elapsed() < Duration::from_millis(self.config.heartbeat_interval)
        }) && self.progress.last_send.is_some()
        {
            // Nothing new and the heartbeat interval hasn't elapsed yet.
            return Ok(());
        }

        match self.progress.state {
            ProgressState::Snapshot => {
                self.send_heartbeat().await;
                return Ok(());
            }
            ProgressState::Probe => self.send_probe_or_heartbeat().await,
            ProgressState::Pipeline => self.send_pipeline_batch().await,
        }
    }

    async fn prev_log_id_for(&self, index: u64) -> Option<LogId> {
        if index == 0 {
            return Some(LogId::default());
        }
        self.storage.try_get_log_entry(index).await.ok().flatten().map(|e| e.log_id)
    }

    async fn entries_in_range(&self, start: u64, stop: u64) -> Vec<Entry<D>> {
        self.storage.get_log_entries(start..stop).await.unwrap_or_default()
    }

    async fn send_probe_or_heartbeat(&mut self) -> Result<(), ()> {
        let next = self.progress.next_index;
        let entries = if next > self.last_log_index {
            Vec::new()
        } else {
            self.entries_in_range(next, next + 1).await
        };
        self.dispatch(next.saturating_sub(1), entries).await
    }

    async fn send_pipeline_batch(&mut self) -> Result<(), ()> {
        let next = self.progress.next_index;
        let window = self.config.max_payload_entries;
        let stop = (next + window).min(self.last_log_index + 1);
        let entries = if next > self.last_log_index {
            Vec::new()
        } else {
            self.entries_in_range(next, stop).await
        };
        let highest_sent = entries.last().map(|e| e.log_id.index).unwrap_or(next.saturating_sub(1));
        self.progress.next_index = highest_sent + 1;
        self.dispatch(next.saturating_sub(1), entries).await
    }

    async fn send_heartbeat(&mut self) {
        let prev = self.progress.next_index.saturating_sub(1);
        let _ = self.dispatch(prev, Vec::new()).await;
    }

    async fn dispatch(&mut self, prev_index: u64, entries: Vec<Entry<D>>) -> Result<(), ()> {
        let prev_log_id = match self.prev_log_id_for(prev_index).await {
            Some(id) => id,
            None => {
                // The leader's log no longer holds `prev_index`: it has been
                // snapshotted away. Fall back to a snapshot transfer (§4.3
                // "Prev-log fields").
                self.transition_to_snapshot().await;
                return Ok(());
            }
        };
        let last_sent = entries.last().map(|e| e.log_id.index).unwrap_or(prev_index);
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.leader_id,
            prev_log_id,
            entries,
            leader_commit: self.commit_index,
        };
        self.progress.last_send = Some(Instant::now());
        match self.network.send_append_entries(self.target, rpc).await {
            Ok(resp) => self.handle_response(resp, last_sent).await,
            Err(err) => {
                tracing::debug!(target = self.target, error = %err, "AppendEntries send failed");
                Ok(())
            }
        }
    }

    async fn handle_response(&mut self, resp: crate::raft::AppendEntriesResponse, last_sent: u64) -> Result<(), ()> {
        if resp.term > self.term {
            let _ = self
                .core_tx
                .send((ReplicaEvent::RevertToFollower { term: resp.term }, Span::current()));
            return Err(());
        }

        self.progress.recent_recv = true;
        let _ = self
            .core_tx
            .send((ReplicaEvent::Contact { target: self.target }, Span::current()));

        if resp.is_success() {
            self.progress.match_index = self.progress.match_index.max(last_sent);
            self.progress.next_index = self.progress.match_index + 1;
            if self.progress.state == ProgressState::Probe {
                self.progress.state = ProgressState::Pipeline;
            }
            let _ = self.core_tx.send((
                ReplicaEvent::UpdateMatchIndex {
                    target: self.target,
                    match_index: self.progress.match_index,
                },
                Span::current(),
            ));
        } else {
            self.progress.state = ProgressState::Probe;
            self.progress.next_index = self.progress.next_index.saturating_sub(1).min(resp.last_log_index + 1);
        }
        Ok(())
    }

    /// Moves this peer into SNAPSHOT state and asks `RaftCore` for a
    /// current snapshot to stream (§4.3 scenario 5). The actual chunked
    /// transfer is driven by `RaftCore::drive_snapshot_stream` once it
    /// receives the snapshot handle.
    async fn transition_to_snapshot(&mut self) {
        self.progress.state = ProgressState::Snapshot;
        let (tx, rx) = oneshot::channel();
        let _ = self
            .core_tx
            .send((ReplicaEvent::NeedsSnapshot { target: self.target, tx }, Span::current()));
        if let Ok(Some(snapshot)) = rx.await {
            self.stream_snapshot(snapshot).await;
        }
    }

    async fn stream_snapshot(&mut self, snapshot: Snapshot<S::SnapshotData>) {
        use tokio::io::AsyncReadExt;
        let Snapshot { meta, mut snapshot } = snapshot;
        let chunk_size = self.config.snapshot_max_chunk_size as usize;
        let mut offset = 0u64;
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = match snapshot.as_mut().read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(target = self.target, error = %err, "snapshot read failed");
                    return;
                }
            };
            let done = n == 0;
            let rpc = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.leader_id,
                meta: meta.clone(),
                offset,
                data: buf[..n].to_vec(),
                done,
            };
            match self.network.send_install_snapshot(self.target, rpc).await {
                Ok(resp) if resp.term > self.term => {
                    let _ = self
                        .core_tx
                        .send((ReplicaEvent::RevertToFollower { term: resp.term }, Span::current()));
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target = self.target, error = %err, "InstallSnapshot send failed");
                    return;
                }
            }
            offset += n as u64;
            if done {
                break;
            }
        }
        self.progress.state = ProgressState::Probe;
        self.progress.match_index = meta.last_log_id.index;
        self.progress.next_index = meta.last_log_id.index + 1;
        self.progress.snapshot_index = meta.last_log_id.index;
        let _ = self.core_tx.send((
            ReplicaEvent::UpdateMatchIndex {
                target: self.target,
                match_index: self.progress.match_index,
            },
            Span::current(),
        ));
    }
}
