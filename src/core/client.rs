//! Client-facing request handling: `apply`/`barrier`/`initialize`, turning
//! payloads into log entries, and the apply pipeline that feeds committed
//! entries to the FSM and completes pending requests in log-index order
//! (§4.3 "Apply pipeline", "Client request completion").

use crate::configuration::Configuration;
use crate::core::PendingRequest;
use crate::core::PendingResponder;
use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::State;
use crate::metrics::Update;
use crate::network::RaftNetwork;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft_types::LogId;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::Instrument;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handles a client `apply` request (§3 "Client request completion").
    /// Only valid on the leader; the entry is appended and handed to
    /// replication, and `tx` fires once its index has been applied.
    #[tracing::instrument(level = "trace", skip(self, payload, tx))]
    pub(crate) async fn handle_client_write_request(&mut self, payload: D, tx: ClientWriteResponseTx<R>) {
        if !self.is_leader() {
            let _ = tx.send(Err(RaftError::NotLeader));
            return;
        }
        let entry = match self.append_payload_to_log(EntryPayload::Command(payload)).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.pending_requests.insert(
            entry.log_id.index,
            PendingRequest {
                responder: PendingResponder::ClientWrite(tx),
            },
        );
        self.replicate_entry(&entry);
        if let Err(err) = self.client_apply_pipeline_tick().await {
            tracing::error!(error = %err, "apply pipeline failed after client write");
        }
    }

    /// Handles a client `barrier` request: a BARRIER entry never reaches the
    /// FSM, it only confirms every prior write on this leader is durable and
    /// visible (§3 "Log entry").
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(crate) async fn handle_client_barrier_request(&mut self, tx: oneshot::Sender<RaftResult<u64>>) {
        if !self.is_leader() {
            let _ = tx.send(Err(RaftError::NotLeader));
            return;
        }
        let entry = match self.append_payload_to_log(EntryPayload::Barrier).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.pending_requests.insert(
            entry.log_id.index,
            PendingRequest {
                responder: PendingResponder::Barrier(tx),
            },
        );
        self.replicate_entry(&entry);
        if let Err(err) = self.client_apply_pipeline_tick().await {
            tracing::error!(error = %err, "apply pipeline failed after client barrier");
        }
    }

    /// Bootstraps a pristine node with an initial configuration (§3
    /// "Lifecycle" `bootstrap`, §8 scenario 1). Only the in-memory
    /// configuration is set here; the CHANGE entry recording it is appended
    /// once this node actually becomes leader, by [`Self::commit_initial_leader_entry`].
    #[tracing::instrument(level = "trace", skip(self, members))]
    pub(crate) async fn handle_initialize(&mut self, members: Configuration) -> RaftResult<()> {
        if self.log.last_index() != 0 || self.current_term != 0 {
            return Err(RaftError::CantBootstrap);
        }
        self.membership = members;
        self.update_membership_bookkeeping();
        self.report_metrics(Update::Update);
        self.set_target_state(State::Follower);
        Ok(())
    }

    /// §8 scenario 1 / the common "new leader commits a no-op" optimization:
    /// a brand-new leader with an empty log commits its bootstrap
    /// configuration; one with an existing log commits a BARRIER so that
    /// every entry from prior terms becomes committed under its own term
    /// (§4.3 "Quorum commit" same-term constraint).
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let payload = if self.log.last_index() == 0 {
            EntryPayload::Change(self.membership.clone())
        } else {
            EntryPayload::Barrier
        };
        let entry = self.append_payload_to_log(payload).await?;
        self.replicate_entry(&entry);
        self.client_apply_pipeline_tick().await
    }

    /// Transforms `payload` into an `Entry` at the next log index, appends it
    /// durably, then to the in-memory log (§4.1 `append`).
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(crate) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Arc<Entry<D>>> {
        let log_id = LogId::new(self.current_term, self.log.last_index() + 1);
        let entry = Arc::new(Entry { log_id, payload });
        self.storage.append_to_log(&[entry.as_ref()]).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.log.append(entry.clone());
        self.last_stored = log_id.index;
        self.report_metrics(Update::Update);
        Ok(entry)
    }

    /// Kicks off replication of a newly appended entry (§4.3 "Trigger").
    /// With no peers at all — the sole-voter case of §8 scenario 1 — the
    /// leader's own durable append already satisfies quorum.
    pub(crate) fn replicate_entry(&mut self, entry: &Arc<Entry<D>>) {
        if self.nodes.is_empty() {
            self.commit_index = self.commit_index.max(entry.log_id.index);
            self.report_metrics(Update::Update);
            return;
        }
        for handle in self.nodes.values() {
            handle.stream.replicate(entry.log_id.index);
        }
    }

    /// §4.3 "Apply pipeline". Entries with a registered pending request are
    /// applied and their callback fired inline, one at a time, in log-index
    /// order; any remaining committed-but-unapplied suffix (follower
    /// catch-up, or a leader whose pending request was already dropped by a
    /// leadership change) is handed to a background task so the main loop
    /// keeps dispatching other messages while it runs.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn client_apply_pipeline_tick(&mut self) -> RaftResult<()> {
        if self.snapshot_state.is_some() {
            return Ok(());
        }

        if !self.replicate_to_sm_handle.is_empty() {
            if let Some(join_res) = self.replicate_to_sm_handle.next().await {
                self.handle_replicate_to_sm_result(join_res)?;
            }
        }

        if self.commit_index <= self.last_applied.index {
            return Ok(());
        }
        if !self.replicate_to_sm_handle.is_empty() {
            // A background apply batch is already in flight; let it finish
            // before considering more work (§5 "Apply callbacks ... fire at
            // most once, in strict log-index order").
            return Ok(());
        }

        let mut index = self.last_applied.index + 1;
        while index <= self.commit_index && self.pending_requests.contains_key(&index) {
            let entry = match self.log.get(index) {
                Some(e) => e,
                None => break,
            };
            self.apply_one_entry(entry).await?;
            index += 1;
        }

        if index > self.commit_index {
            return Ok(());
        }

        let entries = self.log.acquire(index, self.commit_index);
        if entries.is_empty() {
            return Ok(());
        }
        let last_log_id = entries.last().map(|e| e.log_id);
        let storage = self.storage.clone();
        let handle = tokio::spawn(
            async move {
                let refs: Vec<_> = entries.iter().map(|e| e.as_ref()).collect();
                let result = storage.apply_to_state_machine(&refs).await;
                crate::log::Log::release(entries);
                result?;
                Ok(last_log_id)
            }
            .instrument(tracing::debug_span!("apply_to_state_machine")),
        );
        self.replicate_to_sm_handle.push(handle);
        Ok(())
    }

    fn handle_replicate_to_sm_result(
        &mut self,
        res: Result<anyhow::Result<Option<LogId>>, tokio::task::JoinError>,
    ) -> RaftResult<()> {
        match res {
            Ok(Ok(Some(log_id))) => {
                self.last_applied = log_id;
                self.report_metrics(Update::Update);
                Ok(())
            }
            Ok(Ok(None)) => Ok(()),
            Ok(Err(err)) => Err(self.map_fatal_storage_error(err)),
            Err(_join_err) => Err(RaftError::Fatal("apply-to-state-machine task panicked".into())),
        }
    }

    /// Applies one committed entry, dispatching by type per §4.3, and fires
    /// its pending request's callback (if any) with the outcome.
    async fn apply_one_entry(&mut self, entry: Arc<Entry<D>>) -> RaftResult<()> {
        let responder = self.pending_requests.remove(&entry.log_id.index).map(|p| p.responder);
        match &entry.payload {
            EntryPayload::Command(_) => {
                let mut results = self
                    .storage
                    .apply_to_state_machine(&[entry.as_ref()])
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_applied = entry.log_id;
                self.report_metrics(Update::Update);
                if let Some(PendingResponder::ClientWrite(tx)) = responder {
                    let result = results.pop().expect("apply_to_state_machine returns one result per entry");
                    let _ = tx.send(Ok(ClientWriteResponse {
                        index: entry.log_id.index,
                        result,
                    }));
                }
            }
            EntryPayload::Barrier => {
                self.last_applied = entry.log_id;
                self.report_metrics(Update::Update);
                if let Some(PendingResponder::Barrier(tx)) = responder {
                    let _ = tx.send(Ok(entry.log_id.index));
                }
            }
            EntryPayload::Change(conf) => {
                let conf = conf.clone();
                let removes_self = !conf.contains(self.id);
                self.configuration_index = entry.log_id.index;
                self.configuration_uncommitted_index = 0;
                self.last_applied = entry.log_id;
                self.report_metrics(Update::Update);
                self.on_membership_change_applied(entry.log_id.index);
                if self.is_leader() && removes_self {
                    self.step_down();
                }
            }
        }
        Ok(())
    }

    /// §4.3 "If `last_applied − snapshot.last_index ≥ snapshot.threshold`
    /// and no snapshot is pending, start a snapshot".
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn trigger_log_compaction_if_needed(&mut self) -> RaftResult<()> {
        if let Some(SnapshotState::Snapshotting { handle }) = &mut self.snapshot_state {
            if handle.is_finished() {
                let handle = match self.snapshot_state.take() {
                    Some(SnapshotState::Snapshotting { handle }) => handle,
                    _ => unreachable!(),
                };
                match handle.await {
                    Ok(Ok(meta)) => {
                        self.log.snapshot(meta.last_log_id, self.config.snapshot_trailing_entries);
                        self.snapshot_last_log_id = meta.last_log_id;
                    }
                    Ok(Err(err)) => return Err(self.map_fatal_storage_error(err)),
                    Err(_join_err) => return Err(RaftError::Fatal("log compaction task panicked".into())),
                }
            }
            return Ok(());
        }
        if self.snapshot_state.is_some() {
            return Ok(());
        }

        let snapshot_last_index = self.log.snapshot_boundary().last_log_id.index;
        if self.last_applied.index.saturating_sub(snapshot_last_index) < self.config.snapshot_policy_threshold {
            return Ok(());
        }

        let storage = self.storage.clone();
        let handle = tokio::spawn(
            async move {
                let snapshot = storage.do_log_compaction().await?;
                Ok(snapshot.meta)
            }
            .instrument(tracing::debug_span!("do_log_compaction")),
        );
        self.snapshot_state = Some(SnapshotState::Snapshotting { handle });
        Ok(())
    }
}
