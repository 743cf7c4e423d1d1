//! Leader-role behavior: initializing per-peer `Progress` on election,
//! driving replication streams, advancing `commit_index` by quorum (§4.3),
//! and stepping down.

use crate::configuration::Configuration;
use crate::core::ReplicationHandle;
use crate::core::RaftCore;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::State;
use crate::metrics::Update;
use crate::network::RaftNetwork;
use crate::quorum::quorum_match_index;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use tokio::time::Instant;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// §4.2 "CANDIDATE on majority-of-voting grants in its term → LEADER":
    /// initializes `Progress` for every known peer and immediately
    /// broadcasts an empty heartbeat.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn become_leader(&mut self) -> RaftResult<()> {
        tracing::info!(term = self.current_term, "becoming leader");
        self.set_target_state(State::Leader);
        self.update_current_leader(UpdateCurrentLeader::ThisNode);

        let last_log_index = self.log.last_index();
        let ids: Vec<NodeId> = self.membership.all_ids().into_iter().filter(|id| *id != self.id).collect();
        for id in ids {
            self.spawn_replication_stream(id, last_log_index);
        }

        self.has_completed_initial_replication_to_sm = false;
        self.report_metrics(Update::Update);
        self.commit_initial_leader_entry().await
    }

    pub(crate) fn spawn_replication_stream(&mut self, target: NodeId, leader_last_log_index: u64) {
        if self.nodes.contains_key(&target) {
            return;
        }
        let stream = ReplicationStream::spawn(
            self.id,
            target,
            self.current_term,
            leader_last_log_index + 1,
            self.config.clone(),
            self.network.clone(),
            self.storage.clone(),
            self.replication_tx.clone(),
        );
        self.nodes.insert(
            target,
            ReplicationHandle {
                stream,
                matched: LogId::default(),
                last_contact: None,
            },
        );
    }

    pub(crate) fn remove_replication_stream(&mut self, target: NodeId) {
        if let Some(handle) = self.nodes.remove(&target) {
            handle.stream.terminate();
        }
    }

    /// §4.6 "LEADER: for each peer ... evaluate catch-up round deadline; on
    /// majority-contact-loss over `election_timeout`, step down."
    pub(crate) async fn leader_tick(&mut self) -> RaftResult<()> {
        self.drain_replica_events().await?;

        let last_log_index = self.log.last_index();
        for handle in self.nodes.values() {
            handle.stream.replicate(last_log_index);
        }

        self.check_catch_up_deadline().await?;
        self.advance_commit_index().await?;

        if self.lost_contact_with_majority() {
            tracing::warn!("lost contact with a majority of voters, stepping down");
            self.step_down();
        }
        Ok(())
    }

    /// Drains any `ReplicaEvent`s accumulated since the last tick, applying
    /// match-index advances, term-race step-downs and snapshot requests.
    pub(crate) async fn drain_replica_events(&mut self) -> RaftResult<()> {
        loop {
            let event = match self.replication_rx.try_recv() {
                Ok((event, _span)) => event,
                Err(_) => break,
            };
            match event {
                ReplicaEvent::UpdateMatchIndex { target, match_index } => {
                    if let Some(handle) = self.nodes.get_mut(&target) {
                        if match_index > handle.matched.index {
                            let term = self.log.term_of(match_index).unwrap_or(self.current_term);
                            handle.matched = LogId::new(term, match_index);
                        }
                    }
                    self.on_peer_progress(target, match_index).await?;
                }
                ReplicaEvent::Contact { target } => {
                    if let Some(handle) = self.nodes.get_mut(&target) {
                        handle.last_contact = Some(Instant::now());
                    }
                }
                ReplicaEvent::RevertToFollower { term } => {
                    self.update_current_term(term, None);
                    self.save_hard_state().await?;
                    self.step_down();
                    return Ok(());
                }
                ReplicaEvent::NeedsSnapshot { target: _, tx } => {
                    let snapshot = self.storage.get_current_snapshot().await.map_err(|e| self.map_fatal_storage_error(e))?;
                    let _ = tx.send(snapshot);
                }
                ReplicaEvent::Shutdown { target } => {
                    self.nodes.remove(&target);
                }
            }
        }
        Ok(())
    }

    /// §4.3 "Quorum commit": for each candidate `N` above `commit_index`
    /// whose entry is from the current term, advance `commit_index` if a
    /// majority of voting peers (including the leader) have `match_index
    /// >= N`.
    pub(crate) async fn advance_commit_index(&mut self) -> RaftResult<()> {
        let last_index = self.log.last_index();
        if last_index <= self.commit_index {
            return Ok(());
        }
        let mut values: Vec<u64> = vec![last_index_self(self)];
        for id in self.membership.voter_ids() {
            if id == self.id {
                continue;
            }
            if let Some(handle) = self.nodes.get(&id) {
                values.push(handle.matched.index);
            } else {
                values.push(0);
            }
        }
        let candidate = quorum_match_index(&values);
        if candidate <= self.commit_index {
            return Ok(());
        }
        if self.log.term_of(candidate) != Some(self.current_term) {
            // Same-term constraint (§4.3): never commit a stale-term entry
            // purely by index majority.
            return Ok(());
        }
        self.commit_index = candidate;
        for handle in self.nodes.values() {
            handle.stream.update_commit_index(candidate);
        }
        self.report_metrics(Update::Update);
        self.client_apply_pipeline_tick().await?;
        Ok(())
    }

    async fn on_peer_progress(&mut self, _target: NodeId, _match_index: u64) -> RaftResult<()> {
        self.advance_commit_index().await
    }

    fn lost_contact_with_majority(&self) -> bool {
        let needed = self.membership.majority();
        let window = tokio::time::Duration::from_millis(self.config.election_timeout_min);
        let mut contact = 1usize; // the leader always has contact with itself.
        for id in self.membership.voter_ids() {
            if id == self.id {
                continue;
            }
            let recent = self
                .nodes
                .get(&id)
                .and_then(|h| h.last_contact)
                .map_or(false, |t| t.elapsed() < window);
            if recent {
                contact += 1;
            }
        }
        contact < needed
    }

    /// §4.2 "LEADER when it fails to confirm contact ... → FOLLOWER"; also
    /// used on a higher-term discovery (§4.3 "Result handling"). §4.5
    /// "At-most-one rule": any uncommitted membership change in flight is
    /// rolled back to the last committed configuration, and the pending-
    /// change tracking is cleared along with it.
    pub(crate) fn step_down(&mut self) {
        for (_, handle) in std::mem::take(&mut self.nodes) {
            handle.stream.terminate();
        }
        if self.configuration_uncommitted_index != 0 {
            if self.configuration_index != 0 {
                if let Some(entry) = self.log.get(self.configuration_index) {
                    if let crate::raft::EntryPayload::Change(conf) = &entry.payload {
                        self.membership = conf.clone();
                    }
                }
            }
            self.configuration_uncommitted_index = 0;
        }
        self.pending_membership_change = None;
        self.update_current_leader(UpdateCurrentLeader::Unknown);
        self.set_target_state(State::Follower);
        self.update_next_election_timeout(true);
        self.report_metrics(Update::Update);
    }

    pub(crate) async fn run_leader(&mut self) -> RaftResult<()> {
        tokio::select! {
            _ = &mut self.rx_shutdown => {
                self.set_target_state(State::Shutdown);
            }
            msg = self.rx_api.recv() => match msg {
                Some(msg) => self.dispatch_api_msg(msg).await?,
                None => self.set_target_state(State::Shutdown),
            },
            event = self.replication_rx.recv() => {
                if let Some((event, _span)) = event {
                    self.apply_single_replica_event(event).await?;
                } else {
                    self.set_target_state(State::Shutdown);
                }
            }
        }
        Ok(())
    }

    async fn apply_single_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, match_index } => {
                if let Some(handle) = self.nodes.get_mut(&target) {
                    if match_index > handle.matched.index {
                        let term = self.log.term_of(match_index).unwrap_or(self.current_term);
                        handle.matched = LogId::new(term, match_index);
                    }
                }
                self.advance_commit_index().await
            }
            ReplicaEvent::Contact { target } => {
                if let Some(handle) = self.nodes.get_mut(&target) {
                    handle.last_contact = Some(Instant::now());
                }
                Ok(())
            }
            ReplicaEvent::RevertToFollower { term } => {
                self.update_current_term(term, None);
                self.save_hard_state().await?;
                self.step_down();
                Ok(())
            }
            ReplicaEvent::NeedsSnapshot { target: _, tx } => {
                let snapshot = self.storage.get_current_snapshot().await.map_err(|e| self.map_fatal_storage_error(e))?;
                let _ = tx.send(snapshot);
                Ok(())
            }
            ReplicaEvent::Shutdown { target } => {
                self.nodes.remove(&target);
                Ok(())
            }
        }
    }
}

fn last_index_self<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
    core: &RaftCore<D, R, N, S>,
) -> u64 {
    core.log.last_index()
}
