//! Leader-side cluster membership changes (§4.5): add a non-voting member,
//! promote it to voting once it has caught up over a bounded number of
//! rounds, or remove a member outright. At most one such change may be in
//! flight at a time.

use crate::core::CatchUpState;
use crate::core::PendingMembershipChange;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::EntryPayload;
use crate::raft_types::NodeId;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use tokio::time::Duration;
use tokio::time::Instant;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// §4.5 "Add": appends a CHANGE entry introducing `id` as a non-voting
    /// member and starts replicating to it right away so it can catch up.
    #[tracing::instrument(level = "trace", skip(self, address))]
    pub(crate) async fn handle_add_member(&mut self, id: NodeId, address: String) -> RaftResult<()> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }
        if self.pending_membership_change.is_some() {
            return Err(RaftError::CantChange("a membership change is already in progress"));
        }
        if self.last_applied.index < self.configuration_index {
            return Err(RaftError::CantChange("leader's initial entry has not yet committed"));
        }
        let new_membership = self.membership.with_added(id, address)?;

        let last_log_index = self.log.last_index();
        self.spawn_replication_stream(id, last_log_index);

        self.update_membership(new_membership.clone());
        self.update_membership_bookkeeping();
        let entry = self.append_payload_to_log(EntryPayload::Change(new_membership)).await?;
        self.pending_membership_change = Some(PendingMembershipChange::AddOrRemove {
            change_index: entry.log_id.index,
        });
        self.replicate_entry(&entry);
        self.client_apply_pipeline_tick().await
    }

    /// §4.5 "Promote": starts a bounded catch-up sequence for an existing
    /// non-voting member. The CHANGE entry flipping it to voting is only
    /// appended once it has caught up to the leader's log within a single
    /// round, by [`Self::check_catch_up_deadline`].
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn handle_promote_member(&mut self, id: NodeId) -> RaftResult<()> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }
        if self.pending_membership_change.is_some() {
            return Err(RaftError::CantChange("a membership change is already in progress"));
        }
        if self.last_applied.index < self.configuration_index {
            return Err(RaftError::CantChange("leader's initial entry has not yet committed"));
        }
        let server = self.membership.get(id).ok_or(RaftError::BadId)?;
        if server.voting {
            return Err(RaftError::AlreadyVoting(id));
        }
        if !self.nodes.contains_key(&id) {
            return Err(RaftError::BadId);
        }

        self.pending_membership_change = Some(PendingMembershipChange::Promote {
            change_index: 0,
            catch_up: CatchUpState {
                target_id: id,
                round: 1,
                round_target_index: self.log.last_index(),
                round_deadline: Instant::now() + Duration::from_millis(self.config.election_timeout_max),
            },
        });
        Ok(())
    }

    /// §4.5 "Remove": appends a CHANGE entry dropping `id` from the cluster.
    /// Its replication stream is kept alive until the entry is applied, so
    /// the removed server still receives the very entry that removes it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn handle_remove_member(&mut self, id: NodeId) -> RaftResult<()> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }
        if self.pending_membership_change.is_some() {
            return Err(RaftError::CantChange("a membership change is already in progress"));
        }
        if self.last_applied.index < self.configuration_index {
            return Err(RaftError::CantChange("leader's initial entry has not yet committed"));
        }
        let new_membership = self.membership.with_removed(id)?;

        self.update_membership(new_membership.clone());
        self.update_membership_bookkeeping();
        let entry = self.append_payload_to_log(EntryPayload::Change(new_membership)).await?;
        self.pending_membership_change = Some(PendingMembershipChange::AddOrRemove {
            change_index: entry.log_id.index,
        });
        self.replicate_entry(&entry);
        self.client_apply_pipeline_tick().await
    }

    /// Polls the in-flight promotion, if any, once per tick (§4.5 "Promote"
    /// bounded catch-up rounds): a round succeeds once the target's match
    /// index reaches the index the leader's log was at when the round
    /// started. Succeeding the final round — where the target has reached
    /// the leader's *current* last index — commits the promotion; running
    /// out of rounds or overrunning a round's deadline abandons it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) async fn check_catch_up_deadline(&mut self) -> RaftResult<()> {
        let (change_index, mut catch_up) = match self.pending_membership_change.take() {
            Some(PendingMembershipChange::Promote { change_index, catch_up }) => (change_index, catch_up),
            other => {
                self.pending_membership_change = other;
                return Ok(());
            }
        };

        let matched = self.nodes.get(&catch_up.target_id).map(|h| h.matched.index).unwrap_or(0);
        let last_index = self.log.last_index();

        if matched >= catch_up.round_target_index {
            if matched >= last_index {
                let new_membership = match self.membership.with_promoted(catch_up.target_id) {
                    Ok(conf) => conf,
                    Err(err) => {
                        tracing::warn!(target = catch_up.target_id, error = %err, "abandoning promotion");
                        return Ok(());
                    }
                };
                self.update_membership(new_membership.clone());
                self.update_membership_bookkeeping();
                let entry = self.append_payload_to_log(EntryPayload::Change(new_membership)).await?;
                self.pending_membership_change = Some(PendingMembershipChange::AddOrRemove {
                    change_index: entry.log_id.index,
                });
                self.replicate_entry(&entry);
                return self.client_apply_pipeline_tick().await;
            }

            if catch_up.round >= self.config.catch_up_rounds {
                tracing::warn!(target = catch_up.target_id, rounds = catch_up.round, "catch-up round limit reached, abandoning promotion");
                return Ok(());
            }
            catch_up.round += 1;
            catch_up.round_target_index = last_index;
            catch_up.round_deadline = Instant::now() + Duration::from_millis(self.config.election_timeout_max);
            self.pending_membership_change = Some(PendingMembershipChange::Promote { change_index, catch_up });
            return Ok(());
        }

        if Instant::now() >= catch_up.round_deadline {
            tracing::warn!(target = catch_up.target_id, round = catch_up.round, "catch-up round timed out, abandoning promotion");
            return Ok(());
        }

        self.pending_membership_change = Some(PendingMembershipChange::Promote { change_index, catch_up });
        Ok(())
    }

    /// Reconciles state once a CHANGE entry is actually applied: drops
    /// replication streams for any member the new configuration no longer
    /// includes, and clears the at-most-one-change slot if this was the
    /// entry it was tracking.
    pub(crate) fn on_membership_change_applied(&mut self, index: u64) {
        let stale: Vec<NodeId> = self.nodes.keys().copied().filter(|id| !self.membership.contains(*id)).collect();
        for id in stale {
            self.remove_replication_stream(id);
        }
        let clear = match &self.pending_membership_change {
            Some(PendingMembershipChange::AddOrRemove { change_index }) => *change_index == index,
            Some(PendingMembershipChange::Promote { change_index, .. }) => *change_index == index,
            None => false,
        };
        if clear {
            self.pending_membership_change = None;
        }
    }
}
