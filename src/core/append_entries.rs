//! Follower-side handling of the AppendEntries RPC (§4.4).

use crate::core::RaftCore;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::metrics::State;
use crate::metrics::Update;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use std::sync::Arc;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// §4.4: the seven numbered steps are implemented in order below.
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub(crate) async fn handle_append_entries_request(
        &mut self,
        rpc: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // 1. Stale term: reject without touching any state.
        if rpc.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: rpc.prev_log_id.index,
                last_log_index: self.log.last_index(),
            });
        }

        // 2. Newer term: adopt it, clear our vote, and fall back to follower.
        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.save_hard_state().await?;
            if self.is_leader() {
                self.step_down();
            } else {
                self.set_target_state(State::Follower);
            }
        }

        // 3. Acknowledge the sender as leader and reset the election clock.
        self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader_id));
        self.update_next_election_timeout(true);
        if !self.target_state.is_leader() {
            self.set_target_state(State::Follower);
        }

        // 4. A snapshot install is in flight: entries are irrelevant until it finishes.
        if self.snapshot_state.is_some() && !rpc.entries.is_empty() {
            self.report_metrics(Update::Ignore);
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: 0,
                last_log_index: self.last_stored,
            });
        }

        let snapshot_last_index = self.log.snapshot_boundary().last_log_id.index;

        // 5. Consistency check against `prev_log_id`.
        if rpc.prev_log_id.index > snapshot_last_index {
            let local_term = self.log.term_of(rpc.prev_log_id.index);
            if local_term != Some(rpc.prev_log_id.term) {
                self.report_metrics(Update::Ignore);
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    rejected: rpc.prev_log_id.index,
                    last_log_index: self.log.last_index(),
                });
            }
        }

        // 6. Truncate at the first conflict, append the remainder, advance commit_index.
        let mut next_index = rpc.prev_log_id.index + 1;
        let mut conflict_at = None;
        for entry in &rpc.entries {
            debug_assert_eq!(entry.log_id.index, next_index);
            match self.log.term_of(entry.log_id.index) {
                Some(local_term) if local_term == entry.log_id.term => {}
                Some(_) => {
                    conflict_at = Some(entry.log_id.index);
                    break;
                }
                None => break,
            }
            next_index += 1;
        }
        if let Some(index) = conflict_at {
            self.log.truncate(index);
            self.storage.delete_logs_from(index..).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.update_membership_bookkeeping();
        }

        let new_entries: Vec<_> = rpc.entries.into_iter().filter(|e| e.log_id.index >= next_index).collect();
        if !new_entries.is_empty() {
            let stored: Vec<_> = new_entries.into_iter().map(Arc::new).collect();
            let refs: Vec<_> = stored.iter().map(|e| e.as_ref()).collect();
            self.storage.append_to_log(&refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
            for entry in &stored {
                if let crate::raft::EntryPayload::Change(ref conf) = entry.payload {
                    self.update_membership(conf.clone());
                }
            }
            self.log.append_many(stored);
            self.update_membership_bookkeeping();
        }
        self.last_stored = self.log.last_index();

        let last_new_index = self.log.last_index();
        if rpc.leader_commit > self.commit_index {
            self.commit_index = rpc.leader_commit.min(last_new_index);
        }
        self.report_metrics(Update::Ignore);
        self.client_apply_pipeline_tick().await?;

        // 7. Accepted.
        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: self.log.last_index(),
        })
    }
}
