//! Follower-side handling of the InstallSnapshot RPC, the leader's fallback
//! when a peer has fallen behind the log's snapshot boundary (§4.3 "Prev-log
//! fields", §8 scenario 5).

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::State;
use crate::metrics::Update;
use crate::network::RaftNetwork;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft_types::SnapshotSegmentId;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use std::io::SeekFrom;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(crate) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        self.update_next_election_timeout(true);
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
        }
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        self.report_metrics(Update::Ignore);

        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Snapshotting { handle }) => {
                handle.abort();
                self.begin_installing_snapshot(req).await
            }
            Some(SnapshotState::Streaming { offset, id, snapshot }) => {
                if req.meta.snapshot_id == id {
                    return self.continue_installing_snapshot(req, offset, snapshot).await;
                }
                if req.offset == 0 {
                    return self.begin_installing_snapshot(req).await;
                }
                Err(RaftError::SnapshotMismatch {
                    expect: SnapshotSegmentId { id, offset },
                    got: SnapshotSegmentId {
                        id: req.meta.snapshot_id,
                        offset: req.offset,
                    },
                })
            }
        }
    }

    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let id = req.meta.snapshot_id.clone();
        if req.offset > 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: SnapshotSegmentId { id: id.clone(), offset: 0 },
                got: SnapshotSegmentId { id, offset: req.offset },
            });
        }

        let mut snapshot = self.storage.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&req.data).await?;

        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: req.data.len() as u64,
            id,
            snapshot,
        });
        Ok(InstallSnapshotResponse { term: self.current_term })
    }

    async fn continue_installing_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        mut offset: u64,
        snapshot: Box<S::SnapshotData>,
    ) -> RaftResult<InstallSnapshotResponse> {
        let id = req.meta.snapshot_id.clone();
        let mut snapshot = snapshot;

        if req.offset != offset {
            if let Err(err) = snapshot.as_mut().seek(SeekFrom::Start(req.offset)).await {
                self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
                return Err(err.into());
            }
            offset = req.offset;
        }

        if let Err(err) = snapshot.as_mut().write_all(&req.data).await {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Err(err.into());
        }
        offset += req.data.len() as u64;

        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
        }
        Ok(InstallSnapshotResponse { term: self.current_term })
    }

    async fn finalize_snapshot_installation(
        &mut self,
        req: InstallSnapshotRequest,
        mut snapshot: Box<S::SnapshotData>,
    ) -> RaftResult<()> {
        snapshot.as_mut().shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
        self.storage
            .finalize_snapshot_installation(&req.meta, snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.log.restore(req.meta.last_log_id);
        self.update_membership(req.meta.membership.clone());
        self.last_applied = req.meta.last_log_id;
        self.last_stored = req.meta.last_log_id.index;
        self.commit_index = self.commit_index.max(req.meta.last_log_id.index);
        self.configuration_index = req.meta.last_log_id.index;
        self.configuration_uncommitted_index = 0;
        self.report_metrics(Update::Update);
        Ok(())
    }
}
