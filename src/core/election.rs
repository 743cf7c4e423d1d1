//! Follower and candidate behavior: election timeouts, vote solicitation and
//! tallying, and the RequestVote RPC handler (§4.2).

use crate::core::RaftCore;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::metrics::State;
use crate::metrics::Update;
use crate::network::RaftNetwork;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft_types::NodeId;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// The follower/candidate loop: wait for the next inbound message,
    /// shutdown signal, or — since there's no separate timer future here —
    /// let the tick dispatcher (driven externally, §4.6) observe timeout
    /// expiry and call `become_candidate`.
    pub(crate) async fn run_follower_or_candidate(&mut self) -> RaftResult<()> {
        self.update_next_election_timeout(false);
        tokio::select! {
            _ = &mut self.rx_shutdown => self.set_target_state(State::Shutdown),
            msg = self.rx_api.recv() => match msg {
                Some(msg) => self.dispatch_api_msg(msg).await?,
                None => self.set_target_state(State::Shutdown),
            },
        }
        Ok(())
    }

    /// §4.2: FOLLOWER on election-timer expiry → CANDIDATE (term++, vote
    /// for self durably, RequestVote to every voting peer); CANDIDATE on
    /// election-timer expiry → new CANDIDATE term (restart election).
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn become_candidate(&mut self) -> RaftResult<()> {
        self.set_target_state(State::Candidate);
        self.update_current_term(self.current_term + 1, Some(self.id));
        self.voted_for = Some(self.id);
        self.update_current_leader(UpdateCurrentLeader::Unknown);
        self.save_hard_state().await?;
        self.update_next_election_timeout(true);
        self.report_metrics(Update::Update);

        let last_log_id = self.log.last_log_id();
        let voters: Vec<NodeId> = self.membership.voter_ids().into_iter().filter(|id| *id != self.id).collect();
        let needed = self.membership.majority();
        let mut granted: usize = 1; // we always vote for ourselves.

        if granted >= needed {
            self.become_leader().await?;
            return Ok(());
        }

        let term = self.current_term;
        let candidate_id = self.id;
        let rpc = VoteRequest::new(term, candidate_id, last_log_id);

        let mut futs = futures::stream::FuturesUnordered::new();
        for target in voters {
            let network = self.network.clone();
            let rpc = rpc.clone();
            futs.push(async move { (target, network.send_vote(target, rpc).await) });
        }

        use futures::StreamExt;
        while let Some((target, res)) = futs.next().await {
            if self.current_term != term || !self.target_state.is_candidate() {
                // A higher term or a role change happened while votes were
                // in flight; this election is moot.
                return Ok(());
            }
            match res {
                Ok(resp) => {
                    if resp.term > self.current_term {
                        self.update_current_term(resp.term, None);
                        self.save_hard_state().await?;
                        self.set_target_state(State::Follower);
                        self.report_metrics(Update::Update);
                        return Ok(());
                    }
                    if resp.vote_granted {
                        granted += 1;
                        tracing::debug!(target, granted, needed, "vote granted");
                        if granted >= needed {
                            self.become_leader().await?;
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(target, error = %err, "RequestVote RPC failed");
                }
            }
        }
        Ok(())
    }

    /// The RequestVote RPC handler (§4.2 "Vote granting").
    #[tracing::instrument(level = "trace", skip(self, req), fields(req = %req.summary()))]
    pub(crate) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
            }
            self.report_metrics(Update::Update);
        }

        let already_voted_other = matches!(self.voted_for, Some(v) if v != req.candidate_id);
        let candidate_log_id = crate::raft_types::LogId::new(req.last_log_term, req.last_log_index);
        let up_to_date = candidate_log_id >= self.log.last_log_id();

        if already_voted_other || !up_to_date {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.voted_for = Some(req.candidate_id);
        self.save_hard_state().await?;
        self.update_next_election_timeout(true);
        self.report_metrics(Update::Update);

        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }
}
