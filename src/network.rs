//! The network/transport seam (§6 "I/O backend contract", the `send`
//! portion). Framing, connection management and retries all live outside
//! this crate (§1 Non-goals); an implementor only has to get an RPC to
//! `target` and hand back the typed response.

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft_types::NodeId;
use crate::AppData;

/// Implemented by the embedder to deliver RPCs to a named peer.
///
/// Errors returned here are treated as transient (§7 "no-connection, busy,
/// canceled"): the replication engine retries on the next tick without
/// changing role.
#[async_trait::async_trait]
pub trait RaftNetwork<D: AppData>: Send + Sync + 'static {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<D>,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;
}
