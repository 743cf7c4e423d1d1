//! A core Raft consensus state machine: election, replicated log, leader-side
//! replication with PROBE/PIPELINE/SNAPSHOT peer progress, and one-at-a-time
//! (non-joint-consensus) membership changes.
//!
//! Storage, transport and the application state machine are external
//! collaborators, reached through the [`storage::RaftStorage`] and
//! [`network::RaftNetwork`] trait seams; this crate owns only the consensus
//! algorithm itself.

pub mod config;
pub mod configuration;
pub mod core;
pub mod error;
pub mod log;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft;
pub mod raft_types;
pub mod replication;
pub mod storage;
pub mod wire;

use std::fmt::Debug;

/// Marker bound satisfied by any application-defined command payload.
pub trait AppData: Clone + Debug + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static {}
impl<T> AppData for T where T: Clone + Debug + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static {}

/// Marker bound satisfied by any application-defined command response.
pub trait AppDataResponse: Clone + Debug + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static {}
impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static {}

/// A short, human-readable rendering of an RPC or internal event used in
/// `tracing` span fields, so request/response logs stay legible without
/// dumping full entry payloads.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

impl<D: AppData> MessageSummary for raft::AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "AppendEntries(term={}, leader={}, prev={}, n_entries={}, leader_commit={})",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.entries.len(),
            self.leader_commit
        )
    }
}

impl MessageSummary for raft::VoteRequest {
    fn summary(&self) -> String {
        format!(
            "RequestVote(term={}, candidate={}, last_log={}-{})",
            self.term, self.candidate_id, self.last_log_term, self.last_log_index
        )
    }
}

impl MessageSummary for raft::InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "InstallSnapshot(term={}, leader={}, last_log={}, offset={}, done={})",
            self.term, self.leader_id, self.meta.last_log_id, self.offset, self.done
        )
    }
}

pub use config::Config;
pub use config::ConfigBuilder;
pub use configuration::Configuration;
pub use error::RaftError;
pub use error::RaftResult;
pub use metrics::RaftMetrics;
pub use metrics::State;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use raft_types::LogId;
pub use raft_types::NodeId;
pub use raft_types::SnapshotId;
pub use raft_types::SnapshotSegmentId;
pub use storage::RaftStorage;
