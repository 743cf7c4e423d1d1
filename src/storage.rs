//! The storage/FSM seam (§6 "I/O backend contract" load/append/truncate/
//! snapshot operations, plus the FSM contract). On-disk layout, segment
//! naming and CRC framing (§6 "Persistent layout") are all outside this
//! crate's scope (§1) — this trait is the interface an embedder implements
//! against.

use crate::configuration::Configuration;
use crate::raft::Entry;
use crate::raft::SnapshotMeta;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use crate::AppData;
use crate::AppDataResponse;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::error::Error;
use std::fmt::Debug;
use std::ops::RangeBounds;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

/// A readable handle to the current snapshot plus its metadata.
pub struct Snapshot<SD>
where
    SD: AsyncRead + AsyncSeek + Send + Unpin + 'static,
{
    pub meta: SnapshotMeta,
    pub snapshot: Box<SD>,
}

/// The durable `(current_term, voted_for)` pair (§3 "Persistent per-server
/// state"); persisted before any dependent reply or RPC is sent (§5
/// "Ordering guarantees").
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Everything [`RaftCore`](crate::core::RaftCore) needs to resume after a
/// restart, as returned by `get_initial_state` / §6's `load`.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub last_log_id: LogId,
    pub last_applied_log: LogId,
    pub hard_state: HardState,
    pub membership: Configuration,
}

impl InitialState {
    pub fn new_pristine(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: LogId::default(),
            hard_state: HardState::default(),
            membership: Configuration::new_initial(id, String::new()),
        }
    }
}

/// The storage and FSM seam this core consumes (§6). Implementations own
/// log persistence, snapshot persistence, and the application state
/// machine; the core only ever calls through this trait and never touches
/// bytes on disk directly.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The snapshot engine's read/write handle type.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// Returned from `apply_to_state_machine` to signal the core that the
    /// node must shut down rather than continue (§7 "I/O errors and
    /// corruption are fatal").
    type ShutdownError: Error + Send + Sync + 'static;

    /// The most recent membership found in the log (or snapshot, if more
    /// recent), reconstructed by reverse search (§3 configuration index
    /// invariants).
    async fn get_membership_config(&self) -> Result<Configuration>;

    /// Everything needed to resume after a restart; `InitialState::new_pristine`
    /// if this is the first time the node has come online.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Persists `(current_term, voted_for)` durably before returning (§5).
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// `[start, stop)` semantics: `start` inclusive, `stop` exclusive.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Deletes every entry in `range`; used both for follower-side
    /// consistency-check truncation (§4.4 step 6) and leader-side snapshot
    /// prefix release (§4.1 `snapshot`).
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Durable append; must complete before a follower's AppendEntries
    /// reply is sent for these indices (§5).
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Applies committed entries to the application state machine (§4.3
    /// apply pipeline). Only ever called with entries at and below the
    /// current commit index, strictly in order, one batch at a time.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;

    /// Captures a new snapshot of the state machine as of its most recently
    /// applied entry (§4.3 "start a snapshot").
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>>;

    /// Opens a fresh, writable snapshot handle to receive a streamed
    /// snapshot from the leader (§4.4's install-snapshot path).
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalizes a streamed-in snapshot: truncate the log through
    /// `meta.last_log_id`, record the new snapshot pointer, discard any
    /// earlier snapshot.
    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()>;

    /// The currently installed snapshot, if any.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}

/// Test-only introspection, kept separate from the production trait the way
/// the teacher keeps `RaftStorageDebug` out of the main `RaftStorage`
/// surface.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    async fn get_state_machine(&self) -> SM;
    async fn read_hard_state(&self) -> Option<HardState>;
}
