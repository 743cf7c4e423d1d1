//! Core scalar types shared across the crate.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// The identity of a single server in the cluster. Must be greater than zero.
pub type NodeId = u64;

/// An identifier for a particular snapshot transfer, used to distinguish a new
/// `InstallSnapshot` stream from a stale one carrying the same offset.
pub type SnapshotId = String;

/// A log index paired with the term which created it.
///
/// `LogId::default()` (`term=0, index=0`) represents "no entry", the state of a
/// pristine log before anything has ever been written to it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// The three payload kinds a log entry may carry (§3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum EntryType {
    /// An application-defined command to be applied to the FSM.
    Command = 0,
    /// A no-op marker used to confirm a prefix of the log is committed without
    /// touching the FSM (`client_read`/linearizable-barrier support).
    Barrier = 1,
    /// A membership change: the entry's payload is an encoded `Configuration`.
    Change = 2,
}

/// Opaque identifier distinguishing one segment of a chunked snapshot transfer
/// from another, used to detect and reject out-of-order `InstallSnapshot` chunks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}
