//! The error taxonomy of §6/§7, realized as a single `thiserror` enum plus a
//! couple of small helper types used by specific subsystems.

use crate::raft_types::NodeId;
use crate::raft_types::SnapshotSegmentId;

/// Errors which may be returned from the core's public request entry points
/// and from its internal result-handling paths.
///
/// Variants are grouped, in source order, the way §7 groups them: client
/// programming errors, resource errors, I/O/corruption errors, transient
/// conditions. Term races are deliberately absent here — per §7 they are
/// never errors, they are state transitions the core performs and then lets
/// the originating RPC proceed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RaftError {
    // -- client-programming errors --------------------------------------
    #[error("server id must be greater than zero")]
    BadId,

    #[error("node {0} is already present in the configuration")]
    DuplicateId(NodeId),

    #[error("address {0} is already present in the configuration")]
    DuplicateAddress(String),

    #[error("node {0} is already a voting member")]
    AlreadyVoting(NodeId),

    #[error("this node is not the cluster leader")]
    NotLeader,

    #[error("cannot bootstrap: persistent state already exists")]
    CantBootstrap,

    #[error("cannot change membership: {0}")]
    CantChange(&'static str),

    #[error("malformed input: {0}")]
    Malformed(&'static str),

    // -- resource errors ---------------------------------------------------
    #[error("out of memory")]
    OutOfMemory,

    #[error("payload too large")]
    TooBig,

    #[error("name exceeds maximum length")]
    NameTooLong,

    // -- I/O / corruption errors (fatal) -----------------------------------
    #[error("underlying storage is corrupt: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(String),

    // -- transient conditions ----------------------------------------------
    #[error("no connection to peer")]
    NoConnection,

    #[error("peer is busy, retry later")]
    Busy,

    #[error("operation canceled")]
    Canceled,

    // -- lifecycle -----------------------------------------------------------
    #[error("leadership was lost before the request committed")]
    LeadershipLost,

    #[error("the node is shutting down")]
    Shutdown,

    #[error("snapshot chunk out of order: expected {expect:?}, got {got:?}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },

    #[error("catch-up rounds exhausted for node {0}, retry later")]
    CatchUpTimeout(NodeId),

    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl RaftError {
    /// Groups the variants which §7 classifies as fatal to the affected
    /// operation: I/O failures and detected corruption. The core's
    /// `map_fatal_storage_error` helper uses this to decide whether a
    /// storage failure must step the leader down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Corrupt(_) | RaftError::Io(_) | RaftError::Fatal(_))
    }

    /// Groups the variants which §7 classifies as transient: reported to the
    /// caller, but never a reason to change role.
    pub fn is_transient(&self) -> bool {
        matches!(self, RaftError::NoConnection | RaftError::Busy | RaftError::Canceled)
    }
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Io(err.to_string())
    }
}

/// The narrow `Result` alias used at the core's request-handling boundary.
pub type RaftResult<T> = Result<T, RaftError>;

/// Error returned by [`crate::configuration::Configuration`] encode/decode
/// and by the RPC wire codec (§6 round-trip laws).
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported encoding version")]
    UnsupportedVersion,
    #[error("buffer truncated before expected terminator")]
    Truncated,
    #[error("unknown RPC type code")]
    UnknownType,
}
