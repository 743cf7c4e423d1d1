//! The metrics snapshot published on every state-affecting transition, and
//! the `State` enum the core's main loop dispatches on (§4.2, §5).

use crate::configuration::Configuration;
use crate::raft_types::LogId;
use crate::raft_types::NodeId;
use std::fmt;

/// The four roles of §4.2. There is no separate "non-voter" variant: voting
/// eligibility is a property of this node's entry in the current
/// [`Configuration`], orthogonal to which of these four states it occupies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Pre-`start`/`bootstrap`: no log, no configuration.
    Unavailable,
    Follower,
    Candidate,
    Leader,
    /// Terminal: `close` has been requested, the main loop is draining.
    Shutdown,
}

impl State {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, State::Unavailable)
    }
    pub fn is_follower(&self) -> bool {
        matches!(self, State::Follower)
    }
    pub fn is_candidate(&self) -> bool {
        matches!(self, State::Candidate)
    }
    pub fn is_leader(&self) -> bool {
        matches!(self, State::Leader)
    }
    pub fn is_shutdown(&self) -> bool {
        matches!(self, State::Shutdown)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unavailable => "Unavailable",
            State::Follower => "Follower",
            State::Candidate => "Candidate",
            State::Leader => "Leader",
            State::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// A point-in-time snapshot of a node's consensus state, published over a
/// `tokio::sync::watch` channel for external observers.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_id: LogId,
    pub last_applied: u64,
    pub commit_index: u64,
    pub current_leader: Option<NodeId>,
    pub membership: Configuration,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Unavailable,
            current_term: 0,
            last_log_id: LogId::default(),
            last_applied: 0,
            commit_index: 0,
            current_leader: None,
            membership: Configuration::empty(),
        }
    }
}

/// Whether a mutating call site should force a metrics publish or leave it
/// to the next naturally-occurring report, mirroring the teacher's
/// `Update::{Update, Ignore}` dispatch at every state-mutating call site.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Update {
    Update,
    Ignore,
}
