//! Runtime configuration for a [`crate::raft::Raft`] instance.
//!
//! Every numeric knob §9 leaves as "implementation-chosen" lives here, built
//! once via [`ConfigBuilder`], validated at construction, then shared
//! read-only (`Arc<Config>`) with `RaftCore` and every `ReplicationCore` it
//! spawns.

use std::sync::Arc;

/// Errors which can occur while assembling a [`Config`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("election_timeout_min must be less than election_timeout_max")]
    InvalidElectionTimeout,
    #[error("heartbeat_interval must be greater than zero")]
    InvalidHeartbeatInterval,
    #[error("max_payload_entries must be greater than zero")]
    InvalidMaxPayloadEntries,
    #[error("catch_up_rounds must be greater than zero")]
    InvalidCatchUpRounds,
}

/// Runtime configuration for a Raft node.
#[derive(Clone, Debug)]
pub struct Config {
    /// Lower bound (inclusive) of the randomized election timeout window, in
    /// milliseconds (§4.2).
    pub election_timeout_min: u64,
    /// Upper bound (exclusive) of the randomized election timeout window.
    pub election_timeout_max: u64,
    /// Interval, in milliseconds, at which the leader sends heartbeats to
    /// quiescent peers (§4.3, §4.6).
    pub heartbeat_interval: u64,
    /// Upper bound on the number of entries sent in a single PIPELINE-state
    /// AppendEntries (§4.3).
    pub max_payload_entries: u64,
    /// Number of log entries the leader will tolerate a peer lagging by
    /// before considering it out of PIPELINE range.
    pub replication_lag_threshold: u64,
    /// Number of applied entries since the last snapshot before a new
    /// snapshot is triggered (§4.3 "snapshot.threshold").
    pub snapshot_policy_threshold: u64,
    /// Number of trailing log entries retained above the snapshot boundary,
    /// to serve as a hint for laggard peers without requiring a snapshot
    /// transfer (§3, §4.1).
    pub snapshot_trailing_entries: u64,
    /// Maximum number of bytes sent in a single InstallSnapshot chunk.
    pub snapshot_max_chunk_size: u64,
    /// Bound on the number of catch-up rounds a `promote` will run before
    /// aborting with a retryable error (§4.5: "typically 10").
    pub catch_up_rounds: u64,
}

impl Config {
    pub fn build() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`], mirroring the corpus's convention of validating
/// once at construction rather than deferring to first use.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    election_timeout_min: u64,
    election_timeout_max: u64,
    heartbeat_interval: u64,
    max_payload_entries: u64,
    replication_lag_threshold: u64,
    snapshot_policy_threshold: u64,
    snapshot_trailing_entries: u64,
    snapshot_max_chunk_size: u64,
    catch_up_rounds: u64,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_payload_entries: 64,
            replication_lag_threshold: 1000,
            snapshot_policy_threshold: 5000,
            snapshot_trailing_entries: 256,
            snapshot_max_chunk_size: 4 * 1024 * 1024,
            catch_up_rounds: 10,
        }
    }
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = v;
        self
    }

    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = v;
        self
    }

    pub fn heartbeat_interval(mut self, v: u64) -> Self {
        self.heartbeat_interval = v;
        self
    }

    pub fn max_payload_entries(mut self, v: u64) -> Self {
        self.max_payload_entries = v;
        self
    }

    pub fn replication_lag_threshold(mut self, v: u64) -> Self {
        self.replication_lag_threshold = v;
        self
    }

    pub fn snapshot_policy_threshold(mut self, v: u64) -> Self {
        self.snapshot_policy_threshold = v;
        self
    }

    pub fn snapshot_trailing_entries(mut self, v: u64) -> Self {
        self.snapshot_trailing_entries = v;
        self
    }

    pub fn catch_up_rounds(mut self, v: u64) -> Self {
        self.catch_up_rounds = v;
        self
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        if self.max_payload_entries == 0 {
            return Err(ConfigError::InvalidMaxPayloadEntries);
        }
        if self.catch_up_rounds == 0 {
            return Err(ConfigError::InvalidCatchUpRounds);
        }
        Ok(Config {
            election_timeout_min: self.election_timeout_min,
            election_timeout_max: self.election_timeout_max,
            heartbeat_interval: self.heartbeat_interval,
            max_payload_entries: self.max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold,
            snapshot_policy_threshold: self.snapshot_policy_threshold,
            snapshot_trailing_entries: self.snapshot_trailing_entries,
            snapshot_max_chunk_size: self.snapshot_max_chunk_size,
            catch_up_rounds: self.catch_up_rounds,
        })
    }

    pub fn build(self) -> Result<Arc<Config>, ConfigError> {
        self.validate().map(Arc::new)
    }
}
