//! The in-memory replicated log (§4.1).
//!
//! Entries are stored in a `VecDeque<Arc<Entry<D>>>`; the spec's explicit
//! refcount table is realized as `Arc`'s own strong count (see §4.1 "Rust
//! realization" in SPEC_FULL.md) rather than a parallel `HashMap<(u64, u64),
//! usize>` — acquiring/releasing an entry is cloning/dropping its `Arc`.

use crate::raft_types::LogId;
use crate::raft::{Entry, EntryPayload};
use crate::AppData;
use std::collections::VecDeque;
use std::sync::Arc;

/// The log's view of the most recent snapshot boundary (§3).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SnapshotBoundary {
    pub last_log_id: LogId,
}

/// In-memory replicated log: a deque of entries above `offset`, plus the
/// snapshot boundary below which entries are logically absent.
pub struct Log<D: AppData> {
    /// Entries currently held in memory, in strictly increasing index order.
    entries: VecDeque<Arc<Entry<D>>>,
    /// Index below (and including) which entries are no longer materialized
    /// in `entries` (covered by a snapshot, or simply truncated).
    offset: u64,
    snapshot: SnapshotBoundary,
}

impl<D: AppData> Log<D> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            offset: 0,
            snapshot: SnapshotBoundary::default(),
        }
    }

    /// Resets the log around an existing snapshot boundary: both at `start`
    /// when loading from storage, and after installing a follower snapshot
    /// (§3 "Lifecycle", §4.1 `restore`).
    pub fn restore(&mut self, last_log_id: LogId) {
        self.entries.clear();
        self.offset = last_log_id.index;
        self.snapshot = SnapshotBoundary { last_log_id };
    }

    pub fn snapshot_boundary(&self) -> SnapshotBoundary {
        self.snapshot
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn last_log_id(&self) -> LogId {
        match self.entries.back() {
            Some(entry) => entry.log_id,
            None => self.snapshot.last_log_id,
        }
    }

    pub fn last_index(&self) -> u64 {
        self.last_log_id().index
    }

    fn index_in_bounds(&self, index: u64) -> bool {
        index > self.offset && index <= self.offset + self.entries.len() as u64
    }

    /// Returns the entry at `index`, if it is currently materialized.
    pub fn get(&self, index: u64) -> Option<Arc<Entry<D>>> {
        if !self.index_in_bounds(index) {
            return None;
        }
        let pos = (index - self.offset - 1) as usize;
        self.entries.get(pos).cloned()
    }

    /// Returns the term of the entry at `index`, or the snapshot's term if
    /// `index` exactly matches the snapshot boundary.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if index == self.snapshot.last_log_id.index {
            return Some(self.snapshot.last_log_id.term);
        }
        self.get(index).map(|e| e.log_id.term)
    }

    /// Appends a single new entry. The caller is responsible for assigning
    /// the correct `(term, index)` — the log itself only enforces that
    /// indices remain strictly increasing (§4.1 invariant).
    pub fn append(&mut self, entry: Arc<Entry<D>>) {
        debug_assert_eq!(entry.log_id.index, self.last_index() + 1);
        self.entries.push_back(entry);
    }

    pub fn append_many(&mut self, entries: impl IntoIterator<Item = Arc<Entry<D>>>) {
        for entry in entries {
            self.append(entry);
        }
    }

    /// Returns (clones of) the entries at and above `from_index` that are
    /// currently materialized, bumping their `Arc` refcount for as long as
    /// the caller holds the returned vector — e.g. across the background
    /// apply task spawned by [`crate::core::RaftCore::client_apply_pipeline_tick`],
    /// so a concurrent truncation can't drop an entry out from under it
    /// (§4.1 `acquire`).
    pub fn acquire(&self, from_index: u64, up_to_index: u64) -> Vec<Arc<Entry<D>>> {
        let mut out = Vec::new();
        for index in from_index..=up_to_index {
            match self.get(index) {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        out
    }

    /// Releases a previously-[`Log::acquire`]d batch. Because entries are
    /// reference-counted via `Arc`, this is just dropping the vector; kept as
    /// a named operation so call sites read as acquire/release pairs rather
    /// than an implicit drop (§4.1 `release`).
    pub fn release(_entries: Vec<Arc<Entry<D>>>) {}

    /// Removes every entry at and after `from_index`, releasing the log's
    /// own reference to each (§4.1 `truncate`).
    pub fn truncate(&mut self, from_index: u64) {
        if from_index <= self.offset {
            self.entries.clear();
            return;
        }
        let keep = (from_index - self.offset - 1) as usize;
        self.entries.truncate(keep);
    }

    /// Identical effect to [`Log::truncate`]; kept as a distinct name to
    /// mirror the spec's `discard` operation, used on append-path rollback
    /// where no extra release bookkeeping is owed beyond dropping the
    /// `Arc`s (§4.1).
    pub fn discard(&mut self, from_index: u64) {
        self.truncate(from_index);
    }

    /// Advances the snapshot boundary to `last_log_id`, releasing every
    /// entry at or below it except for `trailing` entries retained above the
    /// boundary as a hint for laggard peers (§3, §4.1 `snapshot`).
    pub fn snapshot(&mut self, last_log_id: LogId, trailing: u64) {
        if last_log_id.index <= self.snapshot.last_log_id.index {
            return;
        }
        let keep_from = last_log_id.index.saturating_sub(trailing);
        let drop_upto = keep_from.min(last_log_id.index);
        if drop_upto > self.offset {
            let drop_count = (drop_upto - self.offset) as usize;
            for _ in 0..drop_count.min(self.entries.len()) {
                self.entries.pop_front();
            }
            self.offset = drop_upto;
        }
        self.snapshot = SnapshotBoundary { last_log_id };
    }

    /// Used at load time to align the in-memory deque with a known starting
    /// index read from storage (§4.1 `seek`).
    pub fn seek(&mut self, start_index: u64, entries: Vec<Arc<Entry<D>>>) {
        self.offset = start_index.saturating_sub(1);
        self.entries = entries.into_iter().collect();
    }

    /// Scans backward from `last_index()` for the most recent CHANGE entry,
    /// used to reconstruct `configuration_index`/`configuration_uncommitted_index`
    /// after a truncation (§3 configuration index invariants).
    pub fn last_configuration_entry(&self) -> Option<Arc<Entry<D>>> {
        self.entries
            .iter()
            .rev()
            .find(|e| matches!(e.payload, EntryPayload::Change(_)))
            .cloned()
    }
}

impl<D: AppData> Default for Log<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Configuration;
    use crate::raft::EntryPayload;

    fn entry(term: u64, index: u64, payload: EntryPayload<Vec<u8>>) -> Arc<Entry<Vec<u8>>> {
        Arc::new(Entry {
            log_id: LogId::new(term, index),
            payload,
        })
    }

    #[test]
    fn append_then_truncate_is_observationally_identical() {
        let mut log: Log<Vec<u8>> = Log::new();
        log.append(entry(1, 1, EntryPayload::Command(vec![1])));
        log.append(entry(1, 2, EntryPayload::Command(vec![2])));
        let before = log.last_log_id();
        log.append(entry(1, 3, EntryPayload::Command(vec![3])));
        log.truncate(3);
        assert_eq!(log.last_log_id(), before);
        assert_eq!(log.num_entries(), 2);
    }

    #[test]
    fn snapshot_retains_trailing_entries() {
        let mut log: Log<Vec<u8>> = Log::new();
        for i in 1..=10u64 {
            log.append(entry(1, i, EntryPayload::Command(vec![i as u8])));
        }
        log.snapshot(LogId::new(1, 8), 2);
        assert_eq!(log.snapshot_boundary().last_log_id, LogId::new(1, 8));
        // entries 7,8 retained as trailing hint, 9,10 still present above boundary
        assert!(log.get(6).is_none());
        assert!(log.get(7).is_some());
        assert!(log.get(10).is_some());
    }

    #[test]
    fn last_configuration_entry_scans_backward() {
        let mut log: Log<Vec<u8>> = Log::new();
        let conf = Configuration::new_initial(1, "a");
        log.append(entry(1, 1, EntryPayload::Change(conf.clone())));
        log.append(entry(1, 2, EntryPayload::Command(vec![9])));
        let found = log.last_configuration_entry().unwrap();
        assert_eq!(found.log_id, LogId::new(1, 1));
    }
}
