//! # log
//!
//! why: manage the append-only log of decisions that raft replicates
//! relations: used by node.rs for replication, implemented durably by decision-storage
//! what: LogEntry, EntryPayload, HardState, the LogStore contract, MemLogStore

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::error::StorageError;
use crate::{LogIndex, NodeId, Term};

/// A single-server change to the cluster roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum MembershipChange {
    Join { node_id: NodeId, address: String },
    Leave { node_id: NodeId },
}

/// What an entry carries. Commands stay opaque bytes at this layer;
/// decoding is the applier's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Appended by a new leader so earlier-term entries can commit.
    Noop,
    Command {
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dedup_key: Option<String>,
    },
    Membership(MembershipChange),
    /// The full starting roster, written at index 1 by the first leader in
    /// place of its no-op. Replaces whatever seed list a node booted with.
    Roster { members: ClusterConfig },
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a command entry without a dedup key
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Command { data: command, dedup_key: None },
        }
    }

    pub fn with_payload(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self { term, index, payload }
    }

    /// The opaque command bytes, if this is a command entry.
    pub fn command(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Command { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn membership_change(&self) -> Option<&MembershipChange> {
        match &self.payload {
            EntryPayload::Membership(change) => Some(change),
            _ => None,
        }
    }

    /// The roster in force once this entry is in the log, if it changes it.
    pub fn roster_after(&self, current: &ClusterConfig) -> Option<ClusterConfig> {
        match &self.payload {
            EntryPayload::Membership(change) => Some(current.with_change(change)),
            EntryPayload::Roster { members } => Some(members.clone()),
            _ => None,
        }
    }
}

/// Term and vote; must hit durable storage before any vote is granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Ordered, append-only storage for one node's log.
///
/// Every mutating call returns only once the change is durable, so an
/// AppendEntries success or a vote grant built on top of it is safe to send.
/// `get` returning `None` is the NotFound case.
pub trait LogStore: Send {
    /// Append entries; the first must directly follow the current last index.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Drop every entry with index >= `from_index`. Committed entries are never dropped.
    fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<(), StorageError>;

    fn get(&self, index: LogIndex) -> Option<&LogEntry>;

    /// `(0, 0)` for an empty log.
    fn last_index_and_term(&self) -> (LogIndex, Term);

    /// Record that entries up to `index` are committed. Never moves backwards.
    fn mark_committed(&mut self, index: LogIndex) -> Result<(), StorageError>;

    fn committed_index(&self) -> LogIndex;

    fn save_hard_state(&mut self, state: HardState) -> Result<(), StorageError>;

    fn hard_state(&self) -> HardState;

    /// Up to `max` entries starting at `from`.
    fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let (last, _) = self.last_index_and_term();
        (from.max(1)..=last)
            .take(max)
            .filter_map(|index| self.get(index).cloned())
            .collect()
    }

    /// Term of the entry at `index`, 0 for index 0 or a missing entry.
    fn term_at(&self, index: LogIndex) -> Term {
        if index == 0 {
            return 0;
        }
        self.get(index).map(|e| e.term).unwrap_or(0)
    }
}

/// Checks that `entries` continue a log whose last index is `last`.
pub fn check_contiguous(last: LogIndex, entries: &[LogEntry]) -> Result<(), StorageError> {
    let mut expected = last + 1;
    for entry in entries {
        if entry.index != expected {
            return Err(StorageError::NonContiguous { expected, got: entry.index });
        }
        expected += 1;
    }
    Ok(())
}

// -- in-memory log store --

/// in-memory log store for tests and ephemeral nodes
///
/// nothing survives a restart
#[derive(Debug, Default)]
pub struct MemLogStore {
    entries: Vec<LogEntry>,
    hard_state: HardState,
    committed: LogIndex,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LogStore for MemLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        check_contiguous(self.entries.len() as LogIndex, entries)?;
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        if from_index <= self.committed {
            return Err(StorageError::CommittedTruncation {
                from: from_index,
                committed: self.committed,
            });
        }
        self.entries.retain(|e| e.index < from_index);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    fn last_index_and_term(&self) -> (LogIndex, Term) {
        self.entries.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
    }

    fn mark_committed(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.committed = self.committed.max(index);
        Ok(())
    }

    fn committed_index(&self) -> LogIndex {
        self.committed
    }

    fn save_hard_state(&mut self, state: HardState) -> Result<(), StorageError> {
        self.hard_state = state;
        Ok(())
    }

    fn hard_state(&self) -> HardState {
        self.hard_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rejects_gaps() {
        let mut store = MemLogStore::new();
        store.append(&[LogEntry::new(1, 1, vec![1])]).unwrap();

        let err = store.append(&[LogEntry::new(1, 3, vec![3])]).unwrap_err();
        assert!(matches!(err, StorageError::NonContiguous { expected: 2, got: 3 }));
    }

    #[test]
    fn committed_entries_cannot_be_truncated() {
        let mut store = MemLogStore::new();
        store
            .append(&[LogEntry::new(1, 1, vec![1]), LogEntry::new(1, 2, vec![2])])
            .unwrap();
        store.mark_committed(1).unwrap();

        assert!(store.truncate_suffix(1).is_err());
        store.truncate_suffix(2).unwrap();
        assert_eq!(store.last_index_and_term(), (1, 1));
    }

    #[test]
    fn mark_committed_never_regresses() {
        let mut store = MemLogStore::new();
        store.mark_committed(4).unwrap();
        store.mark_committed(2).unwrap();
        assert_eq!(store.committed_index(), 4);
    }

    #[test]
    fn entries_from_respects_max() {
        let mut store = MemLogStore::new();
        let entries: Vec<_> = (1..=5).map(|i| LogEntry::new(1, i, vec![i as u8])).collect();
        store.append(&entries).unwrap();

        let batch = store.entries_from(2, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
        assert_eq!(batch[1].index, 3);
        assert!(store.entries_from(6, 10).is_empty());
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let entry = LogEntry::with_payload(
            2,
            7,
            EntryPayload::Membership(MembershipChange::Leave { node_id: 3 }),
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"membership\""));
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
