//! # applier
//!
//! why: turn committed log entries into decision outcomes, identically on every node
//! relations: fed by node.rs with entries from RaftNode::take_entries_to_apply
//! what: StateMachine trait, DecisionResult/DecisionOutcome, DecisionApplier (ordering + dedup + cache)

use std::collections::{BTreeMap, HashMap};

use decision_core::{ClusterConfig, EntryPayload, LogEntry, LogIndex, MembershipChange, Term};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApplyError;

/// What applying one entry produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DecisionResult {
    Accepted { effect: serde_json::Value },
    /// The command committed but the state machine refused it.
    Rejected { reason: String },
    /// Leader no-op.
    Noop,
    Membership { change: MembershipChange },
    /// The starting roster the first leader wrote.
    Roster { members: ClusterConfig },
}

/// Immutable outcome of a committed index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub index: LogIndex,
    pub term: Term,
    pub result: DecisionResult,
    /// Set when the command repeated a dedup key already applied at this index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<LogIndex>,
}

/// Deterministic application of decision commands.
///
/// Must depend only on prior state and the command bytes; no clocks, no
/// randomness, no I/O.
pub trait StateMachine: Send {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> DecisionResult;
}

pub struct DecisionApplier {
    machine: Box<dyn StateMachine>,
    last_applied: LogIndex,
    outcomes: BTreeMap<LogIndex, DecisionOutcome>,
    dedup: HashMap<String, LogIndex>,
}

impl std::fmt::Debug for DecisionApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionApplier")
            .field("last_applied", &self.last_applied)
            .field("outcomes", &self.outcomes.len())
            .field("dedup_keys", &self.dedup.len())
            .finish()
    }
}

impl DecisionApplier {
    pub fn new(machine: Box<dyn StateMachine>) -> Self {
        Self {
            machine,
            last_applied: 0,
            outcomes: BTreeMap::new(),
            dedup: HashMap::new(),
        }
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn outcome(&self, index: LogIndex) -> Option<&DecisionOutcome> {
        self.outcomes.get(&index)
    }

    /// Apply the next entry. Re-applying an already applied index returns
    /// the cached outcome; skipping ahead is an error.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<DecisionOutcome, ApplyError> {
        if entry.index <= self.last_applied {
            if let Some(outcome) = self.outcomes.get(&entry.index) {
                return Ok(outcome.clone());
            }
        }
        let expected = self.last_applied + 1;
        if entry.index != expected {
            return Err(ApplyError::OutOfOrder { expected, got: entry.index });
        }

        let mut duplicate_of = None;
        let result = match &entry.payload {
            EntryPayload::Noop => DecisionResult::Noop,
            EntryPayload::Membership(change) => DecisionResult::Membership { change: change.clone() },
            EntryPayload::Roster { members } => DecisionResult::Roster { members: members.clone() },
            EntryPayload::Command { data, dedup_key } => {
                match dedup_key.as_ref().and_then(|k| self.dedup.get(k).map(|i| (k, *i))) {
                    Some((key, original)) => {
                        debug!(index = entry.index, original, key = %key, "duplicate command, not re-applying");
                        duplicate_of = Some(original);
                        self.outcomes
                            .get(&original)
                            .map(|o| o.result.clone())
                            .unwrap_or(DecisionResult::Noop)
                    }
                    None => {
                        if let Some(key) = dedup_key {
                            self.dedup.insert(key.clone(), entry.index);
                        }
                        self.machine.apply(entry.index, data)
                    }
                }
            }
        };

        let outcome = DecisionOutcome { index: entry.index, term: entry.term, result, duplicate_of };
        self.outcomes.insert(entry.index, outcome.clone());
        self.last_applied = entry.index;
        Ok(outcome)
    }
}
