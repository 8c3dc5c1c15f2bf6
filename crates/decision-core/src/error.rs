//! # error
//!
//! why: give every failure the consensus engine can report a typed name
//! relations: returned by node.rs and log.rs, wrapped by decision-cluster errors
//! what: RaftError (engine taxonomy), StorageError (log store failures)

use thiserror::Error;

use crate::{LogIndex, NodeId};

/// Failures raised by a log store implementation.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log data: {0}")]
    Corrupt(String),

    #[error("refusing to truncate from {from}: entries up to {committed} are committed")]
    CommittedTruncation { from: LogIndex, committed: LogIndex },

    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: LogIndex, got: LogIndex },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

/// Errors surfaced by the consensus engine.
#[derive(Error, Debug)]
pub enum RaftError {
    /// This node cannot accept proposals; retry at the hinted leader.
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// The request carried a term older than ours.
    #[error("stale term {received}, current term is {current}")]
    StaleTerm { received: u64, current: u64 },

    /// Follower log lacks a matching entry at prev_log_index.
    #[error("log inconsistency at index {index}")]
    LogInconsistency { index: LogIndex },

    /// The leader could not reach a majority of the configured members.
    #[error("quorum unavailable: heard from {reachable} of {quorum} required members")]
    QuorumUnavailable { reachable: usize, quorum: usize },

    /// The proposal was appended but not observed committed in time.
    /// It may still commit later.
    #[error("commit timeout (index: {index:?})")]
    CommitTimeout { index: Option<LogIndex> },

    #[error("a membership change is already in progress")]
    MembershipChangePending,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Safety property broken; the node must halt.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl RaftError {
    /// Whether a caller may simply retry (possibly elsewhere).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. } | RaftError::QuorumUnavailable { .. } | RaftError::MembershipChangePending
        )
    }

    /// Whether the node must stop instead of continuing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Storage(_) | RaftError::InvariantViolation(_))
    }
}
