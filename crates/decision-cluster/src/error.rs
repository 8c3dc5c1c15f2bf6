//! # error
//!
//! why: typed failures for the async runtime around the consensus engine
//! relations: wraps decision-core's RaftError and StorageError
//! what: TransportError, ApplyError, ConfigError, ClusterError

use std::path::PathBuf;

use decision_core::{LogIndex, NodeId, RaftError, StorageError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// No route to the peer: connection refused, partitioned, or not registered.
    #[error("node {node} is unreachable")]
    Unreachable { node: NodeId },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    /// The peer closed the connection before answering.
    #[error("connection closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Entries must be applied strictly in index order with no gaps.
    #[error("out-of-order apply: expected index {expected}, got {got}")]
    OutOfOrder { expected: LogIndex, got: LogIndex },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(PathBuf),

    #[error("failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Crate-level error returned by node handles and the gateway.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The node loop stopped after an unrecoverable error, or was shut down.
    #[error("node halted: {0}")]
    Halted(String),
}

impl ClusterError {
    /// Errors after which the node must stop rather than risk divergence.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClusterError::Raft(err) => err.is_fatal(),
            ClusterError::Storage(_) | ClusterError::Apply(_) | ClusterError::Halted(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_follows_the_engine() {
        assert!(ClusterError::from(ApplyError::OutOfOrder { expected: 2, got: 3 }).is_fatal());
        assert!(ClusterError::from(RaftError::InvariantViolation("x".into())).is_fatal());
        assert!(!ClusterError::from(RaftError::NotLeader { leader_hint: None }).is_fatal());
        assert!(!ClusterError::from(TransportError::Closed).is_fatal());
    }
}
