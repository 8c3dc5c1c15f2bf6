//! # decision-core
//!
//! why: implement the raft consensus algorithm behind the decision log in pure, portable rust
//! relations: driven by decision-cluster's node runtime, persisted via decision-storage
//! what: state machine, election logic, log contract, roster and message types

pub mod cluster;
pub mod error;
pub mod log;
pub mod message;
pub mod node;

pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

pub use cluster::ClusterConfig;
pub use error::{RaftError, StorageError};
pub use log::{EntryPayload, HardState, LogEntry, LogStore, MemLogStore, MembershipChange};
pub use message::RaftMessage;
pub use node::{NodeState, NodeStatus, RaftConfig, RaftNode};
