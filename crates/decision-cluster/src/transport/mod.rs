//! # transport
//!
//! why: move raft rpcs, gossip pings and client requests between agent nodes
//! relations: used by node.rs for outbound rpcs, serves requests into gateway.rs
//! what: wire Request/Response enums, Transport and RequestHandler traits, tcp and in-memory impls

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use decision_core::{LogIndex, MembershipChange, NodeId, RaftMessage};
use serde::{Deserialize, Serialize};

use crate::applier::DecisionOutcome;
use crate::error::TransportError;
use crate::gateway::SubmitResponse;
use crate::node::ClusterStatus;

pub use memory::{InMemoryNetwork, InMemoryTransport};
pub use tcp::{serve, TcpTransport};

/// Everything one node (or a client) can ask another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// A consensus rpc from peer `from`.
    Raft { from: NodeId, message: RaftMessage },
    /// Gossip heartbeat carrying the sender's address book.
    Ping {
        from: NodeId,
        address: String,
        known: Vec<(NodeId, String)>,
    },
    /// A decision proposal. `forwarded` marks the single permitted hop to the leader.
    Submit {
        command: serde_json::Value,
        #[serde(default)]
        dedup_key: Option<String>,
        #[serde(default)]
        forwarded: bool,
    },
    /// Join or leave, committed through the log like any other decision.
    Membership {
        change: MembershipChange,
        #[serde(default)]
        forwarded: bool,
    },
    Outcome { index: LogIndex },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// `None` when the node could not process the rpc (halted).
    Raft { message: Option<RaftMessage> },
    Pong {
        from: NodeId,
        known: Vec<(NodeId, String)>,
    },
    Submitted(SubmitResponse),
    Outcome { outcome: Option<DecisionOutcome> },
    Status(ClusterStatus),
    Error { message: String },
}

/// Point-to-point request/response to a peer.
///
/// Implementations may address by id, by address, or both. Deadlines are
/// the caller's business.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        target: NodeId,
        address: &str,
        request: Request,
    ) -> Result<Response, TransportError>;
}

/// Server side: whatever answers requests arriving at a node.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}
