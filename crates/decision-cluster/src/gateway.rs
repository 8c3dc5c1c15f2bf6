//! # gateway
//!
//! why: the entry point external collaborators submit decisions through
//! relations: wraps a NodeHandle; serves every inbound transport Request
//! what: SubmitStatus/SubmitResponse, Gateway (submit, join, leave, outcome, status, one-hop forwarding)
//!
//! A timeout never means "failed". The entry may still commit; callers
//! resolve it with `outcome(index)` or retry with the same dedup key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use decision_core::{LogIndex, MembershipChange, NodeId, RaftError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::applier::DecisionOutcome;
use crate::error::{ClusterError, TransportError};
use crate::node::{ClusterStatus, NodeHandle};
use crate::transport::{Request, RequestHandler, Response, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// Committed and applied; see `outcome`.
    Committed,
    /// Not appended anywhere. Safe to retry.
    Rejected,
    /// Unknown. Query by index before retrying without a dedup key.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    #[serde(default)]
    pub index: Option<LogIndex>,
    #[serde(default)]
    pub outcome: Option<DecisionOutcome>,
    #[serde(default)]
    pub leader_hint: Option<NodeId>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SubmitResponse {
    pub fn committed(outcome: DecisionOutcome) -> Self {
        Self {
            status: SubmitStatus::Committed,
            index: Some(outcome.index),
            outcome: Some(outcome),
            leader_hint: None,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>, leader_hint: Option<NodeId>) -> Self {
        Self {
            status: SubmitStatus::Rejected,
            index: None,
            outcome: None,
            leader_hint,
            reason: Some(reason.into()),
        }
    }

    pub fn timeout(index: Option<LogIndex>, reason: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Timeout,
            index,
            outcome: None,
            leader_hint: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    node: NodeHandle,
    transport: Arc<dyn Transport>,
    /// Deadline for a forwarded call; leaves the leader its full commit window.
    forward_timeout: Duration,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("node", &self.node).finish()
    }
}

impl Gateway {
    pub fn new(node: NodeHandle, transport: Arc<dyn Transport>) -> Self {
        let forward_timeout = node.commit_timeout() * 2;
        Self { node, transport, forward_timeout }
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Propose a decision command here, or at the leader if this node is not it.
    pub async fn submit(&self, command: serde_json::Value, dedup_key: Option<String>) -> SubmitResponse {
        self.submit_command(command, dedup_key, false).await
    }

    pub async fn join(&self, node_id: NodeId, address: impl Into<String>) -> SubmitResponse {
        let change = MembershipChange::Join { node_id, address: address.into() };
        self.change_membership(change, false).await
    }

    pub async fn leave(&self, node_id: NodeId) -> SubmitResponse {
        self.change_membership(MembershipChange::Leave { node_id }, false).await
    }

    /// The outcome applied on this node, if it has applied `index` yet.
    pub async fn outcome(&self, index: LogIndex) -> Result<Option<DecisionOutcome>, ClusterError> {
        self.node.outcome(index).await
    }

    pub async fn status(&self) -> Result<ClusterStatus, ClusterError> {
        self.node.status().await
    }

    async fn submit_command(
        &self,
        command: serde_json::Value,
        dedup_key: Option<String>,
        forwarded: bool,
    ) -> SubmitResponse {
        let bytes = match serde_json::to_vec(&command) {
            Ok(bytes) => bytes,
            Err(e) => return SubmitResponse::rejected(format!("unserializable command: {e}"), None),
        };
        let result = self.node.propose(bytes, dedup_key.clone()).await;
        let retry = (!forwarded).then(|| Request::Submit { command, dedup_key, forwarded: true });
        self.settle(result, retry).await
    }

    async fn change_membership(&self, change: MembershipChange, forwarded: bool) -> SubmitResponse {
        let result = self.node.propose_membership(change.clone()).await;
        let retry = (!forwarded).then(|| Request::Membership { change, forwarded: true });
        self.settle(result, retry).await
    }

    /// Map a local proposal result to a client response. `retry` is the
    /// request to forward on NotLeader; `None` once it has already hopped.
    async fn settle(&self, result: Result<DecisionOutcome, ClusterError>, retry: Option<Request>) -> SubmitResponse {
        match result {
            Ok(outcome) => SubmitResponse::committed(outcome),
            Err(ClusterError::Raft(RaftError::NotLeader { leader_hint })) => match retry {
                Some(request) => self.forward(leader_hint, request).await,
                None => SubmitResponse::rejected("not the leader", leader_hint),
            },
            Err(ClusterError::Raft(RaftError::CommitTimeout { index })) => {
                SubmitResponse::timeout(index, "not applied within the commit timeout")
            }
            Err(err) => SubmitResponse::rejected(err.to_string(), None),
        }
    }

    async fn forward(&self, leader_hint: Option<NodeId>, request: Request) -> SubmitResponse {
        let Some(leader) = leader_hint.filter(|leader| *leader != self.node.id()) else {
            return SubmitResponse::rejected("no known leader", None);
        };
        let address = self.node.registry().read().address(leader).map(str::to_string);
        let Some(address) = address else {
            return SubmitResponse::rejected(format!("no address for leader {leader}"), Some(leader));
        };

        debug!(node = self.node.id(), leader, %address, "forwarding to leader");
        let sent = tokio::time::timeout(self.forward_timeout, self.transport.send(leader, &address, request)).await;
        let mut response = match sent {
            Ok(Ok(Response::Submitted(response))) => response,
            Ok(Ok(Response::Error { message })) => SubmitResponse::rejected(message, Some(leader)),
            Ok(Ok(other)) => SubmitResponse::rejected(format!("unexpected response: {other:?}"), Some(leader)),
            // never reached the leader, so nothing was appended
            Ok(Err(TransportError::Unreachable { .. })) => {
                SubmitResponse::rejected(format!("leader {leader} unreachable"), Some(leader))
            }
            Ok(Err(err)) => {
                warn!(node = self.node.id(), leader, error = %err, "forwarded request lost");
                SubmitResponse::timeout(None, err.to_string())
            }
            Err(_) => SubmitResponse::timeout(None, "forwarded request timed out"),
        };
        if response.status != SubmitStatus::Committed && response.leader_hint.is_none() {
            response.leader_hint = Some(leader);
        }
        response
    }
}

#[async_trait]
impl RequestHandler for Gateway {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Raft { from, message } => Response::Raft {
                message: self.node.raft_rpc(from, message).await,
            },
            Request::Ping { from, address, known } => {
                let known = {
                    let registry = self.node.registry();
                    let mut registry = registry.write();
                    registry.heartbeat(from);
                    registry.learn(&[(from, address)]);
                    registry.learn(&known);
                    registry.known()
                };
                Response::Pong { from: self.node.id(), known }
            }
            Request::Submit { command, dedup_key, forwarded } => {
                Response::Submitted(self.submit_command(command, dedup_key, forwarded).await)
            }
            Request::Membership { change, forwarded } => {
                Response::Submitted(self.change_membership(change, forwarded).await)
            }
            Request::Outcome { index } => match self.node.outcome(index).await {
                Ok(outcome) => Response::Outcome { outcome },
                Err(e) => Response::Error { message: e.to_string() },
            },
            Request::Status => match self.node.status().await {
                Ok(status) => Response::Status(status),
                Err(e) => Response::Error { message: e.to_string() },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_wire_format() {
        let response = SubmitResponse::rejected("not the leader", Some(3));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["leader_hint"], 3);

        let back: SubmitResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn timeout_keeps_the_index() {
        let response = SubmitResponse::timeout(Some(9), "slow");
        assert_eq!(response.status, SubmitStatus::Timeout);
        assert_eq!(response.index, Some(9));
        assert!(response.outcome.is_none());
    }
}
