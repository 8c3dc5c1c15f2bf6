//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, framed for the wire by decision-cluster
//! what: PreVote, Vote and AppendEntries requests with their responses

use serde::{Deserialize, Serialize};

use crate::{LogEntry, LogIndex, NodeId, Term};

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    /// Ask whether peers would vote, without bumping anyone's term.
    /// `term` is the term the candidate would campaign in.
    PreVoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    PreVoteResponse {
        term: Term,
        vote_granted: bool,
    },
    /// Request a vote during leader election
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    /// Response to a vote request
    VoteResponse {
        term: Term,
        vote_granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    /// Response to AppendEntries.
    ///
    /// On success `match_index` is the last index known to match the leader;
    /// on failure it is the follower's last log index, a backtracking hint.
    AppendEntriesResponse {
        term: Term,
        success: bool,
        match_index: LogIndex,
    },
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::PreVoteRequest { term, .. }
            | RaftMessage::PreVoteResponse { term, .. }
            | RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. } => *term,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            RaftMessage::PreVoteRequest { .. }
                | RaftMessage::VoteRequest { .. }
                | RaftMessage::AppendEntries { .. }
        )
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::PreVoteRequest { .. } => "pre_vote_request",
            RaftMessage::PreVoteResponse { .. } => "pre_vote_response",
            RaftMessage::VoteRequest { .. } => "vote_request",
            RaftMessage::VoteResponse { .. } => "vote_response",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_wire_format_is_tagged() {
        let msg = RaftMessage::AppendEntries {
            term: 3,
            leader_id: 1,
            prev_log_index: 4,
            prev_log_term: 2,
            entries: vec![],
            leader_commit: 4,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "append_entries");
        assert_eq!(json["leader_commit"], 4);
        assert!(msg.is_request());
        assert_eq!(msg.term(), 3);
    }
}
