//! # node
//!
//! why: the raft state machine: elections, replication, commit tracking
//! relations: uses message.rs for rpc types, log.rs for storage, cluster.rs for quorum
//! what: NodeState, RaftConfig, RaftNode and every role transition
//!
//! The node does no I/O of its own and never reads a clock. Callers feed it
//! timer expirations and inbound messages; it returns the messages to send.
//! Everything that must be durable goes through the LogStore before a
//! handler returns.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::ClusterConfig;
use crate::error::RaftError;
use crate::log::{EntryPayload, HardState, LogEntry, LogStore, MembershipChange};
use crate::message::RaftMessage;
use crate::{LogIndex, NodeId, Term};

/// The possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Polling peers before campaigning; the term has not moved yet
    PreCandidate,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Timing and batching knobs for a node. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    /// Must stay strictly below `election_timeout_min`.
    pub heartbeat_interval: u64,
    pub pre_vote: bool,
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            pre_vote: true,
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    /// A fresh timeout drawn from `[min, max]` to break split votes.
    pub fn random_election_timeout(&self) -> Duration {
        let max = self.election_timeout_max.max(self.election_timeout_min);
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

/// Point-in-time view of a node, for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub members: Vec<NodeId>,
}

/// A single Raft node in the cluster
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Current state (Follower, PreCandidate, Candidate, or Leader)
    pub state: NodeState,
    /// Latest term this node has seen (persisted)
    pub current_term: Term,
    /// Node ID that received our vote in current term (persisted)
    pub voted_for: Option<NodeId>,
    /// Local belief about who leads the current term
    pub leader_id: Option<NodeId>,
    /// Highest index known to be replicated on a majority
    pub commit_index: LogIndex,
    /// Highest index handed out for application
    pub last_applied: LogIndex,
    pub votes_received: BTreeSet<NodeId>,
    pub pre_votes_received: BTreeSet<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, LogIndex>,
    pub config: RaftConfig,
    /// Roster history. Entry 0 is the seed roster from configuration; it
    /// only counts until the `Roster` entry at index 1 reaches the log.
    configs: Vec<(LogIndex, ClusterConfig)>,
    /// Peers that answered since the last lease check.
    recent_acks: BTreeSet<NodeId>,
    log: Box<dyn LogStore>,
}

impl fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current_term", &self.current_term)
            .field("leader_id", &self.leader_id)
            .field("commit_index", &self.commit_index)
            .field("last_log_index", &self.last_log_index())
            .finish()
    }
}

impl RaftNode {
    /// Create a node in Follower state, restoring term, vote and log from `log`.
    pub fn new(id: NodeId, cluster: ClusterConfig, log: Box<dyn LogStore>) -> Self {
        Self::with_config(id, cluster, log, RaftConfig::default())
    }

    pub fn with_config(
        id: NodeId,
        cluster: ClusterConfig,
        log: Box<dyn LogStore>,
        config: RaftConfig,
    ) -> Self {
        let HardState { term, voted_for } = log.hard_state();
        let commit_index = log.committed_index();
        let mut node = Self {
            id,
            state: NodeState::Follower,
            current_term: term,
            voted_for,
            leader_id: None,
            commit_index,
            last_applied: 0,
            votes_received: BTreeSet::new(),
            pre_votes_received: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            config,
            configs: Vec::new(),
            recent_acks: BTreeSet::new(),
            log,
        };
        node.rebuild_configs(cluster);
        node
    }

    /// Replays roster entries on top of the seed roster.
    fn rebuild_configs(&mut self, seed: ClusterConfig) {
        let mut configs = vec![(0, seed)];
        let (last, _) = self.log.last_index_and_term();
        for index in 1..=last {
            let current = &configs[configs.len() - 1].1;
            let next = self.log.get(index).and_then(|e| e.roster_after(current));
            if let Some(next) = next {
                configs.push((index, next));
            }
        }
        self.configs = configs;
    }

    // -- queries --

    /// The latest roster in the log, committed or not.
    pub fn cluster(&self) -> &ClusterConfig {
        &self.configs[self.configs.len() - 1].1
    }

    /// Every other configured member.
    pub fn peers(&self) -> Vec<NodeId> {
        self.cluster().ids().filter(|id| *id != self.id).collect()
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster().quorum_size()
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index_and_term().0
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_index_and_term().1
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log.get(index)
    }

    pub fn get_term_at(&self, index: LogIndex) -> Term {
        self.log.term_at(index)
    }

    /// True while a roster change sits in the log uncommitted.
    pub fn has_pending_config_change(&self) -> bool {
        self.configs[self.configs.len() - 1].0 > self.commit_index
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
            members: self.cluster().ids().collect(),
        }
    }

    /// Raft's up-to-date rule: compare (last term, last index) lexicographically.
    pub fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index())
    }

    // -- role transitions --

    fn persist_hard_state(&mut self) -> Result<(), RaftError> {
        self.log.save_hard_state(HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        })?;
        Ok(())
    }

    /// Step down to follower, adopting `term` if it is newer.
    ///
    /// The vote is only cleared when the term moves; a same-term step-down
    /// keeps it, or this node could vote twice in one term.
    pub fn become_follower(&mut self, term: Term) -> Result<(), RaftError> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_hard_state()?;
        }
        if self.state != NodeState::Follower {
            info!(node = self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.pre_votes_received.clear();
        self.clear_leader_progress();
        Ok(())
    }

    fn clear_leader_progress(&mut self) {
        self.next_index.clear();
        self.match_index.clear();
        self.recent_acks.clear();
    }

    /// Called when the election timer fires. Returns the request to
    /// broadcast to every peer, if any.
    pub fn on_election_timeout(&mut self) -> Result<Option<RaftMessage>, RaftError> {
        if self.state == NodeState::Leader {
            return Ok(None);
        }
        if !self.cluster().contains(self.id) {
            debug!(node = self.id, "not a configured member, not campaigning");
            return Ok(None);
        }
        self.leader_id = None;
        let request = if self.config.pre_vote {
            self.start_pre_vote()?
        } else {
            self.start_election()?
        };
        Ok(Some(request))
    }

    /// Poll peers without touching our term.
    pub fn start_pre_vote(&mut self) -> Result<RaftMessage, RaftError> {
        self.state = NodeState::PreCandidate;
        self.leader_id = None;
        self.pre_votes_received.clear();
        self.pre_votes_received.insert(self.id);
        debug!(node = self.id, term = self.current_term + 1, "starting pre-vote");

        if self.pre_votes_received.len() >= self.quorum_size() {
            return self.start_election();
        }
        Ok(RaftMessage::PreVoteRequest {
            term: self.current_term + 1,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        })
    }

    /// Increment the term, vote for ourselves, and ask everyone else.
    pub fn start_election(&mut self) -> Result<RaftMessage, RaftError> {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.persist_hard_state()?;

        self.pre_votes_received.clear();
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        info!(node = self.id, term = self.current_term, "starting election");

        let request = RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        if self.has_quorum() {
            self.become_leader()?;
        }
        Ok(request)
    }

    /// Take leadership: reset follower progress and append a no-op in our term.
    /// The first leader of an empty log writes the roster instead, so every
    /// later member learns the quorum base from the log and not from its seeds.
    fn become_leader(&mut self) -> Result<(), RaftError> {
        info!(node = self.id, term = self.current_term, votes = self.votes_received.len(), "became leader");
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.pre_votes_received.clear();

        let next = self.last_log_index() + 1;
        self.next_index = self.peers().into_iter().map(|p| (p, next)).collect();
        self.match_index = self.peers().into_iter().map(|p| (p, 0)).collect();
        self.recent_acks.clear();

        let payload = if self.last_log_index() == 0 {
            EntryPayload::Roster { members: self.cluster().clone() }
        } else {
            EntryPayload::Noop
        };
        self.append_local(payload)?;
        self.advance_commit_index()?;
        Ok(())
    }

    /// Requests from an older term are answered in-band and never acted on.
    pub fn check_term(&self, term: Term) -> Result<(), RaftError> {
        if term < self.current_term {
            return Err(RaftError::StaleTerm { received: term, current: self.current_term });
        }
        Ok(())
    }

    // -- elections --

    pub fn handle_pre_vote_request(
        &self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> RaftMessage {
        let term_ok = term > self.current_term
            || (term == self.current_term && self.voted_for.map_or(true, |v| v == candidate_id));
        // a live leader (or our belief in one) suppresses the poll
        let granted = term_ok
            && self.leader_id.is_none()
            && self.is_log_up_to_date(last_log_index, last_log_term);

        debug!(node = self.id, candidate = candidate_id, term, granted, "pre-vote request");
        RaftMessage::PreVoteResponse {
            term: if granted { term } else { self.current_term },
            vote_granted: granted,
        }
    }

    /// Returns the real vote request once a majority would vote for us.
    pub fn handle_pre_vote_response(
        &mut self,
        term: Term,
        vote_granted: bool,
        from: NodeId,
    ) -> Result<Option<RaftMessage>, RaftError> {
        if self.state != NodeState::PreCandidate {
            return Ok(None);
        }
        if !vote_granted {
            if term > self.current_term {
                self.become_follower(term)?;
            }
            return Ok(None);
        }
        if term != self.current_term + 1 {
            return Ok(None);
        }
        if self.cluster().contains(from) {
            self.pre_votes_received.insert(from);
        }
        if self.pre_votes_received.len() >= self.quorum_size() {
            return self.start_election().map(Some);
        }
        Ok(None)
    }

    /// Returns the response and whether the election timer should reset.
    pub fn handle_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<(RaftMessage, bool), RaftError> {
        if let Err(err) = self.check_term(term) {
            debug!(node = self.id, candidate = candidate_id, %err, "rejecting vote request");
            return Ok((
                RaftMessage::VoteResponse { term: self.current_term, vote_granted: false },
                false,
            ));
        }
        if term > self.current_term {
            self.become_follower(term)?;
        }

        let can_vote = self.voted_for.map_or(true, |v| v == candidate_id);
        let granted = can_vote
            && self.state != NodeState::Leader
            && self.is_log_up_to_date(last_log_index, last_log_term);

        if granted {
            self.voted_for = Some(candidate_id);
            // durable before the grant leaves this node
            self.persist_hard_state()?;
            debug!(node = self.id, candidate = candidate_id, term, "granted vote");
        }

        Ok((
            RaftMessage::VoteResponse { term: self.current_term, vote_granted: granted },
            granted,
        ))
    }

    /// Returns true if this response made us leader.
    pub fn handle_vote_response(
        &mut self,
        term: Term,
        vote_granted: bool,
        from: NodeId,
    ) -> Result<bool, RaftError> {
        if term > self.current_term {
            self.become_follower(term)?;
            return Ok(false);
        }
        if self.state != NodeState::Candidate || term < self.current_term {
            return Ok(false);
        }
        if vote_granted && self.cluster().contains(from) {
            self.votes_received.insert(from);
        }
        if self.has_quorum() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    // -- replication (leader side) --

    fn ensure_leader(&self) -> Result<(), RaftError> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader { leader_hint: self.leader_id });
        }
        Ok(())
    }

    /// Append a decision command to the leader's log.
    pub fn propose(
        &mut self,
        command: Vec<u8>,
        dedup_key: Option<String>,
    ) -> Result<(LogIndex, Term), RaftError> {
        self.ensure_leader()?;
        let entry = self.append_local(EntryPayload::Command { data: command, dedup_key })?;
        self.advance_commit_index()?;
        Ok((entry.index, entry.term))
    }

    /// Append a single-server roster change. One at a time, and only after
    /// this leader has committed something in its own term.
    pub fn propose_membership(
        &mut self,
        change: MembershipChange,
    ) -> Result<(LogIndex, Term), RaftError> {
        self.ensure_leader()?;
        if self.has_pending_config_change()
            || self.log.term_at(self.commit_index) != self.current_term
        {
            return Err(RaftError::MembershipChangePending);
        }
        info!(node = self.id, term = self.current_term, ?change, "proposing membership change");
        let entry = self.append_local(EntryPayload::Membership(change))?;
        self.advance_commit_index()?;
        Ok((entry.index, entry.term))
    }

    fn append_local(&mut self, payload: EntryPayload) -> Result<LogEntry, RaftError> {
        let entry = LogEntry::with_payload(self.current_term, self.last_log_index() + 1, payload);
        self.append_to_log(std::slice::from_ref(&entry))?;
        Ok(entry)
    }

    /// Durable append plus roster bookkeeping for membership entries.
    fn append_to_log(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        self.log.append(entries)?;
        let mut roster_changed = false;
        for entry in entries {
            let next = entry.roster_after(self.cluster());
            if let Some(next) = next {
                self.configs.push((entry.index, next));
                roster_changed = true;
            }
        }
        if roster_changed {
            self.sync_leader_progress();
        }
        Ok(())
    }

    /// Drop a conflicting suffix and any roster it introduced.
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), RaftError> {
        if index <= self.commit_index {
            return Err(RaftError::InvariantViolation(format!(
                "node {} asked to truncate committed index {} (commit index {})",
                self.id, index, self.commit_index
            )));
        }
        warn!(node = self.id, from = index, last = self.last_log_index(), "truncating conflicting log suffix");
        self.log.truncate_suffix(index)?;
        self.configs.retain(|(at, _)| *at < index);
        Ok(())
    }

    /// Keep next/match maps in line with the current roster.
    fn sync_leader_progress(&mut self) {
        if self.state != NodeState::Leader {
            return;
        }
        let peers = self.peers();
        let next = self.last_log_index() + 1;
        for peer in &peers {
            self.next_index.entry(*peer).or_insert(next);
            self.match_index.entry(*peer).or_insert(0);
        }
        self.next_index.retain(|id, _| peers.contains(id));
        self.match_index.retain(|id, _| peers.contains(id));
    }

    /// AppendEntries for one peer, from its next_index on. Doubles as the
    /// heartbeat when the peer is caught up.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next = (*self.next_index.get(&peer)?).max(1);
        let prev_log_index = next - 1;
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index),
            entries: self.log.entries_from(next, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    /// Returns true if the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        term: Term,
        success: bool,
        from: NodeId,
        match_index: LogIndex,
    ) -> Result<bool, RaftError> {
        if term > self.current_term {
            self.become_follower(term)?;
            return Ok(false);
        }
        if self.state != NodeState::Leader || term < self.current_term {
            return Ok(false);
        }
        let Some(next) = self.next_index.get(&from).copied() else {
            return Ok(false);
        };
        self.recent_acks.insert(from);

        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        if success {
            let matched = matched.max(match_index);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, next.max(matched + 1));
            return self.advance_commit_index();
        }

        // back off, but not below what the follower already matched
        let retry = next
            .saturating_sub(1)
            .min(match_index + 1)
            .max(matched + 1)
            .max(1);
        debug!(node = self.id, peer = from, next = retry, "follower log mismatch, backing off");
        self.next_index.insert(from, retry);
        Ok(false)
    }

    /// Commit the highest index of the current term stored on a majority.
    pub fn advance_commit_index(&mut self) -> Result<bool, RaftError> {
        if self.state != NodeState::Leader {
            return Ok(false);
        }
        let cluster = self.cluster().clone();
        let quorum = cluster.quorum_size();
        let mut candidate = self.last_log_index();
        let mut advanced = false;

        while candidate > self.commit_index {
            // earlier-term entries only commit indirectly (Raft §5.4.2)
            if self.log.term_at(candidate) != self.current_term {
                break;
            }
            let replicas = cluster
                .ids()
                .filter(|id| {
                    *id == self.id || self.match_index.get(id).copied().unwrap_or(0) >= candidate
                })
                .count();
            if replicas >= quorum {
                self.commit_index = candidate;
                self.log.mark_committed(candidate)?;
                advanced = true;
                break;
            }
            candidate -= 1;
        }

        if advanced {
            debug!(node = self.id, term = self.current_term, commit = self.commit_index, "commit index advanced");
            self.step_down_if_removed();
        }
        Ok(advanced)
    }

    /// A leader whose own removal has committed hands over leadership.
    fn step_down_if_removed(&mut self) {
        if self.state == NodeState::Leader
            && !self.cluster().contains(self.id)
            && !self.has_pending_config_change()
        {
            info!(node = self.id, term = self.current_term, "removed from cluster, stepping down");
            self.state = NodeState::Follower;
            self.leader_id = None;
            self.clear_leader_progress();
        }
    }

    /// Leader lease: called once per election timeout. A leader that has not
    /// heard from a majority since the previous check steps down so clients
    /// stop waiting on it, and reports `QuorumUnavailable`.
    pub fn check_leader_lease(&mut self) -> Result<(), RaftError> {
        if self.state != NodeState::Leader {
            return Ok(());
        }
        let cluster = self.cluster();
        let reachable = cluster
            .ids()
            .filter(|id| *id == self.id || self.recent_acks.contains(id))
            .count();
        let quorum = cluster.quorum_size();
        self.recent_acks.clear();
        if reachable >= quorum {
            return Ok(());
        }
        self.state = NodeState::Follower;
        self.leader_id = None;
        self.clear_leader_progress();
        Err(RaftError::QuorumUnavailable { reachable, quorum })
    }

    // -- replication (follower side) --

    /// Returns the response and whether the election timer should reset.
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Result<(RaftMessage, bool), RaftError> {
        if let Err(err) = self.check_term(term) {
            debug!(node = self.id, leader = leader_id, %err, "rejecting append entries");
            return Ok((self.append_response(false, self.last_log_index()), false));
        }
        if term > self.current_term {
            self.become_follower(term)?;
        } else if self.state == NodeState::Leader {
            return Err(RaftError::InvariantViolation(format!(
                "node {} and node {} both lead term {}",
                self.id, leader_id, term
            )));
        } else if self.state != NodeState::Follower {
            self.become_follower(term)?;
        }
        if self.leader_id != Some(leader_id) {
            info!(node = self.id, leader = leader_id, term, "following leader");
        }
        self.leader_id = Some(leader_id);

        if prev_log_index > 0 {
            match self.log.get(prev_log_index).map(|e| e.term) {
                None => {
                    let err = RaftError::LogInconsistency { index: prev_log_index };
                    debug!(node = self.id, %err, "missing entry");
                    return Ok((self.append_response(false, self.last_log_index()), true));
                }
                Some(existing) if existing != prev_log_term => {
                    let err = RaftError::LogInconsistency { index: prev_log_index };
                    debug!(node = self.id, %err, "term mismatch");
                    let hint = (prev_log_index - 1).min(self.last_log_index());
                    return Ok((self.append_response(false, hint), true));
                }
                Some(_) => {}
            }
        }

        let mut last_new = prev_log_index;
        for (offset, entry) in entries.iter().enumerate() {
            let expected = prev_log_index + 1 + offset as LogIndex;
            if entry.index != expected {
                warn!(node = self.id, expected, got = entry.index, "malformed append entries batch");
                return Ok((self.append_response(false, self.last_log_index()), true));
            }
            match self.log.get(entry.index).map(|e| e.term) {
                Some(existing) if existing == entry.term => {
                    last_new = entry.index;
                }
                Some(_) => {
                    self.truncate_from(entry.index)?;
                    self.append_to_log(&entries[offset..])?;
                    last_new = entries[entries.len() - 1].index;
                    break;
                }
                None => {
                    self.append_to_log(&entries[offset..])?;
                    last_new = entries[entries.len() - 1].index;
                    break;
                }
            }
        }

        if leader_commit > self.commit_index {
            let new_commit = leader_commit.min(last_new);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                self.log.mark_committed(new_commit)?;
            }
        }

        Ok((self.append_response(true, last_new), true))
    }

    fn append_response(&self, success: bool, match_index: LogIndex) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
        }
    }

    // -- application --

    /// Committed entries not yet handed out, in index order. Advances last_applied.
    pub fn take_entries_to_apply(&mut self) -> Result<Vec<LogEntry>, RaftError> {
        let mut ready = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.get(index).cloned().ok_or_else(|| {
                RaftError::InvariantViolation(format!(
                    "committed index {} missing from log of node {}",
                    index, self.id
                ))
            })?;
            ready.push(entry);
            self.last_applied = index;
        }
        Ok(ready)
    }
}
