//! # node
//!
//! why: drive a RaftNode with real timers and a real network
//! relations: owns the core RaftNode, the DecisionApplier and the registry; talks through transport.rs
//! what: NodeHandle (cloneable front door), the single-task event loop behind it, ClusterStatus
//!
//! All consensus state lives in one task. Rpc handling, timer expiry and
//! client proposals arrive as events on one channel and are processed one
//! at a time. Outbound rpcs run on their own tasks and feed their responses
//! back into the same channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use decision_core::{
    ClusterConfig, LogIndex, LogStore, MembershipChange, NodeId, NodeStatus, RaftError, RaftMessage, RaftNode,
    Term,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::applier::{DecisionApplier, DecisionOutcome, DecisionResult, StateMachine};
use crate::config::NodeConfig;
use crate::error::ClusterError;
use crate::registry::{MembershipRegistry, SharedRegistry};
use crate::transport::{Request, Response, Transport};

const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "health", content = "reason", rename_all = "snake_case")]
pub enum NodeHealth {
    Running,
    /// Stopped on an unrecoverable error; the reason is the error text.
    Halted(String),
    Stopped,
}

/// What `status` reports: engine view plus liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node: NodeStatus,
    pub alive: BTreeSet<NodeId>,
    pub suspected: BTreeSet<NodeId>,
    pub health: NodeHealth,
}

type Completion = oneshot::Receiver<Result<DecisionOutcome, RaftError>>;

enum Event {
    Rpc {
        from: NodeId,
        message: RaftMessage,
        reply: oneshot::Sender<Option<RaftMessage>>,
    },
    RpcResponse {
        peer: NodeId,
        message: RaftMessage,
    },
    Propose {
        command: Vec<u8>,
        dedup_key: Option<String>,
        reply: oneshot::Sender<Result<(LogIndex, Completion), RaftError>>,
    },
    ProposeMembership {
        change: MembershipChange,
        reply: oneshot::Sender<Result<(LogIndex, Completion), RaftError>>,
    },
    Outcome {
        index: LogIndex,
        reply: oneshot::Sender<Option<DecisionOutcome>>,
    },
    Status {
        reply: oneshot::Sender<ClusterStatus>,
    },
    Shutdown,
}

/// Front door to a running node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    events: mpsc::Sender<Event>,
    registry: SharedRegistry,
    health: watch::Receiver<NodeHealth>,
    commit_timeout: Duration,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("health", &*self.health.borrow())
            .finish()
    }
}

impl NodeHandle {
    /// Start the node loop on the current tokio runtime.
    ///
    /// Committed entries already in `store` are replayed through `machine`
    /// before any event is processed.
    pub fn spawn(
        config: &NodeConfig,
        store: Box<dyn LogStore>,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> NodeHandle {
        let raft = RaftNode::with_config(config.node_id, config.bootstrap_cluster(), store, config.raft_config());

        let mut registry = MembershipRegistry::new(config.node_id, config.suspect_after());
        for (id, address) in raft.cluster().members() {
            registry.join(id, address);
        }
        if registry.get(config.node_id).is_none() {
            registry.join(config.node_id, config.advertised_addr());
        }
        let registry = registry.shared();

        let (events, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (health_tx, health) = watch::channel(NodeHealth::Running);

        info!(
            node = config.node_id,
            term = raft.current_term,
            commit = raft.commit_index,
            members = ?raft.cluster().ids().collect::<Vec<_>>(),
            "starting node"
        );

        let runtime = NodeRuntime {
            raft,
            applier: DecisionApplier::new(machine),
            registry: registry.clone(),
            transport,
            inbox,
            outbox: events.downgrade(),
            pending: BTreeMap::new(),
            address: config.advertised_addr().to_string(),
            rpc_timeout: config.rpc_timeout(),
            ping_interval: config.ping_interval(),
            lease_period: config.election_timeout_min(),
            election_deadline: Instant::now(),
            leader_since: None,
            was_leader: false,
            health: health_tx,
        };
        tokio::spawn(runtime.run());

        NodeHandle {
            id: config.node_id,
            events,
            registry,
            health,
            commit_timeout: config.commit_timeout(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// How long `propose` waits for its entry to apply.
    pub fn commit_timeout(&self) -> Duration {
        self.commit_timeout
    }

    pub fn health(&self) -> NodeHealth {
        self.health.borrow().clone()
    }

    fn halted(&self) -> ClusterError {
        match &*self.health.borrow() {
            NodeHealth::Halted(reason) => ClusterError::Halted(reason.clone()),
            _ => ClusterError::Halted(format!("node {} is not running", self.id)),
        }
    }

    async fn request<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T, ClusterError> {
        let (reply, response) = oneshot::channel();
        self.events.send(event(reply)).await.map_err(|_| self.halted())?;
        response.await.map_err(|_| self.halted())
    }

    /// Deliver a peer rpc. `None` when there is nothing to send back.
    pub async fn raft_rpc(&self, from: NodeId, message: RaftMessage) -> Option<RaftMessage> {
        self.request(|reply| Event::Rpc { from, message, reply }).await.ok().flatten()
    }

    /// Append a decision command and wait until it is applied here.
    ///
    /// `CommitTimeout` means the outcome is unknown: the entry may still
    /// commit. Query `outcome(index)` to find out.
    pub async fn propose(
        &self,
        command: Vec<u8>,
        dedup_key: Option<String>,
    ) -> Result<DecisionOutcome, ClusterError> {
        let (index, completion) = self
            .request(|reply| Event::Propose { command, dedup_key, reply })
            .await??;
        self.await_completion(index, completion).await
    }

    pub async fn propose_membership(&self, change: MembershipChange) -> Result<DecisionOutcome, ClusterError> {
        let (index, completion) = self.request(|reply| Event::ProposeMembership { change, reply }).await??;
        self.await_completion(index, completion).await
    }

    async fn await_completion(&self, index: LogIndex, completion: Completion) -> Result<DecisionOutcome, ClusterError> {
        match tokio::time::timeout(self.commit_timeout, completion).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) | Err(_) => Err(RaftError::CommitTimeout { index: Some(index) }.into()),
        }
    }

    pub async fn outcome(&self, index: LogIndex) -> Result<Option<DecisionOutcome>, ClusterError> {
        self.request(|reply| Event::Outcome { index, reply }).await
    }

    pub async fn status(&self) -> Result<ClusterStatus, ClusterError> {
        self.request(|reply| Event::Status { reply }).await
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        if self.events.send(Event::Shutdown).await.is_err() {
            return;
        }
        let mut health = self.health.clone();
        loop {
            let running = matches!(*health.borrow(), NodeHealth::Running);
            if !running || health.changed().await.is_err() {
                break;
            }
        }
    }
}

struct Pending {
    term: Term,
    reply: oneshot::Sender<Result<DecisionOutcome, RaftError>>,
}

enum Wake {
    Election,
    Heartbeat,
    Lease,
    Gossip,
    Event(Option<Event>),
}

struct NodeRuntime {
    raft: RaftNode,
    applier: DecisionApplier,
    registry: SharedRegistry,
    transport: Arc<dyn Transport>,
    inbox: mpsc::Receiver<Event>,
    /// Weak so the loop ends once every handle is gone.
    outbox: mpsc::WeakSender<Event>,
    pending: BTreeMap<LogIndex, Pending>,
    address: String,
    rpc_timeout: Duration,
    ping_interval: Duration,
    lease_period: Duration,
    election_deadline: Instant,
    leader_since: Option<Instant>,
    was_leader: bool,
    health: watch::Sender<NodeHealth>,
}

impl NodeRuntime {
    async fn run(mut self) {
        let start = Instant::now();
        let mut heartbeat = interval_at(start + self.raft.config.heartbeat(), self.raft.config.heartbeat());
        let mut lease = interval_at(start + self.lease_period, self.lease_period);
        let mut gossip = interval_at(start + self.ping_interval, self.ping_interval);
        for timer in [&mut heartbeat, &mut lease, &mut gossip] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        self.reset_election_timer();

        let mut result = self.after_event();
        loop {
            if let Err(err) = result {
                if err.is_fatal() {
                    self.halt(err);
                    return;
                }
                warn!(node = self.raft.id, error = %err, "event failed");
            }

            let wake = tokio::select! {
                _ = sleep_until(self.election_deadline) => Wake::Election,
                _ = heartbeat.tick() => Wake::Heartbeat,
                _ = lease.tick() => Wake::Lease,
                _ = gossip.tick() => Wake::Gossip,
                event = self.inbox.recv() => Wake::Event(event),
            };

            result = match wake {
                Wake::Election => self.on_election_timeout(),
                Wake::Heartbeat => {
                    self.broadcast_append_entries();
                    Ok(())
                }
                Wake::Lease => {
                    self.check_lease();
                    Ok(())
                }
                Wake::Gossip => {
                    self.gossip();
                    Ok(())
                }
                Wake::Event(None) | Wake::Event(Some(Event::Shutdown)) => break,
                Wake::Event(Some(event)) => self.handle_event(event),
            }
            .and_then(|()| self.after_event());
        }

        info!(node = self.raft.id, term = self.raft.current_term, "node stopped");
        self.fail_pending();
        let _ = self.health.send(NodeHealth::Stopped);
    }

    fn halt(&mut self, err: ClusterError) {
        error!(node = self.raft.id, term = self.raft.current_term, error = %err, "halting node");
        self.fail_pending();
        let _ = self.health.send(NodeHealth::Halted(err.to_string()));
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.raft.config.random_election_timeout();
    }

    fn handle_event(&mut self, event: Event) -> Result<(), ClusterError> {
        match event {
            Event::Rpc { from, message, reply } => {
                let result = self.handle_rpc(from, message);
                let _ = reply.send(result.as_ref().ok().cloned().flatten());
                result.map(|_| ())
            }
            Event::RpcResponse { peer, message } => self.handle_response(peer, message),
            Event::Propose { command, dedup_key, reply } => {
                let result = self.raft.propose(command, dedup_key);
                self.track_proposal(result, reply)
            }
            Event::ProposeMembership { change, reply } => {
                let result = self.raft.propose_membership(change);
                self.track_proposal(result, reply)
            }
            Event::Outcome { index, reply } => {
                let _ = reply.send(self.applier.outcome(index).cloned());
                Ok(())
            }
            Event::Status { reply } => {
                let registry = self.registry.read();
                let _ = reply.send(ClusterStatus {
                    node: self.raft.status(),
                    alive: registry.list_alive(),
                    suspected: registry.suspected(),
                    health: NodeHealth::Running,
                });
                Ok(())
            }
            Event::Shutdown => Ok(()),
        }
    }

    fn handle_rpc(&mut self, from: NodeId, message: RaftMessage) -> Result<Option<RaftMessage>, ClusterError> {
        self.registry.write().heartbeat(from);
        let response = match message {
            RaftMessage::PreVoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                Some(self.raft.handle_pre_vote_request(term, candidate_id, last_log_index, last_log_term))
            }
            RaftMessage::VoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                let (response, reset) =
                    self.raft.handle_vote_request(term, candidate_id, last_log_index, last_log_term)?;
                if reset {
                    self.reset_election_timer();
                }
                Some(response)
            }
            RaftMessage::AppendEntries { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit } => {
                let (response, reset) = self.raft.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )?;
                if reset {
                    self.reset_election_timer();
                }
                Some(response)
            }
            response => {
                self.handle_response(from, response)?;
                None
            }
        };
        Ok(response)
    }

    fn handle_response(&mut self, peer: NodeId, message: RaftMessage) -> Result<(), ClusterError> {
        self.registry.write().heartbeat(peer);
        match message {
            RaftMessage::PreVoteResponse { term, vote_granted } => {
                if let Some(request) = self.raft.handle_pre_vote_response(term, vote_granted, peer)? {
                    self.broadcast(request);
                }
            }
            RaftMessage::VoteResponse { term, vote_granted } => {
                self.raft.handle_vote_response(term, vote_granted, peer)?;
            }
            RaftMessage::AppendEntriesResponse { term, success, match_index } => {
                if self.raft.handle_append_entries_response(term, success, peer, match_index)? {
                    // carry the new commit index out right away
                    self.broadcast_append_entries();
                } else if self.raft.next_index.get(&peer).map_or(false, |next| *next <= self.raft.last_log_index()) {
                    self.send_append_entries(peer);
                }
            }
            request => {
                debug!(node = self.raft.id, peer, kind = request.kind(), "ignoring request delivered as response");
            }
        }
        Ok(())
    }

    fn track_proposal(
        &mut self,
        result: Result<(LogIndex, Term), RaftError>,
        reply: oneshot::Sender<Result<(LogIndex, Completion), RaftError>>,
    ) -> Result<(), ClusterError> {
        match result {
            Ok((index, term)) => {
                let (done, completion) = oneshot::channel();
                self.pending.insert(index, Pending { term, reply: done });
                let _ = reply.send(Ok((index, completion)));
                self.broadcast_append_entries();
                Ok(())
            }
            Err(err) => {
                let fatal = err.is_fatal().then(|| err.to_string());
                let _ = reply.send(Err(err));
                match fatal {
                    Some(reason) => Err(ClusterError::Halted(reason)),
                    None => Ok(()),
                }
            }
        }
    }

    fn on_election_timeout(&mut self) -> Result<(), ClusterError> {
        self.reset_election_timer();
        if let Some(request) = self.raft.on_election_timeout()? {
            self.broadcast(request);
        }
        Ok(())
    }

    fn check_lease(&mut self) {
        let Some(since) = self.leader_since else {
            return;
        };
        if since.elapsed() < self.lease_period {
            return;
        }
        // pending proposals fail as CommitTimeout in after_event
        if let Err(err) = self.raft.check_leader_lease() {
            warn!(node = self.raft.id, term = self.raft.current_term, %err, "lost contact with majority, stepping down");
        }
    }

    /// Apply newly committed entries, then react to role changes.
    fn after_event(&mut self) -> Result<(), ClusterError> {
        self.apply_committed()?;

        let leading = self.raft.is_leader();
        if leading && !self.was_leader {
            self.leader_since = Some(Instant::now());
            self.broadcast_append_entries();
        } else if !leading && self.was_leader {
            self.leader_since = None;
            self.fail_pending();
            self.reset_election_timer();
        }
        self.was_leader = leading;
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<(), ClusterError> {
        for entry in self.raft.take_entries_to_apply()? {
            let outcome = self.applier.apply(&entry)?;
            match &outcome.result {
                DecisionResult::Membership { change } => self.apply_membership(change),
                DecisionResult::Roster { members } => self.apply_roster(members),
                _ => {}
            }
            if let Some(pending) = self.pending.remove(&entry.index) {
                let result = if pending.term == entry.term {
                    Ok(outcome)
                } else {
                    Err(RaftError::NotLeader { leader_hint: self.raft.leader_hint() })
                };
                let _ = pending.reply.send(result);
            }
        }
        Ok(())
    }

    fn apply_membership(&mut self, change: &MembershipChange) {
        let mut registry = self.registry.write();
        match change {
            MembershipChange::Join { node_id, address } => {
                info!(node = self.raft.id, member = *node_id, %address, "member joined");
                registry.join(*node_id, address.clone());
            }
            MembershipChange::Leave { node_id } => {
                info!(node = self.raft.id, member = *node_id, "member left");
                if *node_id != self.raft.id {
                    registry.leave(*node_id);
                }
            }
        }
    }

    /// Track every member of the replicated roster; drop seeds outside it.
    fn apply_roster(&mut self, members: &ClusterConfig) {
        let mut registry = self.registry.write();
        for (id, address) in members.members() {
            if registry.get(id).is_none() {
                registry.join(id, address);
            }
        }
        let strays: Vec<NodeId> = registry
            .known()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| *id != self.raft.id && !members.contains(*id))
            .collect();
        for id in strays {
            registry.leave(id);
        }
        info!(node = self.raft.id, members = ?members.ids().collect::<Vec<_>>(), "roster applied");
    }

    /// Outstanding proposals after losing leadership, halting or stopping.
    /// An entry still in the log may yet commit under a new leader.
    fn fail_pending(&mut self) {
        let leader_hint = self.raft.leader_hint();
        for (index, pending) in std::mem::take(&mut self.pending) {
            let still_logged = self.raft.get_entry(index).map_or(false, |e| e.term == pending.term);
            let err = if still_logged {
                RaftError::CommitTimeout { index: Some(index) }
            } else {
                RaftError::NotLeader { leader_hint }
            };
            let _ = pending.reply.send(Err(err));
        }
    }

    // -- outbound --

    /// Configured peers the registry does not currently suspect.
    fn targets(&self) -> Vec<NodeId> {
        let registry = self.registry.read();
        self.raft.peers().into_iter().filter(|peer| !registry.is_suspected(*peer)).collect()
    }

    fn peer_address(&self, peer: NodeId) -> String {
        self.registry
            .read()
            .address(peer)
            .or_else(|| self.raft.cluster().address(peer))
            .unwrap_or_default()
            .to_string()
    }

    fn broadcast(&self, message: RaftMessage) {
        for peer in self.targets() {
            self.send_rpc(peer, message.clone());
        }
    }

    fn broadcast_append_entries(&self) {
        if !self.raft.is_leader() {
            return;
        }
        for peer in self.targets() {
            self.send_append_entries(peer);
        }
    }

    fn send_append_entries(&self, peer: NodeId) {
        if let Some(message) = self.raft.create_append_entries(peer) {
            self.send_rpc(peer, message);
        }
    }

    fn send_rpc(&self, peer: NodeId, message: RaftMessage) {
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let address = self.peer_address(peer);
        let transport = self.transport.clone();
        let timeout = self.rpc_timeout;
        let from = self.raft.id;
        let kind = message.kind();
        tokio::spawn(async move {
            let request = Request::Raft { from, message };
            match tokio::time::timeout(timeout, transport.send(peer, &address, request)).await {
                Ok(Ok(Response::Raft { message: Some(message) })) => {
                    let _ = outbox.send(Event::RpcResponse { peer, message }).await;
                }
                Ok(Ok(Response::Raft { message: None })) => {}
                Ok(Ok(other)) => debug!(node = from, peer, ?other, "unexpected response to {kind}"),
                Ok(Err(err)) => debug!(node = from, peer, error = %err, "{kind} failed"),
                Err(_) => debug!(node = from, peer, "{kind} timed out"),
            }
        });
    }

    /// Suspect silent members and ping everyone we know, suspected or not.
    fn gossip(&self) {
        let (targets, known) = {
            let mut registry = self.registry.write();
            registry.check_timeouts(Instant::now());
            let known = registry.known();
            let targets: Vec<_> = known.iter().filter(|(id, _)| *id != self.raft.id).cloned().collect();
            (targets, known)
        };
        if targets.is_empty() {
            return;
        }

        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let from = self.raft.id;
        let address = self.address.clone();
        let timeout = self.rpc_timeout;
        tokio::spawn(async move {
            let pings = targets.into_iter().map(|(peer, peer_address)| {
                let transport = transport.clone();
                let request = Request::Ping { from, address: address.clone(), known: known.clone() };
                async move {
                    let result = tokio::time::timeout(timeout, transport.send(peer, &peer_address, request)).await;
                    (peer, result)
                }
            });
            for (peer, result) in join_all(pings).await {
                if let Ok(Ok(Response::Pong { known, .. })) = result {
                    let mut registry = registry.write();
                    registry.heartbeat(peer);
                    registry.learn(&known);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::GovernanceMachine;
    use crate::transport::InMemoryNetwork;
    use decision_core::MemLogStore;

    fn single_node_config() -> NodeConfig {
        NodeConfig {
            heartbeat_interval_ms: 10,
            election_timeout_min_ms: 30,
            election_timeout_max_ms: 60,
            ..NodeConfig::default()
        }
    }

    fn spawn_single() -> NodeHandle {
        let network = InMemoryNetwork::new();
        NodeHandle::spawn(
            &single_node_config(),
            Box::new(MemLogStore::new()),
            Box::new(GovernanceMachine::new()),
            Arc::new(network.transport(1)),
        )
    }

    async fn wait_for_leader(node: &NodeHandle) {
        for _ in 0..100 {
            if node.status().await.map_or(false, |s| s.node.leader_id == Some(node.id())) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {} never became leader", node.id());
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let node = spawn_single();
        wait_for_leader(&node).await;

        let outcome = node.propose(br#"{"op":"approve","id":42}"#.to_vec(), None).await.unwrap();

        assert!(matches!(outcome.result, DecisionResult::Accepted { .. }));
        assert_eq!(node.outcome(outcome.index).await.unwrap(), Some(outcome));
        node.shutdown().await;
        assert_eq!(node.health(), NodeHealth::Stopped);
    }

    #[tokio::test]
    async fn requests_after_shutdown_report_halted() {
        let node = spawn_single();
        node.shutdown().await;

        let err = node.status().await.unwrap_err();
        assert!(matches!(err, ClusterError::Halted(_)));
    }
}
