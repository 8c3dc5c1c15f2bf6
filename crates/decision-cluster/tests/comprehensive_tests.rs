//! # comprehensive cluster tests
//!
//! why: exercise live nodes end to end: timers, transport, applier, gateway
//! relations: tests decision-cluster over the in-memory network and tcp
//! what: commit, forwarding, failover, partitions, dedup, membership, discovery, recovery

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use decision_cluster::{
    transport, ClusterStatus, DecisionResult, Gateway, GovernanceMachine, InMemoryNetwork, MemberConfig,
    NodeConfig, NodeHandle, Request, RequestHandler, Response, SubmitStatus, TcpTransport, Transport,
};
use decision_core::{MemLogStore, MembershipChange, NodeId, NodeState};
use serde_json::json;

/// Poll `$cond` every 10ms for up to three seconds.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..300 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

fn address(id: NodeId) -> String {
    format!("mem-{id}")
}

fn config(id: NodeId, ids: &[NodeId]) -> NodeConfig {
    NodeConfig {
        node_id: id,
        listen_addr: address(id),
        members: ids.iter().map(|m| MemberConfig { id: *m, address: address(*m) }).collect(),
        heartbeat_interval_ms: 10,
        election_timeout_min_ms: 60,
        election_timeout_max_ms: 120,
        rpc_timeout_ms: 40,
        commit_timeout_ms: 1_000,
        suspect_after_ms: 300,
        ping_interval_ms: 30,
        ..NodeConfig::default()
    }
}

struct TestCluster {
    network: InMemoryNetwork,
    gateways: BTreeMap<NodeId, Gateway>,
}

impl TestCluster {
    fn start(ids: &[NodeId]) -> Self {
        let mut cluster = TestCluster { network: InMemoryNetwork::new(), gateways: BTreeMap::new() };
        for id in ids {
            cluster.add(config(*id, ids));
        }
        cluster
    }

    fn add(&mut self, config: NodeConfig) {
        let id = config.node_id;
        let node = NodeHandle::spawn(
            &config,
            Box::new(MemLogStore::new()),
            Box::new(GovernanceMachine::new()),
            Arc::new(self.network.transport(id)),
        );
        let gateway = Gateway::new(node, Arc::new(self.network.transport(id)));
        self.network.register(id, Arc::new(gateway.clone()));
        self.gateways.insert(id, gateway);
    }

    fn gateway(&self, id: NodeId) -> &Gateway {
        &self.gateways[&id]
    }

    async fn status(&self, id: NodeId) -> ClusterStatus {
        self.gateway(id).status().await.unwrap()
    }

    /// The highest-term node among `ids` that believes it leads.
    async fn leader_among(&self, ids: &[NodeId]) -> NodeId {
        for _ in 0..300 {
            let mut best: Option<(u64, NodeId)> = None;
            for id in ids {
                let status = self.status(*id).await;
                if status.node.state == NodeState::Leader && best.map_or(true, |(term, _)| status.node.term > term) {
                    best = Some((status.node.term, *id));
                }
            }
            if let Some((_, id)) = best {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader among {ids:?}");
    }

    async fn leader(&self) -> NodeId {
        let ids: Vec<NodeId> = self.gateways.keys().copied().collect();
        self.leader_among(&ids).await
    }

    async fn outcome_result(&self, id: NodeId, index: u64) -> Option<DecisionResult> {
        self.gateway(id).outcome(index).await.unwrap().map(|o| o.result)
    }

    async fn shutdown(&self) {
        for gateway in self.gateways.values() {
            gateway.node().shutdown().await;
        }
    }
}

fn approve(id: u64) -> serde_json::Value {
    json!({ "op": "approve", "id": id })
}

// =============================================================================
// SECTION 1: BASIC COMMIT
// =============================================================================

mod basic_commit {
    use super::*;

    #[tokio::test]
    async fn test_three_nodes_agree_on_outcome() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;

        let response = cluster.gateway(leader).submit(approve(42), None).await;
        assert_eq!(response.status, SubmitStatus::Committed);
        let outcome = response.outcome.unwrap();
        assert_eq!(
            outcome.result,
            DecisionResult::Accepted { effect: json!({ "subject": "42", "verdict": "approved" }) }
        );

        for id in [1, 2, 3] {
            eventually!(cluster.gateway(id).outcome(outcome.index).await.unwrap() == Some(outcome.clone()));
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_command_still_commits() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;

        cluster.gateway(leader).submit(approve(7), None).await;
        let again = cluster.gateway(leader).submit(json!({ "op": "reject", "id": 7 }), None).await;

        assert_eq!(again.status, SubmitStatus::Committed);
        assert!(matches!(again.outcome.unwrap().result, DecisionResult::Rejected { .. }));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_indices_are_sequential() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;

        let first = cluster.gateway(leader).submit(approve(1), None).await.index.unwrap();
        let second = cluster.gateway(leader).submit(approve(2), None).await.index.unwrap();

        assert_eq!(second, first + 1);
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 2: GATEWAY FORWARDING
// =============================================================================

mod forwarding {
    use super::*;

    #[tokio::test]
    async fn test_follower_forwards_to_leader() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let follower = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();
        eventually!(cluster.status(follower).await.node.leader_id == Some(leader));

        let response = cluster.gateway(follower).submit(approve(5), None).await;

        assert_eq!(response.status, SubmitStatus::Committed);
        let index = response.index.unwrap();
        eventually!(cluster.outcome_result(leader, index).await == response.outcome.clone().map(|o| o.result));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_forwarded_request_is_not_forwarded_again() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let follower = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();
        eventually!(cluster.status(follower).await.node.leader_id == Some(leader));

        let request = Request::Submit { command: approve(5), dedup_key: None, forwarded: true };
        let response = cluster.gateway(follower).handle(request).await;

        let Response::Submitted(response) = response else {
            panic!("expected a submitted response");
        };
        assert_eq!(response.status, SubmitStatus::Rejected);
        assert_eq!(response.leader_hint, Some(leader));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_outcome_and_status_requests() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let index = cluster.gateway(leader).submit(approve(9), None).await.index.unwrap();

        let Response::Outcome { outcome } = cluster.gateway(leader).handle(Request::Outcome { index }).await else {
            panic!("expected an outcome response");
        };
        assert_eq!(outcome.map(|o| o.index), Some(index));

        let Response::Status(status) = cluster.gateway(leader).handle(Request::Status).await else {
            panic!("expected a status response");
        };
        assert_eq!(status.node.id, leader);
        assert_eq!(status.node.members, vec![1, 2, 3]);
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 3: LEADER FAILURE
// =============================================================================

mod leader_failure {
    use super::*;

    #[tokio::test]
    async fn test_survivors_elect_and_keep_committing() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let old = cluster.leader().await;
        let old_term = cluster.status(old).await.node.term;
        let before = cluster.gateway(old).submit(approve(1), None).await.index.unwrap();

        cluster.network.kill(old);
        let survivors: Vec<NodeId> = [1, 2, 3].into_iter().filter(|id| *id != old).collect();
        let new = cluster.leader_among(&survivors).await;
        assert_ne!(new, old);
        assert!(cluster.status(new).await.node.term > old_term);

        let after = cluster.gateway(new).submit(approve(2), None).await;
        assert_eq!(after.status, SubmitStatus::Committed);

        // committed history is identical on both survivors
        let last = after.index.unwrap();
        for index in 1..=last {
            let a = survivors[0];
            let b = survivors[1];
            eventually!(cluster.outcome_result(a, index).await.is_some());
            eventually!(cluster.outcome_result(a, index).await == cluster.outcome_result(b, index).await);
        }
        assert!(cluster.outcome_result(new, before).await.is_some());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_revived_leader_rejoins_as_follower() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let old = cluster.leader().await;
        cluster.network.kill(old);
        let survivors: Vec<NodeId> = [1, 2, 3].into_iter().filter(|id| *id != old).collect();
        let new = cluster.leader_among(&survivors).await;
        let index = cluster.gateway(new).submit(approve(3), None).await.index.unwrap();

        cluster.network.revive(old);

        eventually!(cluster.status(old).await.node.leader_id == Some(new));
        eventually!(cluster.outcome_result(old, index).await.is_some());
        assert_ne!(cluster.status(old).await.node.state, NodeState::Leader);
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 4: PARTITIONS
// =============================================================================

mod partitions {
    use super::*;

    #[tokio::test]
    async fn test_isolated_minority_never_leads() {
        let ids = [1, 2, 3, 4, 5];
        let cluster = TestCluster::start(&ids);
        let leader = cluster.leader().await;
        let isolated = ids.into_iter().find(|id| *id != leader).unwrap();
        eventually!(cluster.status(isolated).await.node.leader_id == Some(leader));
        let term_before = cluster.status(isolated).await.node.term;

        cluster.network.isolate(isolated);

        let mut last = 0;
        for subject in 100..103 {
            let response = cluster.gateway(leader).submit(approve(subject), None).await;
            assert_eq!(response.status, SubmitStatus::Committed);
            last = response.index.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        let status = cluster.status(isolated).await;
        assert_ne!(status.node.state, NodeState::Leader);
        // pre-vote keeps the isolated node from inflating its term
        assert_eq!(status.node.term, term_before);
        assert!(status.node.commit_index < last);

        cluster.network.heal();
        eventually!(cluster.outcome_result(isolated, last).await.is_some());
        assert_eq!(cluster.leader().await, leader);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_minority_side_reports_not_leader() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let followers: Vec<NodeId> = [1, 2, 3].into_iter().filter(|id| *id != leader).collect();

        cluster.network.partition(&[&[leader], &followers]);
        let new = cluster.leader_among(&followers).await;

        // the old leader loses its lease and cannot accept writes
        eventually!(cluster.status(leader).await.node.state != NodeState::Leader);
        let response = cluster.gateway(leader).submit(approve(11), None).await;
        assert_ne!(response.status, SubmitStatus::Committed);

        let majority = cluster.gateway(new).submit(approve(12), None).await;
        assert_eq!(majority.status, SubmitStatus::Committed);
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 5: DEDUPLICATION
// =============================================================================

mod dedup {
    use super::*;

    #[tokio::test]
    async fn test_retry_with_same_key_applies_once() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let gateway = cluster.gateway(leader);

        let first = gateway.submit(approve(77), Some("req-77".into())).await;
        let retry = gateway.submit(approve(77), Some("req-77".into())).await;

        let first = first.outcome.unwrap();
        let retry = retry.outcome.unwrap();
        assert_eq!(retry.duplicate_of, Some(first.index));
        assert_eq!(retry.result, first.result);
        assert!(matches!(retry.result, DecisionResult::Accepted { .. }));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_after_commit_timeout() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let others: Vec<NodeId> = [1, 2, 3].into_iter().filter(|id| *id != leader).collect();

        cluster.network.isolate(leader);
        let lost = cluster.gateway(leader).submit(approve(88), Some("req-88".into())).await;
        assert_eq!(lost.status, SubmitStatus::Timeout);
        assert!(lost.index.is_some());

        cluster.network.heal();
        let new = cluster.leader_among(&others).await;
        let retry = cluster.gateway(new).submit(approve(88), Some("req-88".into())).await;

        assert_eq!(retry.status, SubmitStatus::Committed);
        // a second application would have been rejected as already decided
        assert!(matches!(retry.outcome.unwrap().result, DecisionResult::Accepted { .. }));
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 6: MEMBERSHIP
// =============================================================================

mod membership {
    use super::*;

    #[tokio::test]
    async fn test_new_node_joins_through_the_log() {
        let mut cluster = TestCluster::start(&[1, 2, 3]);
        cluster.add(NodeConfig { join: true, ..config(4, &[1, 2, 3, 4]) });
        let leader = cluster.leader_among(&[1, 2, 3]).await;
        // a committed entry in the leader's term unlocks membership changes
        cluster.gateway(leader).submit(approve(1), None).await;

        let response = cluster.gateway(leader).join(4, address(4)).await;

        assert_eq!(response.status, SubmitStatus::Committed);
        assert_eq!(
            response.outcome.unwrap().result,
            DecisionResult::Membership { change: MembershipChange::Join { node_id: 4, address: address(4) } }
        );
        assert_eq!(cluster.status(leader).await.node.members, vec![1, 2, 3, 4]);

        let index = cluster.gateway(leader).submit(approve(2), None).await.index.unwrap();
        eventually!(cluster.outcome_result(4, index).await.is_some());
        assert_eq!(cluster.status(4).await.node.members, vec![1, 2, 3, 4]);
        assert!(cluster.gateway(4).node().registry().read().get(4).is_some());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_joiner_with_one_seed_adopts_the_full_roster() {
        let mut cluster = TestCluster::start(&[1, 2, 3, 4, 5]);
        cluster.add(NodeConfig { join: true, ..config(6, &[1]) });
        let leader = cluster.leader_among(&[1, 2, 3, 4, 5]).await;
        cluster.gateway(leader).submit(approve(1), None).await;

        let response = cluster.gateway(leader).join(6, address(6)).await;
        assert_eq!(response.status, SubmitStatus::Committed);

        eventually!(cluster.status(6).await.node.members == vec![1, 2, 3, 4, 5, 6]);
        let registry = cluster.gateway(6).node().registry();
        for id in 1..=5 {
            assert_eq!(registry.read().address(id), Some(address(id).as_str()));
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_member_leaves_and_quorum_shrinks() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let leaving = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();
        cluster.gateway(leader).submit(approve(1), None).await;

        let response = cluster.gateway(leader).leave(leaving).await;
        assert_eq!(response.status, SubmitStatus::Committed);
        cluster.network.kill(leaving);

        let remaining = cluster.gateway(leader).submit(approve(2), None).await;
        assert_eq!(remaining.status, SubmitStatus::Committed);
        assert_eq!(cluster.status(leader).await.node.members.len(), 2);
        assert!(cluster.gateway(leader).node().registry().read().get(leaving).is_none());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_change_is_rejected() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        cluster.gateway(leader).submit(approve(1), None).await;
        let followers: Vec<NodeId> = [1, 2, 3].into_iter().filter(|id| *id != leader).collect();

        // with both followers down the first change cannot commit
        cluster.network.kill(followers[0]);
        cluster.network.kill(followers[1]);
        let gateway = cluster.gateway(leader).clone();
        let leaving = followers[0];
        let pending = tokio::spawn(async move { gateway.leave(leaving).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = cluster.gateway(leader).join(9, address(9)).await;
        assert_eq!(second.status, SubmitStatus::Rejected);

        assert_ne!(pending.await.unwrap().status, SubmitStatus::Committed);
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 7: DISCOVERY
// =============================================================================

mod discovery {
    use super::*;

    #[tokio::test]
    async fn test_silent_peer_is_suspected_then_recovers() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let leader = cluster.leader().await;
        let victim = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();

        cluster.network.kill(victim);
        eventually!(cluster.status(leader).await.suspected.contains(&victim));
        assert!(!cluster.status(leader).await.alive.contains(&victim));

        // suspicion is advisory: two of three still commit
        let response = cluster.gateway(leader).submit(approve(21), None).await;
        assert_eq!(response.status, SubmitStatus::Committed);

        cluster.network.revive(victim);
        eventually!(cluster.status(leader).await.alive.contains(&victim));
        eventually!(cluster.outcome_result(victim, response.index.unwrap()).await.is_some());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_address_book() {
        let cluster = TestCluster::start(&[1, 2, 3]);
        let request = Request::Ping { from: 2, address: address(2), known: vec![(3, "elsewhere:3".into())] };

        let Response::Pong { from, known } = cluster.gateway(1).handle(request).await else {
            panic!("expected pong");
        };

        assert_eq!(from, 1);
        assert!(known.contains(&(3, "elsewhere:3".to_string())));
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 8: RECOVERY AND TCP
// =============================================================================

mod recovery {
    use super::*;

    #[tokio::test]
    async fn test_restart_replays_committed_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..config(1, &[1])
        };
        let network = InMemoryNetwork::new();

        let node = NodeHandle::spawn(
            &config,
            config.open_store().unwrap(),
            Box::new(GovernanceMachine::new()),
            Arc::new(network.transport(1)),
        );
        let gateway = Gateway::new(node.clone(), Arc::new(network.transport(1)));
        eventually!(node.status().await.unwrap().node.state == NodeState::Leader);
        let first = gateway.submit(approve(1), None).await.outcome.unwrap();
        let second = gateway.submit(approve(2), None).await.outcome.unwrap();
        node.shutdown().await;

        let restarted = NodeHandle::spawn(
            &config,
            config.open_store().unwrap(),
            Box::new(GovernanceMachine::new()),
            Arc::new(network.transport(1)),
        );
        assert_eq!(restarted.outcome(first.index).await.unwrap(), Some(first));
        assert_eq!(restarted.outcome(second.index).await.unwrap(), Some(second.clone()));

        // replayed state still refuses a second decision on the same subject
        let gateway = Gateway::new(restarted.clone(), Arc::new(network.transport(1)));
        eventually!(restarted.status().await.unwrap().node.state == NodeState::Leader);
        let again = gateway.submit(approve(2), None).await.outcome.unwrap();
        assert!(matches!(again.result, DecisionResult::Rejected { .. }));
        assert!(again.index > second.index);
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = NodeConfig {
            listen_addr: addr.clone(),
            members: vec![MemberConfig { id: 1, address: addr.clone() }],
            ..config(1, &[1])
        };
        let tcp = Arc::new(TcpTransport::new());
        let node = NodeHandle::spawn(&config, Box::new(MemLogStore::new()), Box::new(GovernanceMachine::new()), tcp.clone());
        let server = transport::serve(listener, Arc::new(Gateway::new(node.clone(), tcp.clone())));
        eventually!(node.status().await.unwrap().node.state == NodeState::Leader);

        let request = Request::Submit { command: approve(3), dedup_key: None, forwarded: false };
        let response = tcp.send(1, &addr, request).await.unwrap();

        let Response::Submitted(response) = response else {
            panic!("expected a submitted response");
        };
        assert_eq!(response.status, SubmitStatus::Committed);
        server.abort();
        node.shutdown().await;
    }
}
