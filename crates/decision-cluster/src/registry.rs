//! # registry
//!
//! why: know which agents are alive and where they listen
//! relations: fed by gossip pings and raft traffic in node.rs, read when picking rpc targets
//! what: MembershipRegistry with heartbeat, suspicion and address book
//!
//! Suspicion is advisory. Quorum is always computed by the engine over the
//! configured roster; the registry only decides whom it is worth talking to.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use decision_core::NodeId;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

pub type SharedRegistry = Arc<RwLock<MembershipRegistry>>;

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub address: String,
    pub last_heartbeat: Instant,
    pub alive: bool,
}

#[derive(Debug)]
pub struct MembershipRegistry {
    self_id: NodeId,
    members: HashMap<NodeId, MemberInfo>,
    suspect_after: Duration,
}

impl MembershipRegistry {
    pub fn new(self_id: NodeId, suspect_after: Duration) -> Self {
        Self { self_id, members: HashMap::new(), suspect_after }
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Record a member. A fresh member starts alive; re-joining updates the address.
    pub fn join(&mut self, node_id: NodeId, address: impl Into<String>) {
        let address = address.into();
        let now = Instant::now();
        match self.members.get_mut(&node_id) {
            Some(info) => {
                info.address = address;
                info.last_heartbeat = now;
                info.alive = true;
            }
            None => {
                self.members.insert(node_id, MemberInfo { address, last_heartbeat: now, alive: true });
            }
        }
    }

    pub fn leave(&mut self, node_id: NodeId) -> bool {
        self.members.remove(&node_id).is_some()
    }

    pub fn heartbeat(&mut self, node_id: NodeId) {
        self.heartbeat_at(node_id, Instant::now());
    }

    /// Unknown ids are ignored; only members get tracked.
    pub fn heartbeat_at(&mut self, node_id: NodeId, at: Instant) {
        if let Some(info) = self.members.get_mut(&node_id) {
            if !info.alive {
                info!(peer = node_id, "peer recovered");
            }
            info.last_heartbeat = info.last_heartbeat.max(at);
            info.alive = true;
        }
    }

    pub fn suspect(&mut self, node_id: NodeId) {
        if node_id == self.self_id {
            return;
        }
        if let Some(info) = self.members.get_mut(&node_id) {
            if info.alive {
                warn!(peer = node_id, "suspecting peer");
            }
            info.alive = false;
        }
    }

    /// Suspect every member silent for longer than the threshold.
    /// Returns the ids newly suspected by this call.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .members
            .iter()
            .filter(|(id, info)| {
                **id != self.self_id
                    && info.alive
                    && now.saturating_duration_since(info.last_heartbeat) > self.suspect_after
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.suspect(*id);
        }
        stale
    }

    /// Members not currently suspected; always includes self when registered.
    pub fn list_alive(&self) -> BTreeSet<NodeId> {
        self.members.iter().filter(|(_, info)| info.alive).map(|(id, _)| *id).collect()
    }

    pub fn suspected(&self) -> BTreeSet<NodeId> {
        self.members.iter().filter(|(_, info)| !info.alive).map(|(id, _)| *id).collect()
    }

    /// Unknown ids are not suspected.
    pub fn is_suspected(&self, node_id: NodeId) -> bool {
        self.members.get(&node_id).map_or(false, |info| !info.alive)
    }

    pub fn address(&self, node_id: NodeId) -> Option<&str> {
        self.members.get(&node_id).map(|info| info.address.as_str())
    }

    pub fn get(&self, node_id: NodeId) -> Option<&MemberInfo> {
        self.members.get(&node_id)
    }

    /// Adopt gossiped addresses for peers we already track.
    pub fn learn(&mut self, known: &[(NodeId, String)]) {
        for (id, address) in known {
            if *id == self.self_id {
                continue;
            }
            if let Some(info) = self.members.get_mut(id) {
                if &info.address != address {
                    info!(peer = *id, %address, "learned new address");
                    info.address = address.clone();
                }
            }
        }
    }

    /// The address book, sorted by id, for gossip.
    pub fn known(&self) -> Vec<(NodeId, String)> {
        let mut known: Vec<_> =
            self.members.iter().map(|(id, info)| (*id, info.address.clone())).collect();
        known.sort();
        known
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MembershipRegistry {
        let mut registry = MembershipRegistry::new(1, Duration::from_millis(100));
        registry.join(1, "a:1");
        registry.join(2, "a:2");
        registry.join(3, "a:3");
        registry
    }

    #[test]
    fn silent_members_become_suspected() {
        let mut registry = registry();
        let later = Instant::now() + Duration::from_millis(150);
        registry.heartbeat_at(2, later);

        let newly = registry.check_timeouts(later);

        assert_eq!(newly, vec![3]);
        assert!(registry.is_suspected(3));
        assert_eq!(registry.list_alive(), BTreeSet::from([1, 2]));
        // already suspected peers are not reported twice
        assert!(registry.check_timeouts(later).is_empty());
    }

    #[test]
    fn self_is_never_suspected() {
        let mut registry = registry();
        registry.check_timeouts(Instant::now() + Duration::from_secs(5));
        registry.suspect(1);
        assert!(registry.list_alive().contains(&1));
    }

    #[test]
    fn heartbeat_clears_suspicion() {
        let mut registry = registry();
        registry.suspect(2);
        assert!(registry.is_suspected(2));

        registry.heartbeat(2);
        assert!(!registry.is_suspected(2));
    }

    #[test]
    fn unknown_nodes_are_not_tracked() {
        let mut registry = registry();
        registry.heartbeat(9);
        registry.learn(&[(9, "x:9".into())]);
        assert!(registry.get(9).is_none());
        assert!(!registry.is_suspected(9));
    }

    #[test]
    fn gossip_updates_known_addresses() {
        let mut registry = registry();
        registry.learn(&[(2, "b:2".into())]);
        assert_eq!(registry.address(2), Some("b:2"));
        assert_eq!(registry.known()[1], (2, "b:2".to_string()));
    }

    #[test]
    fn leave_forgets_member() {
        let mut registry = registry();
        assert!(registry.leave(3));
        assert!(!registry.leave(3));
        assert_eq!(registry.len(), 2);
    }
}
