//! # cluster
//!
//! why: the configured roster that every quorum is computed against
//! relations: owned by node.rs, rebuilt from membership entries in the log
//! what: ClusterConfig (node id -> address), quorum math

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::log::MembershipChange;
use crate::NodeId;

/// The configured voting members, keyed by id.
///
/// Quorum is always taken over this set, never over the subset that
/// happens to be reachable.
///
/// Serialized as a list of `[id, address]` pairs; integer map keys do not
/// survive serde's internally tagged enums.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(NodeId, String)>", into = "Vec<(NodeId, String)>")]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, String>,
}

impl From<Vec<(NodeId, String)>> for ClusterConfig {
    fn from(members: Vec<(NodeId, String)>) -> Self {
        Self::new(members)
    }
}

impl From<ClusterConfig> for Vec<(NodeId, String)> {
    fn from(config: ClusterConfig) -> Self {
        config.members.into_iter().collect()
    }
}

impl ClusterConfig {
    pub fn new(members: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    /// Roster with placeholder addresses, handy when addresses are irrelevant.
    pub fn from_ids(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self::new(ids.into_iter().map(|id| (id, format!("node-{id}"))))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn members(&self) -> impl Iterator<Item = (NodeId, &str)> + '_ {
        self.members.iter().map(|(id, addr)| (*id, addr.as_str()))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// floor(N/2)+1 of the configured membership.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// The roster that results from applying `change`.
    pub fn with_change(&self, change: &MembershipChange) -> Self {
        let mut next = self.clone();
        match change {
            MembershipChange::Join { node_id, address } => {
                next.members.insert(*node_id, address.clone());
            }
            MembershipChange::Leave { node_id } => {
                next.members.remove(node_id);
            }
        }
        next
    }
}
