//! # memory
//!
//! why: run several nodes in one process with controllable links
//! relations: implements the Transport trait from mod.rs; used by the cluster tests
//! what: InMemoryNetwork (kill, revive, isolate, partition, heal), InMemoryTransport
//!
//! Every node registers a handler on a shared hub; sends are direct async
//! calls into the target's handler. Links can be cut to simulate
//! partitions and nodes can be taken down entirely.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use decision_core::NodeId;
use parking_lot::RwLock;
use tracing::debug;

use super::{Request, RequestHandler, Response, Transport};
use crate::error::TransportError;

#[derive(Default)]
struct Hub {
    handlers: HashMap<NodeId, Arc<dyn RequestHandler>>,
    down: BTreeSet<NodeId>,
    /// Severed links, stored with the smaller id first.
    cut: BTreeSet<(NodeId, NodeId)>,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    hub: Arc<RwLock<Hub>>,
}

impl fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hub = self.hub.read();
        f.debug_struct("InMemoryNetwork")
            .field("nodes", &hub.handlers.keys().collect::<Vec<_>>())
            .field("down", &hub.down)
            .field("cut", &hub.cut)
            .finish()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that sends as node `id`.
    pub fn transport(&self, id: NodeId) -> InMemoryTransport {
        InMemoryTransport { from: id, network: self.clone() }
    }

    /// Route requests addressed to `id` into `handler`. Replaces any earlier handler.
    pub fn register(&self, id: NodeId, handler: Arc<dyn RequestHandler>) {
        let mut hub = self.hub.write();
        hub.handlers.insert(id, handler);
        hub.down.remove(&id);
    }

    /// Take a node off the network; it neither sends nor receives.
    pub fn kill(&self, id: NodeId) {
        self.hub.write().down.insert(id);
    }

    pub fn revive(&self, id: NodeId) {
        self.hub.write().down.remove(&id);
    }

    /// Cut `id` off from every other node.
    pub fn isolate(&self, id: NodeId) {
        let mut hub = self.hub.write();
        let others: Vec<NodeId> = hub.handlers.keys().copied().filter(|o| *o != id).collect();
        for other in others {
            hub.cut.insert(link(id, other));
        }
    }

    /// Split the network so nodes only reach others in their own group.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut hub = self.hub.write();
        for (i, group) in groups.iter().enumerate() {
            for other in groups.iter().skip(i + 1) {
                for a in group.iter() {
                    for b in other.iter() {
                        hub.cut.insert(link(*a, *b));
                    }
                }
            }
        }
    }

    /// Restore every severed link. Downed nodes stay down.
    pub fn heal(&self) {
        self.hub.write().cut.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<Arc<dyn RequestHandler>> {
        let hub = self.hub.read();
        if hub.down.contains(&from) || hub.down.contains(&to) || hub.cut.contains(&link(from, to)) {
            return None;
        }
        hub.handlers.get(&to).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    from: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(
        &self,
        target: NodeId,
        _address: &str,
        request: Request,
    ) -> Result<Response, TransportError> {
        let Some(handler) = self.network.route(self.from, target) else {
            debug!(from = self.from, to = target, "dropping request on severed link");
            return Err(TransportError::Unreachable { node: target });
        };
        let response = handler.handle(request).await;
        // the link may have been cut while the request was in flight
        if self.network.route(self.from, target).is_none() {
            return Err(TransportError::Unreachable { node: target });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(NodeId);

    #[async_trait]
    impl RequestHandler for Named {
        async fn handle(&self, _request: Request) -> Response {
            Response::Pong { from: self.0, known: vec![] }
        }
    }

    fn network(ids: &[NodeId]) -> InMemoryNetwork {
        let net = InMemoryNetwork::new();
        for id in ids {
            net.register(*id, Arc::new(Named(*id)));
        }
        net
    }

    async fn reaches(net: &InMemoryNetwork, from: NodeId, to: NodeId) -> bool {
        net.transport(from).send(to, "", Request::Status).await.is_ok()
    }

    #[tokio::test]
    async fn delivers_to_registered_handler() {
        let net = network(&[1, 2]);
        let response = net.transport(1).send(2, "", Request::Status).await.unwrap();
        assert_eq!(response, Response::Pong { from: 2, known: vec![] });
        assert!(!reaches(&net, 1, 9).await);
    }

    #[tokio::test]
    async fn isolation_cuts_both_directions() {
        let net = network(&[1, 2, 3]);
        net.isolate(3);

        assert!(!reaches(&net, 1, 3).await);
        assert!(!reaches(&net, 3, 2).await);
        assert!(reaches(&net, 1, 2).await);

        net.heal();
        assert!(reaches(&net, 3, 1).await);
    }

    #[tokio::test]
    async fn partition_keeps_groups_connected() {
        let net = network(&[1, 2, 3, 4, 5]);
        net.partition(&[&[1, 2], &[3, 4, 5]]);

        assert!(reaches(&net, 1, 2).await);
        assert!(reaches(&net, 3, 5).await);
        assert!(!reaches(&net, 2, 4).await);
    }

    #[tokio::test]
    async fn killed_node_is_silent_until_revived() {
        let net = network(&[1, 2]);
        net.kill(2);
        assert!(!reaches(&net, 1, 2).await);
        assert!(!reaches(&net, 2, 1).await);

        net.revive(2);
        assert!(reaches(&net, 1, 2).await);
    }
}
