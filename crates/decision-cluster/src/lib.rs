//! # decision-cluster
//!
//! why: run the consensus engine as a live agent node: timers, network, applier, clients
//! relations: drives decision-core's RaftNode, persists through decision-storage, embedded by decision-agent
//! what: node event loop, transports, membership registry, decision applier, governance machine, client gateway, config

pub mod applier;
pub mod config;
pub mod error;
pub mod gateway;
pub mod governance;
pub mod node;
pub mod registry;
pub mod transport;

pub use applier::{DecisionApplier, DecisionOutcome, DecisionResult, StateMachine};
pub use config::{MemberConfig, NodeConfig};
pub use error::{ApplyError, ClusterError, ConfigError, TransportError};
pub use gateway::{Gateway, SubmitResponse, SubmitStatus};
pub use governance::{GovernanceCommand, GovernanceMachine};
pub use node::{ClusterStatus, NodeHandle, NodeHealth};
pub use registry::{MembershipRegistry, SharedRegistry};
pub use transport::{InMemoryNetwork, Request, RequestHandler, Response, TcpTransport, Transport};
