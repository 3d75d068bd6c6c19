//! Cross-Account VPC Peering Agent
//!
//! Establishes a private connection between two independently-owned VPCs:
//! the connection is requested locally, accepted from inside the peer
//! account, and the routing tables on both sides are reconciled so traffic
//! for the peer's range crosses the connection. Driven by an external
//! lifecycle controller that speaks Create/Update/Delete and expects exactly
//! one response per invocation, on time.
//!
//! ## Architecture
//!
//! - **Credential Broker**: STS web-identity exchange for short-lived,
//!   per-invocation peer-account credentials
//! - **Network API**: narrow seam over the provider's peering/routing
//!   control plane
//! - **Acceptor**: cross-account acceptance with backoff over propagation lag
//! - **Route Reconciler**: describe-before-mutate, already-achieved is success
//! - **Orchestrator**: the lifecycle state machine, stateless across
//!   invocations
//!
//! ## Security
//!
//! - Zero-Trust: no static keys; the peer role trusts this workload's OIDC
//!   identity
//! - Delegated credentials are explicit values threaded per call, never
//!   ambient, never logged

mod acceptor;
mod credentials;
mod network;
mod orchestrator;
mod routes;
mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use acceptor::CrossAccountAcceptor;
pub use credentials::{CredentialBroker, DelegatedCredentials, StsCredentialBroker};
pub use network::{Ec2NetworkClient, NetworkApi, NetworkScope};
pub use orchestrator::PeeringOrchestrator;
pub use routes::RouteReconciler;
pub use types::{
    AcceptedStatus, BackoffPolicy, Deadline, LifecycleEvent, LifecycleResponse, PeeringConfig,
    PeeringConnection, PeeringError, PeeringOutputs, PeeringRequest, PeeringStatus, RequestType,
    ResponseStatus, RouteAction, RouteEntry, RouteSyncResult,
};
