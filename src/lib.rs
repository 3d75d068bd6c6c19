//! Lornu Peering Orchestrator Library
//!
//! Cross-account VPC peering lifecycle agent: connection provisioning,
//! cross-account acceptance, and route reconciliation behind an idempotent
//! Create/Update/Delete contract.

pub mod agents;
pub mod tools;

pub use agents::peering::{LifecycleEvent, LifecycleResponse, PeeringOrchestrator};
pub use tools::ParameterStoreTool;
