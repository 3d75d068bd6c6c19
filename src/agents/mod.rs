//! Agent modules for the Lornu Peering Orchestrator
//!
//! - `peering`: cross-account VPC peering lifecycle agent

pub mod peering;

pub use peering::PeeringOrchestrator;
