//! HRM Node - per-node event processing and the simulated substrate
//!
//! Hosts one hierarchy controller per node and drives it from a single
//! cooperative worker:
//! - Event processor with prioritized queues (channel data, priority
//!   changes, timers, cluster-updates)
//! - Simulated network implementing the transport and topology seams
//! - Simulation root wiring nodes, registry and observers together
//! - TOML/env configuration and the `hrm-sim` binary

pub mod config;
pub mod network;
pub mod processor;
pub mod simulation;

pub use config::SimulationConfig;
pub use network::SimNetwork;
pub use processor::{EventProcessor, NodeSnapshot, ProcessorHandle};
pub use simulation::Simulation;

use hrm_hierarchy::HierarchyError;
use hrm_protocol::{NodeName, ProtocolError};
use thiserror::Error;

/// Errors originating from node hosting and the simulation.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeName),

    #[error("Event processor stopped: {0}")]
    ProcessorStopped(NodeName),

    #[error("Hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
