//! HRM Hierarchy - elections and recursive hierarchy formation
//!
//! Implements the per-cluster leader election and the escalation that folds
//! elected coordinators into superior clusters:
//! - Bully-variant elector per cluster with timeouts, laggard recovery and
//!   optional liveness
//! - Coordinator creation with signed credentials
//! - Level-by-level escalation gated by a process-wide election registry
//! - One-time address distribution at the top level

pub mod arena;
pub mod cluster;
pub mod controller;
pub mod coordinator;
pub mod elector;
pub mod escalation;
pub mod events;
pub mod registry;
pub mod substrate;

pub use arena::{ClusterArena, ClusterSlot};
pub use cluster::{Cluster, MemberChannel, NeighborCluster};
pub use controller::{ClusterSnapshot, HierarchyConfig, HierarchyController, NodeIdentity, PriorityChange, Substrate};
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use elector::{ElectionTimer, Elector, ElectorConfig, ElectorState, LivenessConfig, TimerKind};
pub use events::{EventRecord, HierarchyEvent};
pub use registry::{ClusterUpdateSink, ElectionRegistry, ElectorStatus, RegistryEntry};
pub use substrate::{ScopeMember, SuperiorScope, TimerSink, Topology, Transport};

use hrm_protocol::{ClusterKey, ProtocolError};
use thiserror::Error;

/// Errors originating from the hierarchy layer.
#[derive(Error, Debug)]
pub enum HierarchyError {
    #[error("Illegal elector transition in {cluster}: {from} -> {to}")]
    IllegalTransition {
        cluster: ClusterKey,
        from: ElectorState,
        to: ElectorState,
    },

    #[error("Cluster already exists: {0}")]
    DuplicateCluster(ClusterKey),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(ClusterKey),

    #[error("Hierarchy height exceeded: level {level} with height {height}")]
    MaxHeightExceeded { level: u8, height: u8 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
