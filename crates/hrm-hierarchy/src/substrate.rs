//! Seams to the collaborators the hierarchy core does not own: the
//! communication substrate, the routing graph and the timer source.

use std::collections::BTreeSet;
use std::time::Duration;

use hrm_protocol::{ClusterKey, Envelope, NodeName};

use crate::elector::ElectionTimer;
use crate::HierarchyError;

/// Best-effort message delivery between nodes.
///
/// A failed send is reported to the caller, which only logs it: lost
/// messages are recovered by protocol timeouts.
pub trait Transport: Send + Sync {
    fn send(&self, to: &NodeName, envelope: Envelope) -> Result<(), HierarchyError>;
}

/// A coordinator that belongs to a superior cluster's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMember {
    pub coordinator: NodeName,
    pub inferior: ClusterKey,
}

/// The superior cluster an inferior cluster folds into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperiorScope {
    pub cluster: ClusterKey,
    pub members: Vec<ScopeMember>,
}

impl SuperiorScope {
    /// Distinct coordinator nodes of the scope.
    pub fn coordinators(&self) -> BTreeSet<NodeName> {
        self.members.iter().map(|m| m.coordinator.clone()).collect()
    }
}

/// Read access to the routing graph plus the coordinator directory.
pub trait Topology: Send + Sync {
    /// Superior cluster of `inferior` and its current coordinator members.
    fn superior_scope(&self, inferior: ClusterKey) -> Option<SuperiorScope>;

    /// Whether the shortest path `from -> to` passes through one of
    /// `covered` (excluding the endpoints).
    fn path_covered(&self, from: &NodeName, to: &NodeName, covered: &BTreeSet<NodeName>) -> bool;

    fn register_coordinator(&self, cluster: ClusterKey, coordinator: &NodeName);

    fn deregister_coordinator(&self, cluster: ClusterKey, coordinator: &NodeName);
}

/// Schedules protocol timers for delivery back to the owning node.
pub trait TimerSink: Send + Sync {
    fn schedule(&self, after: Duration, timer: ElectionTimer);
}
