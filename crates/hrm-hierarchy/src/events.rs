//! Upward notifications about hierarchy formation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use hrm_protocol::{BullyPriority, ClusterKey, NodeName};

use crate::coordinator::CoordinatorHandle;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HierarchyEvent {
    ElectionWon {
        node: NodeName,
        cluster: ClusterKey,
        priority: BullyPriority,
    },
    ElectionLost {
        node: NodeName,
        cluster: ClusterKey,
        coordinator: Option<NodeName>,
    },
    CoordinatorCreated {
        node: NodeName,
        coordinator: CoordinatorHandle,
    },
    CoordinatorInvalidated {
        node: NodeName,
        cluster: ClusterKey,
    },
    SuperiorClusterJoined {
        node: NodeName,
        cluster: ClusterKey,
        members: Vec<NodeName>,
    },
    SuperiorClusterLeft {
        node: NodeName,
        cluster: ClusterKey,
    },
    AddressesDistributed {
        node: NodeName,
        cluster: ClusterKey,
        address: String,
        members: Vec<NodeName>,
    },
    ElectorFailed {
        node: NodeName,
        cluster: ClusterKey,
        reason: String,
    },
}

impl HierarchyEvent {
    pub fn node(&self) -> &NodeName {
        match self {
            Self::ElectionWon { node, .. }
            | Self::ElectionLost { node, .. }
            | Self::CoordinatorCreated { node, .. }
            | Self::CoordinatorInvalidated { node, .. }
            | Self::SuperiorClusterJoined { node, .. }
            | Self::SuperiorClusterLeft { node, .. }
            | Self::AddressesDistributed { node, .. }
            | Self::ElectorFailed { node, .. } => node,
        }
    }
}

/// A timestamped event.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: HierarchyEvent,
}

impl EventRecord {
    pub fn now(event: HierarchyEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}
