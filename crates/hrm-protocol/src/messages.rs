use serde::{Deserialize, Serialize};

use crate::crypto::CoordinatorCredential;
use crate::identity::{ClusterKey, HierarchyLevel, NodeName};
use crate::priority::BullyPriority;
use crate::ProtocolError;

/// The six signaling messages of the election protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionMessage {
    /// Ask a peer for its priority.
    Elect {
        sender_name: NodeName,
        sender_priority: BullyPriority,
        level: HierarchyLevel,
    },
    /// Answer to ELECT carrying the responder's priority.
    Reply {
        sender_name: NodeName,
        sender_priority: BullyPriority,
    },
    /// Winner's announcement, also forwarded to edge peers.
    Announce(AnnounceParams),
    /// Coordinator liveness beacon, or a hint that the sender knows one.
    Alive { sender_name: NodeName },
    /// The sender's priority changed.
    PriorityUpdate { sender_priority: BullyPriority },
    /// Coordinator discovery poll and its answer.
    RequestCoordinator(RequestCoordinatorParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceParams {
    pub sender_name: NodeName,
    pub sender_priority: BullyPriority,
    pub credential: CoordinatorCredential,
    pub token: u64,
    /// Members the winner reached directly with this announcement.
    pub covered_peer_names: Vec<NodeName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCoordinatorParams {
    pub is_answer: bool,
    pub coordinator_known: bool,
    #[serde(default)]
    pub discovery_entries: Vec<DiscoveryEntry>,
}

impl RequestCoordinatorParams {
    pub fn request() -> Self {
        Self {
            is_answer: false,
            coordinator_known: false,
            discovery_entries: Vec::new(),
        }
    }

    pub fn answer(entry: Option<DiscoveryEntry>) -> Self {
        Self {
            is_answer: true,
            coordinator_known: entry.is_some(),
            discovery_entries: entry.into_iter().collect(),
        }
    }
}

/// What a node knows about the coordinator of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub token: u64,
    pub coordinator_name: NodeName,
    pub cluster: ClusterKey,
    pub priority: BullyPriority,
}

/// Message kind tags, used for logging and dispatch statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    Elect,
    Reply,
    Announce,
    Alive,
    PriorityUpdate,
    RequestCoordinator,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elect => "ELECT",
            Self::Reply => "REPLY",
            Self::Announce => "ANNOUNCE",
            Self::Alive => "ALIVE",
            Self::PriorityUpdate => "PRIORITY_UPDATE",
            Self::RequestCoordinator => "REQUEST_COORDINATOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ELECT" => Some(Self::Elect),
            "REPLY" => Some(Self::Reply),
            "ANNOUNCE" => Some(Self::Announce),
            "ALIVE" => Some(Self::Alive),
            "PRIORITY_UPDATE" => Some(Self::PriorityUpdate),
            "REQUEST_COORDINATOR" => Some(Self::RequestCoordinator),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ElectionMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Elect { .. } => MessageKind::Elect,
            Self::Reply { .. } => MessageKind::Reply,
            Self::Announce(_) => MessageKind::Announce,
            Self::Alive { .. } => MessageKind::Alive,
            Self::PriorityUpdate { .. } => MessageKind::PriorityUpdate,
            Self::RequestCoordinator(_) => MessageKind::RequestCoordinator,
        }
    }
}

/// A message in flight between two clusters on two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: NodeName,
    pub source_cluster: ClusterKey,
    pub target_cluster: ClusterKey,
    pub message: ElectionMessage,
}

impl Envelope {
    pub fn new(
        source: NodeName,
        source_cluster: ClusterKey,
        target_cluster: ClusterKey,
        message: ElectionMessage,
    ) -> Self {
        Self {
            source,
            source_cluster,
            target_cluster,
            message,
        }
    }

    /// Whether the envelope crossed an administrative boundary.
    pub fn is_from_foreign_cluster(&self) -> bool {
        self.source_cluster != self.target_cluster
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate an envelope.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// An ELECT must name the level of the cluster it is addressed to.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let ElectionMessage::Elect { level, .. } = &self.message {
            if *level != self.target_cluster.level {
                return Err(ProtocolError::LevelMismatch {
                    expected: self.target_cluster.level.value(),
                    got: level.value(),
                });
            }
        }
        Ok(())
    }
}
