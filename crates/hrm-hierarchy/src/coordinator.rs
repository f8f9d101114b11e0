//! The elected representative of a cluster.

use ed25519_dalek::SigningKey;
use serde::Serialize;

use hrm_protocol::{
    AnnounceParams, BullyPriority, ClusterKey, CoordinatorCredential, ElectionMessage,
    HierarchyLevel, NodeName,
};

use crate::HierarchyError;

/// Upward view of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorHandle {
    pub name: String,
    pub node: NodeName,
    pub address: String,
    pub cluster: ClusterKey,
    pub level: HierarchyLevel,
    pub token: u64,
}

/// Created exactly once per won election and dropped when the win is
/// invalidated or the cluster is torn down.
#[derive(Debug, Clone)]
pub struct Coordinator {
    node: NodeName,
    cluster: ClusterKey,
    token: u64,
    priority: BullyPriority,
    address: String,
    credential: CoordinatorCredential,
    superior: Option<ClusterKey>,
}

impl Coordinator {
    pub fn create(
        signing_key: &SigningKey,
        node: NodeName,
        cluster: ClusterKey,
        token: u64,
        priority: BullyPriority,
    ) -> Result<Self, HierarchyError> {
        let credential = CoordinatorCredential::issue(signing_key, node.clone(), cluster, token, priority)?;
        Ok(Self {
            address: derive_address(cluster, token),
            node,
            cluster,
            token,
            priority,
            credential,
            superior: None,
        })
    }

    pub fn name(&self) -> String {
        format!("{}@{}", self.node, self.cluster)
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    pub fn cluster(&self) -> ClusterKey {
        self.cluster
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn credential(&self) -> &CoordinatorCredential {
        &self.credential
    }

    /// Superior cluster this coordinator represents its cluster in.
    pub fn superior(&self) -> Option<ClusterKey> {
        self.superior
    }

    pub fn set_superior(&mut self, superior: ClusterKey) {
        self.superior = Some(superior);
    }

    /// ANNOUNCE carrying this coordinator's credential.
    pub fn announce(&self, covered_peer_names: Vec<NodeName>) -> ElectionMessage {
        ElectionMessage::Announce(AnnounceParams {
            sender_name: self.node.clone(),
            sender_priority: self.priority,
            credential: self.credential.clone(),
            token: self.token,
            covered_peer_names,
        })
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            name: self.name(),
            node: self.node.clone(),
            address: self.address.clone(),
            cluster: self.cluster,
            level: self.cluster.level,
            token: self.token,
        }
    }
}

/// External address of a coordinator. Real address encoding lives outside
/// the hierarchy core; this only has to be unique per (cluster, token).
fn derive_address(cluster: ClusterKey, token: u64) -> String {
    format!("hrm://{}.{}/{:016x}", cluster.level.value(), cluster.id, token)
}
