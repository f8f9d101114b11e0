use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Name of a physical node in the simulated network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Administrative identifier of a cluster. Unique only within one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rank of a cluster in the hierarchy. Level 0 groups physical nodes,
/// every higher level groups the coordinators of the level below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HierarchyLevel(u8);

impl HierarchyLevel {
    pub const BASE: HierarchyLevel = HierarchyLevel(0);

    /// Build a level, rejecting values outside `0..height`.
    pub fn new(level: u8, height: u8) -> Result<Self, ProtocolError> {
        if height == 0 {
            return Err(ProtocolError::InvalidHeight(height));
        }
        if level >= height {
            return Err(ProtocolError::InvalidLevel { level, height });
        }
        Ok(Self(level))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_base(&self) -> bool {
        self.0 == 0
    }

    /// Whether this is the highest level of a hierarchy of the given height.
    pub fn is_top(&self, height: u8) -> bool {
        self.0.saturating_add(1) >= height
    }

    /// The next level up, or `None` when this level is already the top.
    pub fn superior(&self, height: u8) -> Option<HierarchyLevel> {
        if self.is_top(height) {
            None
        } else {
            Some(Self(self.0 + 1))
        }
    }

    /// The next level down, or `None` at the base.
    pub fn inferior(&self) -> Option<HierarchyLevel> {
        self.0.checked_sub(1).map(Self)
    }
}

impl std::fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Identifies a cluster on a node: no two clusters on one node share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub level: HierarchyLevel,
    pub id: ClusterId,
}

impl ClusterKey {
    pub fn new(level: HierarchyLevel, id: ClusterId) -> Self {
        Self { level, id }
    }

    /// Key of a base-level cluster.
    pub fn base(id: u64) -> Self {
        Self {
            level: HierarchyLevel::BASE,
            id: ClusterId(id),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/C{}", self.level, self.id)
    }
}
