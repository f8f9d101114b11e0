//! Per-node storage of clusters, their electors and coordinators.
//!
//! Everything a node knows about one (level, cluster id) lives in a single
//! slot, so an elector can never outlive its cluster and a cluster holds at
//! most one coordinator. Links across levels are `ClusterKey`s.

use std::collections::BTreeMap;

use hrm_protocol::{ClusterKey, HierarchyLevel};

use crate::cluster::Cluster;
use crate::coordinator::Coordinator;
use crate::elector::Elector;
use crate::HierarchyError;

pub struct ClusterSlot {
    pub cluster: Cluster,
    pub elector: Elector,
    pub coordinator: Option<Coordinator>,
}

impl ClusterSlot {
    pub fn new(cluster: Cluster, elector: Elector) -> Self {
        Self {
            cluster,
            elector,
            coordinator: None,
        }
    }
}

#[derive(Default)]
pub struct ClusterArena {
    slots: BTreeMap<ClusterKey, ClusterSlot>,
}

impl ClusterArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: ClusterSlot) -> Result<(), HierarchyError> {
        let key = slot.cluster.key();
        if self.slots.contains_key(&key) {
            return Err(HierarchyError::DuplicateCluster(key));
        }
        self.slots.insert(key, slot);
        Ok(())
    }

    pub fn contains(&self, key: ClusterKey) -> bool {
        self.slots.contains_key(&key)
    }

    pub fn get(&self, key: ClusterKey) -> Option<&ClusterSlot> {
        self.slots.get(&key)
    }

    pub fn get_mut(&mut self, key: ClusterKey) -> Option<&mut ClusterSlot> {
        self.slots.get_mut(&key)
    }

    pub fn remove(&mut self, key: ClusterKey) -> Option<ClusterSlot> {
        self.slots.remove(&key)
    }

    pub fn keys(&self) -> Vec<ClusterKey> {
        self.slots.keys().copied().collect()
    }

    pub fn keys_at(&self, level: HierarchyLevel) -> Vec<ClusterKey> {
        self.slots.keys().filter(|k| k.level == level).copied().collect()
    }

    /// Clusters at `level` this node currently coordinates.
    pub fn coordinated_at(&self, level: HierarchyLevel) -> Vec<ClusterKey> {
        self.slots
            .iter()
            .filter(|(k, s)| k.level == level && s.coordinator.is_some() && s.elector.is_winner())
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterSlot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
