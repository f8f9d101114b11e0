//! Cluster membership and per-cluster election data.
//!
//! A cluster on a node is the set of member channels to the other nodes (or,
//! above level 0, the other coordinators) of the same administrative group,
//! plus edge channels to directly linked nodes of foreign groups. Edge peers
//! never take part in an election but still learn about its outcome.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use serde::Serialize;

use hrm_protocol::{BullyPriority, ClusterKey, HierarchyLevel, NodeName};

/// One channel from the local cluster to a peer.
#[derive(Debug, Clone, Serialize)]
pub struct MemberChannel {
    pub peer: NodeName,
    /// The cluster the peer hosts this channel in. Differs from the local
    /// key only for edge channels.
    pub peer_cluster: ClusterKey,
    pub is_edge: bool,
    /// Last priority learned from the peer, `UNDEFINED` until it answers.
    pub peer_priority: BullyPriority,
    /// Whether the peer is known to have learned the coordinator.
    pub knows_coordinator: bool,
}

impl MemberChannel {
    pub fn member(peer: NodeName, cluster: ClusterKey) -> Self {
        Self {
            peer,
            peer_cluster: cluster,
            is_edge: false,
            peer_priority: BullyPriority::UNDEFINED,
            knows_coordinator: false,
        }
    }

    pub fn edge(peer: NodeName, peer_cluster: ClusterKey) -> Self {
        Self {
            peer,
            peer_cluster,
            is_edge: true,
            peer_priority: BullyPriority::UNDEFINED,
            knows_coordinator: false,
        }
    }
}

/// Coordinator of a foreign cluster, learned from a forwarded announcement
/// or a discovery answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborCluster {
    pub cluster: ClusterKey,
    pub coordinator: NodeName,
    pub token: u64,
    pub priority: BullyPriority,
    /// Peer the information arrived from.
    pub via: NodeName,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    key: ClusterKey,
    members: BTreeMap<NodeName, MemberChannel>,
    priority: BullyPriority,
    token: Option<u64>,
    neighbors: BTreeMap<ClusterKey, NeighborCluster>,
}

impl Cluster {
    pub fn new(key: ClusterKey, priority: BullyPriority) -> Self {
        Self {
            key,
            members: BTreeMap::new(),
            priority,
            token: None,
            neighbors: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ClusterKey {
        self.key
    }

    pub fn level(&self) -> HierarchyLevel {
        self.key.level
    }

    pub fn priority(&self) -> BullyPriority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: BullyPriority) {
        self.priority = priority;
    }

    /// Add a channel. A peer already present keeps its learned state; a
    /// member channel replaces an edge channel to the same peer.
    pub fn add_member(&mut self, channel: MemberChannel) {
        match self.members.get_mut(&channel.peer) {
            Some(existing) => {
                if existing.is_edge && !channel.is_edge {
                    existing.is_edge = false;
                    existing.peer_cluster = channel.peer_cluster;
                }
            }
            None => {
                self.members.insert(channel.peer.clone(), channel);
            }
        }
    }

    pub fn member(&self, peer: &NodeName) -> Option<&MemberChannel> {
        self.members.get(peer)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberChannel> {
        self.members.values()
    }

    /// Non-edge members: the peers that take part in the election.
    pub fn candidates(&self) -> impl Iterator<Item = &MemberChannel> {
        self.members.values().filter(|m| !m.is_edge)
    }

    pub fn edges(&self) -> impl Iterator<Item = &MemberChannel> {
        self.members.values().filter(|m| m.is_edge)
    }

    pub fn has_candidates(&self) -> bool {
        self.candidates().next().is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Whether every candidate has told us its priority.
    pub fn all_candidates_answered(&self) -> bool {
        self.candidates().all(|m| m.peer_priority.is_defined())
    }

    /// Highest defined priority among candidates.
    pub fn highest_candidate_priority(&self) -> Option<BullyPriority> {
        self.candidates()
            .map(|m| m.peer_priority)
            .filter(|p| p.is_defined())
            .max()
    }

    pub fn record_peer_priority(&mut self, peer: &NodeName, priority: BullyPriority) {
        if let Some(member) = self.members.get_mut(peer) {
            member.peer_priority = priority;
        }
    }

    /// Forget learned priorities so the peers are asked again.
    pub fn reset_peer_priorities(&mut self, peers: &[NodeName]) {
        for peer in peers {
            if let Some(member) = self.members.get_mut(peer) {
                member.peer_priority = BullyPriority::UNDEFINED;
            }
        }
    }

    pub fn set_knows_coordinator(&mut self, peer: &NodeName, knows: bool) {
        if let Some(member) = self.members.get_mut(peer) {
            member.knows_coordinator = knows;
        }
    }

    pub fn clear_coordinator_knowledge(&mut self) {
        for member in self.members.values_mut() {
            member.knows_coordinator = false;
        }
    }

    /// Candidates known to have learned the coordinator.
    pub fn informed_candidates(&self) -> BTreeSet<NodeName> {
        self.candidates()
            .filter(|m| m.knows_coordinator)
            .map(|m| m.peer.clone())
            .collect()
    }

    pub fn token(&self) -> Option<u64> {
        self.token
    }

    /// Assign the cluster token. Only the first assignment takes effect.
    pub fn assign_token<R: Rng>(&mut self, rng: &mut R) -> u64 {
        *self.token.get_or_insert_with(|| rng.gen())
    }

    /// Take over the token announced by the winner.
    pub fn adopt_token(&mut self, token: u64) {
        if self.token != Some(token) {
            tracing::debug!(cluster = %self.key, token, "Adopted announced token");
        }
        self.token = Some(token);
    }

    pub fn record_neighbor(&mut self, neighbor: NeighborCluster) {
        self.neighbors.insert(neighbor.cluster, neighbor);
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &NeighborCluster> {
        self.neighbors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Cluster {
        let mut c = Cluster::new(ClusterKey::base(1), BullyPriority::new(10, 1));
        c.add_member(MemberChannel::member("b".into(), ClusterKey::base(1)));
        c.add_member(MemberChannel::member("c".into(), ClusterKey::base(1)));
        c.add_member(MemberChannel::edge("x".into(), ClusterKey::base(2)));
        c
    }

    #[test]
    fn test_edges_are_not_candidates() {
        let c = cluster();
        assert_eq!(c.candidates().count(), 2);
        assert_eq!(c.edges().count(), 1);
        assert_eq!(c.member_count(), 3);
    }

    #[test]
    fn test_answered_and_highest() {
        let mut c = cluster();
        assert!(!c.all_candidates_answered());
        c.record_peer_priority(&"b".into(), BullyPriority::new(7, 2));
        c.record_peer_priority(&"c".into(), BullyPriority::new(12, 3));
        // Edge priorities never count.
        c.record_peer_priority(&"x".into(), BullyPriority::new(99, 9));
        assert!(c.all_candidates_answered());
        assert_eq!(c.highest_candidate_priority(), Some(BullyPriority::new(12, 3)));
    }

    #[test]
    fn test_token_assigned_once() {
        let mut c = cluster();
        let mut rng = rand::thread_rng();
        let first = c.assign_token(&mut rng);
        let second = c.assign_token(&mut rng);
        assert_eq!(first, second);
        c.adopt_token(5);
        assert_eq!(c.token(), Some(5));
    }

    #[test]
    fn test_member_replaces_edge() {
        let mut c = cluster();
        c.add_member(MemberChannel::member("x".into(), ClusterKey::base(1)));
        assert!(!c.member(&"x".into()).unwrap().is_edge);
        assert_eq!(c.edges().count(), 0);
    }
}
