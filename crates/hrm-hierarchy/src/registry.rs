//! Process-wide directory of electors and the cross-level barrier.
//!
//! The registry maps (level, cluster id) to the electors hosting that
//! cluster, one per node. It gates escalation: elections at level l+1 only
//! start once every elector at level l has settled (won, lost or failed)
//! and every node expected at level l+1 has registered there.
//!
//! All mutation happens under one lock. Nodes are notified from a snapshot
//! taken under the lock, after the lock has been released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use hrm_protocol::{ClusterId, ClusterKey, HierarchyLevel, NodeName};

/// Receives cluster-update requests for one node.
pub trait ClusterUpdateSink: Send + Sync {
    fn update_cluster(&self, level: HierarchyLevel);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectorStatus {
    Idle,
    Electing,
    /// Won and continuing to the next level.
    Won,
    /// Will not continue.
    Lost,
    /// Will not continue.
    Failed,
}

impl ElectorStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Won | Self::Lost | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub node: NodeName,
    pub cluster: ClusterKey,
    pub status: ElectorStatus,
}

#[derive(Default)]
struct RegistryInner {
    electors: BTreeMap<(HierarchyLevel, ClusterId), BTreeMap<NodeName, ElectorStatus>>,
    sinks: BTreeMap<NodeName, Arc<dyn ClusterUpdateSink>>,
    /// Nodes released into a level that have not registered there yet.
    expected: BTreeMap<HierarchyLevel, BTreeSet<NodeName>>,
    /// Nodes that asked to start at a level before the level below settled.
    pending_starts: BTreeMap<HierarchyLevel, BTreeSet<NodeName>>,
    /// Top-level clusters whose addresses were handed out.
    distributed: BTreeSet<ClusterKey>,
}

impl RegistryInner {
    fn level_entries(&self, level: HierarchyLevel) -> impl Iterator<Item = (&NodeName, ElectorStatus)> {
        self.electors
            .range((level, ClusterId(0))..=(level, ClusterId(u64::MAX)))
            .flat_map(|(_, nodes)| nodes.iter().map(|(n, s)| (n, *s)))
    }

    fn level_settled(&self, level: HierarchyLevel) -> bool {
        let nobody_expected = self.expected.get(&level).map_or(true, |e| e.is_empty());
        nobody_expected && self.level_entries(level).all(|(_, s)| s.is_settled())
    }
}

pub struct ElectionRegistry {
    height: u8,
    inner: Mutex<RegistryInner>,
}

impl ElectionRegistry {
    pub fn new(height: u8) -> Self {
        Self {
            height,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    /// Attach the cluster-update sink of a node.
    pub fn attach(&self, node: NodeName, sink: Arc<dyn ClusterUpdateSink>) {
        self.inner.lock().sinks.insert(node, sink);
    }

    /// Register a freshly created elector as idle.
    pub fn register(&self, node: &NodeName, cluster: ClusterKey) {
        let mut inner = self.inner.lock();
        inner
            .electors
            .entry((cluster.level, cluster.id))
            .or_default()
            .insert(node.clone(), ElectorStatus::Idle);
        if let Some(expected) = inner.expected.get_mut(&cluster.level) {
            expected.remove(node);
        }
    }

    /// Record a status change without re-evaluating the barrier.
    pub fn set_status(&self, node: &NodeName, cluster: ClusterKey, status: ElectorStatus) {
        let mut inner = self.inner.lock();
        if let Some(nodes) = inner.electors.get_mut(&(cluster.level, cluster.id)) {
            if let Some(current) = nodes.get_mut(node) {
                *current = status;
            }
        }
    }

    /// Record an outcome and re-evaluate the barrier of its level.
    /// Returns the number of nodes released into the next level.
    pub fn settle(&self, node: &NodeName, cluster: ClusterKey, status: ElectorStatus) -> usize {
        self.set_status(node, cluster, status);
        self.reevaluate(cluster.level)
    }

    /// A node released into `level` found nothing to escalate.
    pub fn skip_level(&self, node: &NodeName, level: HierarchyLevel) -> usize {
        {
            let mut inner = self.inner.lock();
            if let Some(expected) = inner.expected.get_mut(&level) {
                expected.remove(node);
            }
        }
        self.reevaluate(level)
    }

    /// Whether `node` may start its elector for `cluster` now. When the level
    /// below has not settled yet, the start is queued and released later
    /// through a cluster-update for the cluster's level.
    pub fn may_start(&self, node: &NodeName, cluster: ClusterKey) -> bool {
        let Some(inferior) = cluster.level.inferior() else {
            return true;
        };
        let mut inner = self.inner.lock();
        if inner.level_settled(inferior) {
            return true;
        }
        inner
            .pending_starts
            .entry(cluster.level)
            .or_default()
            .insert(node.clone());
        tracing::debug!(node = %node, cluster = %cluster, "Election start queued behind inferior level");
        false
    }

    /// If every elector at `level` has settled, notify the winners (and any
    /// queued starts) to process a cluster-update for `level + 1`.
    pub fn reevaluate(&self, level: HierarchyLevel) -> usize {
        let Some(superior) = level.superior(self.height) else {
            return 0;
        };

        let sinks: Vec<Arc<dyn ClusterUpdateSink>> = {
            let mut inner = self.inner.lock();
            if !inner.level_settled(level) {
                return 0;
            }
            let winners: BTreeSet<NodeName> = inner
                .level_entries(level)
                .filter(|(_, s)| *s == ElectorStatus::Won)
                .map(|(n, _)| n.clone())
                .collect();
            let queued = inner.pending_starts.remove(&superior).unwrap_or_default();
            if winners.is_empty() && queued.is_empty() {
                return 0;
            }

            let already_above: BTreeSet<NodeName> =
                inner.level_entries(superior).map(|(n, _)| n.clone()).collect();
            let newly_expected: Vec<NodeName> = winners
                .iter()
                .filter(|n| !already_above.contains(*n))
                .cloned()
                .collect();
            inner.expected.entry(superior).or_default().extend(newly_expected);

            winners
                .union(&queued)
                .filter_map(|n| inner.sinks.get(n).cloned())
                .collect()
        };

        tracing::info!(
            level = %level,
            released = sinks.len(),
            "Level settled, releasing superior elections"
        );
        for sink in &sinks {
            sink.update_cluster(superior);
        }
        sinks.len()
    }

    /// Remove one elector, e.g. on cluster teardown.
    pub fn deregister(&self, node: &NodeName, cluster: ClusterKey) -> usize {
        {
            let mut inner = self.inner.lock();
            let key = (cluster.level, cluster.id);
            if let Some(nodes) = inner.electors.get_mut(&key) {
                nodes.remove(node);
                if nodes.is_empty() {
                    inner.electors.remove(&key);
                }
            }
        }
        tracing::debug!(node = %node, cluster = %cluster, "Elector deregistered");
        self.reevaluate(cluster.level)
    }

    /// Remove every trace of a node, e.g. when it fails.
    pub fn deregister_node(&self, node: &NodeName) {
        let levels: BTreeSet<HierarchyLevel> = {
            let mut inner = self.inner.lock();
            inner.sinks.remove(node);
            let mut levels = BTreeSet::new();
            inner.electors.retain(|(level, _), nodes| {
                if nodes.remove(node).is_some() {
                    levels.insert(*level);
                }
                !nodes.is_empty()
            });
            for (level, expected) in inner.expected.iter_mut() {
                if expected.remove(node) {
                    levels.insert(*level);
                }
            }
            for pending in inner.pending_starts.values_mut() {
                pending.remove(node);
            }
            levels
        };
        tracing::info!(node = %node, levels = levels.len(), "Node removed from election registry");
        for level in levels {
            self.reevaluate(level);
        }
    }

    pub fn lookup(&self, cluster: ClusterKey) -> Vec<RegistryEntry> {
        let inner = self.inner.lock();
        inner
            .electors
            .get(&(cluster.level, cluster.id))
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|(node, status)| RegistryEntry {
                        node: node.clone(),
                        cluster,
                        status: *status,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let inner = self.inner.lock();
        inner
            .electors
            .iter()
            .flat_map(|((level, id), nodes)| {
                nodes.iter().map(move |(node, status)| RegistryEntry {
                    node: node.clone(),
                    cluster: ClusterKey::new(*level, *id),
                    status: *status,
                })
            })
            .collect()
    }

    pub fn is_level_settled(&self, level: HierarchyLevel) -> bool {
        self.inner.lock().level_settled(level)
    }

    /// Whether the address distribution of `cluster` already ran.
    pub fn addresses_distributed(&self, cluster: ClusterKey) -> bool {
        self.inner.lock().distributed.contains(&cluster)
    }

    /// Claim the one-time address distribution of a top-level cluster.
    /// Only the first claim succeeds, whichever node coordinates by then.
    pub fn claim_address_distribution(&self, cluster: ClusterKey) -> bool {
        self.inner.lock().distributed.insert(cluster)
    }

    /// Nodes that won at least one election at `level`.
    pub fn winners_at(&self, level: HierarchyLevel) -> BTreeSet<NodeName> {
        let inner = self.inner.lock();
        inner
            .level_entries(level)
            .filter(|(_, s)| *s == ElectorStatus::Won)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrm_protocol::DEFAULT_HIERARCHY_HEIGHT;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<HierarchyLevel>>);

    impl ClusterUpdateSink for Recorder {
        fn update_cluster(&self, level: HierarchyLevel) {
            self.0.lock().push(level);
        }
    }

    fn level(v: u8) -> HierarchyLevel {
        HierarchyLevel::new(v, DEFAULT_HIERARCHY_HEIGHT).unwrap()
    }

    #[test]
    fn test_barrier_waits_for_every_elector() {
        let reg = ElectionRegistry::new(DEFAULT_HIERARCHY_HEIGHT);
        let a_sink = Arc::new(Recorder::default());
        reg.attach("a".into(), a_sink.clone());
        reg.register(&"a".into(), ClusterKey::base(1));
        reg.register(&"b".into(), ClusterKey::base(1));
        reg.register(&"c".into(), ClusterKey::base(2));

        assert_eq!(reg.settle(&"a".into(), ClusterKey::base(1), ElectorStatus::Won), 0);
        assert_eq!(reg.settle(&"b".into(), ClusterKey::base(1), ElectorStatus::Lost), 0);
        assert!(a_sink.0.lock().is_empty());
        // The last sibling, even a failed one, releases the level.
        assert_eq!(reg.settle(&"c".into(), ClusterKey::base(2), ElectorStatus::Failed), 1);
        assert_eq!(*a_sink.0.lock(), vec![level(1)]);
    }

    #[test]
    fn test_top_level_never_releases() {
        let reg = ElectionRegistry::new(2);
        reg.attach("a".into(), Arc::new(Recorder::default()));
        let top = ClusterKey::new(HierarchyLevel::new(1, 2).unwrap(), ClusterId(1));
        reg.register(&"a".into(), top);
        assert_eq!(reg.settle(&"a".into(), top, ElectorStatus::Won), 0);
    }

    #[test]
    fn test_queued_start_released_with_level() {
        let reg = ElectionRegistry::new(DEFAULT_HIERARCHY_HEIGHT);
        let b_sink = Arc::new(Recorder::default());
        reg.attach("b".into(), b_sink.clone());
        reg.register(&"a".into(), ClusterKey::base(1));
        let superior = ClusterKey::new(level(1), ClusterId(1));
        assert!(!reg.may_start(&"b".into(), superior));
        reg.settle(&"a".into(), ClusterKey::base(1), ElectorStatus::Lost);
        assert_eq!(*b_sink.0.lock(), vec![level(1)]);
        assert!(reg.may_start(&"b".into(), superior));
    }

    #[test]
    fn test_expected_nodes_hold_superior_level() {
        let reg = ElectionRegistry::new(DEFAULT_HIERARCHY_HEIGHT);
        reg.attach("a".into(), Arc::new(Recorder::default()));
        reg.register(&"a".into(), ClusterKey::base(1));
        reg.settle(&"a".into(), ClusterKey::base(1), ElectorStatus::Won);
        // "a" was released into level 1 but has not registered there yet.
        assert!(!reg.is_level_settled(level(1)));
        reg.skip_level(&"a".into(), level(1));
        assert!(reg.is_level_settled(level(1)));
    }

    #[test]
    fn test_deregister_releases_barrier() {
        let reg = ElectionRegistry::new(DEFAULT_HIERARCHY_HEIGHT);
        let a_sink = Arc::new(Recorder::default());
        reg.attach("a".into(), a_sink.clone());
        reg.register(&"a".into(), ClusterKey::base(1));
        reg.register(&"b".into(), ClusterKey::base(2));
        reg.settle(&"a".into(), ClusterKey::base(1), ElectorStatus::Won);
        assert!(a_sink.0.lock().is_empty());
        reg.deregister_node(&"b".into());
        assert_eq!(*a_sink.0.lock(), vec![level(1)]);
        assert!(reg.lookup(ClusterKey::base(2)).is_empty());
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn test_address_distribution_claimed_once() {
        let reg = ElectionRegistry::new(2);
        let top = ClusterKey::new(HierarchyLevel::new(1, 2).unwrap(), ClusterId(1));
        assert!(!reg.addresses_distributed(top));
        assert!(reg.claim_address_distribution(top));
        assert!(reg.addresses_distributed(top));
        // A takeover coordinator finds the cluster already served.
        assert!(!reg.claim_address_distribution(top));
        let other = ClusterKey::new(HierarchyLevel::new(1, 2).unwrap(), ClusterId(2));
        assert!(reg.claim_address_distribution(other));
    }
}
