//! Simulated communication and routing substrate.
//!
//! `SimNetwork` stands in for the real network underneath the hierarchy:
//! - Transport: envelopes are JSON-encoded, decoded and handed to the
//!   destination's processor. Failed nodes are unreachable and a seeded
//!   loss rate drops messages silently.
//! - Topology: administrative domains and physical links form the graph.
//!   Level-0 clusters are domains; two clusters are adjacent when they share
//!   a node or a link joins their members. Each level folds into the next:
//!   the lowest unassigned cluster id heads a superior cluster that takes
//!   every unassigned cluster within the expansion radius, counted in hops
//!   of that level's cluster graph. Superior clusters are adjacent when any
//!   of their members are.
//! - Coordinator directory per level.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hrm_hierarchy::{HierarchyError, ScopeMember, SuperiorScope, Topology, Transport};
use hrm_protocol::{ClusterId, ClusterKey, Envelope, NodeName};

use crate::processor::ProcessorHandle;

/// Static shape of the simulated network.
#[derive(Debug, Clone, Default)]
pub struct NetworkGraph {
    domains: BTreeMap<NodeName, BTreeSet<u64>>,
    links: BTreeMap<NodeName, BTreeSet<NodeName>>,
}

impl NetworkGraph {
    pub fn add_node(&mut self, node: NodeName, domains: impl IntoIterator<Item = u64>) {
        self.domains.entry(node.clone()).or_default().extend(domains);
        self.links.entry(node).or_default();
    }

    pub fn add_link(&mut self, a: NodeName, b: NodeName) {
        self.links.entry(a.clone()).or_default().insert(b.clone());
        self.links.entry(b).or_default().insert(a);
    }

    pub fn domains_of(&self, node: &NodeName) -> BTreeSet<u64> {
        self.domains.get(node).cloned().unwrap_or_default()
    }

    pub fn neighbors(&self, node: &NodeName) -> BTreeSet<NodeName> {
        self.links.get(node).cloned().unwrap_or_default()
    }

    pub fn domain_members(&self, domain: u64) -> Vec<NodeName> {
        self.domains
            .iter()
            .filter(|(_, d)| d.contains(&domain))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Level-0 cluster graph: every domain with the domains that share one
    /// of its members or are linked to one.
    pub fn domain_adjacency(&self) -> ClusterGraph {
        let mut graph = ClusterGraph::new();
        for (node, domains) in &self.domains {
            let reachable: BTreeSet<u64> = self
                .neighbors(node)
                .iter()
                .flat_map(|n| self.domains_of(n))
                .chain(domains.iter().copied())
                .collect();
            for domain in domains {
                let adjacent = graph.entry(ClusterId(*domain)).or_default();
                adjacent.extend(reachable.iter().filter(|d| *d != domain).map(|d| ClusterId(*d)));
            }
        }
        graph
    }

    /// Shortest path over physical links, endpoints included.
    pub fn shortest_path(&self, from: &NodeName, to: &NodeName) -> Option<Vec<NodeName>> {
        let mut parent: BTreeMap<NodeName, NodeName> = BTreeMap::new();
        let mut seen = BTreeSet::from([from.clone()]);
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == to {
                let mut path = vec![current.clone()];
                let mut cursor = &current;
                while let Some(p) = parent.get(cursor) {
                    path.push(p.clone());
                    cursor = p;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.neighbors(&current) {
                if seen.insert(next.clone()) {
                    parent.insert(next.clone(), current.clone());
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

/// Adjacency between the clusters of one level.
pub type ClusterGraph = BTreeMap<ClusterId, BTreeSet<ClusterId>>;

/// Fold one level: each cluster mapped to the id of its superior cluster.
pub fn fold_clusters(graph: &ClusterGraph, radius: u32) -> BTreeMap<ClusterId, ClusterId> {
    let mut fold = BTreeMap::new();
    for &head in graph.keys() {
        if fold.contains_key(&head) {
            continue;
        }
        fold.insert(head, head);
        let mut frontier = vec![head];
        for _ in 0..radius {
            let mut next = Vec::new();
            for cluster in frontier {
                for &adjacent in graph.get(&cluster).into_iter().flatten() {
                    if !fold.contains_key(&adjacent) {
                        fold.insert(adjacent, head);
                        next.push(adjacent);
                    }
                }
            }
            frontier = next;
        }
    }
    fold
}

/// Cluster graph of the level above a fold.
fn superior_graph(graph: &ClusterGraph, fold: &BTreeMap<ClusterId, ClusterId>) -> ClusterGraph {
    let mut superior = ClusterGraph::new();
    for (cluster, adjacent) in graph {
        let Some(&from) = fold.get(cluster) else {
            continue;
        };
        let entry = superior.entry(from).or_default();
        entry.extend(adjacent.iter().filter_map(|a| fold.get(a)).filter(|to| **to != from));
    }
    superior
}

pub struct SimNetwork {
    graph: NetworkGraph,
    height: u8,
    /// Per level below the top, inferior cluster id to superior cluster id.
    folds: Vec<BTreeMap<ClusterId, ClusterId>>,
    handles: RwLock<BTreeMap<NodeName, ProcessorHandle>>,
    failed: RwLock<BTreeSet<NodeName>>,
    directory: RwLock<BTreeMap<ClusterKey, NodeName>>,
    loss_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimNetwork {
    pub fn new(graph: NetworkGraph, height: u8, expansion_radius: u32, loss_rate: f64, seed: u64) -> Self {
        let mut folds = Vec::new();
        let mut level_graph = graph.domain_adjacency();
        for level in 0..height.saturating_sub(1) {
            let fold = fold_clusters(&level_graph, expansion_radius);
            let superiors: BTreeSet<ClusterId> = fold.values().copied().collect();
            tracing::debug!(level, clusters = level_graph.len(), superiors = superiors.len(), "Cluster graph folded");
            level_graph = superior_graph(&level_graph, &fold);
            folds.push(fold);
        }
        Self {
            graph,
            height,
            folds,
            handles: RwLock::new(BTreeMap::new()),
            failed: RwLock::new(BTreeSet::new()),
            directory: RwLock::new(BTreeMap::new()),
            loss_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    pub fn attach(&self, handle: ProcessorHandle) {
        self.handles.write().insert(handle.node().clone(), handle);
    }

    /// Make a node unreachable and drop its coordinator entries.
    pub fn fail(&self, node: &NodeName) {
        self.failed.write().insert(node.clone());
        self.directory.write().retain(|_, n| n != node);
        tracing::warn!(node = %node, "Node failed");
    }

    pub fn is_failed(&self, node: &NodeName) -> bool {
        self.failed.read().contains(node)
    }

    fn lose(&self) -> bool {
        self.loss_rate > 0.0 && self.rng.lock().gen::<f64>() < self.loss_rate
    }
}

impl Transport for SimNetwork {
    fn send(&self, to: &NodeName, envelope: Envelope) -> Result<(), HierarchyError> {
        if self.is_failed(&envelope.source) || self.is_failed(to) {
            return Err(HierarchyError::Transport(format!("{to} unreachable")));
        }
        if self.lose() {
            tracing::debug!(
                from = %envelope.source,
                to = %to,
                kind = %envelope.message.kind(),
                "Message lost in transit"
            );
            return Ok(());
        }

        let wire = envelope.to_json()?;
        let envelope = Envelope::from_json(&wire)?;

        let handle = self
            .handles
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| HierarchyError::Transport(format!("no route to {to}")))?;
        handle
            .deliver(envelope)
            .map_err(|e| HierarchyError::Transport(e.to_string()))
    }
}

impl Topology for SimNetwork {
    fn superior_scope(&self, inferior: ClusterKey) -> Option<SuperiorScope> {
        let level = inferior.level.superior(self.height)?;
        let fold = self.folds.get(inferior.level.value() as usize)?;
        let superior = *fold.get(&inferior.id)?;
        let members: Vec<ScopeMember> = self
            .directory
            .read()
            .iter()
            .filter(|(k, _)| k.level == inferior.level && fold.get(&k.id) == Some(&superior))
            .map(|(k, n)| ScopeMember {
                coordinator: n.clone(),
                inferior: *k,
            })
            .collect();
        if members.is_empty() {
            return None;
        }
        Some(SuperiorScope {
            cluster: ClusterKey::new(level, superior),
            members,
        })
    }

    fn path_covered(&self, from: &NodeName, to: &NodeName, covered: &BTreeSet<NodeName>) -> bool {
        let Some(path) = self.graph.shortest_path(from, to) else {
            return false;
        };
        path.iter()
            .skip(1)
            .take(path.len().saturating_sub(2))
            .any(|hop| covered.contains(hop))
    }

    fn register_coordinator(&self, cluster: ClusterKey, coordinator: &NodeName) {
        self.directory.write().insert(cluster, coordinator.clone());
    }

    fn deregister_coordinator(&self, cluster: ClusterKey, coordinator: &NodeName) {
        let mut directory = self.directory.write();
        if directory.get(&cluster) == Some(coordinator) {
            directory.remove(&cluster);
        }
    }
}
