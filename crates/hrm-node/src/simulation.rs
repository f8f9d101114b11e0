//! Simulation root: builds every node from the topology configuration and
//! owns the shared election registry and simulated network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hrm_hierarchy::{
    ElectionRegistry, EventRecord, HierarchyController, MemberChannel, NodeIdentity,
    PriorityChange, Substrate,
};
use hrm_protocol::{BullyPriority, ClusterKey, NodeName, DEFAULT_NODE_PRIORITY};

use crate::config::SimulationConfig;
use crate::network::{NetworkGraph, SimNetwork};
use crate::processor::{EventProcessor, NodeSnapshot, ProcessorHandle};
use crate::NodeError;

pub struct Simulation {
    registry: Arc<ElectionRegistry>,
    network: Arc<SimNetwork>,
    handles: BTreeMap<NodeName, ProcessorHandle>,
    tasks: BTreeMap<NodeName, JoinHandle<()>>,
    events: Option<mpsc::UnboundedReceiver<EventRecord>>,
}

impl Simulation {
    /// Build and spawn every node. Must be called inside a tokio runtime.
    /// Elections do not begin until [`Simulation::start`].
    pub fn build(config: &SimulationConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let hierarchy = config.to_hierarchy_config();
        let topology = &config.topology;

        let mut graph = NetworkGraph::default();
        for node in &topology.nodes {
            graph.add_node(NodeName::new(&node.name), node.domains.iter().copied());
        }
        for (a, b) in &topology.links {
            graph.add_link(NodeName::new(a), NodeName::new(b));
        }

        let registry = Arc::new(ElectionRegistry::new(hierarchy.height));
        let network = Arc::new(SimNetwork::new(
            graph,
            hierarchy.height,
            config.hierarchy.expansion_radius,
            topology.loss_rate,
            topology.seed,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let slow_dispatch = Duration::from_millis(config.processor.slow_dispatch_warn_ms);

        let mut handles = BTreeMap::new();
        let mut tasks = BTreeMap::new();
        for (index, spec) in topology.nodes.iter().enumerate() {
            let name = NodeName::new(&spec.name);
            let unique_id = index as u64 + 1;
            let identity = match spec.priority {
                Some(value) => NodeIdentity::generate(name.clone(), BullyPriority::new(value, unique_id)),
                None => NodeIdentity::generate(name.clone(), BullyPriority::new(DEFAULT_NODE_PRIORITY, unique_id))
                    .with_connectivity(network.graph().neighbors(&name).len()),
            };

            let (handle, queues) =
                EventProcessor::queues(name.clone(), config.processor.max_pending_cluster_updates);
            let substrate = Substrate {
                transport: network.clone(),
                topology: network.clone(),
                timers: Arc::new(handle.clone()),
            };
            let mut controller =
                HierarchyController::new(identity, hierarchy.clone(), registry.clone(), substrate)
                    .with_events(events_tx.clone());

            for domain in network.graph().domains_of(&name) {
                let channels = base_channels(network.graph(), &name, domain);
                controller.join_cluster(ClusterKey::base(domain), channels)?;
            }

            registry.attach(name.clone(), Arc::new(handle.clone()));
            network.attach(handle.clone());
            let processor = EventProcessor::new(controller, &handle, queues, slow_dispatch);
            tasks.insert(name.clone(), tokio::spawn(processor.run()));
            handles.insert(name, handle);
        }

        tracing::info!(
            nodes = handles.len(),
            links = topology.links.len(),
            height = hierarchy.height,
            "Simulation built"
        );

        Ok(Self {
            registry,
            network,
            handles,
            tasks,
            events: Some(events_rx),
        })
    }

    /// Start the level-0 elections of every node.
    pub fn start(&self) -> Result<(), NodeError> {
        for handle in self.handles.values() {
            handle.start()?;
        }
        Ok(())
    }

    /// Take the stream of hierarchy events. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EventRecord>> {
        self.events.take()
    }

    pub fn registry(&self) -> &Arc<ElectionRegistry> {
        &self.registry
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeName> {
        self.handles.keys()
    }

    fn handle(&self, node: &NodeName) -> Result<&ProcessorHandle, NodeError> {
        self.handles
            .get(node)
            .ok_or_else(|| NodeError::UnknownNode(node.clone()))
    }

    pub fn change_priority(&self, node: &NodeName, change: PriorityChange) -> Result<(), NodeError> {
        self.handle(node)?.post_priority_change(change)
    }

    pub async fn snapshot_node(&self, node: &NodeName) -> Result<NodeSnapshot, NodeError> {
        self.handle(node)?.snapshot().await
    }

    /// Snapshots of every running node.
    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut snapshots = Vec::with_capacity(self.handles.len());
        for handle in self.handles.values() {
            match handle.snapshot().await {
                Ok(s) => snapshots.push(s),
                Err(e) => tracing::debug!(node = %handle.node(), error = %e, "Snapshot skipped"),
            }
        }
        snapshots
    }

    /// Crash a node: it becomes unreachable, its processor stops without
    /// notifying anyone and its electors leave the registry.
    pub fn fail_node(&mut self, node: &NodeName) -> Result<(), NodeError> {
        let handle = self
            .handles
            .remove(node)
            .ok_or_else(|| NodeError::UnknownNode(node.clone()))?;
        self.network.fail(node);
        if let Some(task) = self.tasks.remove(node) {
            task.abort();
        }
        drop(handle);
        self.registry.deregister_node(node);
        Ok(())
    }

    /// Stop every processor and wait for them to finish.
    pub async fn shutdown(mut self) {
        for handle in self.handles.values() {
            handle.shutdown();
        }
        for (node, task) in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::warn!(node = %node, error = %e, "Event processor ended abnormally");
            }
        }
        tracing::info!("Simulation stopped");
    }
}

/// Member channels to the other nodes of `domain`, plus edge channels to
/// linked nodes outside it.
fn base_channels(graph: &NetworkGraph, node: &NodeName, domain: u64) -> Vec<MemberChannel> {
    let key = ClusterKey::base(domain);
    let members: BTreeSet<NodeName> = graph
        .domain_members(domain)
        .into_iter()
        .filter(|m| m != node)
        .collect();

    let mut channels: Vec<MemberChannel> = members
        .iter()
        .map(|m| MemberChannel::member(m.clone(), key))
        .collect();
    for neighbor in graph.neighbors(node) {
        if members.contains(&neighbor) {
            continue;
        }
        for foreign in graph.domains_of(&neighbor) {
            if foreign != domain {
                channels.push(MemberChannel::edge(neighbor.clone(), ClusterKey::base(foreign)));
            }
        }
    }
    channels
}
