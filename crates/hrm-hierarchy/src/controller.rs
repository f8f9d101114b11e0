//! Per-node hierarchy state and the glue between electors and the substrate.
//!
//! A `HierarchyController` owns every cluster a node takes part in. It is
//! driven by exactly one worker (the node's event processor), so it needs no
//! internal locking; the election registry is the only state it shares with
//! other nodes.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use hrm_protocol::{
    BullyPriority, ClusterKey, ElectionMessage, Envelope, HierarchyLevel, NodeName,
    ADDRESS_DISTRIBUTION_SETTLE_MS, DEFAULT_HIERARCHY_HEIGHT,
};

use crate::arena::{ClusterArena, ClusterSlot};
use crate::cluster::{Cluster, MemberChannel};
use crate::coordinator::CoordinatorHandle;
use crate::elector::{ElectionEnv, ElectionTimer, Elector, ElectorAction, ElectorConfig, ElectorState, TimerKind};
use crate::escalation;
use crate::events::{EventRecord, HierarchyEvent};
use crate::registry::{ElectionRegistry, ElectorStatus};
use crate::substrate::{TimerSink, Topology, Transport};
use crate::HierarchyError;

/// Configuration shared by all clusters of a node.
#[derive(Debug, Clone)]
pub struct HierarchyConfig {
    /// Number of hierarchy levels (H).
    pub height: u8,
    pub elector: ElectorConfig,
    /// Delay between the top-level win and address distribution.
    pub address_settle: Duration,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            height: DEFAULT_HIERARCHY_HEIGHT,
            elector: ElectorConfig::default(),
            address_settle: Duration::from_millis(ADDRESS_DISTRIBUTION_SETTLE_MS),
        }
    }
}

/// Who the node is.
#[derive(Clone)]
pub struct NodeIdentity {
    pub name: NodeName,
    pub signing_key: SigningKey,
    /// Hierarchy priority: the administrator's value and the unique id.
    pub priority: BullyPriority,
    /// Physical neighbor count when level-0 clusters elect with the
    /// connectivity priority instead of the hierarchy priority.
    pub neighbors: Option<usize>,
}

impl NodeIdentity {
    /// Identity with a freshly generated signing key.
    pub fn generate(name: NodeName, priority: BullyPriority) -> Self {
        Self {
            name,
            signing_key: hrm_protocol::crypto::generate_keypair(),
            priority,
            neighbors: None,
        }
    }

    /// Elect with the connectivity priority at level 0.
    pub fn with_connectivity(mut self, neighbors: usize) -> Self {
        self.neighbors = Some(neighbors);
        self
    }

    /// Priority for clusters at `level` derived from an administrator value.
    pub fn priority_at(&self, level: HierarchyLevel, value: u64) -> BullyPriority {
        match self.neighbors {
            Some(neighbors) if level.is_base() => {
                BullyPriority::for_connectivity(value, neighbors, self.priority.unique_id())
            }
            _ => self.priority.with_value(value),
        }
    }

    /// Current priority for clusters at `level`.
    pub fn cluster_priority(&self, level: HierarchyLevel) -> BullyPriority {
        match self.priority.value() {
            Some(value) => self.priority_at(level, value),
            None => self.priority,
        }
    }
}

/// The collaborators a controller talks to.
#[derive(Clone)]
pub struct Substrate {
    pub transport: Arc<dyn Transport>,
    pub topology: Arc<dyn Topology>,
    pub timers: Arc<dyn TimerSink>,
}

/// A request to change the local priority, for one level or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityChange {
    pub level: Option<HierarchyLevel>,
    pub value: u64,
}

/// Diagnostic view of one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub cluster: ClusterKey,
    pub state: ElectorState,
    pub is_winner: bool,
    pub coordinator: Option<NodeName>,
    pub token: Option<u64>,
    pub priority: BullyPriority,
    pub members: Vec<NodeName>,
    pub edges: usize,
    pub neighbors: Vec<ClusterKey>,
    pub restarts: u32,
}

pub struct HierarchyController {
    pub(crate) identity: NodeIdentity,
    pub(crate) config: HierarchyConfig,
    pub(crate) arena: ClusterArena,
    pub(crate) registry: Arc<ElectionRegistry>,
    pub(crate) substrate: Substrate,
    events: Option<mpsc::UnboundedSender<EventRecord>>,
}

impl HierarchyController {
    pub fn new(
        identity: NodeIdentity,
        config: HierarchyConfig,
        registry: Arc<ElectionRegistry>,
        substrate: Substrate,
    ) -> Self {
        Self {
            identity,
            config,
            arena: ClusterArena::new(),
            registry,
            substrate,
            events: None,
        }
    }

    /// Forward hierarchy events to an observer.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<EventRecord>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &NodeName {
        &self.identity.name
    }

    pub fn priority(&self) -> BullyPriority {
        self.identity.priority
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    pub fn arena(&self) -> &ClusterArena {
        &self.arena
    }

    pub fn registry(&self) -> &Arc<ElectionRegistry> {
        &self.registry
    }

    pub fn elector(&self, key: ClusterKey) -> Option<&Elector> {
        self.arena.get(key).map(|s| &s.elector)
    }

    pub fn cluster(&self, key: ClusterKey) -> Option<&Cluster> {
        self.arena.get(key).map(|s| &s.cluster)
    }

    /// Coordinators this node currently holds.
    pub fn coordinators(&self) -> Vec<CoordinatorHandle> {
        self.arena
            .iter()
            .filter_map(|s| s.coordinator.as_ref().map(|c| c.handle()))
            .collect()
    }

    // ---- Cluster lifecycle ----

    /// Create a cluster with its elector and register the elector.
    pub fn join_cluster(&mut self, key: ClusterKey, members: Vec<MemberChannel>) -> Result<(), HierarchyError> {
        if key.level.value() >= self.config.height {
            return Err(HierarchyError::MaxHeightExceeded {
                level: key.level.value(),
                height: self.config.height,
            });
        }

        let mut cluster = Cluster::new(key, self.identity.cluster_priority(key.level));
        for member in members {
            if member.peer != self.identity.name {
                cluster.add_member(member);
            }
        }
        let member_count = cluster.member_count();
        let elector = Elector::new(key, self.config.elector.clone());
        self.arena.insert(ClusterSlot::new(cluster, elector))?;
        self.registry.register(&self.identity.name, key);

        tracing::info!(node = %self.identity.name, cluster = %key, members = member_count, "Joined cluster");
        Ok(())
    }

    /// Start the election of a cluster unless the level below is still
    /// electing, in which case the registry releases it later.
    pub fn start_election(&mut self, key: ClusterKey) -> Result<(), HierarchyError> {
        if !self.arena.contains(key) {
            return Err(HierarchyError::ClusterNotFound(key));
        }
        if !self.registry.may_start(&self.identity.name, key) {
            return Ok(());
        }
        let actions = self.with_elector(key, |elector, cluster, env| elector.start_election(cluster, env))?;
        if !actions.is_empty() {
            self.registry.set_status(&self.identity.name, key, ElectorStatus::Electing);
        }
        self.apply(key, actions);
        Ok(())
    }

    /// Start every base-level cluster.
    pub fn start_base_elections(&mut self) -> Result<(), HierarchyError> {
        for key in self.arena.keys_at(HierarchyLevel::BASE) {
            self.start_election(key)?;
        }
        Ok(())
    }

    /// Tear a cluster down: drop its coordinator and deregister its elector.
    pub fn leave_cluster(&mut self, key: ClusterKey) -> Result<(), HierarchyError> {
        let slot = self.arena.remove(key).ok_or(HierarchyError::ClusterNotFound(key))?;
        if slot.coordinator.is_some() {
            self.substrate.topology.deregister_coordinator(key, &self.identity.name);
        }
        self.registry.deregister(&self.identity.name, key);
        tracing::info!(node = %self.identity.name, cluster = %key, "Left cluster");
        Ok(())
    }

    /// Tear down every cluster, top level first.
    pub fn teardown(&mut self) {
        let mut keys = self.arena.keys();
        keys.reverse();
        for key in keys {
            if let Err(e) = self.leave_cluster(key) {
                tracing::warn!(node = %self.identity.name, cluster = %key, error = %e, "Teardown failed");
            }
        }
    }

    // ---- Event Handling ----

    /// Dispatch an inbound message to the elector of its target cluster.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), HierarchyError> {
        let key = envelope.target_cluster;
        if !self.arena.contains(key) && !escalation::join_referenced_superior(self, key)? {
            tracing::debug!(
                node = %self.identity.name,
                cluster = %key,
                from = %envelope.source,
                kind = %envelope.message.kind(),
                "Dropped message for unknown cluster"
            );
            return Ok(());
        }

        tracing::debug!(
            node = %self.identity.name,
            cluster = %key,
            from = %envelope.source,
            kind = %envelope.message.kind(),
            "Dispatching message"
        );
        let actions = self.with_elector(key, |elector, cluster, env| {
            elector.handle_incoming(cluster, envelope, env)
        })?;
        self.apply(key, actions);

        if self.elector(key).map(|e| e.state()) == Some(ElectorState::Idle) {
            self.start_election(key)?;
        }
        Ok(())
    }

    pub fn handle_timer(&mut self, timer: ElectionTimer) -> Result<(), HierarchyError> {
        if !self.arena.contains(timer.cluster) {
            tracing::trace!(cluster = %timer.cluster, "Timer for removed cluster ignored");
            return Ok(());
        }
        if timer.kind == TimerKind::AddressSettle {
            escalation::distribute_addresses(self, timer);
            return Ok(());
        }
        let actions = self.with_elector(timer.cluster, |elector, cluster, env| {
            elector.handle_timer(cluster, timer, env)
        })?;
        self.apply(timer.cluster, actions);
        Ok(())
    }

    pub fn handle_priority_change(&mut self, change: PriorityChange) -> Result<(), HierarchyError> {
        if change.level.is_none() {
            self.identity.priority = self.identity.priority.with_value(change.value);
        }
        let keys: Vec<ClusterKey> = match change.level {
            Some(level) => self.arena.keys_at(level),
            None => self.arena.keys(),
        };
        tracing::info!(
            node = %self.identity.name,
            value = change.value,
            clusters = keys.len(),
            "Local priority changed"
        );
        for key in keys {
            let priority = self.identity.priority_at(key.level, change.value);
            let actions = self.with_elector(key, |elector, cluster, env| {
                elector.local_priority_changed(cluster, priority, env)
            })?;
            self.apply(key, actions);
        }
        Ok(())
    }

    /// Process a cluster-update request for `level`. Returns whether a
    /// superior cluster was found or created.
    pub fn handle_cluster_update(&mut self, level: HierarchyLevel) -> Result<bool, HierarchyError> {
        escalation::on_cluster_update(self, level)
    }

    pub fn snapshot(&self) -> Vec<ClusterSnapshot> {
        self.arena
            .iter()
            .map(|slot| ClusterSnapshot {
                cluster: slot.cluster.key(),
                state: slot.elector.state(),
                is_winner: slot.elector.is_winner(),
                coordinator: slot.elector.coordinator_name(&self.identity.name),
                token: slot.cluster.token(),
                priority: slot.cluster.priority(),
                members: slot.cluster.candidates().map(|m| m.peer.clone()).collect(),
                edges: slot.cluster.edges().count(),
                neighbors: slot.cluster.neighbors().map(|n| n.cluster).collect(),
                restarts: slot.elector.restarts(),
            })
            .collect()
    }

    // ---- Internals ----

    fn with_elector<F>(&mut self, key: ClusterKey, f: F) -> Result<Vec<ElectorAction>, HierarchyError>
    where
        F: FnOnce(&mut Elector, &mut Cluster, &ElectionEnv) -> Vec<ElectorAction>,
    {
        let slot = self
            .arena
            .get_mut(key)
            .ok_or(HierarchyError::ClusterNotFound(key))?;
        let env = ElectionEnv {
            local: &self.identity.name,
            topology: self.substrate.topology.as_ref(),
            now: Instant::now(),
        };
        Ok(f(&mut slot.elector, &mut slot.cluster, &env))
    }

    pub(crate) fn apply(&mut self, key: ClusterKey, actions: Vec<ElectorAction>) {
        for action in actions {
            match action {
                ElectorAction::Send {
                    to,
                    target_cluster,
                    message,
                } => self.send(key, &to, target_cluster, message),
                ElectorAction::Schedule { after, timer } => {
                    self.substrate.timers.schedule(after, timer);
                }
                ElectorAction::Won => escalation::on_election_won(self, key),
                ElectorAction::Lost { coordinator } => {
                    self.registry.settle(&self.identity.name, key, ElectorStatus::Lost);
                    self.emit(HierarchyEvent::ElectionLost {
                        node: self.identity.name.clone(),
                        cluster: key,
                        coordinator,
                    });
                }
                ElectorAction::AnswerWithAnnounce { to, target_cluster } => {
                    let announce = self
                        .arena
                        .get(key)
                        .and_then(|s| s.coordinator.as_ref())
                        .map(|c| c.announce(Vec::new()));
                    match announce {
                        Some(message) => self.send(key, &to, target_cluster, message),
                        None => tracing::warn!(cluster = %key, "No local coordinator to announce"),
                    }
                }
                ElectorAction::CoordinatorInvalidated => escalation::on_coordinator_invalidated(self, key),
                ElectorAction::Restarted { .. } => {
                    self.registry.set_status(&self.identity.name, key, ElectorStatus::Electing);
                }
                ElectorAction::Failed { reason } => {
                    tracing::error!(node = %self.identity.name, cluster = %key, reason = %reason, "Elector failed");
                    self.registry.settle(&self.identity.name, key, ElectorStatus::Failed);
                    self.emit(HierarchyEvent::ElectorFailed {
                        node: self.identity.name.clone(),
                        cluster: key,
                        reason,
                    });
                }
            }
        }
    }

    pub(crate) fn send(&self, source_cluster: ClusterKey, to: &NodeName, target_cluster: ClusterKey, message: ElectionMessage) {
        let kind = message.kind();
        let envelope = Envelope::new(self.identity.name.clone(), source_cluster, target_cluster, message);
        if let Err(e) = self.substrate.transport.send(to, envelope) {
            tracing::warn!(
                node = %self.identity.name,
                peer = %to,
                kind = %kind,
                error = %e,
                "Send failed, message lost"
            );
        }
    }

    pub(crate) fn emit(&self, event: HierarchyEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(EventRecord::now(event));
        }
    }
}
