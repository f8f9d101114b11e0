//! Bully election state machine, one per cluster.
//!
//! The elector never performs I/O. Every entry point takes the cluster it
//! belongs to plus an [`ElectionEnv`] and returns the [`ElectorAction`]s the
//! caller must carry out: messages to send, timers to schedule and outcome
//! notifications for escalation and the registry.
//!
//! States move along `Idle -> Electing -> Elected`, and `Elected -> Electing`
//! when the known coordinator turns out to be stale. Any other transition
//! puts the elector into `Error`, where it stays.
//!
//! Every round carries a number. Timers scheduled in an earlier round are
//! ignored when they fire, which is how an interrupted wait is cancelled.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use hrm_protocol::{
    AnnounceParams, BullyPriority, ClusterKey, DiscoveryEntry, ElectionMessage, Envelope,
    NodeName, RequestCoordinatorParams, ALIVE_INTERVAL_MS, ALIVE_TIMEOUT_MS, ANNOUNCE_TIMEOUT_MS,
    COORDINATOR_POLL_TIMEOUT_MS, MAX_COORDINATOR_POLLS, MAX_ELECTION_RESTARTS, REPLY_TIMEOUT_MS,
};

use crate::cluster::{Cluster, MemberChannel, NeighborCluster};
use crate::substrate::Topology;
use crate::HierarchyError;

/// Periodic coordinator liveness.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(ALIVE_INTERVAL_MS),
            timeout: Duration::from_millis(ALIVE_TIMEOUT_MS),
        }
    }
}

/// Configuration for a single elector.
#[derive(Debug, Clone)]
pub struct ElectorConfig {
    /// Wait for REPLYs after ELECT; also the ELECT re-broadcast suppression window.
    pub reply_timeout: Duration,
    /// Wait for the winner's ANNOUNCE after losing.
    pub announce_timeout: Duration,
    /// Interval between coordinator polls.
    pub coordinator_poll_timeout: Duration,
    /// Polls before re-electing among the laggards.
    pub max_coordinator_polls: u32,
    /// Ceiling on restarts of this elector.
    pub max_restarts: u32,
    /// `None` disables ALIVE beacons and stale-coordinator detection.
    pub liveness: Option<LivenessConfig>,
}

impl Default for ElectorConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(REPLY_TIMEOUT_MS),
            announce_timeout: Duration::from_millis(ANNOUNCE_TIMEOUT_MS),
            coordinator_poll_timeout: Duration::from_millis(COORDINATOR_POLL_TIMEOUT_MS),
            max_coordinator_polls: MAX_COORDINATOR_POLLS,
            max_restarts: MAX_ELECTION_RESTARTS,
            liveness: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectorState {
    Idle,
    Electing,
    Elected,
    Error,
}

impl ElectorState {
    fn can_transition_to(self, next: ElectorState) -> bool {
        use ElectorState::*;
        matches!(
            (self, next),
            (Idle, Electing) | (Electing, Elected) | (Elected, Electing)
        )
    }
}

impl std::fmt::Display for ElectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Electing => "ELECTING",
            Self::Elected => "ELECTED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ReplyWindow,
    AnnounceWait,
    CoordinatorPoll { attempt: u32 },
    AliveTick,
    AliveCheck,
    /// Handled by escalation, never by the elector.
    AddressSettle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTimer {
    pub cluster: ClusterKey,
    pub round: u64,
    pub kind: TimerKind,
}

/// The coordinator a losing elector has adopted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownCoordinator {
    pub name: NodeName,
    pub priority: BullyPriority,
    pub token: u64,
}

/// Side effects requested by the elector.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectorAction {
    Send {
        to: NodeName,
        target_cluster: ClusterKey,
        message: ElectionMessage,
    },
    Schedule {
        after: Duration,
        timer: ElectionTimer,
    },
    /// The local node won: create the coordinator, announce, escalate.
    Won,
    /// The local node lost.
    Lost { coordinator: Option<NodeName> },
    /// Send our coordinator announcement to a single peer.
    AnswerWithAnnounce {
        to: NodeName,
        target_cluster: ClusterKey,
    },
    /// The local coordinator of this cluster is no longer valid.
    CoordinatorInvalidated,
    Restarted { round: u64 },
    Failed { reason: String },
}

/// Ambient inputs for one elector call.
pub struct ElectionEnv<'a> {
    pub local: &'a NodeName,
    pub topology: &'a dyn Topology,
    pub now: Instant,
}

pub struct Elector {
    cluster: ClusterKey,
    config: ElectorConfig,
    state: ElectorState,
    won: bool,
    round: u64,
    restarts: u32,
    last_elect_broadcast: Option<Instant>,
    /// Adopted coordinator; `None` while we are the winner or still waiting.
    coordinator: Option<KnownCoordinator>,
    /// Peer that told us (via ALIVE) it knows a stronger coordinator.
    superior_hint: Option<NodeName>,
    last_alive: Option<Instant>,
    failure: Option<String>,
}

impl Elector {
    pub fn new(cluster: ClusterKey, config: ElectorConfig) -> Self {
        Self {
            cluster,
            config,
            state: ElectorState::Idle,
            won: false,
            round: 0,
            restarts: 0,
            last_elect_broadcast: None,
            coordinator: None,
            superior_hint: None,
            last_alive: None,
            failure: None,
        }
    }

    pub fn cluster(&self) -> ClusterKey {
        self.cluster
    }

    pub fn state(&self) -> ElectorState {
        self.state
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Valid only in `Elected`.
    pub fn is_winner(&self) -> bool {
        self.state == ElectorState::Elected && self.won
    }

    /// Whether a coordinator is known: either we are it or we adopted one.
    pub fn is_coordinator_valid(&self) -> bool {
        self.state == ElectorState::Elected && (self.won || self.coordinator.is_some())
    }

    pub fn coordinator(&self) -> Option<&KnownCoordinator> {
        self.coordinator.as_ref()
    }

    /// Name of the coordinator as seen from this node.
    pub fn coordinator_name(&self, local: &NodeName) -> Option<NodeName> {
        if self.is_winner() {
            Some(local.clone())
        } else if self.state == ElectorState::Elected {
            self.coordinator.as_ref().map(|c| c.name.clone())
        } else {
            None
        }
    }

    // ---------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------

    /// Begin the protocol. Idempotent: running or finished electors ignore it.
    pub fn start_election(&mut self, cluster: &mut Cluster, env: &ElectionEnv) -> Vec<ElectorAction> {
        let mut actions = Vec::new();
        match self.state {
            ElectorState::Idle => {
                if !self.enter(ElectorState::Electing, &mut actions) {
                    return actions;
                }
                self.round += 1;
                tracing::info!(
                    node = %env.local,
                    cluster = %self.cluster,
                    priority = %cluster.priority(),
                    members = cluster.member_count(),
                    "Starting election"
                );
                self.run_round(cluster, env, &mut actions);
            }
            ElectorState::Electing | ElectorState::Elected => {
                tracing::debug!(cluster = %self.cluster, state = %self.state, "Election already running");
            }
            ElectorState::Error => {
                tracing::warn!(cluster = %self.cluster, "Election not started, elector has failed");
            }
        }
        actions
    }

    /// Send ELECT to every candidate whose priority is still unknown,
    /// unless a broadcast already went out within the reply window.
    pub fn broadcast_elect(&mut self, cluster: &Cluster, env: &ElectionEnv) -> Vec<ElectorAction> {
        if let Some(last) = self.last_elect_broadcast {
            if env.now.duration_since(last) < self.config.reply_timeout {
                tracing::debug!(cluster = %self.cluster, "ELECT re-broadcast suppressed");
                return Vec::new();
            }
        }

        let message = ElectionMessage::Elect {
            sender_name: env.local.clone(),
            sender_priority: cluster.priority(),
            level: cluster.level(),
        };
        let sends: Vec<ElectorAction> = cluster
            .candidates()
            .filter(|m| !m.peer_priority.is_defined())
            .map(|m| ElectorAction::Send {
                to: m.peer.clone(),
                target_cluster: m.peer_cluster,
                message: message.clone(),
            })
            .collect();

        if !sends.is_empty() {
            self.last_elect_broadcast = Some(env.now);
            tracing::debug!(cluster = %self.cluster, targets = sends.len(), "Broadcast ELECT");
        }
        sends
    }

    /// Dispatch an inbound message addressed to this cluster.
    pub fn handle_incoming(
        &mut self,
        cluster: &mut Cluster,
        envelope: Envelope,
        env: &ElectionEnv,
    ) -> Vec<ElectorAction> {
        let mut actions = Vec::new();
        if self.state == ElectorState::Error {
            tracing::debug!(cluster = %self.cluster, kind = %envelope.message.kind(), "Dropped message for failed elector");
            return actions;
        }

        let from = envelope.source.clone();
        if let Err(e) = envelope.validate() {
            tracing::warn!(cluster = %self.cluster, peer = %from, error = %e, "Rejected malformed message");
            return actions;
        }
        if envelope.is_from_foreign_cluster() {
            self.on_edge_message(cluster, from, envelope);
            return actions;
        }

        if cluster.member(&from).is_none() {
            tracing::debug!(cluster = %self.cluster, peer = %from, "Learned new member from inbound message");
            cluster.add_member(MemberChannel::member(from.clone(), self.cluster));
        }

        match envelope.message {
            ElectionMessage::Elect {
                sender_priority, ..
            } => self.on_elect(cluster, &from, sender_priority, env, &mut actions),
            ElectionMessage::Reply {
                sender_priority, ..
            } => {
                cluster.record_peer_priority(&from, sender_priority);
                self.maybe_decide_early(cluster, env, &mut actions);
            }
            ElectionMessage::Announce(params) => self.on_announce(cluster, &from, params, env, &mut actions),
            ElectionMessage::Alive { sender_name } => self.on_alive(&from, &sender_name, env),
            ElectionMessage::PriorityUpdate { sender_priority } => {
                self.on_priority_update(cluster, &from, sender_priority, env, &mut actions)
            }
            ElectionMessage::RequestCoordinator(params) => {
                self.on_request_coordinator(cluster, &from, params, env, &mut actions)
            }
        }
        actions
    }

    /// React to a protocol timer. Timers from earlier rounds are ignored.
    pub fn handle_timer(
        &mut self,
        cluster: &mut Cluster,
        timer: ElectionTimer,
        env: &ElectionEnv,
    ) -> Vec<ElectorAction> {
        let mut actions = Vec::new();
        if timer.round != self.round || self.state == ElectorState::Error {
            tracing::trace!(cluster = %self.cluster, round = timer.round, "Stale timer ignored");
            return actions;
        }

        let waiting_for_coordinator =
            self.state == ElectorState::Elected && !self.won && self.coordinator.is_none();

        match timer.kind {
            TimerKind::ReplyWindow => {
                if self.state == ElectorState::Electing {
                    self.decide(cluster, env, &mut actions);
                }
            }
            TimerKind::AnnounceWait => {
                if waiting_for_coordinator {
                    tracing::warn!(cluster = %self.cluster, "No announcement received, polling for coordinator");
                    self.poll_coordinator(cluster, 1, &mut actions);
                }
            }
            TimerKind::CoordinatorPoll { attempt } => {
                if waiting_for_coordinator {
                    if attempt < self.config.max_coordinator_polls {
                        self.poll_coordinator(cluster, attempt + 1, &mut actions);
                    } else {
                        self.reelect_laggards(cluster, env, &mut actions);
                    }
                }
            }
            TimerKind::AliveTick => self.on_alive_tick(cluster, env, &mut actions),
            TimerKind::AliveCheck => self.on_alive_check(cluster, env, &mut actions),
            TimerKind::AddressSettle => {}
        }
        actions
    }

    /// The local priority for this cluster changed.
    pub fn local_priority_changed(
        &mut self,
        cluster: &mut Cluster,
        priority: BullyPriority,
        env: &ElectionEnv,
    ) -> Vec<ElectorAction> {
        let mut actions = Vec::new();
        cluster.set_priority(priority);

        for member in cluster.candidates() {
            actions.push(ElectorAction::Send {
                to: member.peer.clone(),
                target_cluster: member.peer_cluster,
                message: ElectionMessage::PriorityUpdate {
                    sender_priority: priority,
                },
            });
        }

        if self.state != ElectorState::Elected {
            return actions;
        }
        let outranked = self.won
            && cluster
                .highest_candidate_priority()
                .is_some_and(|p| p > priority);
        let outranks_coordinator = !self.won
            && self
                .coordinator
                .as_ref()
                .is_some_and(|c| c.priority < priority);
        if outranked || outranks_coordinator {
            self.restart(cluster, env, "local priority changed", &mut actions);
        }
        actions
    }

    /// Discovery entry describing this cluster's coordinator, if known.
    pub fn discovery_entry(&self, cluster: &Cluster, local: &NodeName) -> Option<DiscoveryEntry> {
        if self.is_winner() {
            return Some(DiscoveryEntry {
                token: cluster.token().unwrap_or_default(),
                coordinator_name: local.clone(),
                cluster: cluster.key(),
                priority: cluster.priority(),
            });
        }
        if self.state != ElectorState::Elected {
            return None;
        }
        self.coordinator.as_ref().map(|c| DiscoveryEntry {
            token: c.token,
            coordinator_name: c.name.clone(),
            cluster: cluster.key(),
            priority: c.priority,
        })
    }

    // ---------------------------------------------------------------
    // Rounds
    // ---------------------------------------------------------------

    fn run_round(&mut self, cluster: &mut Cluster, env: &ElectionEnv, actions: &mut Vec<ElectorAction>) {
        if !cluster.has_candidates() {
            self.decide(cluster, env, actions);
            return;
        }

        actions.extend(self.broadcast_elect(cluster, env));

        if cluster.all_candidates_answered() {
            self.decide(cluster, env, actions);
        } else {
            actions.push(self.schedule(self.config.reply_timeout, TimerKind::ReplyWindow));
        }
    }

    fn maybe_decide_early(&mut self, cluster: &mut Cluster, env: &ElectionEnv, actions: &mut Vec<ElectorAction>) {
        if self.state == ElectorState::Electing && cluster.all_candidates_answered() {
            self.decide(cluster, env, actions);
        }
    }

    /// Compare the local priority with the highest answer on the full
    /// (value, unique id) vector. No answers at all means we win.
    fn decide(&mut self, cluster: &mut Cluster, env: &ElectionEnv, actions: &mut Vec<ElectorAction>) {
        let local = cluster.priority();
        let highest = cluster.highest_candidate_priority();
        let wins = self.superior_hint.is_none() && highest.map_or(true, |h| local >= h);

        if !self.enter(ElectorState::Elected, actions) {
            return;
        }

        if wins {
            self.won = true;
            self.coordinator = None;
            cluster.clear_coordinator_knowledge();
            tracing::info!(node = %env.local, cluster = %self.cluster, priority = %local, "Election won");
            actions.push(ElectorAction::Won);
            if let Some(liveness) = &self.config.liveness {
                actions.push(self.schedule(liveness.interval, TimerKind::AliveTick));
            }
        } else {
            self.won = false;
            tracing::info!(
                node = %env.local,
                cluster = %self.cluster,
                priority = %local,
                highest = %highest.unwrap_or(BullyPriority::UNDEFINED),
                "Election lost"
            );
            actions.push(ElectorAction::Lost {
                coordinator: self.coordinator.as_ref().map(|c| c.name.clone()),
            });
            if self.coordinator.is_none() {
                actions.push(self.schedule(self.config.announce_timeout, TimerKind::AnnounceWait));
            }
        }
    }

    /// Return to `Electing` because the known coordinator is stale.
    fn restart(&mut self, cluster: &mut Cluster, env: &ElectionEnv, reason: &str, actions: &mut Vec<ElectorAction>) {
        if self.restarts >= self.config.max_restarts {
            tracing::warn!(cluster = %self.cluster, restarts = self.restarts, reason, "Restart ceiling reached, election not restarted");
            return;
        }
        if !self.enter(ElectorState::Electing, actions) {
            return;
        }
        self.restarts += 1;
        self.round += 1;

        let was_winner = self.won;
        self.won = false;
        self.coordinator = None;
        self.superior_hint = None;
        self.last_alive = None;
        cluster.clear_coordinator_knowledge();

        tracing::info!(node = %env.local, cluster = %self.cluster, round = self.round, reason, "Restarting election");
        if was_winner {
            actions.push(ElectorAction::CoordinatorInvalidated);
        }
        actions.push(ElectorAction::Restarted { round: self.round });
        self.run_round(cluster, env, actions);
    }

    // ---------------------------------------------------------------
    // Message handlers
    // ---------------------------------------------------------------

    fn on_elect(
        &mut self,
        cluster: &mut Cluster,
        from: &NodeName,
        sender: BullyPriority,
        env: &ElectionEnv,
        actions: &mut Vec<ElectorAction>,
    ) {
        cluster.record_peer_priority(from, sender);
        let Some(target_cluster) = cluster.member(from).map(|m| m.peer_cluster) else {
            return;
        };

        let known = self.known_coordinator_priority(cluster);
        if let Some(known) = known {
            if known >= sender {
                if self.won {
                    actions.push(ElectorAction::AnswerWithAnnounce {
                        to: from.clone(),
                        target_cluster,
                    });
                } else {
                    actions.push(ElectorAction::Send {
                        to: from.clone(),
                        target_cluster,
                        message: ElectionMessage::Alive {
                            sender_name: env.local.clone(),
                        },
                    });
                }
                return;
            }
        }

        actions.push(ElectorAction::Send {
            to: from.clone(),
            target_cluster,
            message: ElectionMessage::Reply {
                sender_name: env.local.clone(),
                sender_priority: cluster.priority(),
            },
        });

        if known.is_some() {
            // A candidate stronger than the known coordinator appeared.
            self.restart(cluster, env, "stronger candidate appeared", actions);
        } else {
            self.maybe_decide_early(cluster, env, actions);
        }
    }

    fn on_announce(
        &mut self,
        cluster: &mut Cluster,
        from: &NodeName,
        params: AnnounceParams,
        env: &ElectionEnv,
        actions: &mut Vec<ElectorAction>,
    ) {
        if let Err(e) = params.credential.verify() {
            tracing::warn!(cluster = %self.cluster, peer = %from, error = %e, "Rejected announcement with invalid credential");
            return;
        }
        if params.credential.cluster != self.cluster || params.credential.coordinator != params.sender_name {
            tracing::warn!(cluster = %self.cluster, peer = %from, "Rejected announcement for another cluster");
            return;
        }

        let announcer = params.sender_name.clone();
        cluster.record_peer_priority(&announcer, params.sender_priority);

        if params.sender_priority < cluster.priority() {
            if self.is_winner() {
                if let Some(target_cluster) = cluster.member(from).map(|m| m.peer_cluster) {
                    actions.push(ElectorAction::AnswerWithAnnounce {
                        to: from.clone(),
                        target_cluster,
                    });
                }
            } else {
                tracing::debug!(cluster = %self.cluster, announcer = %announcer, "Ignored announcement from weaker coordinator");
            }
            return;
        }

        let newly_known = self.coordinator.as_ref().map(|c| &c.name) != Some(&announcer);
        let demoted = self.is_winner();
        let undecided = matches!(self.state, ElectorState::Idle | ElectorState::Electing);

        match self.state {
            ElectorState::Idle => {
                if !self.enter(ElectorState::Electing, actions) {
                    return;
                }
                self.round += 1;
                if !self.enter(ElectorState::Elected, actions) {
                    return;
                }
            }
            ElectorState::Electing => {
                if !self.enter(ElectorState::Elected, actions) {
                    return;
                }
            }
            ElectorState::Elected | ElectorState::Error => {}
        }

        self.won = false;
        self.superior_hint = None;
        self.last_alive = Some(env.now);
        self.coordinator = Some(KnownCoordinator {
            name: announcer.clone(),
            priority: params.sender_priority,
            token: params.token,
        });
        cluster.adopt_token(params.token);
        cluster.set_knows_coordinator(&announcer, true);
        for peer in &params.covered_peer_names {
            cluster.set_knows_coordinator(peer, true);
        }

        if demoted {
            tracing::info!(node = %env.local, cluster = %self.cluster, coordinator = %announcer, "Demoted by stronger coordinator");
            actions.push(ElectorAction::CoordinatorInvalidated);
        }
        if demoted || undecided {
            actions.push(ElectorAction::Lost {
                coordinator: Some(announcer.clone()),
            });
        }

        if newly_known {
            tracing::info!(node = %env.local, cluster = %self.cluster, coordinator = %announcer, token = params.token, "Coordinator adopted");
            for edge in cluster.edges() {
                actions.push(ElectorAction::Send {
                    to: edge.peer.clone(),
                    target_cluster: edge.peer_cluster,
                    message: ElectionMessage::Announce(params.clone()),
                });
            }
            if let Some(liveness) = &self.config.liveness {
                actions.push(self.schedule(liveness.timeout, TimerKind::AliveCheck));
            }
        }
    }

    fn on_alive(&mut self, from: &NodeName, sender_name: &NodeName, env: &ElectionEnv) {
        match self.state {
            ElectorState::Elected
                if self.coordinator.as_ref().map(|c| &c.name) == Some(sender_name) =>
            {
                self.last_alive = Some(env.now);
            }
            ElectorState::Electing => {
                tracing::debug!(cluster = %self.cluster, peer = %from, "Peer knows a stronger coordinator");
                self.superior_hint = Some(from.clone());
            }
            _ => {
                tracing::trace!(cluster = %self.cluster, peer = %from, "Unsolicited ALIVE");
            }
        }
    }

    fn on_priority_update(
        &mut self,
        cluster: &mut Cluster,
        from: &NodeName,
        priority: BullyPriority,
        env: &ElectionEnv,
        actions: &mut Vec<ElectorAction>,
    ) {
        cluster.record_peer_priority(from, priority);
        match self.state {
            ElectorState::Electing => self.maybe_decide_early(cluster, env, actions),
            ElectorState::Elected if self.won => {
                if priority > cluster.priority() {
                    self.restart(cluster, env, "member outranks coordinator", actions);
                }
            }
            ElectorState::Elected => {
                let local = cluster.priority();
                let mut stale = false;
                if let Some(coordinator) = self.coordinator.as_mut() {
                    if &coordinator.name == from {
                        coordinator.priority = priority;
                        stale = priority < local;
                    }
                }
                if stale {
                    self.restart(cluster, env, "coordinator priority dropped", actions);
                }
            }
            _ => {}
        }
    }

    fn on_request_coordinator(
        &mut self,
        cluster: &mut Cluster,
        from: &NodeName,
        params: RequestCoordinatorParams,
        env: &ElectionEnv,
        actions: &mut Vec<ElectorAction>,
    ) {
        if !params.is_answer {
            cluster.set_knows_coordinator(from, false);
            let entry = self.discovery_entry(cluster, env.local);
            if let Some(target_cluster) = cluster.member(from).map(|m| m.peer_cluster) {
                actions.push(ElectorAction::Send {
                    to: from.clone(),
                    target_cluster,
                    message: ElectionMessage::RequestCoordinator(RequestCoordinatorParams::answer(entry)),
                });
            }
            return;
        }

        cluster.set_knows_coordinator(from, params.coordinator_known);
        for entry in params.discovery_entries {
            if entry.cluster != self.cluster {
                cluster.record_neighbor(NeighborCluster {
                    cluster: entry.cluster,
                    coordinator: entry.coordinator_name,
                    token: entry.token,
                    priority: entry.priority,
                    via: from.clone(),
                });
                continue;
            }
            let waiting = self.state == ElectorState::Elected && !self.won && self.coordinator.is_none();
            if waiting && entry.priority >= cluster.priority() {
                tracing::info!(
                    node = %env.local,
                    cluster = %self.cluster,
                    coordinator = %entry.coordinator_name,
                    via = %from,
                    "Coordinator discovered by polling"
                );
                cluster.adopt_token(entry.token);
                cluster.set_knows_coordinator(&entry.coordinator_name, true);
                self.last_alive = Some(env.now);
                self.coordinator = Some(KnownCoordinator {
                    name: entry.coordinator_name,
                    priority: entry.priority,
                    token: entry.token,
                });
                if let Some(liveness) = &self.config.liveness {
                    actions.push(self.schedule(liveness.timeout, TimerKind::AliveCheck));
                }
            }
        }
    }

    fn on_edge_message(&mut self, cluster: &mut Cluster, from: NodeName, envelope: Envelope) {
        match envelope.message {
            ElectionMessage::Announce(params) => {
                if let Err(e) = params.credential.verify() {
                    tracing::warn!(cluster = %self.cluster, peer = %from, error = %e, "Rejected foreign announcement");
                    return;
                }
                tracing::debug!(
                    cluster = %self.cluster,
                    neighbor = %envelope.source_cluster,
                    coordinator = %params.sender_name,
                    "Recorded neighbor cluster"
                );
                cluster.record_neighbor(NeighborCluster {
                    cluster: params.credential.cluster,
                    coordinator: params.sender_name,
                    token: params.token,
                    priority: params.sender_priority,
                    via: from,
                });
            }
            other => {
                tracing::debug!(cluster = %self.cluster, peer = %from, kind = %other.kind(), "Ignored edge message");
            }
        }
    }

    // ---------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------

    fn poll_coordinator(&mut self, cluster: &Cluster, attempt: u32, actions: &mut Vec<ElectorAction>) {
        for member in cluster.candidates() {
            actions.push(ElectorAction::Send {
                to: member.peer.clone(),
                target_cluster: member.peer_cluster,
                message: ElectionMessage::RequestCoordinator(RequestCoordinatorParams::request()),
            });
        }
        actions.push(self.schedule(
            self.config.coordinator_poll_timeout,
            TimerKind::CoordinatorPoll { attempt },
        ));
    }

    /// Candidates that still do not know the coordinator and are not
    /// reachable through one that does.
    pub fn laggards(&self, cluster: &Cluster, env: &ElectionEnv) -> Vec<NodeName> {
        let informed = cluster.informed_candidates();
        cluster
            .candidates()
            .filter(|m| !m.knows_coordinator)
            .filter(|m| !env.topology.path_covered(env.local, &m.peer, &informed))
            .map(|m| m.peer.clone())
            .collect()
    }

    fn reelect_laggards(&mut self, cluster: &mut Cluster, env: &ElectionEnv, actions: &mut Vec<ElectorAction>) {
        let laggards = self.laggards(cluster, env);
        tracing::warn!(
            node = %env.local,
            cluster = %self.cluster,
            laggards = laggards.len(),
            "Coordinator still unknown, re-electing among laggards"
        );
        cluster.reset_peer_priorities(&laggards);
        self.restart(cluster, env, "coordinator unknown after polling", actions);
    }

    fn on_alive_tick(&mut self, cluster: &Cluster, env: &ElectionEnv, actions: &mut Vec<ElectorAction>) {
        let Some(interval) = self.config.liveness.as_ref().map(|l| l.interval) else {
            return;
        };
        if !self.is_winner() {
            return;
        }
        for member in cluster.candidates() {
            actions.push(ElectorAction::Send {
                to: member.peer.clone(),
                target_cluster: member.peer_cluster,
                message: ElectionMessage::Alive {
                    sender_name: env.local.clone(),
                },
            });
        }
        actions.push(self.schedule(interval, TimerKind::AliveTick));
    }

    fn on_alive_check(&mut self, cluster: &mut Cluster, env: &ElectionEnv, actions: &mut Vec<ElectorAction>) {
        let Some(timeout) = self.config.liveness.as_ref().map(|l| l.timeout) else {
            return;
        };
        if self.state != ElectorState::Elected || self.won || self.coordinator.is_none() {
            return;
        }
        let silent_for = self
            .last_alive
            .map(|t| env.now.duration_since(t))
            .unwrap_or(timeout);
        if silent_for >= timeout {
            tracing::warn!(cluster = %self.cluster, silent_ms = silent_for.as_millis() as u64, "Coordinator silent, presumed stale");
            // The silent coordinator must be asked again.
            if let Some(name) = self.coordinator.as_ref().map(|c| c.name.clone()) {
                cluster.reset_peer_priorities(&[name]);
            }
            self.restart(cluster, env, "coordinator silent", actions);
        } else {
            actions.push(self.schedule(timeout - silent_for, TimerKind::AliveCheck));
        }
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn known_coordinator_priority(&self, cluster: &Cluster) -> Option<BullyPriority> {
        if self.state != ElectorState::Elected {
            return None;
        }
        if self.won {
            Some(cluster.priority())
        } else {
            self.coordinator.as_ref().map(|c| c.priority)
        }
    }

    fn schedule(&self, after: Duration, kind: TimerKind) -> ElectorAction {
        ElectorAction::Schedule {
            after,
            timer: ElectionTimer {
                cluster: self.cluster,
                round: self.round,
                kind,
            },
        }
    }

    fn transition(&mut self, next: ElectorState) -> Result<(), HierarchyError> {
        if !self.state.can_transition_to(next) {
            let err = HierarchyError::IllegalTransition {
                cluster: self.cluster,
                from: self.state,
                to: next,
            };
            tracing::error!(cluster = %self.cluster, from = %self.state, to = %next, "Illegal elector transition");
            self.state = ElectorState::Error;
            self.won = false;
            self.failure = Some(err.to_string());
            return Err(err);
        }
        self.state = next;
        Ok(())
    }

    /// Transition, turning a failure into a `Failed` action.
    fn enter(&mut self, next: ElectorState, actions: &mut Vec<ElectorAction>) -> bool {
        match self.transition(next) {
            Ok(()) => true,
            Err(e) => {
                actions.push(ElectorAction::Failed { reason: e.to_string() });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::substrate::SuperiorScope;

    struct NoTopology;

    impl Topology for NoTopology {
        fn superior_scope(&self, _inferior: ClusterKey) -> Option<SuperiorScope> {
            None
        }
        fn path_covered(&self, _from: &NodeName, _to: &NodeName, _covered: &BTreeSet<NodeName>) -> bool {
            false
        }
        fn register_coordinator(&self, _cluster: ClusterKey, _coordinator: &NodeName) {}
        fn deregister_coordinator(&self, _cluster: ClusterKey, _coordinator: &NodeName) {}
    }

    fn setup(peers: &[&str]) -> (Elector, Cluster) {
        let key = ClusterKey::base(1);
        let mut cluster = Cluster::new(key, BullyPriority::new(10, 5));
        for p in peers {
            cluster.add_member(MemberChannel::member((*p).into(), key));
        }
        (Elector::new(key, ElectorConfig::default()), cluster)
    }

    fn sends(actions: &[ElectorAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, ElectorAction::Send { .. }))
            .count()
    }

    #[test]
    fn test_lattice() {
        use ElectorState::*;
        assert!(Idle.can_transition_to(Electing));
        assert!(Electing.can_transition_to(Elected));
        assert!(Elected.can_transition_to(Electing));
        assert!(!Idle.can_transition_to(Elected));
        assert!(!Electing.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Electing));
    }

    #[test]
    fn test_illegal_transition_enters_error() {
        let (mut elector, _) = setup(&[]);
        let err = elector.transition(ElectorState::Elected).unwrap_err();
        assert!(matches!(err, HierarchyError::IllegalTransition { .. }));
        assert_eq!(elector.state(), ElectorState::Error);
        assert!(elector.failure().is_some());
        assert!(!elector.is_winner());
    }

    #[test]
    fn test_lonely_cluster_wins_without_messages() {
        let (mut elector, mut cluster) = setup(&[]);
        let local = NodeName::from("a");
        let env = ElectionEnv { local: &local, topology: &NoTopology, now: Instant::now() };
        let actions = elector.start_election(&mut cluster, &env);
        assert_eq!(sends(&actions), 0);
        assert!(actions.contains(&ElectorAction::Won));
        assert!(elector.is_winner());
        assert!(elector.is_coordinator_valid());
    }

    #[test]
    fn test_start_on_elected_is_noop() {
        let (mut elector, mut cluster) = setup(&[]);
        let local = NodeName::from("a");
        let env = ElectionEnv { local: &local, topology: &NoTopology, now: Instant::now() };
        elector.start_election(&mut cluster, &env);
        let round = elector.round();
        assert!(elector.start_election(&mut cluster, &env).is_empty());
        assert_eq!(elector.round(), round);
        assert_eq!(elector.state(), ElectorState::Elected);
    }

    #[test]
    fn test_broadcast_suppressed_within_reply_window() {
        let (mut elector, cluster) = setup(&["b", "c"]);
        let local = NodeName::from("a");
        let now = Instant::now();
        let env = ElectionEnv { local: &local, topology: &NoTopology, now };
        assert_eq!(sends(&elector.broadcast_elect(&cluster, &env)), 2);
        let later = ElectionEnv {
            local: &local,
            topology: &NoTopology,
            now: now + Duration::from_millis(REPLY_TIMEOUT_MS / 2),
        };
        assert!(elector.broadcast_elect(&cluster, &later).is_empty());
        let after_window = ElectionEnv {
            local: &local,
            topology: &NoTopology,
            now: now + Duration::from_millis(REPLY_TIMEOUT_MS),
        };
        assert_eq!(sends(&elector.broadcast_elect(&cluster, &after_window)), 2);
    }

    #[test]
    fn test_stale_round_timer_ignored() {
        let (mut elector, mut cluster) = setup(&["b"]);
        let local = NodeName::from("a");
        let env = ElectionEnv { local: &local, topology: &NoTopology, now: Instant::now() };
        elector.start_election(&mut cluster, &env);
        let stale = ElectionTimer {
            cluster: cluster.key(),
            round: elector.round() + 7,
            kind: TimerKind::ReplyWindow,
        };
        assert!(elector.handle_timer(&mut cluster, stale, &env).is_empty());
        assert_eq!(elector.state(), ElectorState::Electing);
    }

    #[test]
    fn test_alive_hint_makes_us_defer() {
        let (mut elector, mut cluster) = setup(&["b"]);
        let local = NodeName::from("a");
        let env = ElectionEnv { local: &local, topology: &NoTopology, now: Instant::now() };
        elector.start_election(&mut cluster, &env);
        let alive = Envelope::new(
            "b".into(),
            cluster.key(),
            cluster.key(),
            ElectionMessage::Alive { sender_name: "b".into() },
        );
        elector.handle_incoming(&mut cluster, alive, &env);
        let timer = ElectionTimer { cluster: cluster.key(), round: elector.round(), kind: TimerKind::ReplyWindow };
        let actions = elector.handle_timer(&mut cluster, timer, &env);
        assert!(matches!(actions[0], ElectorAction::Lost { coordinator: None }));
        assert!(!elector.is_winner());
    }

    /// Elector "a" following coordinator "b" with liveness enabled.
    fn following_b(now: Instant) -> (Elector, Cluster) {
        let key = ClusterKey::base(1);
        let mut cluster = Cluster::new(key, BullyPriority::new(10, 5));
        cluster.add_member(MemberChannel::member("b".into(), key));
        let config = ElectorConfig {
            liveness: Some(LivenessConfig::default()),
            ..ElectorConfig::default()
        };
        let mut elector = Elector::new(key, config);

        let priority = BullyPriority::new(20, 6);
        let credential = hrm_protocol::CoordinatorCredential::issue(
            &hrm_protocol::crypto::generate_keypair(),
            "b".into(),
            key,
            42,
            priority,
        )
        .unwrap();
        let announce = Envelope::new(
            "b".into(),
            key,
            key,
            ElectionMessage::Announce(AnnounceParams {
                sender_name: "b".into(),
                sender_priority: priority,
                credential,
                token: 42,
                covered_peer_names: Vec::new(),
            }),
        );
        let local = NodeName::from("a");
        let env = ElectionEnv { local: &local, topology: &NoTopology, now };
        let actions = elector.handle_incoming(&mut cluster, announce, &env);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ElectorAction::Schedule { timer, .. } if timer.kind == TimerKind::AliveCheck)));
        (elector, cluster)
    }

    #[test]
    fn test_alive_check_within_timeout_reschedules() {
        let now = Instant::now();
        let (mut elector, mut cluster) = following_b(now);
        let local = NodeName::from("a");
        let check = ElectionTimer { cluster: cluster.key(), round: elector.round(), kind: TimerKind::AliveCheck };
        let env = ElectionEnv { local: &local, topology: &NoTopology, now: now + Duration::from_secs(1) };

        let actions = elector.handle_timer(&mut cluster, check, &env);
        assert_eq!(
            actions,
            vec![ElectorAction::Schedule {
                after: Duration::from_millis(ALIVE_TIMEOUT_MS) - Duration::from_secs(1),
                timer: check,
            }]
        );
        assert_eq!(elector.state(), ElectorState::Elected);
        assert_eq!(elector.restarts(), 0);
        assert_eq!(elector.coordinator().unwrap().name, NodeName::from("b"));
    }

    #[test]
    fn test_silent_coordinator_restarts_election() {
        let now = Instant::now();
        let (mut elector, mut cluster) = following_b(now);
        let local = NodeName::from("a");
        let check = ElectionTimer { cluster: cluster.key(), round: elector.round(), kind: TimerKind::AliveCheck };
        let env = ElectionEnv {
            local: &local,
            topology: &NoTopology,
            now: now + Duration::from_millis(ALIVE_TIMEOUT_MS),
        };

        let actions = elector.handle_timer(&mut cluster, check, &env);
        assert_eq!(elector.state(), ElectorState::Electing);
        assert_eq!(elector.restarts(), 1);
        // The silent coordinator is asked again.
        assert_eq!(sends(&actions), 1);
    }
}
