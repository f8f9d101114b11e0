//! Tests for election and hierarchy formation across several nodes.
//!
//! The nodes are driven synchronously: messages are queued on an in-memory
//! wire, timers are recorded and fired explicitly, and cluster-update
//! requests from the registry are drained after every step.
//!
//! Verifies:
//! - Exactly one winner per cluster, ties broken by unique id
//! - Immediate win for clusters without members and with no replies
//! - Edge peers are excluded from candidates but learn the outcome
//! - Escalation is monotonic and stops below the configured height
//! - Address distribution runs exactly once at the top level
//! - Laggard recovery through coordinator polling
//! - Re-election after priority changes
//! - A deposed coordinator abandons its superior clusters
//! - Connectivity-derived level-0 priorities survive priority changes

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use hrm_hierarchy::*;
use hrm_protocol::*;

// ═══════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct Wire {
    queue: Mutex<VecDeque<(NodeName, Envelope)>>,
    log: Mutex<Vec<(NodeName, Envelope)>>,
    /// (destination, kind, remaining drops)
    drops: Mutex<Vec<(NodeName, MessageKind, u32)>>,
}

impl Wire {
    fn drop_next(&self, to: &str, kind: MessageKind, count: u32) {
        self.drops.lock().push((NodeName::from(to), kind, count));
    }

    fn sent(&self, kind: MessageKind) -> Vec<(NodeName, Envelope)> {
        self.log
            .lock()
            .iter()
            .filter(|(_, e)| e.message.kind() == kind)
            .cloned()
            .collect()
    }
}

impl Transport for Wire {
    fn send(&self, to: &NodeName, envelope: Envelope) -> Result<(), HierarchyError> {
        self.log.lock().push((to.clone(), envelope.clone()));
        let mut drops = self.drops.lock();
        if let Some(rule) = drops
            .iter_mut()
            .find(|(n, k, left)| n == to && *k == envelope.message.kind() && *left > 0)
        {
            rule.2 -= 1;
            return Ok(());
        }
        self.queue.lock().push_back((to.clone(), envelope));
        Ok(())
    }
}

#[derive(Default)]
struct Timers(Mutex<Vec<ElectionTimer>>);

impl TimerSink for Timers {
    fn schedule(&self, _after: Duration, timer: ElectionTimer) {
        self.0.lock().push(timer);
    }
}

#[derive(Default)]
struct Updates(Mutex<Vec<HierarchyLevel>>);

impl ClusterUpdateSink for Updates {
    fn update_cluster(&self, level: HierarchyLevel) {
        self.0.lock().push(level);
    }
}

/// Nodes grouped in domains; superior clusters gather every coordinator of
/// the level below, with the smallest cluster id.
struct StaticTopology {
    height: u8,
    directory: Mutex<BTreeMap<ClusterKey, NodeName>>,
}

impl Topology for StaticTopology {
    fn superior_scope(&self, inferior: ClusterKey) -> Option<SuperiorScope> {
        let level = inferior.level.superior(self.height)?;
        let directory = self.directory.lock();
        let members: Vec<ScopeMember> = directory
            .iter()
            .filter(|(k, _)| k.level == inferior.level)
            .map(|(k, n)| ScopeMember {
                coordinator: n.clone(),
                inferior: *k,
            })
            .collect();
        let id = members.iter().map(|m| m.inferior.id).min()?;
        Some(SuperiorScope {
            cluster: ClusterKey::new(level, id),
            members,
        })
    }

    fn path_covered(&self, _from: &NodeName, _to: &NodeName, _covered: &BTreeSet<NodeName>) -> bool {
        false
    }

    fn register_coordinator(&self, cluster: ClusterKey, coordinator: &NodeName) {
        self.directory.lock().insert(cluster, coordinator.clone());
    }

    fn deregister_coordinator(&self, cluster: ClusterKey, coordinator: &NodeName) {
        let mut directory = self.directory.lock();
        if directory.get(&cluster) == Some(coordinator) {
            directory.remove(&cluster);
        }
    }
}

struct Harness {
    height: u8,
    nodes: BTreeMap<NodeName, HierarchyController>,
    timers: BTreeMap<NodeName, Arc<Timers>>,
    updates: BTreeMap<NodeName, Arc<Updates>>,
    wire: Arc<Wire>,
    topology: Arc<StaticTopology>,
    registry: Arc<ElectionRegistry>,
    events_tx: mpsc::UnboundedSender<EventRecord>,
    events_rx: mpsc::UnboundedReceiver<EventRecord>,
    seen: Vec<HierarchyEvent>,
}

impl Harness {
    fn new(height: u8) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            height,
            nodes: BTreeMap::new(),
            timers: BTreeMap::new(),
            updates: BTreeMap::new(),
            wire: Arc::new(Wire::default()),
            topology: Arc::new(StaticTopology {
                height,
                directory: Mutex::new(BTreeMap::new()),
            }),
            registry: Arc::new(ElectionRegistry::new(height)),
            events_tx,
            events_rx,
            seen: Vec::new(),
        }
    }

    fn add_node(&mut self, name: &str, value: u64, unique_id: u64) {
        self.add_identity(NodeIdentity::generate(name.into(), BullyPriority::new(value, unique_id)));
    }

    fn add_identity(&mut self, identity: NodeIdentity) {
        let name = identity.name.clone();
        let timers = Arc::new(Timers::default());
        let updates = Arc::new(Updates::default());
        let substrate = Substrate {
            transport: self.wire.clone(),
            topology: self.topology.clone(),
            timers: timers.clone(),
        };
        let config = HierarchyConfig {
            height: self.height,
            ..Default::default()
        };
        let ctl = HierarchyController::new(identity, config, self.registry.clone(), substrate)
            .with_events(self.events_tx.clone());
        self.registry.attach(name.clone(), updates.clone());
        self.timers.insert(name.clone(), timers);
        self.updates.insert(name.clone(), updates);
        self.nodes.insert(name, ctl);
    }

    /// Put nodes into one base cluster, plus edge channels to foreign nodes.
    fn domain(&mut self, id: u64, members: &[&str], edges: &[(&str, &str, u64)]) {
        let key = ClusterKey::base(id);
        for m in members {
            let mut channels: Vec<MemberChannel> = members
                .iter()
                .filter(|p| *p != m)
                .map(|p| MemberChannel::member(NodeName::from(*p), key))
                .collect();
            for (local, foreign, foreign_domain) in edges {
                if local == m {
                    channels.push(MemberChannel::edge(
                        NodeName::from(*foreign),
                        ClusterKey::base(*foreign_domain),
                    ));
                }
            }
            self.node_mut(m).join_cluster(key, channels).unwrap();
        }
    }

    fn node(&self, name: &str) -> &HierarchyController {
        &self.nodes[&NodeName::from(name)]
    }

    fn node_mut(&mut self, name: &str) -> &mut HierarchyController {
        self.nodes.get_mut(&NodeName::from(name)).unwrap()
    }

    fn start(&mut self) {
        let names: Vec<NodeName> = self.nodes.keys().cloned().collect();
        for name in names {
            self.nodes.get_mut(&name).unwrap().start_base_elections().unwrap();
        }
        self.pump();
    }

    /// Deliver messages and cluster updates until nothing is left.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            loop {
                let next = self.wire.queue.lock().pop_front();
                let Some((to, envelope)) = next else { break };
                if let Some(ctl) = self.nodes.get_mut(&to) {
                    ctl.handle_envelope(envelope).unwrap();
                }
                progressed = true;
            }
            let names: Vec<NodeName> = self.nodes.keys().cloned().collect();
            for name in names {
                let levels: Vec<HierarchyLevel> = std::mem::take(&mut *self.updates[&name].0.lock());
                for level in levels {
                    self.nodes.get_mut(&name).unwrap().handle_cluster_update(level).unwrap();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        while let Ok(record) = self.events_rx.try_recv() {
            self.seen.push(record.event);
        }
    }

    /// Fire every pending timer of the given kind, then pump.
    fn fire(&mut self, matches: impl Fn(&TimerKind) -> bool) -> usize {
        let mut fired = 0;
        let names: Vec<NodeName> = self.nodes.keys().cloned().collect();
        for name in names {
            let due: Vec<ElectionTimer> = {
                let mut pending = self.timers[&name].0.lock();
                let (due, keep): (Vec<_>, Vec<_>) = pending.drain(..).partition(|t| matches(&t.kind));
                *pending = keep;
                due
            };
            for timer in due {
                self.nodes.get_mut(&name).unwrap().handle_timer(timer).unwrap();
                fired += 1;
            }
        }
        self.pump();
        fired
    }

    fn winners(&self, key: ClusterKey) -> Vec<NodeName> {
        self.nodes
            .values()
            .filter(|n| n.elector(key).map(|e| e.is_winner()).unwrap_or(false))
            .map(|n| n.name().clone())
            .collect()
    }

    fn distributions(&self) -> usize {
        self.seen
            .iter()
            .filter(|e| matches!(e, HierarchyEvent::AddressesDistributed { .. }))
            .count()
    }
}

fn level(v: u8) -> HierarchyLevel {
    HierarchyLevel::new(v, DEFAULT_HIERARCHY_HEIGHT).unwrap()
}

fn three_nodes() -> Harness {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    h.add_node("a", 10, 1);
    h.add_node("b", 10, 2);
    h.add_node("c", 7, 3);
    h.domain(1, &["a", "b", "c"], &[]);
    h
}

// ═══════════════════════════════════════════════════════════════
// Base-level elections
// ═══════════════════════════════════════════════════════════════

#[test]
fn equal_values_resolved_by_unique_id() {
    let mut h = three_nodes();
    h.start();

    assert_eq!(h.winners(ClusterKey::base(1)), vec![NodeName::from("b")]);
    for name in ["a", "c"] {
        let elector = h.node(name).elector(ClusterKey::base(1)).unwrap();
        assert_eq!(elector.state(), ElectorState::Elected);
        assert!(!elector.is_winner());
        assert!(elector.is_coordinator_valid());
        assert_eq!(elector.coordinator().unwrap().name, NodeName::from("b"));
    }
}

#[test]
fn losers_adopt_the_winner_token() {
    let mut h = three_nodes();
    h.start();
    let token = h.node("b").cluster(ClusterKey::base(1)).unwrap().token();
    assert!(token.is_some());
    for name in ["a", "c"] {
        assert_eq!(h.node(name).cluster(ClusterKey::base(1)).unwrap().token(), token);
    }
}

#[test]
fn exactly_one_winner_with_distinct_priorities() {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    let names = ["n1", "n2", "n3", "n4", "n5", "n6"];
    for (i, name) in names.iter().enumerate() {
        h.add_node(name, (i as u64 * 37) % 11, i as u64 + 1);
    }
    h.domain(1, &names, &[]);
    h.start();
    h.fire(|k| *k == TimerKind::ReplyWindow);

    let winners = h.winners(ClusterKey::base(1));
    assert_eq!(winners.len(), 1);
    let best = names
        .iter()
        .enumerate()
        .max_by_key(|(i, _)| BullyPriority::new((*i as u64 * 37) % 11, *i as u64 + 1))
        .map(|(_, n)| NodeName::from(*n))
        .unwrap();
    assert_eq!(winners[0], best);
}

#[test]
fn lonely_cluster_wins_without_messages() {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    h.add_node("solo", 1, 1);
    h.domain(9, &["solo"], &[]);
    h.start();

    assert_eq!(h.winners(ClusterKey::base(9)), vec![NodeName::from("solo")]);
    assert!(h.wire.log.lock().is_empty());
}

#[test]
fn silent_peers_resolve_to_win_after_reply_window() {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    h.add_node("a", 1, 1);
    // "b" and "c" are members on paper but never answer.
    let key = ClusterKey::base(1);
    h.node_mut("a")
        .join_cluster(
            key,
            vec![
                MemberChannel::member("b".into(), key),
                MemberChannel::member("c".into(), key),
            ],
        )
        .unwrap();
    h.start();
    assert_eq!(h.node("a").elector(key).unwrap().state(), ElectorState::Electing);
    assert_eq!(h.wire.sent(MessageKind::Elect).len(), 2);

    h.fire(|k| *k == TimerKind::ReplyWindow);
    assert!(h.node("a").elector(key).unwrap().is_winner());
}

#[test]
fn start_election_twice_is_a_noop() {
    let mut h = three_nodes();
    h.start();
    let before = h.wire.log.lock().len();
    let round = h.node("b").elector(ClusterKey::base(1)).unwrap().round();
    h.node_mut("b").start_election(ClusterKey::base(1)).unwrap();
    h.pump();
    assert_eq!(h.wire.log.lock().len(), before);
    assert_eq!(h.node("b").elector(ClusterKey::base(1)).unwrap().round(), round);
}

// ═══════════════════════════════════════════════════════════════
// Edge peers
// ═══════════════════════════════════════════════════════════════

#[test]
fn edge_peers_learn_outcome_without_voting() {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    h.add_node("a", 5, 1);
    h.add_node("b", 9, 2);
    h.add_node("x", 99, 3);
    h.domain(1, &["a", "b"], &[("b", "x", 2)]);
    h.domain(2, &["x"], &[("x", "b", 1)]);
    h.start();

    // The strong foreign node does not take part in domain 1.
    assert_eq!(h.winners(ClusterKey::base(1)), vec![NodeName::from("b")]);
    assert!(h
        .wire
        .sent(MessageKind::Elect)
        .iter()
        .all(|(to, e)| to.as_str() != "x" || e.source_cluster != ClusterKey::base(1)));

    let neighbors: Vec<ClusterKey> = h
        .node("x")
        .cluster(ClusterKey::base(2))
        .unwrap()
        .neighbors()
        .map(|n| n.cluster)
        .collect();
    assert_eq!(neighbors, vec![ClusterKey::base(1)]);
}

// ═══════════════════════════════════════════════════════════════
// Escalation
// ═══════════════════════════════════════════════════════════════

#[test]
fn hierarchy_escalates_to_top_and_distributes_once() {
    let mut h = three_nodes();
    h.start();

    let top = ClusterKey::new(level(2), ClusterId(1));
    assert!(h.node("b").elector(ClusterKey::new(level(1), ClusterId(1))).unwrap().is_winner());
    assert!(h.node("b").elector(top).unwrap().is_winner());
    // Losers never escalate.
    assert_eq!(h.node("a").arena().len(), 1);
    assert_eq!(h.distributions(), 0);

    assert_eq!(h.fire(|k| *k == TimerKind::AddressSettle), 1);
    assert_eq!(h.distributions(), 1);
    assert_eq!(h.fire(|k| *k == TimerKind::AddressSettle), 0);
    assert_eq!(h.distributions(), 1);
}

#[test]
fn superior_cluster_created_only_after_inferior_coordinator() {
    let mut h = three_nodes();
    h.start();

    let first_coordinator = h.seen.iter().position(|e| {
        matches!(e, HierarchyEvent::CoordinatorCreated { coordinator, .. } if coordinator.level.is_base())
    });
    let first_superior = h
        .seen
        .iter()
        .position(|e| matches!(e, HierarchyEvent::SuperiorClusterJoined { .. }));
    assert!(first_coordinator.unwrap() < first_superior.unwrap());

    for node in h.nodes.values() {
        for key in node.arena().keys() {
            assert!(key.level.value() < DEFAULT_HIERARCHY_HEIGHT);
        }
    }
}

#[test]
fn joining_beyond_height_is_rejected() {
    let mut h = three_nodes();
    let beyond = ClusterKey::new(HierarchyLevel::new(3, 4).unwrap(), ClusterId(1));
    let err = h.node_mut("a").join_cluster(beyond, Vec::new()).unwrap_err();
    assert!(matches!(err, HierarchyError::MaxHeightExceeded { .. }));
}

#[test]
fn two_domains_fold_into_one_superior_cluster() {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    h.add_node("a", 5, 1);
    h.add_node("b", 9, 2);
    h.add_node("c", 3, 3);
    h.add_node("d", 4, 4);
    h.domain(1, &["a", "b"], &[]);
    h.domain(2, &["c", "d"], &[]);
    h.start();

    let l1 = ClusterKey::new(level(1), ClusterId(1));
    assert_eq!(h.winners(l1), vec![NodeName::from("b")]);
    let d_view = h.node("d").elector(l1).unwrap();
    assert_eq!(d_view.coordinator().unwrap().name, NodeName::from("b"));
    assert!(h.registry.is_level_settled(HierarchyLevel::BASE));
    assert_eq!(h.registry.winners_at(level(1)), BTreeSet::from([NodeName::from("b")]));
}

// ═══════════════════════════════════════════════════════════════
// Recovery
// ═══════════════════════════════════════════════════════════════

#[test]
fn lost_announcement_recovered_by_polling() {
    let mut h = three_nodes();
    h.wire.drop_next("a", MessageKind::Announce, 1);
    h.start();

    let a = h.node("a").elector(ClusterKey::base(1)).unwrap();
    assert!(!a.is_coordinator_valid());

    h.fire(|k| *k == TimerKind::AnnounceWait);
    let a = h.node("a").elector(ClusterKey::base(1)).unwrap();
    assert!(a.is_coordinator_valid());
    assert_eq!(a.coordinator().unwrap().name, NodeName::from("b"));
    assert!(!h.wire.sent(MessageKind::RequestCoordinator).is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_polls_trigger_reelection() {
    let mut h = three_nodes();
    h.wire.drop_next("a", MessageKind::Announce, 1);
    h.wire.drop_next("a", MessageKind::RequestCoordinator, 10);
    h.start();

    h.fire(|k| *k == TimerKind::AnnounceWait);
    for _ in 0..MAX_COORDINATOR_POLLS - 1 {
        h.fire(|k| matches!(k, TimerKind::CoordinatorPoll { .. }));
    }
    // Let the ELECT suppression window lapse before the renewed election.
    tokio::time::advance(Duration::from_millis(REPLY_TIMEOUT_MS * 2)).await;
    h.fire(|k| matches!(k, TimerKind::CoordinatorPoll { .. }));

    let a = h.node("a").elector(ClusterKey::base(1)).unwrap();
    assert_eq!(a.restarts(), 1);
    // The winner answered the renewed ELECT with its announcement.
    assert_eq!(a.coordinator().unwrap().name, NodeName::from("b"));
    assert_eq!(h.winners(ClusterKey::base(1)), vec![NodeName::from("b")]);
}

#[test]
fn priority_increase_takes_over_coordination() {
    let mut h = three_nodes();
    h.start();
    h.node_mut("a")
        .handle_priority_change(PriorityChange {
            level: Some(HierarchyLevel::BASE),
            value: 500,
        })
        .unwrap();
    h.pump();

    assert_eq!(h.winners(ClusterKey::base(1)), vec![NodeName::from("a")]);
    let b = h.node("b").elector(ClusterKey::base(1)).unwrap();
    assert_eq!(b.coordinator().unwrap().name, NodeName::from("a"));
    assert!(h
        .seen
        .iter()
        .any(|e| matches!(e, HierarchyEvent::CoordinatorInvalidated { node, .. } if node.as_str() == "b")));
}

#[test]
fn deposed_coordinator_abandons_superior_clusters() {
    let mut h = three_nodes();
    h.start();
    assert_eq!(h.fire(|k| *k == TimerKind::AddressSettle), 1);

    h.node_mut("a")
        .handle_priority_change(PriorityChange {
            level: Some(HierarchyLevel::BASE),
            value: 500,
        })
        .unwrap();
    h.pump();

    let l1 = ClusterKey::new(level(1), ClusterId(1));
    let top = ClusterKey::new(level(2), ClusterId(1));
    assert_eq!(h.winners(l1), vec![NodeName::from("a")]);
    assert_eq!(h.winners(top), vec![NodeName::from("a")]);
    assert_eq!(h.node("b").arena().keys(), vec![ClusterKey::base(1)]);
    let left: Vec<ClusterKey> = h
        .seen
        .iter()
        .filter_map(|e| match e {
            HierarchyEvent::SuperiorClusterLeft { node, cluster } if node.as_str() == "b" => Some(*cluster),
            _ => None,
        })
        .collect();
    assert_eq!(left, vec![l1, top]);

    // The top-level cluster was served before the takeover.
    assert_eq!(h.fire(|k| *k == TimerKind::AddressSettle), 0);
    assert_eq!(h.distributions(), 1);
}

#[test]
fn superior_members_reelect_after_coordinator_withdraws() {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    h.add_node("a", 5, 1);
    h.add_node("b", 9, 2);
    h.add_node("c", 3, 3);
    h.add_node("d", 4, 4);
    h.domain(1, &["a", "b"], &[]);
    h.domain(2, &["c", "d"], &[]);
    h.start();
    let l1 = ClusterKey::new(level(1), ClusterId(1));
    assert_eq!(h.winners(l1), vec![NodeName::from("b")]);

    h.node_mut("a")
        .handle_priority_change(PriorityChange {
            level: None,
            value: 50,
        })
        .unwrap();
    h.pump();
    h.fire(|k| *k == TimerKind::ReplyWindow);

    assert!(h.node("b").elector(l1).is_none());
    assert!(h.node("d").elector(l1).unwrap().restarts() >= 1);
    assert_eq!(h.winners(l1), vec![NodeName::from("a")]);
    assert_eq!(h.node("d").elector(l1).unwrap().coordinator().unwrap().name, NodeName::from("a"));
}

#[test]
fn connectivity_priority_kept_across_priority_changes() {
    let mut h = Harness::new(DEFAULT_HIERARCHY_HEIGHT);
    h.add_identity(NodeIdentity::generate("a".into(), BullyPriority::new(1, 1)).with_connectivity(2));
    h.domain(1, &["a"], &[]);
    let base = ClusterKey::base(1);
    assert_eq!(
        h.node("a").cluster(base).unwrap().priority(),
        BullyPriority::for_connectivity(1, 2, 1)
    );
    h.start();
    let l1 = ClusterKey::new(level(1), ClusterId(1));
    assert_eq!(h.node("a").cluster(l1).unwrap().priority(), BullyPriority::new(1, 1));

    h.node_mut("a")
        .handle_priority_change(PriorityChange { level: None, value: 7 })
        .unwrap();
    h.pump();

    assert_eq!(
        h.node("a").cluster(base).unwrap().priority(),
        BullyPriority::for_connectivity(7, 2, 1)
    );
    assert_eq!(h.node("a").cluster(l1).unwrap().priority(), BullyPriority::new(7, 1));
    assert_eq!(h.node("a").priority(), BullyPriority::new(7, 1));
}

#[test]
fn teardown_removes_electors_from_registry() {
    let mut h = three_nodes();
    h.start();
    h.node_mut("c").teardown();
    assert!(h.node("c").arena().is_empty());
    assert!(h
        .registry
        .lookup(ClusterKey::base(1))
        .iter()
        .all(|e| e.node.as_str() != "c"));
}
