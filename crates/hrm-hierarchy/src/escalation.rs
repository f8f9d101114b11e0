//! Hierarchy escalation: what happens after a cluster elects its coordinator.
//!
//! Below the top level a winner creates its coordinator, announces it and
//! settles in the registry. Once every sibling elector of its level has
//! settled, the registry posts a cluster-update for the next level to every
//! waiting winner, and each of them locates or creates the superior cluster
//! formed by the coordinators in its scope. At the top level the winner
//! instead runs a single address-distribution pass after a settling delay.

use hrm_protocol::{BullyPriority, ClusterKey, ElectionMessage, HierarchyLevel, NodeName};

use crate::cluster::MemberChannel;
use crate::controller::HierarchyController;
use crate::coordinator::Coordinator;
use crate::elector::{ElectionTimer, TimerKind};
use crate::events::HierarchyEvent;
use crate::registry::ElectorStatus;
use crate::substrate::SuperiorScope;
use crate::HierarchyError;

/// The local elector of `key` won.
pub(crate) fn on_election_won(ctl: &mut HierarchyController, key: ClusterKey) {
    let node = ctl.identity.name.clone();
    let height = ctl.config.height;
    let settle_delay = ctl.config.address_settle;

    let Some(slot) = ctl.arena.get_mut(key) else {
        return;
    };
    let token = slot.cluster.assign_token(&mut rand::thread_rng());
    let priority = slot.cluster.priority();
    let coordinator = match Coordinator::create(&ctl.identity.signing_key, node.clone(), key, token, priority) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(node = %node, cluster = %key, error = %e, "Coordinator creation failed");
            ctl.registry.settle(&node, key, ElectorStatus::Failed);
            return;
        }
    };

    let covered: Vec<NodeName> = slot.cluster.candidates().map(|m| m.peer.clone()).collect();
    let announce = coordinator.announce(covered);
    // Edge peers are not candidates but still learn the outcome.
    let targets: Vec<(NodeName, ClusterKey)> = slot
        .cluster
        .members()
        .map(|m| (m.peer.clone(), m.peer_cluster))
        .collect();
    let handle = coordinator.handle();
    let round = slot.elector.round();
    let needs_distribution = key.level.is_top(height) && !ctl.registry.addresses_distributed(key);
    slot.coordinator = Some(coordinator);

    ctl.substrate.topology.register_coordinator(key, &node);
    tracing::info!(
        node = %node,
        cluster = %key,
        token,
        address = %handle.address,
        "Coordinator created"
    );
    ctl.emit(HierarchyEvent::ElectionWon {
        node: node.clone(),
        cluster: key,
        priority,
    });
    ctl.emit(HierarchyEvent::CoordinatorCreated {
        node: node.clone(),
        coordinator: handle,
    });

    for (peer, peer_cluster) in targets {
        ctl.send(key, &peer, peer_cluster, announce.clone());
    }

    ctl.registry.settle(&node, key, ElectorStatus::Won);

    if needs_distribution {
        tracing::debug!(cluster = %key, delay_ms = settle_delay.as_millis() as u64, "Top level reached, scheduling address distribution");
        ctl.substrate.timers.schedule(
            settle_delay,
            ElectionTimer {
                cluster: key,
                round,
                kind: TimerKind::AddressSettle,
            },
        );
    }
}

/// The local coordinator of `key` lost its mandate. The superior clusters it
/// was escalated into are abandoned with it.
pub(crate) fn on_coordinator_invalidated(ctl: &mut HierarchyController, key: ClusterKey) {
    let node = ctl.identity.name.clone();
    let Some(slot) = ctl.arena.get_mut(key) else {
        return;
    };
    let Some(coordinator) = slot.coordinator.take() else {
        return;
    };
    ctl.substrate.topology.deregister_coordinator(key, &node);
    tracing::info!(node = %node, cluster = %key, "Coordinator invalidated");
    ctl.emit(HierarchyEvent::CoordinatorInvalidated { node, cluster: key });

    if let Some(superior) = coordinator.superior() {
        abandon_superior(ctl, superior);
    }
}

/// Leave `superior` unless another local coordinator still folds into it,
/// then walk further up.
fn abandon_superior(ctl: &mut HierarchyController, superior: ClusterKey) {
    let node = ctl.identity.name.clone();
    let Some(inferior_level) = superior.level.inferior() else {
        return;
    };
    let still_represented = ctl.arena.coordinated_at(inferior_level).into_iter().any(|inferior| {
        ctl.arena
            .get(inferior)
            .and_then(|s| s.coordinator.as_ref())
            .is_some_and(|c| c.superior() == Some(superior))
    });
    if still_represented {
        return;
    }
    let Some(slot) = ctl.arena.get(superior) else {
        return;
    };
    let above = slot.coordinator.as_ref().and_then(|c| c.superior());
    let targets: Vec<(NodeName, ClusterKey)> = slot
        .cluster
        .candidates()
        .map(|m| (m.peer.clone(), m.peer_cluster))
        .collect();

    // Members that follow us as coordinator see our priority vanish and
    // re-elect among themselves.
    for (peer, peer_cluster) in targets {
        ctl.send(
            superior,
            &peer,
            peer_cluster,
            ElectionMessage::PriorityUpdate {
                sender_priority: BullyPriority::UNDEFINED,
            },
        );
    }
    if let Err(e) = ctl.leave_cluster(superior) {
        tracing::warn!(node = %node, cluster = %superior, error = %e, "Leaving superior cluster failed");
        return;
    }
    ctl.emit(HierarchyEvent::SuperiorClusterLeft { node, cluster: superior });

    if let Some(above) = above {
        abandon_superior(ctl, above);
    }
}

/// Cluster-update for `level`: find or create the superior cluster of every
/// cluster this node coordinates at `level - 1`, then start its election.
pub(crate) fn on_cluster_update(ctl: &mut HierarchyController, level: HierarchyLevel) -> Result<bool, HierarchyError> {
    let node = ctl.identity.name.clone();
    let Some(inferior_level) = level.inferior() else {
        return Ok(false);
    };
    if level.value() >= ctl.config.height {
        return Err(HierarchyError::MaxHeightExceeded {
            level: level.value(),
            height: ctl.config.height,
        });
    }

    let inferiors = ctl.arena.coordinated_at(inferior_level);
    if inferiors.is_empty() {
        tracing::debug!(node = %node, level = %level, "No inferior coordinator, escalation skipped");
        ctl.registry.skip_level(&node, level);
        return Ok(false);
    }

    let mut superiors = Vec::new();
    for inferior in inferiors {
        let Some(scope) = ctl.substrate.topology.superior_scope(inferior) else {
            tracing::warn!(node = %node, cluster = %inferior, "No superior scope for coordinated cluster");
            continue;
        };
        if scope.cluster.level != level {
            tracing::warn!(node = %node, cluster = %inferior, superior = %scope.cluster, "Superior scope at wrong level");
            continue;
        }
        ensure_superior(ctl, inferior, &scope)?;
        if !superiors.contains(&scope.cluster) {
            superiors.push(scope.cluster);
        }
    }

    if superiors.is_empty() {
        ctl.registry.skip_level(&node, level);
        return Ok(false);
    }
    for superior in superiors {
        ctl.start_election(superior)?;
    }
    Ok(true)
}

/// An inbound message named a superior cluster this node does not know yet.
/// Create it if one of our coordinated clusters folds into it.
pub(crate) fn join_referenced_superior(ctl: &mut HierarchyController, key: ClusterKey) -> Result<bool, HierarchyError> {
    let Some(inferior_level) = key.level.inferior() else {
        return Ok(false);
    };
    for inferior in ctl.arena.coordinated_at(inferior_level) {
        let Some(scope) = ctl.substrate.topology.superior_scope(inferior) else {
            continue;
        };
        if scope.cluster == key {
            ensure_superior(ctl, inferior, &scope)?;
            return Ok(true);
        }
    }
    Ok(false)
}

fn ensure_superior(ctl: &mut HierarchyController, inferior: ClusterKey, scope: &SuperiorScope) -> Result<(), HierarchyError> {
    let node = ctl.identity.name.clone();
    let members: Vec<MemberChannel> = scope
        .coordinators()
        .into_iter()
        .filter(|c| *c != node)
        .map(|c| MemberChannel::member(c, scope.cluster))
        .collect();
    let member_names: Vec<NodeName> = members.iter().map(|m| m.peer.clone()).collect();

    match ctl.arena.get_mut(scope.cluster) {
        Some(slot) => {
            for member in members {
                slot.cluster.add_member(member);
            }
        }
        None => {
            ctl.join_cluster(scope.cluster, members)?;
            ctl.emit(HierarchyEvent::SuperiorClusterJoined {
                node: node.clone(),
                cluster: scope.cluster,
                members: member_names,
            });
        }
    }

    if let Some(coordinator) = ctl.arena.get_mut(inferior).and_then(|s| s.coordinator.as_mut()) {
        coordinator.set_superior(scope.cluster);
    }
    Ok(())
}

/// One-time address distribution by the top-level coordinator.
pub(crate) fn distribute_addresses(ctl: &mut HierarchyController, timer: ElectionTimer) {
    let node = ctl.identity.name.clone();
    let Some(slot) = ctl.arena.get(timer.cluster) else {
        return;
    };
    if !slot.elector.is_winner() || slot.elector.round() != timer.round {
        tracing::debug!(cluster = %timer.cluster, "Coordinator changed before address distribution");
        return;
    }
    let Some(address) = slot.coordinator.as_ref().map(|c| c.address().to_string()) else {
        return;
    };
    if !ctl.registry.claim_address_distribution(timer.cluster) {
        tracing::debug!(cluster = %timer.cluster, "Addresses already distributed");
        return;
    }

    let mut members: Vec<NodeName> = slot.cluster.candidates().map(|m| m.peer.clone()).collect();
    members.push(node.clone());
    members.sort();

    // Address encoding belongs to the routing layer; the pass is reported
    // upward with the coordinator set it covers.
    tracing::info!(
        node = %node,
        cluster = %timer.cluster,
        members = members.len(),
        "Distributing addresses"
    );
    ctl.emit(HierarchyEvent::AddressesDistributed {
        node,
        cluster: timer.cluster,
        address,
        members,
    });
}
