//! Per-node event processor.
//!
//! Every node runs exactly one processor task, which owns the node's
//! [`HierarchyController`]. Producers (the network, the election registry,
//! timer tasks and the simulation root) only ever talk to it through a
//! cloneable [`ProcessorHandle`].
//!
//! Each pass dispatches in a fixed order: one queued message per inbound
//! channel, then one priority change, then one expired timer, then at most
//! one cluster-update (lowest pending level). When every queue is empty the
//! worker suspends until a producer posts something.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};

use hrm_hierarchy::{
    ClusterSnapshot, ClusterUpdateSink, CoordinatorHandle, ElectionTimer, HierarchyController,
    HierarchyError, PriorityChange, TimerSink,
};
use hrm_protocol::{BullyPriority, ClusterKey, Envelope, HierarchyLevel, NodeName};

use crate::NodeError;

/// Diagnostic view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node: NodeName,
    pub priority: BullyPriority,
    pub clusters: Vec<ClusterSnapshot>,
    pub coordinators: Vec<CoordinatorHandle>,
}

enum ProcessorCommand {
    Start,
    Snapshot(oneshot::Sender<NodeSnapshot>),
    Shutdown,
}

/// Pending cluster-update requests, one saturating counter per level.
struct UpdateCounters {
    counts: Mutex<BTreeMap<HierarchyLevel, u32>>,
    ceiling: u32,
    notify: Notify,
}

impl UpdateCounters {
    fn new(ceiling: u32) -> Self {
        Self {
            counts: Mutex::new(BTreeMap::new()),
            ceiling: ceiling.max(1),
            notify: Notify::new(),
        }
    }

    fn post(&self, level: HierarchyLevel) {
        {
            let mut counts = self.counts.lock();
            let count = counts.entry(level).or_insert(0);
            *count = (*count + 1).min(self.ceiling);
        }
        self.notify.notify_one();
    }

    /// Consume one request for the lowest pending level.
    fn take_lowest(&self) -> Option<HierarchyLevel> {
        let mut counts = self.counts.lock();
        let level = *counts.keys().next()?;
        if let Some(count) = counts.get_mut(&level) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&level);
            }
        }
        Some(level)
    }
}

/// Cloneable producer side of a node's processor.
#[derive(Clone)]
pub struct ProcessorHandle {
    node: NodeName,
    inbound: mpsc::UnboundedSender<Envelope>,
    priorities: mpsc::UnboundedSender<PriorityChange>,
    timers: mpsc::UnboundedSender<ElectionTimer>,
    commands: mpsc::UnboundedSender<ProcessorCommand>,
    updates: Arc<UpdateCounters>,
}

impl ProcessorHandle {
    pub fn node(&self) -> &NodeName {
        &self.node
    }

    /// Queue an inbound message on its channel.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), NodeError> {
        self.inbound
            .send(envelope)
            .map_err(|_| NodeError::ProcessorStopped(self.node.clone()))
    }

    pub fn post_priority_change(&self, change: PriorityChange) -> Result<(), NodeError> {
        self.priorities
            .send(change)
            .map_err(|_| NodeError::ProcessorStopped(self.node.clone()))
    }

    /// Start the node's level-0 elections.
    pub fn start(&self) -> Result<(), NodeError> {
        self.command(ProcessorCommand::Start)
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.command(ProcessorCommand::Snapshot(tx))?;
        rx.await.map_err(|_| NodeError::ProcessorStopped(self.node.clone()))
    }

    /// Ask the processor to tear down its clusters and exit.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ProcessorCommand::Shutdown);
    }

    fn command(&self, command: ProcessorCommand) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .map_err(|_| NodeError::ProcessorStopped(self.node.clone()))
    }
}

impl ClusterUpdateSink for ProcessorHandle {
    fn update_cluster(&self, level: HierarchyLevel) {
        tracing::debug!(node = %self.node, level = %level, "Cluster-update posted");
        self.updates.post(level);
    }
}

impl TimerSink for ProcessorHandle {
    fn schedule(&self, after: Duration, timer: ElectionTimer) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = timers.send(timer);
        });
    }
}

/// Consumer side of the queues, moved into the processor.
pub struct ProcessorQueues {
    inbound: mpsc::UnboundedReceiver<Envelope>,
    priorities: mpsc::UnboundedReceiver<PriorityChange>,
    timers: mpsc::UnboundedReceiver<ElectionTimer>,
    commands: mpsc::UnboundedReceiver<ProcessorCommand>,
}

/// What woke a suspended processor.
enum Wake {
    Command(Option<ProcessorCommand>),
    Envelope(Envelope),
    Priority(PriorityChange),
    Timer(ElectionTimer),
    Updates,
}

pub struct EventProcessor {
    controller: HierarchyController,
    queues: ProcessorQueues,
    updates: Arc<UpdateCounters>,
    /// One FIFO per (sender, target cluster) channel.
    inboxes: BTreeMap<(NodeName, ClusterKey), VecDeque<Envelope>>,
    pending_priorities: VecDeque<PriorityChange>,
    pending_timers: VecDeque<ElectionTimer>,
    slow_dispatch: Duration,
}

impl EventProcessor {
    /// Create the queues of a node. The handle exists before the processor
    /// because the controller needs it as its timer sink.
    pub fn queues(node: NodeName, max_pending_updates: u32) -> (ProcessorHandle, ProcessorQueues) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (priorities_tx, priorities) = mpsc::unbounded_channel();
        let (timers_tx, timers) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = ProcessorHandle {
            node,
            inbound: inbound_tx,
            priorities: priorities_tx,
            timers: timers_tx,
            commands: commands_tx,
            updates: Arc::new(UpdateCounters::new(max_pending_updates)),
        };
        let queues = ProcessorQueues {
            inbound,
            priorities,
            timers,
            commands,
        };
        (handle, queues)
    }

    pub fn new(
        controller: HierarchyController,
        handle: &ProcessorHandle,
        queues: ProcessorQueues,
        slow_dispatch: Duration,
    ) -> Self {
        Self {
            controller,
            queues,
            updates: handle.updates.clone(),
            inboxes: BTreeMap::new(),
            pending_priorities: VecDeque::new(),
            pending_timers: VecDeque::new(),
            slow_dispatch,
        }
    }

    /// Run until shutdown, then tear down every cluster of the node.
    pub async fn run(mut self) {
        let node = self.controller.name().clone();
        tracing::info!(node = %node, "Event processor started");

        'outer: loop {
            while let Ok(command) = self.queues.commands.try_recv() {
                if !self.on_command(command) {
                    break 'outer;
                }
            }
            self.collect();
            if self.dispatch_next() {
                tokio::task::yield_now().await;
                continue;
            }

            let wake = tokio::select! {
                biased;
                command = self.queues.commands.recv() => Wake::Command(command),
                Some(envelope) = self.queues.inbound.recv() => Wake::Envelope(envelope),
                Some(change) = self.queues.priorities.recv() => Wake::Priority(change),
                Some(timer) = self.queues.timers.recv() => Wake::Timer(timer),
                _ = self.updates.notify.notified() => Wake::Updates,
                else => Wake::Command(None),
            };
            match wake {
                Wake::Command(Some(command)) => {
                    if !self.on_command(command) {
                        break;
                    }
                }
                Wake::Command(None) => break,
                Wake::Envelope(envelope) => self.enqueue(envelope),
                Wake::Priority(change) => self.pending_priorities.push_back(change),
                Wake::Timer(timer) => self.pending_timers.push_back(timer),
                Wake::Updates => {}
            }
        }

        self.controller.teardown();
        tracing::info!(node = %node, "Event processor stopped");
    }

    /// Move everything already posted into the local queues.
    fn collect(&mut self) {
        while let Ok(envelope) = self.queues.inbound.try_recv() {
            self.enqueue(envelope);
        }
        while let Ok(change) = self.queues.priorities.try_recv() {
            self.pending_priorities.push_back(change);
        }
        while let Ok(timer) = self.queues.timers.try_recv() {
            self.pending_timers.push_back(timer);
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        self.inboxes
            .entry((envelope.source.clone(), envelope.target_cluster))
            .or_default()
            .push_back(envelope);
    }

    /// Dispatch the next unit of work. Returns false when every queue is empty.
    fn dispatch_next(&mut self) -> bool {
        if !self.inboxes.is_empty() {
            let channels: Vec<(NodeName, ClusterKey)> = self.inboxes.keys().cloned().collect();
            for channel in channels {
                let Some(envelope) = self.inboxes.get_mut(&channel).and_then(|q| q.pop_front()) else {
                    continue;
                };
                if self.inboxes.get(&channel).is_some_and(|q| q.is_empty()) {
                    self.inboxes.remove(&channel);
                }
                self.timed("message", |ctl| ctl.handle_envelope(envelope));
            }
            return true;
        }
        if let Some(change) = self.pending_priorities.pop_front() {
            self.timed("priority", |ctl| ctl.handle_priority_change(change));
            return true;
        }
        if let Some(timer) = self.pending_timers.pop_front() {
            self.timed("timer", |ctl| ctl.handle_timer(timer));
            return true;
        }
        if let Some(level) = self.updates.take_lowest() {
            self.timed("cluster-update", |ctl| ctl.handle_cluster_update(level).map(|_| ()));
            return true;
        }
        false
    }

    /// Returns false on shutdown.
    fn on_command(&mut self, command: ProcessorCommand) -> bool {
        match command {
            ProcessorCommand::Start => {
                self.timed("start", |ctl| ctl.start_base_elections());
                true
            }
            ProcessorCommand::Snapshot(reply) => {
                let _ = reply.send(NodeSnapshot {
                    node: self.controller.name().clone(),
                    priority: self.controller.priority(),
                    clusters: self.controller.snapshot(),
                    coordinators: self.controller.coordinators(),
                });
                true
            }
            ProcessorCommand::Shutdown => false,
        }
    }

    fn timed<F>(&mut self, what: &'static str, dispatch: F)
    where
        F: FnOnce(&mut HierarchyController) -> Result<(), HierarchyError>,
    {
        let started = std::time::Instant::now();
        let result = dispatch(&mut self.controller);
        let elapsed = started.elapsed();

        if elapsed > self.slow_dispatch {
            tracing::warn!(
                node = %self.controller.name(),
                dispatch = what,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow dispatch"
            );
        }
        if let Err(e) = result {
            tracing::warn!(node = %self.controller.name(), dispatch = what, error = %e, "Dispatch failed");
        }
    }
}
