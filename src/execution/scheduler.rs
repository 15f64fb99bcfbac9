//! Scheduler
//!
//! Tracks node state for one run of a [`Plan`]:
//! - dependency readiness (every dependency terminal and proceeding)
//! - the worker budget, shared out by node weight
//! - failure isolation: a failed node turns its whole downstream subtree
//!   into `NotRun` and leaves unrelated samples alone
//! - abort: pending nodes are never started, running ones finish

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::workflow::{NodeId, Plan};

/// Why a node was never started.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum NotRunReason {
    /// A transitive dependency ended in `Failure`
    UpstreamFailed(NodeId),
    /// The run was aborted before the node was scheduled
    Aborted,
}

/// Terminal outcome of a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Success,
    /// The tool failed but empty placeholder outputs let dependents proceed
    FailureWithPlaceholder { exit_code: Option<i32> },
    Failure { reason: String },
    NotRun { reason: NotRunReason },
}

impl RunResult {
    /// Whether dependents may run after this result.
    pub fn proceeds(&self) -> bool {
        matches!(
            self,
            RunResult::Success | RunResult::FailureWithPlaceholder { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::FailureWithPlaceholder { .. } => "placeholder",
            RunResult::Failure { .. } => "failed",
            RunResult::NotRun { .. } => "not run",
        }
    }
}

/// Scheduling state of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    Pending,
    Running,
    Done(RunResult),
}

/// Ready-set computation and state transitions for one run.
pub struct Scheduler<'p> {
    plan: &'p Plan,
    order: Vec<NodeId>,
    states: BTreeMap<NodeId, NodeState>,
    budget: usize,
    in_use: usize,
    keep_going: bool,
    aborted: bool,
}

impl<'p> Scheduler<'p> {
    /// Creates a scheduler with a worker budget of `budget` (at least 1).
    pub fn new(plan: &'p Plan, budget: usize, keep_going: bool) -> Self {
        let budget = budget.max(1);
        let order: Vec<NodeId> = plan.topological_order().into_iter().cloned().collect();

        info!(
            "Scheduling {} nodes with a worker budget of {}{}",
            order.len(),
            budget,
            if keep_going { " (keep going)" } else { "" }
        );

        Self {
            plan,
            states: order.iter().map(|id| (id.clone(), NodeState::Pending)).collect(),
            order,
            budget,
            in_use: 0,
            keep_going,
            aborted: false,
        }
    }

    /// Budget share held by a node while it runs.
    pub fn weight(&self, id: &NodeId) -> usize {
        self.plan
            .node(id)
            .map_or(1, |n| n.threads)
            .clamp(1, self.budget)
    }

    fn dependencies_proceed(&self, id: &NodeId) -> bool {
        self.plan.dependencies(id).into_iter().all(|dep| {
            matches!(self.states.get(dep), Some(NodeState::Done(result)) if result.proceeds())
        })
    }

    /// Nodes that can start now, in topological order, within the free budget.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        if self.aborted {
            return Vec::new();
        }

        let mut ready = Vec::new();
        let mut to_allocate = 0;

        for id in &self.order {
            if self.states.get(id) != Some(&NodeState::Pending) || !self.dependencies_proceed(id) {
                continue;
            }

            let weight = self.weight(id);
            if self.in_use + to_allocate + weight > self.budget {
                debug!(
                    "{} needs {} workers but only {} free",
                    id,
                    weight,
                    self.budget - self.in_use - to_allocate
                );
                continue;
            }

            ready.push(id.clone());
            to_allocate += weight;
        }

        ready
    }

    pub fn mark_running(&mut self, id: &NodeId) {
        let weight = self.weight(id);
        self.in_use += weight;
        self.states.insert(id.clone(), NodeState::Running);
        debug!("{} started ({}/{} workers in use)", id, self.in_use, self.budget);
    }

    /// Records a node's terminal result.
    ///
    /// Returns the nodes that became `NotRun` as a consequence.
    pub fn mark_finished(&mut self, id: &NodeId, result: RunResult) -> Vec<NodeId> {
        if self.states.get(id) == Some(&NodeState::Running) {
            self.in_use = self.in_use.saturating_sub(self.weight(id));
        }

        let failed = matches!(result, RunResult::Failure { .. });
        self.states.insert(id.clone(), NodeState::Done(result));

        if !failed {
            return Vec::new();
        }

        let mut skipped = Vec::new();
        for dependent in self.plan.transitive_dependents(id) {
            if self.states.get(&dependent) == Some(&NodeState::Pending) {
                self.states.insert(
                    dependent.clone(),
                    NodeState::Done(RunResult::NotRun {
                        reason: NotRunReason::UpstreamFailed(id.clone()),
                    }),
                );
                skipped.push(dependent);
            }
        }
        if !skipped.is_empty() {
            warn!("{} failed; {} downstream nodes will not run", id, skipped.len());
        }

        if !self.keep_going {
            skipped.extend(self.abort());
        }
        skipped
    }

    /// Stops scheduling; every pending node becomes `NotRun(Aborted)`.
    pub fn abort(&mut self) -> Vec<NodeId> {
        self.aborted = true;
        let mut aborted = Vec::new();
        for (id, state) in self.states.iter_mut() {
            if *state == NodeState::Pending {
                *state = NodeState::Done(RunResult::NotRun {
                    reason: NotRunReason::Aborted,
                });
                aborted.push(id.clone());
            }
        }
        if !aborted.is_empty() {
            warn!("Run aborted; {} pending nodes will not run", aborted.len());
        }
        aborted
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn running_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == NodeState::Running)
            .count()
    }

    /// True while any node is pending or running.
    pub fn has_work_remaining(&self) -> bool {
        self.states
            .values()
            .any(|s| matches!(s, NodeState::Pending | NodeState::Running))
    }

    /// Returns the current progress as (terminal, total).
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .states
            .values()
            .filter(|s| matches!(s, NodeState::Done(_)))
            .count();
        (done, self.states.len())
    }

    pub fn state(&self, id: &NodeId) -> Option<&NodeState> {
        self.states.get(id)
    }

    /// Terminal results of every node that has finished.
    pub fn results(&self) -> BTreeMap<NodeId, RunResult> {
        self.states
            .iter()
            .filter_map(|(id, state)| match state {
                NodeState::Done(result) => Some((id.clone(), result.clone())),
                _ => None,
            })
            .collect()
    }
}
