//! Execution Engine
//!
//! Drives a [`Plan`] to completion:
//! - ready nodes run on worker threads, results come back over a channel
//! - a failure is isolated to its downstream subtree (keep-going) or stops
//!   all further scheduling
//! - nodes with up-to-date outputs are not rerun unless forced
//! - operator abort via an [`AbortHandle`] or an abort flag file
//! - every result is persisted to the run ledger as it arrives

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::error::ExecutionError;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::{Node, NodeId, Plan, RunLedger};

use super::invoke::execute_node;
use super::scheduler::{RunResult, Scheduler};

/// Interval for checking the abort flag while nodes are running.
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Cloneable handle that stops scheduling of pending nodes.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs one node on a worker thread.
type NodeRunner = fn(&Node, &Path) -> RunResult;

/// Sends a worker's result when dropped, so a panicking worker still
/// reports a `Failure` instead of leaving the engine waiting.
struct Completion {
    id: NodeId,
    tx: Sender<(NodeId, RunResult)>,
    result: Option<RunResult>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| RunResult::Failure {
            reason: "worker thread panicked".into(),
        });
        if let Err(e) = self.tx.send((self.id.clone(), result)) {
            error!("Failed to send completion signal: {}", e);
        }
    }
}

/// Outcome of an engine run.
#[derive(Debug)]
pub struct RunReport {
    pub results: BTreeMap<NodeId, RunResult>,
    pub elapsed: Duration,
    pub timeline: ExecutionTimeline,
    pub dry_run: bool,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&RunResult) -> bool) -> usize {
        self.results.values().filter(|r| pred(r)).count()
    }

    pub fn successes(&self) -> usize {
        self.count(|r| *r == RunResult::Success)
    }

    pub fn placeholders(&self) -> usize {
        self.count(|r| matches!(r, RunResult::FailureWithPlaceholder { .. }))
    }

    pub fn failures(&self) -> usize {
        self.count(|r| matches!(r, RunResult::Failure { .. }))
    }

    pub fn not_run(&self) -> usize {
        self.count(|r| matches!(r, RunResult::NotRun { .. }))
    }

    /// True when no node failed or was left unrun.
    pub fn is_success(&self) -> bool {
        self.failures() == 0 && self.not_run() == 0
    }

    pub fn result(&self, id: &NodeId) -> Option<&RunResult> {
        self.results.get(id)
    }
}

/// Plan execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use ampliflow::config::{RunConfig, SampleTable};
/// use ampliflow::execution::Engine;
/// use ampliflow::workflow::{PlanPolicy, RuleGraphBuilder, StageRegistry};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = RunConfig::load("config.yaml")?;
///     let samples = SampleTable::load(&config.samples)?;
///     let policy = PlanPolicy::decide(&config, &samples)?;
///     let registry = StageRegistry::standard(&config);
///     let plan = RuleGraphBuilder::new(&registry, &samples, policy).build_default()?;
///
///     let mut engine = Engine::new(&plan, &config.result_dir);
///     engine.set_max_workers(8);
///     engine.set_keep_going(true);
///     let report = engine.run()?;
///     println!("{} nodes succeeded", report.successes());
///     Ok(())
/// }
/// ```
pub struct Engine<'p> {
    plan: &'p Plan,
    result_dir: PathBuf,
    run_name: String,
    max_workers: usize,
    keep_going: bool,
    dry_run: bool,
    force: bool,
    abort_flag_path: Option<PathBuf>,
    abort: AbortHandle,
    runner: NodeRunner,
}

impl<'p> Engine<'p> {
    pub fn new(plan: &'p Plan, result_dir: impl Into<PathBuf>) -> Self {
        let result_dir = result_dir.into();
        let run_name = result_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("default")
            .to_string();

        Self {
            plan,
            result_dir,
            run_name,
            max_workers: num_cpus::get(),
            keep_going: false,
            dry_run: false,
            force: false,
            abort_flag_path: None,
            abort: AbortHandle::default(),
            runner: execute_node,
        }
    }

    pub fn set_max_workers(&mut self, max: usize) {
        self.max_workers = max.max(1);
    }

    pub fn set_keep_going(&mut self, keep_going: bool) {
        self.keep_going = keep_going;
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn set_run_name(&mut self, name: impl Into<String>) {
        self.run_name = name.into();
    }

    /// Reruns nodes even when their outputs are up to date.
    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    /// Scheduling stops once this file exists.
    pub fn set_abort_flag_path(&mut self, path: impl Into<PathBuf>) {
        self.abort_flag_path = Some(path.into());
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn abort_requested(&self) -> bool {
        if self.abort.is_aborted() {
            return true;
        }
        match &self.abort_flag_path {
            Some(path) if Path::new(path).exists() => {
                info!("Abort flag found at {}", path.display());
                true
            }
            _ => false,
        }
    }

    /// Runs the plan until every node is terminal.
    ///
    /// Node failures are reported in the returned [`RunReport`]; only
    /// engine faults (unusable result directory, ledger I/O) are `Err`.
    pub fn run(&mut self) -> Result<RunReport, ExecutionError> {
        let start_time = Instant::now();
        let root = self.result_dir.clone();

        if !self.dry_run {
            fs::create_dir_all(&root).map_err(|source| ExecutionError::WorkingDir {
                path: root.clone(),
                source,
            })?;
        }

        let mut ledger = RunLedger::load(&root).unwrap_or_else(|_| {
            info!("Starting fresh run state for '{}'", self.run_name);
            RunLedger::new(&self.run_name)
        });
        let pruned = ledger.retain_nodes(self.plan.nodes.keys());
        if pruned > 0 {
            info!("Dropped {} run state records for nodes outside this plan", pruned);
        }

        let mut scheduler = Scheduler::new(self.plan, self.max_workers, self.keep_going);
        let mut timeline = ExecutionTimeline::new();

        info!(
            "Starting execution of {} nodes (workers: {}, dry run: {}, force: {})",
            self.plan.len(),
            self.max_workers,
            self.dry_run,
            self.force
        );

        let (tx, rx): (Sender<(NodeId, RunResult)>, Receiver<(NodeId, RunResult)>) = channel();
        let mut running_count = 0;

        loop {
            if !scheduler.is_aborted() && self.abort_requested() {
                for id in scheduler.abort() {
                    ledger.record(&id, scheduler_result(&scheduler, &id));
                }
                self.save_ledger(&ledger)?;
            }

            loop {
                let ready = scheduler.ready_nodes();
                if ready.is_empty() {
                    break;
                }

                for id in ready {
                    scheduler.mark_running(&id);

                    let Some(node) = self.plan.node(&id) else {
                        scheduler.mark_finished(
                            &id,
                            RunResult::Failure {
                                reason: "node missing from plan".into(),
                            },
                        );
                        continue;
                    };

                    let left_placeholders = !self.force
                        && matches!(
                            ledger.get(&id).map(|r| &r.result),
                            Some(RunResult::FailureWithPlaceholder { .. })
                        );
                    if left_placeholders {
                        info!("{} left placeholder outputs last run; retrying", id);
                    } else if !node.should_run(&root, self.force) {
                        info!("{} is up to date", id);
                        timeline.add_event(id.to_string(), EventType::UpToDate);
                        scheduler.mark_finished(&id, RunResult::Success);
                        ledger.record(&id, RunResult::Success);
                        continue;
                    }

                    if self.dry_run {
                        println!();
                        println!("[DRY RUN] {}", id);
                        println!("  Command: {}", node.action.describe());
                        println!("  Outputs: {:?}", node.outputs);
                        println!("  Threads: {}", scheduler.weight(&id));
                        timeline.add_event(id.to_string(), EventType::Completed);
                        scheduler.mark_finished(&id, RunResult::Success);
                        continue;
                    }

                    info!("Starting {}", id);
                    timeline.add_event(id.to_string(), EventType::Started);

                    let mut completion = Completion {
                        id: id.clone(),
                        tx: tx.clone(),
                        result: None,
                    };
                    let node = node.clone();
                    let root = root.clone();
                    let runner = self.runner;
                    thread::spawn(move || {
                        completion.result = Some(runner(&node, &root));
                    });

                    running_count += 1;
                }
            }

            if running_count == 0 {
                if scheduler.has_work_remaining() {
                    // nothing runnable and nothing in flight
                    warn!("No runnable nodes remain; aborting");
                    for id in scheduler.abort() {
                        ledger.record(&id, scheduler_result(&scheduler, &id));
                    }
                }
                break;
            }

            let (id, result) = match rx.recv_timeout(ABORT_CHECK_INTERVAL) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExecutionError::Channel(
                        "all workers hung up before reporting".into(),
                    ))
                }
            };
            running_count -= 1;

            match &result {
                RunResult::Success => {
                    info!("{} completed successfully", id);
                    timeline.add_event(id.to_string(), EventType::Completed);
                }
                RunResult::FailureWithPlaceholder { exit_code } => {
                    warn!("{} failed (exit {:?}); continuing with placeholders", id, exit_code);
                    timeline.add_event(id.to_string(), EventType::Placeholder);
                }
                RunResult::Failure { reason } => {
                    error!("{} failed: {}", id, reason);
                    timeline.add_event(id.to_string(), EventType::Failed);
                }
                RunResult::NotRun { .. } => {}
            }

            let skipped = scheduler.mark_finished(&id, result.clone());
            ledger.record(&id, result);
            for skipped_id in skipped {
                ledger.record(&skipped_id, scheduler_result(&scheduler, &skipped_id));
            }
            self.save_ledger(&ledger)?;

            let (done, total) = scheduler.progress();
            info!("Progress: {}/{} nodes", done, total);
        }

        self.save_ledger(&ledger)?;

        let elapsed = start_time.elapsed();
        info!("Execution finished in {:.2?}", elapsed);

        Ok(RunReport {
            results: scheduler.results(),
            elapsed,
            timeline,
            dry_run: self.dry_run,
        })
    }

    fn save_ledger(&self, ledger: &RunLedger) -> Result<(), ExecutionError> {
        if self.dry_run {
            return Ok(());
        }
        ledger.save(&self.result_dir)
    }
}

fn scheduler_result(scheduler: &Scheduler<'_>, id: &NodeId) -> RunResult {
    match scheduler.state(id) {
        Some(super::scheduler::NodeState::Done(result)) => result.clone(),
        _ => RunResult::NotRun {
            reason: super::scheduler::NotRunReason::Aborted,
        },
    }
}
