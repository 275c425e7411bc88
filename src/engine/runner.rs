use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{BuildCache, OutputBundle};
use crate::checker::{MustRunReason, UpToDateChecker, UpToDateResult};
use crate::core::{BuildId, TaskId};
use crate::engine::events::EventSink;
use crate::engine::{CancelToken, FailurePolicy, NodeState, ProgressEvent, SkipReason};
use crate::error::{ActionError, EngineError, TaskError};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::graph::DependencyGraph;
use crate::outcome::{BuildResult, NodeReport, RunSummary, TaskExecution, Terminal, aggregate};
use crate::plan::ExecutionPlan;
use crate::store::{RecordedOutcome, TaskExecutionRecord, TaskStateStore};
use crate::task::{TaskContext, TaskNode};

/// How long the scheduler waits for a result before checking for
/// cancellation again.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct Runner<'a> {
    pub graph: &'a DependencyGraph,
    pub plan: &'a ExecutionPlan,
    pub store: &'a dyn TaskStateStore,
    pub cache: Option<&'a dyn BuildCache>,
    pub root: &'a Utf8Path,
    pub subscribers: &'a [Sender<ProgressEvent>],
    pub policy: FailurePolicy,
    pub workers: usize,
    pub rerun: bool,
    pub cancel: &'a CancelToken,
}

/// What a worker sends back once it is done with a node.
struct Finished {
    index: NodeIndex,
    terminal: Terminal,
    execution: TaskExecution,
}

impl Runner<'_> {
    /// Executes the plan on a pool of `workers` threads.
    ///
    /// The calling thread owns every piece of scheduling state and is the
    /// only one that touches it:
    /// 1. Nodes without unresolved dependencies are queued as ready, excluded
    ///    nodes are settled and release their dependents.
    /// 2. Ready nodes are handed to the pool, oldest first, while fewer than
    ///    `workers` are running.
    /// 3. Each worker checks, maybe runs, and records its node, then sends the
    ///    terminal state back over a channel.
    /// 4. A finished node releases its dependents, or, if it failed, skips
    ///    everything downstream of it and applies the failure policy.
    /// 5. Once nothing is running and nothing can be dispatched, every node
    ///    still waiting ends `skipped(build-aborted)` and the store is flushed.
    pub fn run(self) -> Result<BuildResult, EngineError> {
        let started = Instant::now();
        let build_id = BuildId::new();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("kumitate-worker-{i}"))
            .build()?;

        let root_span = tracing::span!(Level::INFO, "build", id = %build_id);
        root_span.pb_set_length(self.plan.len() as u64);
        root_span.pb_set_style(&bar_style());
        root_span.pb_set_message("Running tasks...");
        let _enter = root_span.enter();

        let worker = Worker {
            graph: self.graph,
            store: self.store,
            cache: self.cache,
            fingerprinter: Fingerprinter::new(self.root),
            rerun: self.rerun,
            cancel: self.cancel,
            build_id,
            parent: root_span.clone(),
        };

        let mut schedule = Schedule::new(
            self.graph,
            self.plan,
            EventSink::new(self.subscribers),
            &root_span,
            self.policy,
        );

        let task_style = task_style();

        pool.in_place_scope(|scope| {
            let (sender, receiver) = channel::<Finished>();

            schedule.seed();

            loop {
                if !schedule.cancelled && self.cancel.is_cancelled() {
                    schedule.cancel();
                }

                while schedule.running < self.workers
                    && let Some(index) = schedule.dispatch()
                {
                    let worker = &worker;
                    let sender = sender.clone();
                    let style = task_style.clone();

                    scope.spawn(move |_| {
                        let start = Instant::now();
                        // A panicking store or cache must still report back,
                        // or the node would stay running forever.
                        let terminal = catch_unwind(AssertUnwindSafe(|| {
                            worker.execute(index, style)
                        }))
                        .unwrap_or_else(|panic| {
                            let message = panic_message(&*panic);
                            tracing::error!("Task bookkeeping panicked: {message}");
                            Terminal::Failed(TaskError::Panicked(message))
                        });

                        // The receiver outlives every worker.
                        let _ = sender.send(Finished {
                            index,
                            terminal,
                            execution: TaskExecution {
                                start,
                                duration: start.elapsed(),
                            },
                        });
                    });
                }

                if schedule.running == 0 {
                    break;
                }

                match receiver.recv_timeout(POLL_INTERVAL) {
                    Ok(finished) => schedule.complete(finished),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        schedule.finish();

        let store_error = match self.store.flush() {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("Couldn't flush task history: {e}");
                Some(e)
            }
        };

        let summary = RunSummary {
            build_id,
            dispatch_order: schedule.dispatch_order,
            cancelled: schedule.cancelled,
            elapsed: started.elapsed(),
            store_error,
        };

        let result = aggregate(schedule.reports, summary);
        tracing::info!(
            failed = result.failed.len(),
            elapsed = ?result.elapsed,
            "Build complete!"
        );

        Ok(result)
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn task_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Per-node bookkeeping, owned by the scheduling thread.
struct Schedule<'a> {
    graph: &'a DependencyGraph,
    plan: &'a ExecutionPlan,
    events: EventSink<'a>,
    span: &'a Span,
    policy: FailurePolicy,
    states: HashMap<NodeIndex, NodeState>,
    indegree: HashMap<NodeIndex, usize>,
    ready: VecDeque<NodeIndex>,
    running: usize,
    /// No further dispatches; set by fail-fast or cancellation.
    aborting: bool,
    cancelled: bool,
    dispatch_order: Vec<TaskId>,
    reports: Vec<NodeReport>,
}

impl<'a> Schedule<'a> {
    fn new(
        graph: &'a DependencyGraph,
        plan: &'a ExecutionPlan,
        events: EventSink<'a>,
        span: &'a Span,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            graph,
            plan,
            events,
            span,
            policy,
            states: plan.order.iter().map(|&i| (i, NodeState::Pending)).collect(),
            indegree: plan.entries.iter().map(|(&i, e)| (i, e.indegree)).collect(),
            ready: VecDeque::new(),
            running: 0,
            aborting: false,
            cancelled: false,
            dispatch_order: Vec::new(),
            reports: Vec::with_capacity(plan.len()),
        }
    }

    fn state(&self, index: NodeIndex) -> NodeState {
        self.states
            .get(&index)
            .copied()
            .unwrap_or(NodeState::Pending)
    }

    fn transition(&mut self, index: NodeIndex, next: NodeState) {
        let previous = self.state(index);
        debug_assert!(
            previous.can_transition_to(next),
            "invalid transition {previous} -> {next} for {}",
            self.graph.id(index)
        );

        self.states.insert(index, next);
        self.events.emit(self.graph.id(index), previous, next);

        if next.is_terminal() {
            self.span.pb_inc(1);
        }
    }

    fn finalize(&mut self, index: NodeIndex, terminal: Terminal, execution: Option<TaskExecution>) {
        self.transition(index, terminal.state());
        self.reports.push(NodeReport {
            id: self.graph.id(index).clone(),
            terminal,
            execution,
        });
    }

    fn seed(&mut self) {
        let plan = self.plan;

        for &index in &plan.order {
            let Some(entry) = plan.entry(index) else {
                continue;
            };
            if !entry.excluded && entry.indegree == 0 {
                self.make_ready(index);
            }
        }

        for &index in &plan.order {
            if plan.entry(index).is_some_and(|entry| entry.excluded) {
                tracing::debug!(task = %self.graph.id(index), "excluded by filter");
                self.finalize(index, Terminal::Skipped(SkipReason::ExcludedByFilter), None);
                self.release(index);
            }
        }
    }

    fn make_ready(&mut self, index: NodeIndex) {
        self.transition(index, NodeState::Ready);
        self.ready.push_back(index);
    }

    /// Takes the oldest ready node and marks it running.
    fn dispatch(&mut self) -> Option<NodeIndex> {
        if self.aborting {
            return None;
        }

        let index = self.ready.pop_front()?;
        self.transition(index, NodeState::Running);
        self.running += 1;
        self.dispatch_order.push(self.graph.id(index).clone());

        Some(index)
    }

    fn complete(&mut self, finished: Finished) {
        let Finished {
            index,
            terminal,
            execution,
        } = finished;

        self.running -= 1;

        let state = terminal.state();
        self.finalize(index, terminal, Some(execution));

        if state.satisfies_dependents() {
            self.release(index);
        } else if state == NodeState::Failed {
            self.skip_dependents(index);

            if self.policy == FailurePolicy::FailFast && !self.aborting {
                tracing::warn!(
                    task = %self.graph.id(index),
                    "Task failed, waiting for {} running tasks before stopping",
                    self.running
                );
                self.aborting = true;
            }
        }
    }

    /// One dependency of each direct dependent is now satisfied.
    fn release(&mut self, index: NodeIndex) {
        let plan = self.plan;
        let Some(entry) = plan.entry(index) else {
            return;
        };

        for &dependent in &entry.dependents {
            if self.state(dependent) != NodeState::Pending {
                continue;
            }
            let Some(count) = self.indegree.get_mut(&dependent) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 && !self.aborting {
                self.make_ready(dependent);
            }
        }
    }

    /// Every pending node downstream of a failure ends `dependency-failed`.
    fn skip_dependents(&mut self, failed: NodeIndex) {
        let plan = self.plan;
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        if let Some(entry) = plan.entry(failed) {
            queue.extend(&entry.dependents);
        }

        while let Some(index) = queue.pop_front() {
            if self.state(index) != NodeState::Pending {
                continue;
            }
            self.finalize(index, Terminal::Skipped(SkipReason::DependencyFailed), None);
            if let Some(entry) = plan.entry(index) {
                queue.extend(&entry.dependents);
            }
        }
    }

    fn cancel(&mut self) {
        tracing::warn!(running = self.running, "Build cancelled");
        self.cancelled = true;
        self.aborting = true;
    }

    /// Drives every node that is still waiting to `skipped(build-aborted)`.
    fn finish(&mut self) {
        self.ready.clear();

        let plan = self.plan;
        for &index in &plan.order {
            if !self.state(index).is_terminal() {
                self.finalize(index, Terminal::Skipped(SkipReason::BuildAborted), None);
            }
        }
    }
}

/// The part of a run shared by every worker thread.
struct Worker<'a> {
    graph: &'a DependencyGraph,
    store: &'a dyn TaskStateStore,
    cache: Option<&'a dyn BuildCache>,
    fingerprinter: Fingerprinter,
    rerun: bool,
    cancel: &'a CancelToken,
    build_id: BuildId,
    parent: Span,
}

impl Worker<'_> {
    fn execute(&self, index: NodeIndex, style: ProgressStyle) -> Terminal {
        let node = self.graph.node(index);

        let span = tracing::span!(parent: &self.parent, Level::INFO, "task", name = %node.id());
        span.pb_set_style(&style);
        span.pb_set_message(&format!("Running {}", node.id()));
        let _enter = span.enter();

        self.run_node(node, &span)
    }

    fn run_node(&self, node: &TaskNode, span: &Span) -> Terminal {
        let record = match self.store.load(node.id()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Couldn't load task history, treating as new: {e}");
                None
            }
        };

        let checker = UpToDateChecker::new(&self.fingerprinter).rerun(self.rerun);
        let check = match checker.check(node, record.as_deref()) {
            Ok(check) => check,
            Err(e) => {
                tracing::error!("Couldn't fingerprint inputs: {e}");
                return Terminal::Failed(e.into());
            }
        };

        let reason = match (check.result, record.as_deref()) {
            (UpToDateResult::MustRun(reason), _) => reason,
            (UpToDateResult::UpToDate, Some(previous)) => {
                tracing::info!("UP-TO-DATE");
                self.save(node, check.inputs, previous.output.clone(), RecordedOutcome::UpToDate);
                return Terminal::Skipped(SkipReason::UpToDate);
            }
            (UpToDateResult::UpToDate, None) => MustRunReason::NoHistory,
        };

        let cacheable = !node.outputs().is_empty()
            && !matches!(reason, MustRunReason::AlwaysRun | MustRunReason::RerunRequested);
        let cache = self.cache.filter(|_| cacheable);

        if let Some(cache) = cache {
            match self.load_from_cache(cache, node, &check.inputs) {
                Ok(Some(outputs)) => {
                    tracing::info!("FROM-CACHE");
                    self.save(node, check.inputs, outputs, RecordedOutcome::UpToDate);
                    return Terminal::Skipped(SkipReason::LoadedFromCache);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Couldn't load outputs from cache: {e:#}"),
            }
        }

        if self.cancel.is_cancelled() {
            return Terminal::Skipped(SkipReason::BuildAborted);
        }

        tracing::info!(reason = %reason, "Executing");

        let context = TaskContext {
            id: node.id(),
            root: self.fingerprinter.root(),
            cancel: self.cancel,
            span: span.clone(),
        };

        // A panicking action only touches its own context and outputs, so
        // the shared scheduling state stays consistent.
        let result = match catch_unwind(AssertUnwindSafe(|| node.action().execute(&context))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TaskError::Action(ActionError::from(e))),
            Err(panic) => Err(TaskError::Panicked(panic_message(&*panic))),
        };

        if let Err(error) = result {
            tracing::error!("FAILED: {error}");
            self.save(node, check.inputs, Fingerprint::default(), RecordedOutcome::Failed);
            return Terminal::Failed(error);
        }

        let outputs = match self.fingerprinter.fingerprint(node.outputs()) {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::error!("Couldn't fingerprint outputs: {e}");
                self.save(node, check.inputs, Fingerprint::default(), RecordedOutcome::Failed);
                return Terminal::Failed(e.into());
            }
        };

        if let Some(cache) = cache
            && let Err(e) = self.store_in_cache(cache, node, &check.inputs)
        {
            tracing::warn!("Couldn't store outputs in cache: {e:#}");
        }

        self.save(node, check.inputs, outputs, RecordedOutcome::Executed);
        Terminal::Succeeded(reason)
    }

    fn save(&self, node: &TaskNode, input: Fingerprint, output: Fingerprint, outcome: RecordedOutcome) {
        let record = TaskExecutionRecord::new(input, output, outcome, self.build_id);
        if let Err(e) = self.store.save(node.id(), record) {
            tracing::warn!("Couldn't record task history: {e}");
        }
    }

    /// Restores cached outputs and returns their fingerprint.
    fn load_from_cache(
        &self,
        cache: &dyn BuildCache,
        node: &TaskNode,
        inputs: &Fingerprint,
    ) -> anyhow::Result<Option<Fingerprint>> {
        let Some(bundle) = cache.try_load(node, inputs)? else {
            return Ok(None);
        };

        bundle.restore(self.fingerprinter.root())?;
        Ok(Some(self.fingerprinter.fingerprint(node.outputs())?))
    }

    fn store_in_cache(
        &self,
        cache: &dyn BuildCache,
        node: &TaskNode,
        inputs: &Fingerprint,
    ) -> anyhow::Result<()> {
        let bundle = OutputBundle::capture(self.fingerprinter.root(), node.outputs())?;
        cache.store(node, inputs, &bundle)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
