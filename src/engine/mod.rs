//! The invocation API: options, cancellation and the [`Engine`] itself.

mod events;
mod runner;
mod state;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::BuildCache;
use crate::core::TaskId;
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::outcome::BuildResult;
use crate::plan::{ExecutionPlan, build_plan};
use crate::store::TaskStateStore;

pub use events::ProgressEvent;
pub use state::{NodeState, SkipReason};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop dispatching after the first failure; running tasks finish.
    #[default]
    FailFast,
    /// Keep running everything that does not depend on a failed task.
    ContinueOnFailure,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// One invocation of the engine.
///
/// ```rust
/// use kumitate::{FailurePolicy, RunOptions};
///
/// let options: RunOptions = serde_json::from_str(r#"{
///     "targets": [":app:assemble"],
///     "failure-policy": "continue-on-failure",
///     "workers": 4
/// }"#).unwrap();
///
/// assert_eq!(options.failure_policy, FailurePolicy::ContinueOnFailure);
/// assert!(!options.rerun_tasks);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RunOptions {
    pub targets: Vec<TaskId>,
    pub exclusions: Vec<TaskId>,
    pub failure_policy: FailurePolicy,
    /// Upper bound on concurrently running tasks. Defaults to the number of
    /// cores; zero is treated as one.
    pub workers: usize,
    /// Ignore task history and run every planned task.
    pub rerun_tasks: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            exclusions: Vec::new(),
            failure_policy: FailurePolicy::default(),
            workers: default_workers(),
            rerun_tasks: false,
        }
    }
}

impl RunOptions {
    pub fn new<I, T>(targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn exclude(mut self, id: impl Into<TaskId>) -> Self {
        self.exclusions.push(id.into());
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn rerun_tasks(mut self, rerun: bool) -> Self {
        self.rerun_tasks = rerun;
        self
    }
}

/// Cooperative cancellation shared between the caller, the scheduler and
/// running actions.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs an immutable [`DependencyGraph`] against a task history.
pub struct Engine {
    graph: DependencyGraph,
    store: Arc<dyn TaskStateStore>,
    cache: Option<Arc<dyn BuildCache>>,
    root: Utf8PathBuf,
    subscribers: Vec<Sender<ProgressEvent>>,
}

impl Engine {
    pub fn new(graph: DependencyGraph, store: Arc<dyn TaskStateStore>) -> Self {
        Self {
            graph,
            store,
            cache: None,
            root: Utf8PathBuf::from("."),
            subscribers: Vec::new(),
        }
    }

    /// Base directory for relative input and output paths.
    pub fn with_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn BuildCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Every node state transition of every later run is sent to the
    /// returned receiver. Dropping it is fine.
    pub fn subscribe(&mut self) -> Receiver<ProgressEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    /// Validates the options against the graph without running anything.
    pub fn plan(&self, options: &RunOptions) -> Result<ExecutionPlan, EngineError> {
        build_plan(&self.graph, &options.targets, &options.exclusions)
    }

    pub fn run(&self, options: &RunOptions) -> Result<BuildResult, EngineError> {
        self.run_with_cancel(options, &CancelToken::new())
    }

    /// Like [`Engine::run`]. Once `cancel` fires, nothing new is dispatched,
    /// running tasks are left to finish, and everything else ends
    /// `skipped(build-aborted)`.
    pub fn run_with_cancel(
        &self,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<BuildResult, EngineError> {
        let plan = self.plan(options)?;

        runner::Runner {
            graph: &self.graph,
            plan: &plan,
            store: &*self.store,
            cache: self.cache.as_deref(),
            root: &self.root,
            subscribers: &self.subscribers,
            policy: options.failure_policy,
            workers: options.workers.max(1),
            rerun: options.rerun_tasks,
            cancel,
        }
        .run()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("graph", &self.graph)
            .field("root", &self.root)
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}
