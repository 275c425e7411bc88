//! Collecting per-node results into the result of a whole run.

mod profile;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use console::style;

use crate::checker::MustRunReason;
use crate::core::{BuildId, TaskId};
use crate::engine::{NodeState, SkipReason};
use crate::error::{StateStoreError, TaskError};

/// Wall-clock span of one dispatched node, including its up-to-date check.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// A node that ended `failed`, with the error it raised.
#[derive(Debug)]
pub struct FailedTask {
    pub id: TaskId,
    pub error: TaskError,
}

/// Terminal state of one node, with the detail that led to it.
#[derive(Debug)]
pub(crate) enum Terminal {
    Succeeded(MustRunReason),
    Failed(TaskError),
    Skipped(SkipReason),
}

impl Terminal {
    pub fn state(&self) -> NodeState {
        match self {
            Terminal::Succeeded(_) => NodeState::Succeeded,
            Terminal::Failed(_) => NodeState::Failed,
            Terminal::Skipped(reason) => NodeState::Skipped(*reason),
        }
    }
}

#[derive(Debug)]
pub(crate) struct NodeReport {
    pub id: TaskId,
    pub terminal: Terminal,
    pub execution: Option<TaskExecution>,
}

/// Run-wide facts known only to the scheduler.
#[derive(Debug)]
pub(crate) struct RunSummary {
    pub build_id: BuildId,
    pub dispatch_order: Vec<TaskId>,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub store_error: Option<StateStoreError>,
}

/// Everything that happened during one invocation.
///
/// Lists are in the order nodes reached their terminal state.
#[derive(Debug)]
pub struct BuildResult {
    pub build_id: BuildId,
    /// Nodes whose action ran and returned `Ok`, with the reason they ran.
    pub succeeded: Vec<(TaskId, MustRunReason)>,
    /// Every failed node, each with its original error.
    pub failed: Vec<FailedTask>,
    pub skipped: Vec<(TaskId, SkipReason)>,
    /// Timing of every dispatched node.
    pub durations: HashMap<TaskId, TaskExecution>,
    /// Identities in the order they were handed to workers.
    pub dispatch_order: Vec<TaskId>,
    /// The run was cancelled through its [`CancelToken`](crate::CancelToken).
    pub cancelled: bool,
    pub elapsed: Duration,
    /// Set when the task history couldn't be flushed at the end of the run.
    pub store_error: Option<StateStoreError>,
    states: Vec<(TaskId, NodeState)>,
}

/// Folds the terminal state of every planned node into a [`BuildResult`].
pub(crate) fn aggregate(reports: Vec<NodeReport>, summary: RunSummary) -> BuildResult {
    let mut result = BuildResult {
        build_id: summary.build_id,
        succeeded: Vec::new(),
        failed: Vec::new(),
        skipped: Vec::new(),
        durations: HashMap::new(),
        dispatch_order: summary.dispatch_order,
        cancelled: summary.cancelled,
        elapsed: summary.elapsed,
        store_error: summary.store_error,
        states: Vec::with_capacity(reports.len()),
    };

    for report in reports {
        result.states.push((report.id.clone(), report.terminal.state()));

        if let Some(execution) = report.execution {
            result.durations.insert(report.id.clone(), execution);
        }

        match report.terminal {
            Terminal::Succeeded(reason) => result.succeeded.push((report.id, reason)),
            Terminal::Failed(error) => result.failed.push(FailedTask {
                id: report.id,
                error,
            }),
            Terminal::Skipped(reason) => result.skipped.push((report.id, reason)),
        }
    }

    result
}

impl BuildResult {
    /// No node ended `failed`.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Process exit status for a command line front end.
    pub fn exit_code(&self) -> i32 {
        if !self.failed.is_empty() {
            1
        } else if self.cancelled {
            130
        } else {
            0
        }
    }

    /// Terminal state of a planned node.
    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.states
            .iter()
            .find(|(node, _)| node.as_str() == id)
            .map(|(_, state)| *state)
    }

    /// Every planned node with its terminal state.
    pub fn states(&self) -> &[(TaskId, NodeState)] {
        &self.states
    }

    pub fn error_of(&self, id: &str) -> Option<&TaskError> {
        self.failed
            .iter()
            .find(|task| task.id.as_str() == id)
            .map(|task| &task.error)
    }

    /// Nodes that never ran because of a failure or an abort.
    pub fn skipped_due_to_failure(&self) -> usize {
        self.skipped
            .iter()
            .filter(|(_, reason)| reason.is_fallout())
            .count()
    }

    fn count_skipped(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|(_, r)| *r == reason).count()
    }
}

impl Display for BuildResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, task) in self.failed.iter().enumerate() {
            if self.failed.len() > 1 {
                let header = style("Task failed with an exception.").red();
                writeln!(f, "{} {header}", style(format!("{}:", i + 1)).bold())?;
            } else {
                writeln!(f, "{}", style("FAILURE: Build failed with an exception.").red().bold())?;
            }
            writeln!(f)?;
            writeln!(f, "* What went wrong:")?;
            writeln!(f, "Execution failed for task '{}'.", task.id)?;
            writeln!(f, "> {}", task.error)?;
            writeln!(f)?;
        }

        let fallout = self.skipped_due_to_failure();
        if fallout > 0 {
            writeln!(f, "{fallout} tasks were skipped because of earlier failures.")?;
        }

        let elapsed = format!("{:.2?}", self.elapsed);
        if !self.is_success() {
            writeln!(f, "{} in {elapsed}", style("BUILD FAILED").red().bold())?;
        } else if self.cancelled {
            writeln!(f, "{} in {elapsed}", style("BUILD CANCELLED").yellow().bold())?;
        } else {
            writeln!(f, "{} in {elapsed}", style("BUILD SUCCESSFUL").green().bold())?;
        }

        let actionable = self.states.len() - self.count_skipped(SkipReason::ExcludedByFilter);
        let executed = self.succeeded.len() + self.failed.len();
        let up_to_date = self.count_skipped(SkipReason::UpToDate);
        let from_cache = self.count_skipped(SkipReason::LoadedFromCache);

        let mut parts = vec![format!("{executed} executed")];
        if from_cache > 0 {
            parts.push(format!("{from_cache} from cache"));
        }
        if up_to_date > 0 {
            parts.push(format!("{up_to_date} up-to-date"));
        }
        if fallout > 0 {
            parts.push(format!("{fallout} skipped"));
        }

        let noun = if actionable == 1 { "task" } else { "tasks" };
        write!(f, "{actionable} actionable {noun}: {}", parts.join(", "))
    }
}
