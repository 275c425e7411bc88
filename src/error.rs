use std::fmt::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::TaskId;

/// The dependency graph contains a cycle.
///
/// `cycle` lists the identities on the cycle, starting and ending with the
/// same node; each entry depends on the one that follows it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Circular dependency between the following tasks:\n{}", render_cycle(.cycle))]
pub struct CycleError {
    pub cycle: Vec<TaskId>,
}

fn render_cycle(cycle: &[TaskId]) -> String {
    let mut acc = String::new();
    for (i, id) in cycle.iter().enumerate() {
        if i == 0 {
            let _ = write!(acc, "{id}");
        } else {
            let _ = write!(acc, "\n\\--- {id}");
        }
    }
    acc
}

/// A requested or excluded identity is not present in the graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Task '{id}' not found in the task graph.")]
pub struct UnknownTargetError {
    pub id: TaskId,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' is declared more than once.")]
    Duplicate(TaskId),

    #[error("Task '{dependent}' depends on '{dependency}', which is not in the task graph.")]
    UnknownDependency { dependent: TaskId, dependency: TaskId },
}

/// I/O failure while hashing a declared input or output.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Couldn't read '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't walk directory tree.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Walking '{root}' yielded '{path}', which is outside of it.")]
    OutsideTree { root: Utf8PathBuf, path: Utf8PathBuf },
}

/// The error returned by a task's action, preserved verbatim.
///
/// Use [`ActionError::inner`] to inspect or downcast the original error.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct ActionError(#[from] pub(crate) Arc<anyhow::Error>);

impl ActionError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(e: anyhow::Error) -> Self {
        ActionError(Arc::new(e))
    }
}

/// Why a single node ended `failed`. Never fatal to the whole run.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("Couldn't fingerprint task files.\n{0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Couldn't access task history.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode task history.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode task history.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Task history has unsupported version {0}.")]
    UnsupportedVersion(u32),

    #[error("Task history lock was poisoned by a panicking writer.")]
    Poisoned,
}

/// Errors that abort an invocation before any node is dispatched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    UnknownTarget(#[from] UnknownTargetError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Failed to build worker pool.\n{0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_tree_names_both_paths() {
        let err = FingerprintError::OutsideTree {
            root: "out".into(),
            path: "/elsewhere/x".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'out'"));
        assert!(msg.contains("'/elsewhere/x'"));
    }

    #[test]
    fn test_cycle_message_lists_every_node() {
        let err = CycleError {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a\n\\--- b\n\\--- a"));
    }

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct Custom;

    #[test]
    fn test_action_error_keeps_original() {
        let err = ActionError::from(anyhow::Error::new(Custom));
        assert!(err.inner().downcast_ref::<Custom>().is_some());
        assert_eq!(TaskError::from(err).to_string(), "disk on fire");
    }
}
