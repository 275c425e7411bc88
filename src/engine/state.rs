use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Why a node ended without its action running to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    UpToDate,
    LoadedFromCache,
    DependencyFailed,
    ExcludedByFilter,
    BuildAborted,
}

impl SkipReason {
    pub fn name(self) -> &'static str {
        match self {
            SkipReason::UpToDate => "up-to-date",
            SkipReason::LoadedFromCache => "loaded-from-cache",
            SkipReason::DependencyFailed => "dependency-failed",
            SkipReason::ExcludedByFilter => "excluded-by-filter",
            SkipReason::BuildAborted => "build-aborted",
        }
    }

    /// Skipped because something else went wrong, as opposed to skipped
    /// because there was nothing to do.
    pub fn is_fallout(self) -> bool {
        matches!(self, SkipReason::DependencyFailed | SkipReason::BuildAborted)
    }
}

/// Lifecycle of one node during a run.
///
/// `Pending -> Ready -> Running -> {Succeeded, Failed, Skipped}`, with a
/// few shortcuts into `Skipped` for nodes that never get dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped(_)
        )
    }

    /// Whether a dependent may treat this node as done.
    pub fn satisfies_dependents(self) -> bool {
        match self {
            NodeState::Succeeded => true,
            NodeState::Skipped(reason) => !reason.is_fallout(),
            _ => false,
        }
    }

    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        use SkipReason::*;

        match (self, next) {
            (Pending, Ready) => true,
            (Pending, Skipped(DependencyFailed | ExcludedByFilter | BuildAborted)) => true,
            (Ready, Running) => true,
            (Ready, Skipped(BuildAborted)) => true,
            (Running, Succeeded | Failed) => true,
            (Running, Skipped(UpToDate | LoadedFromCache | BuildAborted)) => true,
            _ => false,
        }
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Pending => f.write_str("pending"),
            NodeState::Ready => f.write_str("ready"),
            NodeState::Running => f.write_str("running"),
            NodeState::Succeeded => f.write_str("succeeded"),
            NodeState::Failed => f.write_str("failed"),
            NodeState::Skipped(reason) => write!(f, "skipped({})", reason.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        let terminal = [
            NodeState::Succeeded,
            NodeState::Failed,
            NodeState::Skipped(SkipReason::UpToDate),
        ];
        for state in terminal {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(NodeState::Ready));
            assert!(!state.can_transition_to(NodeState::Running));
        }
    }

    #[test]
    fn test_pending_never_runs_directly() {
        assert!(!NodeState::Pending.can_transition_to(NodeState::Running));
        assert!(
            NodeState::Pending.can_transition_to(NodeState::Skipped(SkipReason::DependencyFailed))
        );
        assert!(!NodeState::Pending.can_transition_to(NodeState::Skipped(SkipReason::UpToDate)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            NodeState::Skipped(SkipReason::ExcludedByFilter).to_string(),
            "skipped(excluded-by-filter)"
        );
    }
}
