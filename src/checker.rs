//! Decides whether a task may be skipped.
//!
//! A task runs when it is flagged always-run, when a rerun was requested,
//! when it has no history, when its last run failed, when its inputs
//! changed, or when its declared outputs no longer match what the last run
//! left behind. Tasks declaring no outputs are judged on their inputs alone.

use std::fmt::{Display, Formatter};

use crate::error::FingerprintError;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::store::{RecordedOutcome, TaskExecutionRecord};
use crate::task::TaskNode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MustRunReason {
    AlwaysRun,
    RerunRequested,
    NoHistory,
    PreviousFailure,
    /// Spec keys of the inputs that differ from the stored fingerprint.
    InputChanged(Vec<String>),
    /// Spec keys of the outputs modified outside the build.
    OutputChangedExternally(Vec<String>),
}

impl MustRunReason {
    pub fn name(&self) -> &'static str {
        match self {
            MustRunReason::AlwaysRun => "always-run-flagged",
            MustRunReason::RerunRequested => "rerun-requested",
            MustRunReason::NoHistory => "no-history",
            MustRunReason::PreviousFailure => "previous-failure",
            MustRunReason::InputChanged(_) => "input-changed",
            MustRunReason::OutputChangedExternally(_) => "output-changed-externally",
        }
    }
}

impl Display for MustRunReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())?;
        match self {
            MustRunReason::InputChanged(keys) | MustRunReason::OutputChangedExternally(keys)
                if !keys.is_empty() =>
            {
                write!(f, " ({})", keys.join(", "))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpToDateResult {
    UpToDate,
    MustRun(MustRunReason),
}

/// The verdict together with the input fingerprint it was based on. The
/// engine records exactly this fingerprint once the task completes.
#[derive(Clone, Debug)]
pub struct Check {
    pub result: UpToDateResult,
    pub inputs: Fingerprint,
}

#[derive(Debug, Clone, Copy)]
pub struct UpToDateChecker<'a> {
    fingerprinter: &'a Fingerprinter,
    rerun: bool,
}

impl<'a> UpToDateChecker<'a> {
    pub fn new(fingerprinter: &'a Fingerprinter) -> Self {
        Self {
            fingerprinter,
            rerun: false,
        }
    }

    /// Treat every task as if it had been flagged always-run.
    pub fn rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    pub fn check(
        &self,
        node: &TaskNode,
        stored: Option<&TaskExecutionRecord>,
    ) -> Result<Check, FingerprintError> {
        let inputs = self.fingerprinter.fingerprint(node.inputs())?;
        let result = self.decide(node, stored, &inputs)?;
        Ok(Check { result, inputs })
    }

    fn decide(
        &self,
        node: &TaskNode,
        stored: Option<&TaskExecutionRecord>,
        inputs: &Fingerprint,
    ) -> Result<UpToDateResult, FingerprintError> {
        use MustRunReason::*;

        if node.always_run() {
            return Ok(UpToDateResult::MustRun(AlwaysRun));
        }
        if self.rerun {
            return Ok(UpToDateResult::MustRun(RerunRequested));
        }

        let Some(stored) = stored else {
            return Ok(UpToDateResult::MustRun(NoHistory));
        };
        if stored.outcome == RecordedOutcome::Failed {
            return Ok(UpToDateResult::MustRun(PreviousFailure));
        }

        let changed = inputs.changed(&stored.input);
        if !changed.is_empty() {
            return Ok(UpToDateResult::MustRun(InputChanged(changed)));
        }

        if !node.outputs().is_empty() {
            let outputs = self.fingerprinter.fingerprint(node.outputs())?;
            let changed = outputs.changed(&stored.output);
            if !changed.is_empty() {
                return Ok(UpToDateResult::MustRun(OutputChangedExternally(changed)));
            }
        }

        Ok(UpToDateResult::UpToDate)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8Path;
    use tempfile::TempDir;

    use super::*;
    use crate::core::BuildId;
    use crate::task::Spec;

    struct Fixture {
        _dir: TempDir,
        fp: Fingerprinter,
        node: TaskNode,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let fp = Fingerprinter::new(Utf8Path::from_path(dir.path()).unwrap());
            fs::write(fp.root().join("in.txt"), "input").unwrap();
            fs::write(fp.root().join("out.txt"), "output").unwrap();

            let node = TaskNode::new(":copy")
                .input(Spec::file("in.txt"))
                .output(Spec::file("out.txt"))
                .lifecycle();

            Self { _dir: dir, fp, node }
        }

        fn record(&self, outcome: RecordedOutcome) -> TaskExecutionRecord {
            TaskExecutionRecord::new(
                self.fp.fingerprint(self.node.inputs()).unwrap(),
                self.fp.fingerprint(self.node.outputs()).unwrap(),
                outcome,
                BuildId::new(),
            )
        }

        fn result(&self, stored: Option<&TaskExecutionRecord>) -> UpToDateResult {
            UpToDateChecker::new(&self.fp)
                .check(&self.node, stored)
                .unwrap()
                .result
        }
    }

    #[test]
    fn test_no_history() {
        let fx = Fixture::new();
        assert_eq!(fx.result(None), UpToDateResult::MustRun(MustRunReason::NoHistory));
    }

    #[test]
    fn test_matching_record_is_up_to_date() {
        let fx = Fixture::new();
        let record = fx.record(RecordedOutcome::Executed);
        assert_eq!(fx.result(Some(&record)), UpToDateResult::UpToDate);
    }

    #[test]
    fn test_input_change_names_the_input() {
        let fx = Fixture::new();
        let record = fx.record(RecordedOutcome::Executed);
        fs::write(fx.fp.root().join("in.txt"), "inpuT").unwrap();

        assert_eq!(
            fx.result(Some(&record)),
            UpToDateResult::MustRun(MustRunReason::InputChanged(vec!["file:in.txt".into()]))
        );
    }

    #[test]
    fn test_deleted_output() {
        let fx = Fixture::new();
        let record = fx.record(RecordedOutcome::Executed);
        fs::remove_file(fx.fp.root().join("out.txt")).unwrap();

        assert_eq!(
            fx.result(Some(&record)),
            UpToDateResult::MustRun(MustRunReason::OutputChangedExternally(vec![
                "file:out.txt".into()
            ]))
        );
    }

    #[test]
    fn test_previous_failure() {
        let fx = Fixture::new();
        let record = fx.record(RecordedOutcome::Failed);
        assert_eq!(
            fx.result(Some(&record)),
            UpToDateResult::MustRun(MustRunReason::PreviousFailure)
        );
    }

    #[test]
    fn test_flags_win_over_history() {
        let fx = Fixture::new();
        let record = fx.record(RecordedOutcome::Executed);

        let check = UpToDateChecker::new(&fx.fp)
            .rerun(true)
            .check(&fx.node, Some(&record))
            .unwrap();
        assert_eq!(check.result, UpToDateResult::MustRun(MustRunReason::RerunRequested));
        assert_eq!(check.inputs, record.input);

        let always = TaskNode::new(":always").always_run().lifecycle();
        let check = UpToDateChecker::new(&fx.fp).check(&always, Some(&record)).unwrap();
        assert_eq!(check.result, UpToDateResult::MustRun(MustRunReason::AlwaysRun));
    }

    #[test]
    fn test_zero_outputs_judged_on_inputs() {
        let fx = Fixture::new();
        let node = TaskNode::new(":lint").input(Spec::file("in.txt")).lifecycle();
        let record = TaskExecutionRecord::new(
            fx.fp.fingerprint(node.inputs()).unwrap(),
            Fingerprint::default(),
            RecordedOutcome::Executed,
            BuildId::new(),
        );

        let checker = UpToDateChecker::new(&fx.fp);
        assert_eq!(checker.check(&node, Some(&record)).unwrap().result, UpToDateResult::UpToDate);

        fs::write(fx.fp.root().join("in.txt"), "changed").unwrap();
        assert!(matches!(
            checker.check(&node, Some(&record)).unwrap().result,
            UpToDateResult::MustRun(MustRunReason::InputChanged(_))
        ));
    }

    #[test]
    fn test_reason_display() {
        let reason = MustRunReason::InputChanged(vec!["file:a".into(), "property:b".into()]);
        assert_eq!(reason.to_string(), "input-changed (file:a, property:b)");
        assert_eq!(MustRunReason::NoHistory.to_string(), "no-history");
    }
}
