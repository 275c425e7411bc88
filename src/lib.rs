#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod checker;
mod core;
mod engine;
mod error;
mod fingerprint;
mod graph;
#[cfg(feature = "logging")]
pub mod logging;
mod outcome;
mod plan;
mod store;
mod task;

pub use crate::cache::{BuildCache, LocalCache, OutputBundle, cache_key};
pub use crate::checker::{Check, MustRunReason, UpToDateChecker, UpToDateResult};
pub use crate::core::{BuildId, Hash32, TaskId};
pub use crate::engine::{
    CancelToken, Engine, FailurePolicy, NodeState, ProgressEvent, RunOptions, SkipReason,
};
pub use crate::error::*;
pub use crate::fingerprint::{Fingerprint, Fingerprinter, SpecFingerprint, TreeEntry};
pub use crate::graph::DependencyGraph;
pub use crate::outcome::{BuildResult, FailedTask, TaskExecution};
pub use crate::plan::{ExecutionPlan, build_plan};
pub use crate::store::{
    FileStore, MemoryStore, RecordedOutcome, TaskExecutionRecord, TaskStateStore,
};
pub use crate::task::{Action, Spec, TaskContext, TaskDef, TaskNode};
