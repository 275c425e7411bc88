//! Task declarations consumed by the engine.
//!
//! A [`TaskNode`] is handed over fully resolved by the configuration layer:
//! its identity, the files, trees and properties it reads and writes, the
//! identities it depends on and the [`Action`] to run. The engine never looks
//! inside the action; it only decides whether to call it.

use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::TaskId;
use crate::engine::CancelToken;

/// A single declared input or output of a task.
///
/// Paths are resolved against the engine root when relative.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Spec {
    /// A single file; its bytes are hashed.
    File(Utf8PathBuf),
    /// A directory tree; every entry below it is hashed by relative path.
    Tree(Utf8PathBuf),
    /// A scalar value, stored in its canonical JSON serialization.
    Property { name: String, value: String },
}

impl Spec {
    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        Spec::File(path.into())
    }

    pub fn tree(path: impl Into<Utf8PathBuf>) -> Self {
        Spec::Tree(path.into())
    }

    /// Declares a property input. The value is serialized to JSON; objects
    /// serialize with sorted keys, so equal values always produce equal text.
    pub fn property<T>(name: impl Into<String>, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        Ok(Spec::Property {
            name: name.into(),
            value: serde_json::to_string(value)?,
        })
    }

    /// The key under which this spec appears in a fingerprint.
    pub fn key(&self) -> String {
        match self {
            Spec::File(path) => format!("file:{path}"),
            Spec::Tree(path) => format!("tree:{path}"),
            Spec::Property { name, .. } => format!("property:{name}"),
        }
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        match self {
            Spec::File(path) | Spec::Tree(path) => Some(path),
            Spec::Property { .. } => None,
        }
    }
}

/// Everything an action may look at while it runs.
pub struct TaskContext<'a> {
    /// Identity of the running task.
    pub id: &'a TaskId,
    /// Base directory used to resolve relative spec paths.
    pub root: &'a Utf8Path,
    pub(crate) cancel: &'a CancelToken,
    pub(crate) span: tracing::Span,
}

impl TaskContext<'_> {
    /// Resolves a path the same way declared specs are resolved.
    pub fn path(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.root.join(path)
    }

    /// Long-running actions should poll this and return early once the
    /// invocation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The tracing span the task runs in.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// The executable part of a task.
///
/// Implemented for every `Fn(&TaskContext) -> anyhow::Result<()>` closure.
pub trait Action: Send + Sync {
    fn execute(&self, context: &TaskContext<'_>) -> anyhow::Result<()>;
}

impl<F> Action for F
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, context: &TaskContext<'_>) -> anyhow::Result<()> {
        self(context)
    }
}

/// A unit of work in the dependency graph.
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) id: TaskId,
    pub(crate) inputs: Vec<Spec>,
    pub(crate) outputs: Vec<Spec>,
    pub(crate) dependencies: Vec<TaskId>,
    pub(crate) always_run: bool,
    pub(crate) action: Arc<dyn Action>,
}

impl TaskNode {
    /// Starts declaring a task with the given identity.
    pub fn new(id: impl Into<TaskId>) -> TaskDef {
        TaskDef {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            always_run: false,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn inputs(&self) -> &[Spec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Spec] {
        &self.outputs
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub fn always_run(&self) -> bool {
        self.always_run
    }

    pub(crate) fn action(&self) -> &dyn Action {
        &*self.action
    }
}

impl Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dependencies", &self.dependencies)
            .field("always_run", &self.always_run)
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`TaskNode::new`]. Finish it with [`TaskDef::run`] or
/// [`TaskDef::lifecycle`].
///
/// # Example
///
/// ```rust
/// use kumitate::{Spec, TaskNode};
///
/// let compile = TaskNode::new(":compile")
///     .input(Spec::tree("src"))
///     .output(Spec::file("build/app"))
///     .depends_on(":generate")
///     .run(|ctx| {
///         std::fs::create_dir_all(ctx.path("build"))?;
///         std::fs::write(ctx.path("build/app"), b"binary")?;
///         Ok(())
///     });
///
/// assert_eq!(compile.id().as_str(), ":compile");
/// ```
#[derive(Debug)]
pub struct TaskDef {
    id: TaskId,
    inputs: Vec<Spec>,
    outputs: Vec<Spec>,
    dependencies: Vec<TaskId>,
    always_run: bool,
}

impl TaskDef {
    pub fn input(mut self, spec: Spec) -> Self {
        push_spec(&mut self.inputs, spec);
        self
    }

    pub fn inputs(mut self, specs: impl IntoIterator<Item = Spec>) -> Self {
        for spec in specs {
            push_spec(&mut self.inputs, spec);
        }
        self
    }

    pub fn output(mut self, spec: Spec) -> Self {
        push_spec(&mut self.outputs, spec);
        self
    }

    pub fn outputs(mut self, specs: impl IntoIterator<Item = Spec>) -> Self {
        for spec in specs {
            push_spec(&mut self.outputs, spec);
        }
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        push_unique(&mut self.dependencies, dependency.into());
        self
    }

    /// Skip the up-to-date check entirely; the task runs on every invocation.
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn run<F>(self, callback: F) -> TaskNode
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action(Arc::new(callback))
    }

    pub fn action(self, action: Arc<dyn Action>) -> TaskNode {
        TaskNode {
            id: self.id,
            inputs: self.inputs,
            outputs: self.outputs,
            dependencies: self.dependencies,
            always_run: self.always_run,
            action,
        }
    }

    /// A task without an action of its own, used to aggregate dependencies.
    pub fn lifecycle(self) -> TaskNode {
        self.run(|_| Ok(()))
    }
}

/// A later declaration replaces an earlier one with the same key.
fn push_spec(specs: &mut Vec<Spec>, spec: Spec) {
    let key = spec.key();
    match specs.iter_mut().find(|existing| existing.key() == key) {
        Some(existing) => *existing = spec,
        None => specs.push(spec),
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_sets_are_ordered_and_unique() {
        let node = TaskNode::new("t")
            .input(Spec::file("b"))
            .input(Spec::file("a"))
            .input(Spec::file("b"))
            .depends_on("x")
            .depends_on("x")
            .lifecycle();

        assert_eq!(node.inputs(), &[Spec::file("b"), Spec::file("a")]);
        assert_eq!(node.dependencies(), &[TaskId::new("x")]);
        assert!(!node.always_run());
    }

    #[test]
    fn test_redeclared_property_replaces_earlier_value() {
        let node = TaskNode::new("t")
            .input(Spec::property("opt", &1).unwrap())
            .input(Spec::file("a"))
            .inputs([Spec::property("opt", &2).unwrap()])
            .lifecycle();

        assert_eq!(
            node.inputs(),
            &[Spec::property("opt", &2).unwrap(), Spec::file("a")]
        );
    }

    #[test]
    fn test_property_is_canonical() {
        let a = Spec::property("opts", &serde_json::json!({"b": 1, "a": [1, 2]})).unwrap();
        let b = Spec::property("opts", &serde_json::json!({"a": [1, 2], "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), "property:opts");
    }

    #[test]
    fn test_spec_keys() {
        assert_eq!(Spec::file("src/main.rs").key(), "file:src/main.rs");
        assert_eq!(Spec::tree("src").key(), "tree:src");
        assert_eq!(Spec::tree("src").path(), Some(Utf8Path::new("src")));
    }
}
