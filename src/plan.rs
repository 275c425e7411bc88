use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::graph::NodeIndex;

use crate::core::TaskId;
use crate::error::{EngineError, UnknownTargetError};
use crate::graph::DependencyGraph;

/// Bookkeeping for one node of an [`ExecutionPlan`].
#[derive(Debug, Clone)]
pub(crate) struct PlanEntry {
    /// Dependencies inside the plan.
    pub dependencies: Vec<NodeIndex>,
    /// Dependents inside the plan, ordered by node insertion.
    pub dependents: Vec<NodeIndex>,
    /// Number of unresolved dependencies when the run starts.
    pub indegree: usize,
    /// Pre-skipped by the exclusion filter.
    pub excluded: bool,
}

/// The validated subgraph needed to reach the requested targets.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub(crate) entries: HashMap<NodeIndex, PlanEntry>,
    /// Topological order, ready-FIFO, ties broken by insertion order.
    pub(crate) order: Vec<NodeIndex>,
    ids: Vec<TaskId>,
    excluded: Vec<TaskId>,
}

impl ExecutionPlan {
    /// Every identity in the plan, in the order a sequential run dispatches
    /// them. Excluded nodes are not part of this list.
    pub fn task_order(&self) -> &[TaskId] {
        &self.ids
    }

    /// Nodes that stay in the plan only as `skipped(excluded-by-filter)`.
    pub fn excluded(&self) -> &[TaskId] {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, index: NodeIndex) -> Option<&PlanEntry> {
        self.entries.get(&index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().chain(&self.excluded).any(|task| task.as_str() == id)
    }
}

fn resolve(graph: &DependencyGraph, ids: &[TaskId]) -> Result<Vec<NodeIndex>, UnknownTargetError> {
    ids.iter()
        .map(|id| {
            graph
                .lookup(id.as_str())
                .ok_or_else(|| UnknownTargetError { id: id.clone() })
        })
        .collect()
}

/// Filters the graph down to the requested targets plus their transitive
/// dependencies.
///
/// An excluded node reached from the targets stays in the plan as a
/// pre-skipped node, so its dependents still see a terminal predecessor. The
/// walk does not continue through it: its own dependencies are only planned
/// when some non-excluded node needs them too.
pub fn build_plan(
    graph: &DependencyGraph,
    targets: &[TaskId],
    exclusions: &[TaskId],
) -> Result<ExecutionPlan, EngineError> {
    let requested = resolve(graph, targets)?;
    let excluded: HashSet<NodeIndex> = resolve(graph, exclusions)?.into_iter().collect();

    graph.validate_from(requested.iter().copied())?;

    // Backwards walk over dependencies, stopping at excluded nodes.
    let mut closure: BTreeSet<NodeIndex> = BTreeSet::new();
    let mut queue: VecDeque<NodeIndex> = VecDeque::new();
    for &index in &requested {
        if closure.insert(index) {
            queue.push_back(index);
        }
    }
    while let Some(index) = queue.pop_front() {
        if excluded.contains(&index) {
            continue;
        }
        for dependency in graph.dependencies_of(index) {
            if closure.insert(dependency) {
                queue.push_back(dependency);
            }
        }
    }

    let mut entries: HashMap<NodeIndex, PlanEntry> = HashMap::with_capacity(closure.len());
    for &index in &closure {
        let is_excluded = excluded.contains(&index);
        let dependencies = if is_excluded {
            Vec::new()
        } else {
            graph
                .dependencies_of(index)
                .into_iter()
                .filter(|dependency| closure.contains(dependency))
                .collect()
        };

        entries.insert(
            index,
            PlanEntry {
                indegree: dependencies.len(),
                dependencies,
                dependents: Vec::new(),
                excluded: is_excluded,
            },
        );
    }

    // Edges leaving an excluded node were dropped above, so dependents are
    // derived from the filtered dependency lists rather than from the graph.
    for &index in &closure {
        let dependencies = entries[&index].dependencies.clone();
        for dependency in dependencies {
            if let Some(entry) = entries.get_mut(&dependency) {
                entry.dependents.push(index);
            }
        }
    }
    for entry in entries.values_mut() {
        entry.dependents.sort_unstable();
    }

    let order = simulate_sequential(&closure, &entries);

    let ids = order
        .iter()
        .filter(|index| !entries[*index].excluded)
        .map(|&index| graph.id(index).clone())
        .collect();

    let excluded = closure
        .iter()
        .filter(|index| entries[*index].excluded)
        .map(|&index| graph.id(index).clone())
        .collect();

    Ok(ExecutionPlan {
        entries,
        order,
        ids,
        excluded,
    })
}

/// Kahn's algorithm with a FIFO ready queue: the order a single worker would
/// dispatch the plan if every node succeeded. Excluded nodes settle first.
fn simulate_sequential(
    closure: &BTreeSet<NodeIndex>,
    entries: &HashMap<NodeIndex, PlanEntry>,
) -> Vec<NodeIndex> {
    let mut indegree: HashMap<NodeIndex, usize> =
        entries.iter().map(|(&i, e)| (i, e.indegree)).collect();

    let mut ready: VecDeque<NodeIndex> = closure
        .iter()
        .copied()
        .filter(|i| entries[i].excluded)
        .collect();
    ready.extend(
        closure
            .iter()
            .copied()
            .filter(|i| !entries[i].excluded && entries[i].indegree == 0),
    );

    let mut order = Vec::with_capacity(closure.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for dependent in &entries[&index].dependents {
            if let Some(count) = indegree.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    order
}
