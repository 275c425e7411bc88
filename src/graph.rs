//! The dependency graph of task nodes.
//!
//! Nodes live in a `petgraph` graph and are addressed by their [`TaskId`]
//! through an index, so edges are plain identity pairs and the graph owns
//! every node. An edge is stored pointing from the dependency to the
//! dependent: outgoing neighbours of a node are the tasks waiting on it,
//! incoming neighbours are the tasks it waits on.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::TaskId;
use crate::error::{CycleError, GraphError};
use crate::task::TaskNode;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    pub(crate) graph: Graph<Arc<TaskNode>, ()>,
    pub(crate) index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from fully declared nodes: all nodes are added first,
    /// then one edge per declared dependency.
    pub fn from_nodes(nodes: impl IntoIterator<Item = TaskNode>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        let mut declared = Vec::new();

        for node in nodes {
            let dependencies = node.dependencies.clone();
            let id = node.id.clone();
            graph.add_node(node)?;
            declared.push((id, dependencies));
        }

        for (id, dependencies) in declared {
            for dependency in dependencies {
                graph.add_edge(id.as_str(), dependency.as_str())?;
            }
        }

        Ok(graph)
    }

    /// Adds a node. Its declared dependencies are not wired here, see
    /// [`DependencyGraph::from_nodes`] or [`DependencyGraph::add_edge`].
    pub fn add_node(&mut self, node: TaskNode) -> Result<NodeIndex, GraphError> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::Duplicate(node.id));
        }

        let id = node.id.clone();
        let index = self.graph.add_node(Arc::new(node));
        self.index.insert(id, index);

        Ok(index)
    }

    /// Records that `dependent` must not start before `dependency` is done.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) -> Result<(), GraphError> {
        let unknown = || GraphError::UnknownDependency {
            dependent: dependent.into(),
            dependency: dependency.into(),
        };

        let a = *self.index.get(dependent).ok_or_else(unknown)?;
        let b = *self.index.get(dependency).ok_or_else(unknown)?;

        self.graph.update_edge(b, a, ());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&index| &*self.graph[index])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Identities in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.graph.node_indices().map(|index| &self.graph[index].id)
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &Arc<TaskNode> {
        &self.graph[index]
    }

    pub(crate) fn id(&self, index: NodeIndex) -> &TaskId {
        &self.graph[index].id
    }

    /// Direct dependencies, ordered by node insertion.
    pub(crate) fn dependencies_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(index, Direction::Incoming)
    }

    fn sorted_neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<_> = self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort_unstable();
        neighbors
    }

    /// Checks the whole graph for cycles.
    pub fn validate(&self) -> Result<(), CycleError> {
        self.validate_from(self.graph.node_indices())
    }

    /// Checks every node reachable from `roots` by following dependencies.
    ///
    /// Depth-first with on-stack marking, O(V+E). The first back edge found
    /// is reported: the cycle runs from the revisited node, through each
    /// node that depends on the next, back to the revisited node.
    pub(crate) fn validate_from(
        &self,
        roots: impl IntoIterator<Item = NodeIndex>,
    ) -> Result<(), CycleError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::New; self.graph.node_count()];
        // (node, its dependencies, next dependency to visit)
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();

        for root in roots {
            if marks[root.index()] != Mark::New {
                continue;
            }

            marks[root.index()] = Mark::OnStack;
            stack.push((root, self.dependencies_of(root), 0));

            while let Some((node, dependencies, cursor)) = stack.last_mut() {
                let Some(&next) = dependencies.get(*cursor) else {
                    marks[node.index()] = Mark::Done;
                    stack.pop();
                    continue;
                };
                *cursor += 1;

                match marks[next.index()] {
                    Mark::Done => {}
                    Mark::New => {
                        marks[next.index()] = Mark::OnStack;
                        stack.push((next, self.dependencies_of(next), 0));
                    }
                    Mark::OnStack => {
                        let start = stack
                            .iter()
                            .position(|(index, _, _)| *index == next)
                            .unwrap_or(0);

                        let mut cycle: Vec<TaskId> = stack[start..]
                            .iter()
                            .map(|(index, _, _)| self.id(*index).clone())
                            .collect();
                        cycle.push(self.id(next).clone());

                        return Err(CycleError { cycle });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn graph(edges: &[(&str, &str)], nodes: &[&str]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for &id in nodes {
            graph.add_node(TaskNode::new(id).lifecycle()).unwrap();
        }
        for &(dependent, dependency) in edges {
            graph.add_edge(dependent, dependency).unwrap();
        }
        graph
    }

    /// Following "depends on" from each entry must reach the next one.
    fn assert_is_cycle(graph: &DependencyGraph, cycle: &[TaskId]) {
        assert!(cycle.len() >= 2);
        assert_eq!(cycle.first(), cycle.last());
        for pair in cycle.windows(2) {
            let from = graph.lookup(pair[0].as_str()).unwrap();
            let to = graph.lookup(pair[1].as_str()).unwrap();
            assert!(graph.dependencies_of(from).contains(&to), "{pair:?}");
        }
    }

    #[test]
    fn test_acyclic_validates() {
        let g = graph(&[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")], &["a", "b", "c", "d"]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_self_loop() {
        let g = graph(&[("a", "a")], &["a"]);
        let err = g.validate().unwrap_err();
        assert_eq!(err.cycle, vec![TaskId::new("a"), TaskId::new("a")]);
    }

    #[test]
    fn test_cycle_reported_in_order() {
        let g = graph(
            &[("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")],
            &["d", "a", "b", "c"],
        );
        let err = g.validate().unwrap_err();
        assert_is_cycle(&g, &err.cycle);
        assert_eq!(err.cycle.len(), 4);
        assert!(!err.cycle.contains(&TaskId::new("d")));
    }

    #[test]
    fn test_cycle_outside_roots_is_ignored() {
        let g = graph(&[("x", "y"), ("y", "x")], &["a", "x", "y"]);
        let a = g.lookup("a").unwrap();
        assert!(g.validate_from([a]).is_ok());
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_duplicate_node() {
        let mut g = graph(&[], &["a"]);
        let err = g.add_node(TaskNode::new("a").lifecycle()).unwrap_err();
        assert_eq!(err, GraphError::Duplicate("a".into()));
    }

    #[test]
    fn test_unknown_edge_endpoint() {
        let mut g = graph(&[], &["a"]);
        assert!(matches!(
            g.add_edge("a", "missing"),
            Err(GraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_dependencies_follow_node_order_not_edge_order() {
        let g = DependencyGraph::from_nodes([
            TaskNode::new("a").lifecycle(),
            TaskNode::new("b").lifecycle(),
            TaskNode::new("c").depends_on("b").depends_on("a").lifecycle(),
        ])
        .unwrap();

        let [a, b, c] = ["a", "b", "c"].map(|id| g.lookup(id).unwrap());
        assert_eq!(g.dependencies_of(c), vec![a, b]);
    }

    #[test]
    fn test_from_nodes_wires_declared_dependencies() {
        let g = DependencyGraph::from_nodes([
            TaskNode::new("b").depends_on("a").lifecycle(),
            TaskNode::new("a").lifecycle(),
        ])
        .unwrap();

        let a = g.lookup("a").unwrap();
        let b = g.lookup("b").unwrap();
        assert_eq!(g.dependencies_of(b), vec![a]);
    }

    proptest! {
        // Edges only ever point from a later node to an earlier one, so the
        // generated graph is acyclic by construction.
        #[test]
        fn forward_edges_always_validate(
            n in 1usize..24,
            raw in proptest::collection::vec((0usize..24, 0usize..24), 0..64),
        ) {
            let names: Vec<String> = (0..n).map(|i| format!("t{i}")).collect();
            let mut g = DependencyGraph::new();
            for name in &names {
                g.add_node(TaskNode::new(name.as_str()).lifecycle()).unwrap();
            }
            for (a, b) in raw {
                let (a, b) = (a % n, b % n);
                if a > b {
                    g.add_edge(&names[a], &names[b]).unwrap();
                }
            }
            prop_assert!(g.validate().is_ok());
        }

        #[test]
        fn back_edge_is_always_reported(n in 2usize..16) {
            let names: Vec<String> = (0..n).map(|i| format!("t{i}")).collect();
            let mut g = DependencyGraph::new();
            for name in &names {
                g.add_node(TaskNode::new(name.as_str()).lifecycle()).unwrap();
            }
            for i in 1..n {
                g.add_edge(&names[i], &names[i - 1]).unwrap();
            }
            g.add_edge(&names[0], &names[n - 1]).unwrap();

            let err = g.validate().unwrap_err();
            prop_assert_eq!(err.cycle.len(), n + 1);
            assert_is_cycle(&g, &err.cycle);
        }
    }
}
