use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Bfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;
use weave_core::{short_id, TaskId, WeaveError, WeaveResult};

/// Counts reported by [`DependencyGraph::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub nodes: usize,
    pub edges: usize,
    /// Nodes with no dependencies.
    pub roots: usize,
    /// Nodes nothing depends on.
    pub leaves: usize,
    pub completed: usize,
}

/// Directed acyclic graph of task prerequisites.
///
/// Stored as a petgraph [`DiGraphMap`] with an edge `b -> a` whenever "a
/// depends on b", so edges point from prerequisite to dependent. Edges that
/// would close a cycle are rejected before they are stored, so the graph is
/// acyclic at all times. Node order is insertion order, which keeps ready sets
/// and layers stable.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraphMap<TaskId, ()>,
    order: Vec<TaskId>,
    completed: HashSet<TaskId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, id: TaskId) {
        if self.graph.contains_node(id) {
            return;
        }
        self.graph.add_node(id);
        self.order.push(id);
    }

    /// Record that `id` depends on `depends_on`.
    ///
    /// Both nodes must already exist. The edge is refused, leaving the graph
    /// untouched, when `depends_on` already (transitively) depends on `id`.
    pub fn add_dependency(&mut self, id: TaskId, depends_on: TaskId) -> WeaveResult<()> {
        for node in [id, depends_on] {
            if !self.contains(node) {
                return Err(WeaveError::Validation(format!(
                    "Unknown task {node} in dependency edge"
                )));
            }
        }
        if id == depends_on || has_path_connecting(&self.graph, id, depends_on, None) {
            return Err(WeaveError::CircularDependency(format!(
                "{} -> {} would close a cycle",
                short_id(&id),
                short_id(&depends_on)
            )));
        }

        self.graph.add_edge(depends_on, id, ());
        debug!(task = %short_id(&id), depends_on = %short_id(&depends_on), "Dependency added");
        Ok(())
    }

    pub fn remove_dependency(&mut self, id: TaskId, depends_on: TaskId) -> bool {
        self.graph.remove_edge(depends_on, id).is_some()
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: TaskId) -> bool {
        if !self.graph.remove_node(id) {
            return false;
        }
        self.order.retain(|n| *n != id);
        self.completed.remove(&id);
        true
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.graph.contains_node(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Node ids in insertion order.
    pub fn nodes(&self) -> &[TaskId] {
        &self.order
    }

    fn neighbors(&self, id: TaskId, direction: Direction) -> HashSet<TaskId> {
        if !self.contains(id) {
            return HashSet::new();
        }
        self.graph.neighbors_directed(id, direction).collect()
    }

    /// Direct prerequisites of `id`, in insertion order.
    pub fn dependencies_of(&self, id: TaskId) -> Vec<TaskId> {
        self.ordered(&self.neighbors(id, Direction::Incoming))
    }

    /// Nodes that directly depend on `id`, in insertion order.
    pub fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        self.ordered(&self.neighbors(id, Direction::Outgoing))
    }

    fn ordered(&self, set: &HashSet<TaskId>) -> Vec<TaskId> {
        self.order.iter().filter(|n| set.contains(n)).copied().collect()
    }

    /// Every node that depends on `id` directly or indirectly.
    pub fn transitive_dependents(&self, id: TaskId) -> Vec<TaskId> {
        if !self.contains(id) {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, id);
        while let Some(node) = bfs.next(&self.graph) {
            if node != id {
                seen.insert(node);
            }
        }
        self.ordered(&seen)
    }

    /// Whether every dependency of `id` is in `completed`.
    pub fn can_execute(&self, id: TaskId, completed: &HashSet<TaskId>) -> bool {
        self.contains(id)
            && self
                .graph
                .neighbors_directed(id, Direction::Incoming)
                .all(|d| completed.contains(&d))
    }

    /// Nodes not in `completed` whose dependencies all are.
    pub fn ready_nodes(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| !completed.contains(id) && self.can_execute(**id, completed))
            .copied()
            .collect()
    }

    /// Ready nodes against the graph's own completion set.
    pub fn ready(&self) -> Vec<TaskId> {
        self.ready_nodes(&self.completed)
    }

    pub fn mark_completed(&mut self, id: TaskId) -> bool {
        self.contains(id) && self.completed.insert(id)
    }

    pub fn is_completed(&self, id: TaskId) -> bool {
        self.completed.contains(&id)
    }

    pub fn completed(&self) -> &HashSet<TaskId> {
        &self.completed
    }

    /// Partition the graph into layers. Every node's dependencies sit in an
    /// earlier layer, so the nodes of one layer can run in parallel.
    pub fn execution_layers(&self) -> WeaveResult<Vec<Vec<TaskId>>> {
        let mut done = HashSet::new();
        let mut layers = Vec::new();

        while done.len() < self.order.len() {
            let layer = self.ready_nodes(&done);
            if layer.is_empty() {
                let stuck = self.order.len() - done.len();
                return Err(WeaveError::CircularDependency(format!(
                    "{stuck} task(s) can never become ready"
                )));
            }
            done.extend(layer.iter().copied());
            layers.push(layer);
        }
        Ok(layers)
    }

    /// Kahn's algorithm: every node appears after all of its dependencies.
    pub fn topological_order(&self) -> WeaveResult<Vec<TaskId>> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .order
            .iter()
            .map(|id| {
                let degree = self.graph.neighbors_directed(*id, Direction::Incoming).count();
                (*id, degree)
            })
            .collect();

        let mut queue: VecDeque<TaskId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(id) == Some(&0))
            .copied()
            .collect();

        let mut result = Vec::with_capacity(self.order.len());
        while let Some(node) = queue.pop_front() {
            result.push(node);
            for dependent in self.dependents_of(node) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if result.len() < self.order.len() {
            return Err(WeaveError::CircularDependency(format!(
                "topological order covers {} of {} tasks",
                result.len(),
                self.order.len()
            )));
        }
        Ok(result)
    }

    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn statistics(&self) -> GraphStatistics {
        let count_without = |direction| {
            self.graph
                .nodes()
                .filter(|n| self.graph.neighbors_directed(*n, direction).next().is_none())
                .count()
        };
        GraphStatistics {
            nodes: self.graph.node_count(),
            edges: self.graph.edge_count(),
            roots: count_without(Direction::Incoming),
            leaves: count_without(Direction::Outgoing),
            completed: self.completed.len(),
        }
    }

    pub fn clear(&mut self) {
        self.graph.clear();
        self.order.clear();
        self.completed.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn nodes(graph: &mut DependencyGraph, n: usize) -> Vec<TaskId> {
        (0..n)
            .map(|_| {
                let id = Uuid::new_v4();
                graph.add_node(id);
                id
            })
            .collect()
    }

    /// a <- b, a <- c, {b, c} <- d
    fn diamond() -> (DependencyGraph, [TaskId; 4]) {
        let mut g = DependencyGraph::new();
        let ids = nodes(&mut g, 4);
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        g.add_dependency(b, a).unwrap();
        g.add_dependency(c, a).unwrap();
        g.add_dependency(d, b).unwrap();
        g.add_dependency(d, c).unwrap();
        (g, [a, b, c, d])
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut g = DependencyGraph::new();
        let id = Uuid::new_v4();
        g.add_node(id);
        g.add_node(id);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let mut g = DependencyGraph::new();
        let ids = nodes(&mut g, 1);
        let err = g.add_dependency(ids[0], Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, WeaveError::Validation(_)));
    }

    #[test]
    fn test_diamond_layers() {
        let (g, [a, b, c, d]) = diamond();
        let layers = g.execution_layers().unwrap();
        assert_eq!(layers, vec![vec![a], vec![b, c], vec![d]]);
    }

    #[test]
    fn test_layers_partition_nodes() {
        let (g, _) = diamond();
        let layers = g.execution_layers().unwrap();
        let mut seen = HashSet::new();
        for (i, layer) in layers.iter().enumerate() {
            for node in layer {
                assert!(seen.insert(*node), "node appears twice");
                for dep in g.dependencies_of(*node) {
                    let dep_layer = layers.iter().position(|l| l.contains(&dep)).unwrap();
                    assert!(dep_layer < i);
                }
            }
        }
        assert_eq!(seen.len(), g.len());
    }

    #[test]
    fn test_cycle_rejected_graph_unchanged() {
        let (mut g, [a, _, _, d]) = diamond();
        let before = g.statistics();
        let err = g.add_dependency(a, d).unwrap_err();
        assert!(matches!(err, WeaveError::CircularDependency(_)));
        assert_eq!(g.statistics(), before);
        assert!(g.dependencies_of(a).is_empty());
        assert!(!g.has_cycle());
    }

    #[test]
    fn test_long_chain_cycle_rejected() {
        let mut g = DependencyGraph::new();
        let ids = nodes(&mut g, 5);
        for pair in ids.windows(2) {
            g.add_dependency(pair[1], pair[0]).unwrap();
        }
        let edges = g.statistics().edges;
        assert!(matches!(
            g.add_dependency(ids[0], ids[4]),
            Err(WeaveError::CircularDependency(_))
        ));
        assert_eq!(g.statistics().edges, edges);
        assert_eq!(g.topological_order().unwrap(), ids);
        assert!(!g.has_cycle());
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut g = DependencyGraph::new();
        let ids = nodes(&mut g, 1);
        assert!(matches!(
            g.add_dependency(ids[0], ids[0]),
            Err(WeaveError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_ready_nodes() {
        let (g, [a, b, c, d]) = diamond();
        assert_eq!(g.ready_nodes(&HashSet::new()), vec![a]);
        assert_eq!(g.ready_nodes(&HashSet::from([a])), vec![b, c]);
        assert_eq!(g.ready_nodes(&HashSet::from([a, b])), vec![c]);
        assert_eq!(g.ready_nodes(&HashSet::from([a, b, c])), vec![d]);
    }

    #[test]
    fn test_mark_completed_drives_ready() {
        let (mut g, [a, b, c, d]) = diamond();
        assert!(g.mark_completed(a));
        assert!(!g.mark_completed(a));
        assert_eq!(g.ready(), vec![b, c]);
        g.mark_completed(b);
        g.mark_completed(c);
        assert_eq!(g.ready(), vec![d]);
        assert!(!g.mark_completed(Uuid::new_v4()));
    }

    #[test]
    fn test_topological_order() {
        let (g, [a, b, c, d]) = diamond();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![a, b, c, d]);
        let pos = |id| order.iter().position(|n| *n == id).unwrap();
        for node in g.nodes() {
            for dep in g.dependencies_of(*node) {
                assert!(pos(dep) < pos(*node));
            }
        }
    }

    #[test]
    fn test_transitive_dependents() {
        let (g, [a, b, c, d]) = diamond();
        assert_eq!(g.transitive_dependents(a), vec![b, c, d]);
        assert_eq!(g.transitive_dependents(b), vec![d]);
        assert!(g.transitive_dependents(d).is_empty());
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let (mut g, [a, b, c, d]) = diamond();
        assert!(g.remove_node(b));
        assert_eq!(g.dependencies_of(d), vec![c]);
        assert_eq!(g.dependents_of(a), vec![c]);
        assert!(!g.remove_node(b));
        assert_eq!(g.statistics().edges, 2);
    }

    #[test]
    fn test_remove_dependency() {
        let (mut g, [a, b, _, _]) = diamond();
        assert!(g.remove_dependency(b, a));
        assert!(!g.remove_dependency(b, a));
        assert!(g.dependents_of(a).iter().all(|n| *n != b));
    }

    #[test]
    fn test_statistics() {
        let (mut g, [a, ..]) = diamond();
        g.mark_completed(a);
        let stats = g.statistics();
        assert_eq!(stats.nodes, 4);
        assert_eq!(stats.edges, 4);
        assert_eq!(stats.roots, 1);
        assert_eq!(stats.leaves, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_empty_graph() {
        let g = DependencyGraph::new();
        assert!(g.execution_layers().unwrap().is_empty());
        assert!(g.topological_order().unwrap().is_empty());
        assert!(g.is_empty());
    }

    #[test]
    fn test_clear() {
        let (mut g, _) = diamond();
        g.clear();
        assert!(g.is_empty());
        assert_eq!(g.statistics(), GraphStatistics::default());
    }
}
