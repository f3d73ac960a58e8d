//! Builder for a batch of actions and the dependency edges between them.

use std::sync::Arc;

use super::action::{ActionId, ActionRef};
use super::observer::ActionObserver;

/// Position of an action inside one [`ActionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

pub(crate) struct GraphNode {
    pub(crate) action: ActionRef,
    /// Edges to other nodes of the same graph.
    pub(crate) depends_on: Vec<NodeId>,
    /// Edges to actions dispatched earlier.
    pub(crate) after: Vec<ActionId>,
    /// Observers notified for this action only, after the dispatcher-wide ones.
    pub(crate) observers: Vec<Arc<dyn ActionObserver>>,
}

/// Actions plus dependency edges, dispatched together with
/// [`Dispatcher::dispatch_graph`](super::Dispatcher::dispatch_graph).
///
/// Edges point from dependent to dependency. Nothing runs until the whole
/// graph has been checked for cycles.
#[derive(Default)]
pub struct ActionGraph {
    pub(crate) nodes: Vec<GraphNode>,
}

impl ActionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: ActionRef) -> NodeId {
        self.nodes.push(GraphNode {
            action,
            depends_on: Vec::new(),
            after: Vec::new(),
            observers: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    /// `dependent` may not start before `dependency` is terminal.
    pub fn depends_on(&mut self, dependent: NodeId, dependency: NodeId) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(dependent.0) {
            if !node.depends_on.contains(&dependency) {
                node.depends_on.push(dependency);
            }
        }
        self
    }

    /// `dependent` may not start before the already dispatched `action` is
    /// terminal.
    pub fn after(&mut self, dependent: NodeId, action: ActionId) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(dependent.0) {
            if !node.after.contains(&action) {
                node.after.push(action);
            }
        }
        self
    }

    /// Attach an observer to a single action.
    pub fn observe(&mut self, node: NodeId, observer: Arc<dyn ActionObserver>) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(node.0) {
            node.observers.push(observer);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edge to a node that does not exist in this graph, if any.
    pub(crate) fn dangling_edge(&self) -> Option<(NodeId, NodeId)> {
        self.nodes.iter().enumerate().find_map(|(i, node)| {
            node.depends_on
                .iter()
                .find(|dep| dep.0 >= self.nodes.len())
                .map(|dep| (NodeId(i), *dep))
        })
    }

    /// A node that sits on a dependency cycle, if any.
    ///
    /// Iterative three-colour DFS so deep chains cannot overflow the stack.
    pub(crate) fn find_cycle(&self) -> Option<NodeId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            marks[root] = Mark::InProgress;
            while let Some((node, edge)) = stack.pop() {
                let deps = &self.nodes[node].depends_on;
                if edge < deps.len() {
                    stack.push((node, edge + 1));
                    let next = deps[edge].0;
                    match marks.get(next) {
                        Some(Mark::InProgress) => return Some(NodeId(next)),
                        Some(Mark::Unvisited) => {
                            marks[next] = Mark::InProgress;
                            stack.push((next, 0));
                        }
                        Some(Mark::Done) | None => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ActionFn;

    fn noop(name: &'static str) -> ActionRef {
        ActionFn::arc(name, |_ctx| async { Ok(()) })
    }

    #[test]
    fn acyclic_diamond_has_no_cycle() {
        let mut g = ActionGraph::new();
        let a = g.add(noop("a"));
        let b = g.add(noop("b"));
        let c = g.add(noop("c"));
        let d = g.add(noop("d"));
        g.depends_on(b, a).depends_on(c, a);
        g.depends_on(d, b).depends_on(d, c);
        assert_eq!(g.find_cycle(), None);
    }

    #[test]
    fn transitive_cycle_is_found() {
        let mut g = ActionGraph::new();
        let a = g.add(noop("a"));
        let b = g.add(noop("b"));
        let c = g.add(noop("c"));
        g.depends_on(a, b).depends_on(b, c).depends_on(c, a);
        assert!(g.find_cycle().is_some());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut g = ActionGraph::new();
        let a = g.add(noop("a"));
        g.depends_on(a, a);
        assert_eq!(g.find_cycle(), Some(a));
    }

    #[test]
    fn duplicate_edges_are_collapsed() {
        let mut g = ActionGraph::new();
        let a = g.add(noop("a"));
        let b = g.add(noop("b"));
        g.depends_on(b, a).depends_on(b, a);
        assert_eq!(g.nodes[b.0].depends_on, vec![a]);
    }

    #[test]
    fn foreign_node_id_is_dangling() {
        let mut other = ActionGraph::new();
        other.add(noop("x"));
        let foreign = other.add(noop("y"));

        let mut g = ActionGraph::new();
        let a = g.add(noop("a"));
        g.depends_on(a, foreign);
        assert_eq!(g.dangling_edge(), Some((a, foreign)));
    }
}
