use super::error::ResolutionError;
use super::registry::backend::BackendHandle;
use super::registry::functor::Implementation;
use crate::core::models::ids::FunctorId;
use crate::core::options::Options;
use crate::core::types::value::TypeTag;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

pub type NodeId = NodeIndex;

/// Why one node must run before another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    /// The target reads the source's value.
    Dependency,
    /// The target is nested in the loop the source manages.
    LoopManager,
    /// A nested functor's outside dependency, attached to its loop manager.
    Forced,
}

#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub capability: String,
    pub type_tag: TypeTag,
    pub node: NodeId,
}

/// Printing and likelihood metadata of one requested observable.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub label: String,
    pub purpose: String,
    pub printme: bool,
    /// Stable index of the observable within the request.
    pub capability_id: usize,
}

/// An activated functor with everything resolution decided for it.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub functor: FunctorId,
    pub origin: String,
    pub function: String,
    pub capability: String,
    pub type_tag: TypeTag,
    pub implementation: Implementation,
    pub dependencies: Vec<ResolvedDependency>,
    pub backends: BTreeMap<String, BackendHandle>,
    pub loop_manager: Option<NodeId>,
    /// Functors run by this loop manager, in execution order.
    pub nested: Vec<NodeId>,
    pub options: Options,
    pub outputs: Vec<OutputSpec>,
}

impl GraphNode {
    pub fn label(&self) -> String {
        format!("{}::{}", self.origin, self.function)
    }

    pub fn is_loop_manager(&self) -> bool {
        matches!(self.implementation, Implementation::LoopManager(_))
    }

    pub fn is_nested(&self) -> bool {
        self.loop_manager.is_some()
    }
}

/// The resolved, acyclic graph of activated functors for one run.
///
/// Immutable once built. Node ids index directly into per-point value slots.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<GraphNode, EdgeKind>,
    order: Vec<NodeId>,
    outputs: Vec<(NodeId, usize)>,
    lineages: Vec<Vec<String>>,
}

impl DependencyGraph {
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.graph[id]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn active_models(&self) -> impl Iterator<Item = &str> {
        self.lineages
            .iter()
            .filter_map(|lineage| lineage.first().map(String::as_str))
    }

    /// The active model that is, or descends from, `model`.
    pub fn active_descendant_of(&self, model: &str) -> Option<&str> {
        self.lineages
            .iter()
            .find(|lineage| lineage.iter().any(|m| m == model))
            .and_then(|lineage| lineage.first().map(String::as_str))
    }

    /// A deterministic topological order of every node, loop-nested ones included.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Providers this node reads from, in the order its dependencies were declared.
    pub fn dependencies_of(&self, id: NodeId) -> Vec<NodeId> {
        self.graph[id].dependencies.iter().map(|d| d.node).collect()
    }

    pub fn predecessors(&self, id: NodeId) -> Vec<(NodeId, EdgeKind)> {
        let mut preds: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect();
        preds.sort();
        preds
    }

    /// Every edge as `(from, to, kind)`, sorted.
    pub fn edges(&self) -> Vec<(NodeId, NodeId, EdgeKind)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| (e.source(), e.target(), *e.weight()))
            .collect();
        edges.sort();
        edges
    }

    /// Requested observables as `(node, output)` pairs ordered by capability id.
    pub fn outputs(&self) -> impl Iterator<Item = (NodeId, &OutputSpec)> {
        self.outputs
            .iter()
            .map(|&(id, slot)| (id, &self.graph[id].outputs[slot]))
    }

    pub fn find(&self, capability: &str) -> Option<NodeId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.graph[id].capability == capability)
    }

    /// `(backend, version)` pairs bound anywhere in the graph.
    pub fn required_backends(&self) -> BTreeSet<(String, String)> {
        self.graph
            .node_weights()
            .flat_map(|n| n.backends.values())
            .map(|h| (h.entry().backend.clone(), h.entry().version.clone()))
            .collect()
    }

    pub fn describe_order(&self) -> String {
        let mut out = String::from("Functor evaluation order:\n");
        for (i, &id) in self.order.iter().enumerate() {
            let node = &self.graph[id];
            let _ = write!(
                out,
                "{:>4}. {} [{}] <- {}",
                i + 1,
                node.capability,
                node.type_tag,
                node.label()
            );
            if let Some(manager) = node.loop_manager {
                let _ = write!(out, "  (loop: {})", self.graph[manager].capability);
            }
            for (name, handle) in &node.backends {
                let _ = write!(out, "\n        backend {name} -> {}", handle.entry().label());
            }
            out.push('\n');
        }
        out
    }

    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph capgraph {\n  rankdir=LR;\n");
        for &id in &self.order {
            let node = &self.graph[id];
            let shape = if node.is_loop_manager() { "box" } else { "ellipse" };
            let _ = writeln!(
                out,
                "  n{} [shape={shape}, label=\"{}\\n{} [{}]\"];",
                id.index(),
                node.label(),
                node.capability,
                node.type_tag
            );
        }
        for (from, to, kind) in self.edges() {
            let style = match kind {
                EdgeKind::Dependency => "solid",
                EdgeKind::LoopManager => "bold",
                EdgeKind::Forced => "dashed",
            };
            let _ = writeln!(
                out,
                "  n{} -> n{} [style={style}];",
                from.index(),
                to.index()
            );
        }
        out.push_str("}\n");
        out
    }
}

/// Mutable graph used while resolution is in progress. Dropped on error, so a failed
/// resolution never leaves a partial graph behind.
#[derive(Default)]
pub(crate) struct GraphBuilder {
    graph: DiGraph<GraphNode, EdgeKind>,
}

impl GraphBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_node(&mut self, node: GraphNode) -> NodeId {
        self.graph.add_node(node)
    }

    pub(crate) fn node(&self, id: NodeId) -> &GraphNode {
        &self.graph[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut GraphNode {
        &mut self.graph[id]
    }

    /// Adds `from -> to` unless an edge between the two already exists.
    pub(crate) fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, kind);
        }
    }

    /// Sorts the graph and freezes it. `lineages` holds each active model followed by
    /// its ancestors.
    pub(crate) fn finish(
        mut self,
        lineages: Vec<Vec<String>>,
    ) -> Result<DependencyGraph, ResolutionError> {
        let order = self.sorted()?;
        let position: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let managers: Vec<NodeId> = self
            .graph
            .node_indices()
            .filter(|&id| self.graph[id].is_loop_manager())
            .collect();
        for manager in managers {
            let mut nested: Vec<NodeId> = self
                .graph
                .node_indices()
                .filter(|&id| self.graph[id].loop_manager == Some(manager))
                .collect();
            nested.sort_by_key(|id| position[id]);
            self.graph[manager].nested = nested;
        }

        let mut outputs: Vec<(NodeId, usize)> = self
            .graph
            .node_indices()
            .flat_map(|id| (0..self.graph[id].outputs.len()).map(move |slot| (id, slot)))
            .collect();
        outputs.sort_by_key(|&(id, slot)| self.graph[id].outputs[slot].capability_id);

        Ok(DependencyGraph {
            graph: self.graph,
            order,
            outputs,
            lineages,
        })
    }

    /// Kahn's algorithm, always taking the lowest-indexed ready node.
    fn sorted(&self) -> Result<Vec<NodeId>, ResolutionError> {
        let mut indegree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|id| self.graph.edges_directed(id, Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<NodeId> = self
            .graph
            .node_indices()
            .filter(|id| indegree[id.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for next in self.graph.neighbors_directed(id, Direction::Outgoing) {
                indegree[next.index()] -= 1;
                if indegree[next.index()] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            Err(ResolutionError::CyclicDependency {
                chain: self.find_cycle(&indegree),
            })
        }
    }

    fn find_cycle(&self, indegree: &[usize]) -> Vec<String> {
        let Some(start) = self
            .graph
            .node_indices()
            .find(|id| indegree[id.index()] > 0)
        else {
            return Vec::new();
        };

        // Walk backwards along unresolved edges: every node left with a positive indegree
        // has a predecessor that is also unresolved, so the walk must revisit a node.
        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(prev) = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .find(|p| indegree[p.index()] > 0)
            else {
                return path.iter().map(|&id| self.graph[id].label()).collect();
            };
            if let Some(pos) = path.iter().position(|&id| id == prev) {
                let mut cycle: Vec<NodeId> = path[pos..].to_vec();
                cycle.reverse();
                cycle.push(cycle[0]);
                return cycle.iter().map(|&id| self.graph[id].label()).collect();
            }
            path.push(prev);
            current = prev;
        }
    }
}
