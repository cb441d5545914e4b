//! Resource graph construction.
//!
//! Nodes are declared specs; an edge `A -> B` means B references A and
//! therefore depends on it. Node indices follow declaration order, which is
//! used to break ties everywhere an order is derived from the graph.

use crate::config::{ResourceId, ResourceSpec};
use crate::error::{CirrusError, Result, ValidationError};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::debug;

use super::reference::extract_references;

/// Directed acyclic graph of declared resources.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    graph: DiGraph<ResourceSpec, ()>,
    indices: HashMap<ResourceId, NodeIndex>,
    ids: Vec<ResourceId>,
    order: Vec<NodeIndex>,
}

impl ResourceGraph {
    /// Builds the graph from declared specs.
    ///
    /// Pure: the specs are cloned into the graph and nothing else is touched.
    ///
    /// # Errors
    ///
    /// Returns a validation error for duplicate identities, malformed or
    /// dangling references, and cycles (self-references included).
    pub fn build(specs: &[ResourceSpec]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(specs.len(), specs.len());
        let mut indices = HashMap::with_capacity(specs.len());
        let mut ids = Vec::with_capacity(specs.len());

        for spec in specs {
            let id = spec.id();
            if indices.contains_key(&id) {
                return Err(CirrusError::Validation(ValidationError::DuplicateResource {
                    resource: id.to_string(),
                }));
            }
            let idx = graph.add_node(spec.clone());
            indices.insert(id.clone(), idx);
            ids.push(id);
        }

        for spec in specs {
            let id = spec.id();
            let to = indices[&id];
            for reference in extract_references(&id, &spec.attributes)? {
                let Some(&from) = indices.get(&reference.target) else {
                    return Err(CirrusError::Validation(ValidationError::MissingReference {
                        resource: id.to_string(),
                        target: reference.target.to_string(),
                        expression: reference.expression,
                    }));
                };
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut built = Self {
            graph,
            indices,
            ids,
            order: Vec::new(),
        };
        built.check_cycles()?;
        built.order = built.kahn_order();

        debug!(
            "Built resource graph: {} nodes, {} edges",
            built.graph.node_count(),
            built.graph.edge_count()
        );
        Ok(built)
    }

    fn check_cycles(&self) -> Result<()> {
        let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .map(|mut scc| {
                scc.sort_unstable();
                scc
            })
            .collect();

        if cycles.is_empty() {
            return Ok(());
        }

        // Report the cycle holding the earliest-declared member
        cycles.sort_unstable_by_key(|scc| scc[0]);
        let members = cycles[0]
            .iter()
            .map(|idx| self.ids[idx.index()].to_string())
            .collect();

        Err(CirrusError::Validation(ValidationError::CyclicDependency {
            members,
        }))
    }

    /// Kahn's algorithm with a min-heap on declaration index.
    fn kahn_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
        order
    }

    fn index_of(&self, id: &ResourceId) -> Option<NodeIndex> {
        self.indices.get(id).copied()
    }

    fn ids_sorted(&self, mut nodes: Vec<NodeIndex>) -> Vec<&ResourceId> {
        nodes.sort_unstable();
        nodes.dedup();
        nodes.into_iter().map(|idx| &self.ids[idx.index()]).collect()
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if no resources were declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns true if the identity is declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.indices.contains_key(id)
    }

    /// Returns the spec for an identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceSpec> {
        self.index_of(id).map(|idx| &self.graph[idx])
    }

    /// Declaration position of an identity.
    #[must_use]
    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.index_of(id).map(NodeIndex::index)
    }

    /// Specs in declaration order.
    pub fn specs(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.graph.node_indices().map(|idx| &self.graph[idx])
    }

    /// Specs in topological order, dependencies first, ties broken by
    /// declaration order.
    pub fn topological_order(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.order.iter().map(|idx| &self.graph[*idx])
    }

    /// Direct dependencies of a resource, in declaration order.
    #[must_use]
    pub fn dependencies(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a resource, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &ResourceId, direction: Direction) -> Vec<&ResourceId> {
        let Some(idx) = self.index_of(id) else {
            return Vec::new();
        };
        self.ids_sorted(self.graph.neighbors_directed(idx, direction).collect())
    }

    /// All resources reachable through dependent edges, in declaration order.
    #[must_use]
    pub fn transitive_dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        self.ids_sorted(seen.into_iter().collect())
    }

    /// All `(dependency, dependent)` pairs, ordered by dependent then
    /// dependency declaration.
    #[must_use]
    pub fn edges(&self) -> Vec<(ResourceId, ResourceId)> {
        let mut edges: Vec<(NodeIndex, NodeIndex)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .collect();
        edges.sort_unstable_by_key(|(from, to)| (*to, *from));
        edges
            .into_iter()
            .map(|(from, to)| (self.ids[from.index()].clone(), self.ids[to.index()].clone()))
            .collect()
    }
}
