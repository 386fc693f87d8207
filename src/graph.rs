//! The tri-graph view of a KCUDF instance: three edge-labelled graphs
//! (directed dependencies, undirected conflicts, directed provides) sharing
//! one conceptual vertex set, plus the `(keep, install)` state of every
//! package.
//!
//! The view is populated through the [`KCudfWriter`] trait, so it can be fed
//! either by the KCUDF reader or directly by the translator without a file
//! round-trip.

use ahash::HashMap;
use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex, UnGraph},
};

use crate::kcudf::KCudfWriter;

/// The three vertices representing one package.
#[derive(Copy, Clone)]
#[derive(Debug)]
struct Vertices {
    dep: NodeIndex,
    conflict: NodeIndex,
    provide: NodeIndex,
}

/// Three graphs over a common vertex set, keyed by the package ids of the
/// KCUDF input. Degree queries are O(1), adjacency iteration is
/// O(out-degree), edge tests are linear in the degree of the smaller
/// endpoint.
#[derive(Debug)]
pub struct TriGraph {
    deps: DiGraph<u32, ()>,
    conflicts: UnGraph<u32, ()>,
    provides: DiGraph<u32, ()>,
    nodes: HashMap<u32, Vertices>,
    states: HashMap<u32, (bool, bool)>,
}

impl Default for TriGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TriGraph {
    pub fn new() -> Self {
        Self {
            deps: DiGraph::new(),
            conflicts: UnGraph::new_undirected(),
            provides: DiGraph::new(),
            nodes: HashMap::default(),
            states: HashMap::default(),
        }
    }

    fn vertices(&self, p: u32) -> Vertices {
        *self
            .nodes
            .get(&p)
            .unwrap_or_else(|| panic!("relation names undeclared package {p}"))
    }

    /// Registers package `p`. Duplicate registrations keep the first state.
    pub fn add_package(&mut self, p: u32, keep: bool, install: bool) {
        if self.nodes.contains_key(&p) {
            return;
        }
        let vertices = Vertices {
            dep: self.deps.add_node(p),
            conflict: self.conflicts.add_node(p),
            provide: self.provides.add_node(p),
        };
        self.nodes.insert(p, vertices);
        self.states.insert(p, (keep, install));
    }

    pub fn is_package(&self, p: u32) -> bool {
        self.nodes.contains_key(&p)
    }

    pub fn num_packages(&self) -> usize {
        self.nodes.len()
    }

    /// All package ids, in registration order.
    pub fn packages(&self) -> impl Iterator<Item = u32> + '_ {
        self.deps.node_indices().map(|ix| self.deps[ix])
    }

    pub fn keep(&self, p: u32) -> bool {
        self.states[&p].0
    }

    pub fn install(&self, p: u32) -> bool {
        self.states[&p].1
    }

    /// The `(keep, install)` pair of `p`.
    pub fn state(&self, p: u32) -> (bool, bool) {
        self.states[&p]
    }

    pub fn set_state(&mut self, p: u32, keep: bool, install: bool) {
        debug_assert!(self.is_package(p));
        self.states.insert(p, (keep, install));
    }

    pub fn add_dependency(&mut self, p: u32, q: u32) {
        let (vp, vq) = (self.vertices(p).dep, self.vertices(q).dep);
        if self.deps.find_edge(vp, vq).is_none() {
            self.deps.add_edge(vp, vq, ());
        }
    }

    pub fn add_conflict(&mut self, p: u32, q: u32) {
        let (vp, vq) = (self.vertices(p).conflict, self.vertices(q).conflict);
        if self.conflicts.find_edge(vp, vq).is_none() {
            self.conflicts.add_edge(vp, vq, ());
        }
    }

    pub fn add_provides(&mut self, p: u32, q: u32) {
        let (vp, vq) = (self.vertices(p).provide, self.vertices(q).provide);
        if self.provides.find_edge(vp, vq).is_none() {
            self.provides.add_edge(vp, vq, ());
        }
    }

    /// The packages `p` depends on.
    pub fn dependencies(&self, p: u32) -> impl Iterator<Item = u32> + '_ {
        self.deps
            .neighbors_directed(self.vertices(p).dep, Direction::Outgoing)
            .map(|ix| self.deps[ix])
    }

    /// The packages depending on `p`.
    pub fn dependers(&self, p: u32) -> impl Iterator<Item = u32> + '_ {
        self.deps
            .neighbors_directed(self.vertices(p).dep, Direction::Incoming)
            .map(|ix| self.deps[ix])
    }

    /// The packages in conflict with `p`.
    pub fn conflicts(&self, p: u32) -> impl Iterator<Item = u32> + '_ {
        self.conflicts
            .neighbors(self.vertices(p).conflict)
            .map(|ix| self.conflicts[ix])
    }

    /// The packages `p` provides.
    pub fn provides(&self, p: u32) -> impl Iterator<Item = u32> + '_ {
        self.provides
            .neighbors_directed(self.vertices(p).provide, Direction::Outgoing)
            .map(|ix| self.provides[ix])
    }

    /// The providers of `p`.
    pub fn providers(&self, p: u32) -> impl Iterator<Item = u32> + '_ {
        self.provides
            .neighbors_directed(self.vertices(p).provide, Direction::Incoming)
            .map(|ix| self.provides[ix])
    }

    pub fn has_dependency(&self, p: u32, q: u32) -> bool {
        self.deps
            .find_edge(self.vertices(p).dep, self.vertices(q).dep)
            .is_some()
    }

    pub fn has_conflict(&self, p: u32, q: u32) -> bool {
        self.conflicts
            .find_edge(self.vertices(p).conflict, self.vertices(q).conflict)
            .is_some()
    }

    pub fn num_dependencies(&self) -> usize {
        self.deps.edge_count()
    }

    pub fn num_conflicts(&self) -> usize {
        self.conflicts.edge_count()
    }

    pub fn num_provides(&self) -> usize {
        self.provides.edge_count()
    }
}

impl KCudfWriter for TriGraph {
    fn package(&mut self, id: u32, keep: bool, install: bool, _desc: &str) -> std::io::Result<()> {
        self.add_package(id, keep, install);
        Ok(())
    }

    fn dependency(&mut self, id: u32, id2: u32, _desc: &str) -> std::io::Result<()> {
        self.add_dependency(id, id2);
        Ok(())
    }

    fn conflict(&mut self, id: u32, id2: u32, _desc: &str) -> std::io::Result<()> {
        self.add_conflict(id, id2);
        Ok(())
    }

    fn provides(&mut self, id: u32, id2: u32, _desc: &str) -> std::io::Result<()> {
        self.add_provides(id, id2);
        Ok(())
    }
}
