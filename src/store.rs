//! The node store: an arena of package nodes keyed by dense integer ids.
//!
//! Every object of the translated universe is a [`Node`]: either a concrete
//! `(name, version)` pair that exists in the input, or a disjunction ("one
//! of" a set of provider nodes). All cross-references (dependencies,
//! conflicts, providers, the `but` exception and the forward target) are
//! node ids into the same arena, so the structures stay trivially hashable
//! and the later fixpoint cannot alias.
//!
//! Disjunctions can be *forwarded* to another node once interning discovers
//! a structurally identical disjunction; every read on a forwarded node
//! chases the redirect chain to its terminal.

use std::collections::BTreeSet;

use ahash::HashMap;

use crate::internal::{
    arena::Arena,
    id::{NameId, NodeId},
};

/// Kind-specific data of a disjunction node.
#[derive(Debug, Default)]
pub struct Disjunction {
    /// The alternatives; after flattening, only concrete node ids.
    providers: BTreeSet<NodeId>,
    /// A node to exclude from the providers when flattening. Supports the
    /// "conflicts with every version of the name except myself" encoding.
    but: Option<NodeId>,
    /// If set, this node is an alias for another disjunction or concrete.
    forwarded: Option<NodeId>,
    /// Whether `providers` has been fully expanded to concrete leaves.
    flat: bool,
}

#[derive(Debug)]
enum NodeKind {
    Concrete { name: NameId },
    Disjunction(Disjunction),
}

/// A package node. Common state lives here; provider data only exists for
/// disjunctions.
#[derive(Debug)]
pub struct Node {
    install: bool,
    keep: bool,
    version: Option<u32>,
    info: String,
    keep_info: String,
    deps: BTreeSet<NodeId>,
    conflicts: BTreeSet<NodeId>,
    kind: NodeKind,
}

impl Node {
    fn new(install: bool, version: Option<u32>, info: String, kind: NodeKind) -> Self {
        Self {
            install,
            keep: false,
            version,
            info,
            keep_info: String::new(),
            deps: BTreeSet::new(),
            conflicts: BTreeSet::new(),
            kind,
        }
    }
}

/// Arena of nodes plus the package-name interner.
///
/// Ids are handed out densely in allocation order; the allocator is owned by
/// the store, so independent translations never share id space.
#[derive(Default, Debug)]
pub struct NodeStore {
    nodes: Arena<NodeId, Node>,
    names: Arena<NameId, String>,
    name_to_id: HashMap<String, NameId>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a package name, returning the same id for the same name.
    pub fn intern_name(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.names.alloc(name.to_string());
        self.name_to_id.insert(name.to_string(), id);
        id
    }

    /// Returns the name interned under `id`.
    pub fn name(&self, id: NameId) -> &str {
        &self.names[id]
    }

    /// Returns the id of `name` if it was interned before.
    pub fn lookup_name(&self, name: &str) -> Option<NameId> {
        self.name_to_id.get(name).copied()
    }

    /// Creates a concrete node for `(name, version)` with the given
    /// installation status.
    pub fn new_concrete(&mut self, name: NameId, version: u32, installed: bool) -> NodeId {
        let info = format!("{}v{}", self.names[name], version);
        self.nodes.alloc(Node::new(
            installed,
            Some(version),
            info,
            NodeKind::Concrete { name },
        ))
    }

    /// Creates an unversioned disjunction node.
    pub fn new_disjunction(&mut self, info: &str) -> NodeId {
        self.nodes.alloc(Node::new(
            false,
            None,
            format!("disj-{info}"),
            NodeKind::Disjunction(Disjunction::default()),
        ))
    }

    /// Creates a disjunction node that stands for a specific version of a
    /// name (the `name=v` form).
    pub fn new_versioned_disjunction(&mut self, info: &str, version: u32) -> NodeId {
        self.nodes.alloc(Node::new(
            false,
            Some(version),
            format!("disj-{info}"),
            NodeKind::Disjunction(Disjunction::default()),
        ))
    }

    /// Number of nodes allocated so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids in allocation order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.ids()
    }

    /// Chases the forward chain of `id` to its terminal node.
    pub fn resolve(&self, id: NodeId) -> NodeId {
        let mut current = id;
        loop {
            match &self.nodes[current].kind {
                NodeKind::Disjunction(Disjunction {
                    forwarded: Some(next),
                    ..
                }) => current = *next,
                _ => return current,
            }
        }
    }

    fn terminal(&self, id: NodeId) -> &Node {
        &self.nodes[self.resolve(id)]
    }

    fn terminal_mut(&mut self, id: NodeId) -> &mut Node {
        let id = self.resolve(id);
        &mut self.nodes[id]
    }

    /// Whether `id` resolves to a concrete node.
    pub fn is_concrete(&self, id: NodeId) -> bool {
        matches!(self.terminal(id).kind, NodeKind::Concrete { .. })
    }

    /// Whether `id` itself (not its terminal) is forwarded.
    pub fn is_forwarded(&self, id: NodeId) -> bool {
        matches!(&self.nodes[id].kind, NodeKind::Disjunction(d) if d.forwarded.is_some())
    }

    /// The interned name of a concrete node.
    pub fn concrete_name(&self, id: NodeId) -> NameId {
        match self.terminal(id).kind {
            NodeKind::Concrete { name } => name,
            NodeKind::Disjunction(_) => panic!("node {id:?} is not concrete"),
        }
    }

    /// The version of the node `id` resolves to, `None` when the terminal is
    /// an unversioned disjunction.
    pub fn version(&self, id: NodeId) -> Option<u32> {
        self.terminal(id).version
    }

    pub fn install(&self, id: NodeId) -> bool {
        self.terminal(id).install
    }

    pub fn keep(&self, id: NodeId) -> bool {
        self.terminal(id).keep
    }

    /// Sets the install flag of the terminal of `id`.
    ///
    /// Flipping the polarity of a node whose state was frozen with `keep` is
    /// a programming error: the request encoding checks for the conflict
    /// before marking.
    pub fn mark_install(&mut self, id: NodeId, install: bool) {
        let t = self.resolve(id);
        let node = &self.nodes[t];
        if node.install == install {
            return;
        }
        if node.keep {
            panic!(
                "changing install for already kept node {} ({})",
                t.to_u32(),
                node.keep_info,
            );
        }
        self.nodes[t].install = install;
    }

    pub fn mark_keep(&mut self, id: NodeId, keep: bool) {
        self.terminal_mut(id).keep = keep;
    }

    /// Diagnostic description of the node, for debug output.
    pub fn info(&self, id: NodeId) -> &str {
        &self.terminal(id).info
    }

    pub fn keep_info(&self, id: NodeId) -> &str {
        &self.terminal(id).keep_info
    }

    pub fn add_info(&mut self, id: NodeId, info: &str) {
        let node = self.terminal_mut(id);
        node.info.push_str(" -=- ");
        node.info.push_str(info);
    }

    pub fn add_keep_info(&mut self, id: NodeId, info: &str) {
        let node = self.terminal_mut(id);
        node.keep_info.push_str(" -=- ");
        node.keep_info.push_str(info);
    }

    /// Records that `a` depends on `b`. Idempotent.
    pub fn add_dep(&mut self, a: NodeId, b: NodeId) {
        self.terminal_mut(a).deps.insert(b);
    }

    /// Records a conflict from `a` to `b`. Idempotent. Conflicts are
    /// logically undirected; the writer normalizes at emission time.
    pub fn add_conflict(&mut self, a: NodeId, b: NodeId) {
        self.terminal_mut(a).conflicts.insert(b);
    }

    /// Dependencies as stored (targets are chased at emission time).
    pub fn deps(&self, id: NodeId) -> &BTreeSet<NodeId> {
        &self.terminal(id).deps
    }

    pub fn conflicts(&self, id: NodeId) -> &BTreeSet<NodeId> {
        &self.terminal(id).conflicts
    }

    fn disjunction(&self, id: NodeId) -> &Disjunction {
        match &self.terminal(id).kind {
            NodeKind::Disjunction(d) => d,
            NodeKind::Concrete { .. } => panic!("node {id:?} resolves to a concrete"),
        }
    }

    fn disjunction_mut(&mut self, id: NodeId) -> &mut Disjunction {
        let id = self.resolve(id);
        match &mut self.nodes[id].kind {
            NodeKind::Disjunction(d) => d,
            NodeKind::Concrete { .. } => panic!("node {id:?} resolves to a concrete"),
        }
    }

    /// Adds `provider` as an alternative of the disjunction `id`.
    pub fn add_provider(&mut self, id: NodeId, provider: NodeId) {
        self.disjunction_mut(id).providers.insert(provider);
    }

    /// The providers of the disjunction `id` resolves to.
    pub fn providers(&self, id: NodeId) -> &BTreeSet<NodeId> {
        &self.disjunction(id).providers
    }

    /// Sets the provider exception of the disjunction `id`.
    pub fn set_but(&mut self, id: NodeId, but: NodeId) {
        self.disjunction_mut(id).but = Some(but);
    }

    pub fn is_flat(&self, id: NodeId) -> bool {
        self.disjunction(id).flat
    }

    /// Forwards `a` to `b`: `a` becomes an alias of `b`, after its
    /// dependencies and conflicts have been transferred and `b` has been
    /// dropped from its provider set.
    pub fn forward(&mut self, a: NodeId, b: NodeId) {
        let a = self.resolve(a);
        let b = self.resolve(b);
        assert_ne!(a, b, "cannot forward node {a:?} to itself");

        let deps = std::mem::take(&mut self.nodes[a].deps);
        let conflicts = std::mem::take(&mut self.nodes[a].conflicts);
        for d in deps {
            self.add_dep(b, d);
        }
        for c in conflicts {
            self.add_conflict(b, c);
        }

        let breadcrumb = format!("[({}) {}]", a.to_u32(), self.nodes[a].info);
        let keep_breadcrumb = (!self.nodes[a].keep_info.is_empty())
            .then(|| format!("[({}) {}]", a.to_u32(), self.nodes[a].keep_info));

        {
            let disj = match &mut self.nodes[a].kind {
                NodeKind::Disjunction(d) => d,
                NodeKind::Concrete { .. } => panic!("cannot forward concrete node {a:?}"),
            };
            disj.providers.remove(&b);
            disj.forwarded = Some(b);
        }

        tracing::trace!("forwarding node {} to {}", a.to_u32(), b.to_u32());
        self.add_info(b, &breadcrumb);
        if let Some(keep_breadcrumb) = keep_breadcrumb {
            self.add_keep_info(b, &keep_breadcrumb);
        }
        self.nodes[a].info.push_str(&format!("  -fwd-> {}", b.to_u32()));
    }

    /// Expands the providers of the disjunction `id` (and, transitively, of
    /// every disjunction reachable through its providers) down to concrete
    /// leaves, then applies the `but` exception. Memoized through the `flat`
    /// flag; iterative, as provider chains can be long.
    pub fn flatten(&mut self, id: NodeId) {
        let root = self.resolve(id);
        if self.is_concrete(root) || self.is_flat(root) {
            return;
        }

        let mut visiting: BTreeSet<NodeId> = BTreeSet::new();
        let mut stack: Vec<(NodeId, bool)> = vec![(root, false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                let mut flat: BTreeSet<NodeId> = BTreeSet::new();
                for p in self.providers(current).clone() {
                    let p = self.resolve(p);
                    if self.is_concrete(p) {
                        flat.insert(p);
                    } else {
                        debug_assert!(self.is_flat(p));
                        flat.extend(self.providers(p).iter().copied());
                    }
                }
                let disj = self.disjunction_mut(current);
                if let Some(but) = disj.but {
                    flat.remove(&but);
                }
                disj.providers = flat;
                disj.flat = true;
                visiting.remove(&current);
                continue;
            }

            if self.is_flat(current) {
                continue;
            }
            if !visiting.insert(current) {
                panic!("provider cycle involving node {}", current.to_u32());
            }
            stack.push((current, true));
            for p in self.providers(current).clone() {
                let p = self.resolve(p);
                if !self.is_concrete(p) && !self.is_flat(p) {
                    if visiting.contains(&p) {
                        panic!("provider cycle involving node {}", p.to_u32());
                    }
                    stack.push((p, false));
                }
            }
        }
    }

    /// Installs a mutual conflict among all the nodes of `ids`.
    pub fn pairwise_conflicts(&mut self, ids: &BTreeSet<NodeId>) {
        for &p in ids {
            for &q in ids {
                if p != q {
                    self.add_conflict(p, q);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concrete(store: &mut NodeStore, name: &str, version: u32) -> NodeId {
        let name = store.intern_name(name);
        store.new_concrete(name, version, false)
    }

    #[test]
    fn reads_chase_the_forward_chain() {
        let mut store = NodeStore::new();
        let a = concrete(&mut store, "a", 1);
        let d1 = store.new_disjunction("one");
        let d2 = store.new_disjunction("two");
        store.add_provider(d1, a);
        store.add_provider(d2, a);
        store.add_dep(d2, a);

        store.forward(d2, d1);
        // d2's dependency moved to d1, and reads on d2 see d1.
        assert!(store.deps(d1).contains(&a));
        assert_eq!(store.resolve(d2), d1);
        store.mark_install(d2, true);
        assert!(store.install(d1));

        // Chains of forwards resolve to the final target.
        let d3 = store.new_disjunction("three");
        store.add_provider(d3, a);
        store.forward(d1, d3);
        assert_eq!(store.resolve(d2), d3);

        // Version reads follow the redirect; unforwarded disjunctions keep
        // their stored version.
        let v = store.new_versioned_disjunction("x=3", 3);
        store.add_provider(v, a);
        assert_eq!(store.version(v), Some(3));
        store.forward(v, d3);
        assert_eq!(store.version(v), store.version(d3));
    }

    #[test]
    fn forward_transfers_conflicts_and_drops_the_target_provider() {
        let mut store = NodeStore::new();
        let a = concrete(&mut store, "a", 1);
        let c = concrete(&mut store, "c", 1);
        let d1 = store.new_disjunction("one");
        let d2 = store.new_disjunction("two");
        store.add_provider(d1, a);
        store.add_provider(d1, d2);
        store.add_provider(d2, a);
        store.add_conflict(d1, c);

        store.forward(d1, d2);
        // Reads on d1 now see d2: the target provider is gone, the conflict
        // moved over.
        itertools::assert_equal(store.providers(d1).iter().copied(), [a]);
        assert!(store.conflicts(d2).contains(&c));
    }

    #[test]
    fn flatten_expands_to_concrete_leaves_and_applies_but() {
        let mut store = NodeStore::new();
        let a = concrete(&mut store, "a", 1);
        let b = concrete(&mut store, "b", 1);
        let c = concrete(&mut store, "c", 1);
        let inner = store.new_disjunction("inner");
        store.add_provider(inner, b);
        store.add_provider(inner, c);
        let outer = store.new_disjunction("outer");
        store.add_provider(outer, a);
        store.add_provider(outer, inner);
        store.set_but(outer, c);

        store.flatten(outer);
        assert!(store.is_flat(outer));
        itertools::assert_equal(store.providers(outer).iter().copied(), [a, b]);
        // The inner disjunction was flattened along the way.
        assert!(store.is_flat(inner));
    }

    #[test]
    #[should_panic(expected = "changing install for already kept node")]
    fn flipping_a_kept_node_is_a_hard_failure() {
        let mut store = NodeStore::new();
        let a = concrete(&mut store, "a", 1);
        store.mark_keep(a, true);
        store.mark_install(a, true);
    }
}
