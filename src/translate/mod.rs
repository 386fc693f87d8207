//! The translator: turns a [`CudfDoc`] into the KCUDF normal form.
//!
//! Translation is a sequence of passes over the document that populate the
//! node store and its indexes:
//!
//! 1. every package becomes a concrete node, paired with a per-version
//!    disjunction and registered with the `{name}-pvall` sink (installed
//!    families additionally get a `{name}-pvany` node);
//! 2. installed families wire every version into their `pvany`;
//! 3. equality constraints in deps, conflicts, provides and the request are
//!    materialized as `name=v` disjunctions (virtual versions included);
//! 4. unconstrained provides feed `{name}-pvall`; any other provide relation
//!    is invalid CUDF;
//! 5. range constraints and multi-term dependency disjunctions become
//!    string-keyed disjunctions over the versions satisfying them.
//!
//! After the passes every disjunction is flattened to concrete leaves,
//! structurally equal disjunctions are interned through the [`trie`] and the
//! losers forwarded, zero-provider disjunctions are pinned uninstalled, the
//! install flags of the constraint disjunctions are synced with their
//! providers, and finally the user request is encoded as `keep`/`install`
//! marks (rejecting requests that contradict earlier pins).

pub mod trie;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};

use ahash::HashMap;
use indexmap::IndexMap;
use itertools::Itertools;
use thiserror::Error;

use crate::{
    cudf::{CudfDoc, CudfPackage, Keep, RelOp, Vpkg},
    internal::id::{NameId, NodeId},
    kcudf::{KCudfInfoWriter, KCudfWriter},
    store::NodeStore,
};
use trie::DisjunctionTrie;

/// Version recorded in the info sidecar for artificial packages.
const ARTIFICIAL_VERSION: u32 = 999;

/// Error raised while translating a document.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// A `provides:` with a relation other than `=` or unconstrained.
    #[error(
        "invalid provide {constraint} on package {package}: only unconstrained \
         and equality relations are allowed"
    )]
    InvalidProvide { package: String, constraint: String },

    /// The request contradicts already frozen state.
    #[error("unable to fulfill request: {0}")]
    FailedRequest(String),

    /// The universe declares the same `(name, version)` twice.
    #[error("duplicate package {name} version {version}")]
    DuplicatePackage { name: String, version: u32 },
}

/// Counters collected while translating.
#[derive(Debug, Default, Clone, Copy)]
pub struct TranslatorStats {
    /// Concrete packages in the universe.
    pub concrete: u32,
    /// Disjunctions surviving translation (after merging).
    pub disjunctions: u32,
    /// Disjunctions merged into an earlier structural duplicate.
    pub merged: u32,
    /// Disjunctions pinned uninstalled for lack of providers.
    pub zero_providers: u32,
}

impl Display for TranslatorStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Translation statistics:")?;
        writeln!(f, "\tConcrete packages: {}", self.concrete)?;
        writeln!(f, "\tReal disjunctions: {}", self.disjunctions)?;
        writeln!(f, "\tEqual disj: {}", self.merged)?;
        writeln!(f, "\tZero-provider disj: {}", self.zero_providers)
    }
}

/// The serialized form of a constraint, used as its intern key.
///
/// One function produces every key: unversioned constraints map to the
/// `{name}-pvany` node, versioned ones to `{name}{op}{version}`.
fn constraint_key(vpkg: &Vpkg) -> String {
    match vpkg.constraint {
        None => format!("{}-pvany", vpkg.name),
        Some(_) => vpkg.to_string(),
    }
}

fn pvall_key(name: &str) -> String {
    format!("{name}-pvall")
}

fn pvany_key(name: &str) -> String {
    format!("{name}-pvany")
}

/// Translates CUDF documents into KCUDF.
///
/// Construction runs the whole translation; the resulting value holds the
/// translated universe and can emit it any number of times through
/// [`Translator::translate`].
#[derive(Debug)]
pub struct Translator {
    store: NodeStore,
    /// `(name, version) → concrete node`.
    concrete: HashMap<NameId, BTreeMap<u32, NodeId>>,
    /// `(name, version) → per-version disjunction`, including virtuals.
    specv: HashMap<NameId, BTreeMap<u32, NodeId>>,
    /// Serialized constraint → disjunction node.
    constv: IndexMap<String, NodeId, ahash::RandomState>,
    stats: TranslatorStats,
}

impl Translator {
    /// Translates `doc`, producing the in-memory KCUDF universe.
    pub fn new(doc: &CudfDoc) -> Result<Self, TranslateError> {
        let mut translator = Self {
            store: NodeStore::new(),
            concrete: HashMap::default(),
            specv: HashMap::default(),
            constv: IndexMap::default(),
            stats: TranslatorStats::default(),
        };
        translator.build(doc)?;
        Ok(translator)
    }

    fn build(&mut self, doc: &CudfDoc) -> Result<(), TranslateError> {
        self.process_concrete_packages(doc)?;
        self.process_installed_packages(doc);
        self.process_equality_constraints(doc)?;
        self.process_provides(doc)?;
        self.process_range_constraints(doc);

        self.flatten_all();
        let mut trie = self.intern_all();
        self.simplify();
        self.fix_install_virtuals();
        self.process_request(doc, &mut trie)?;
        self.fix_install_virtuals();

        self.stats.concrete = doc.packages.len() as u32;
        self.stats.disjunctions = self
            .store
            .ids()
            .filter(|&id| !self.store.is_concrete(id) && !self.store.is_forwarded(id))
            .count() as u32;
        self.check_consistency();
        Ok(())
    }

    /// Translation counters.
    pub fn stats(&self) -> &TranslatorStats {
        &self.stats
    }

    /// The translated node universe.
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// The node interned for the serialized constraint `key`, resolved
    /// through forwards.
    pub fn constraint_node(&self, key: &str) -> Option<NodeId> {
        self.constv.get(key).map(|&id| self.store.resolve(id))
    }

    /// The per-version disjunction for `(name, version)`, resolved through
    /// forwards. Includes virtual versions.
    pub fn version_node(&self, name: &str, version: u32) -> Option<NodeId> {
        let name = self.store.lookup_name(name)?;
        let id = *self.specv.get(&name)?.get(&version)?;
        Some(self.store.resolve(id))
    }

    /// The concrete node for `(name, version)`.
    pub fn concrete_node(&self, name: &str, version: u32) -> Option<NodeId> {
        let name = self.store.lookup_name(name)?;
        self.concrete.get(&name)?.get(&version).copied()
    }

    /// The concrete node of a universe package; pass 1 registered it.
    fn concrete_of(&self, pkg: &CudfPackage) -> NodeId {
        self.concrete_node(&pkg.name, pkg.version)
            .expect("package registered by the concrete pass")
    }

    // Intern helpers over `constv`.

    fn disjunction_by_key(&mut self, key: &str) -> NodeId {
        if let Some(&id) = self.constv.get(key) {
            return id;
        }
        let id = self.store.new_disjunction(key);
        self.constv.insert(key.to_string(), id);
        id
    }

    /// The versions of `name` satisfying `vpkg`, as per-version disjunction
    /// ids.
    fn solve_constraint(&self, vpkg: &Vpkg) -> Vec<NodeId> {
        let Some(name) = self.store.lookup_name(&vpkg.name) else {
            return Vec::new();
        };
        self.specv
            .get(&name)
            .into_iter()
            .flatten()
            .filter(|(&version, _)| vpkg.matches(version))
            .map(|(_, &id)| id)
            .collect()
    }

    /// The disjunction for the non-equality constraint `vpkg`, created with
    /// the versions satisfying it as providers.
    fn disjunction_for(&mut self, vpkg: &Vpkg) -> NodeId {
        debug_assert_ne!(vpkg.rel(), Some(RelOp::Eq));
        let key = constraint_key(vpkg);
        if let Some(&id) = self.constv.get(&key) {
            return id;
        }
        let id = self.disjunction_by_key(&key);
        for provider in self.solve_constraint(vpkg) {
            self.store.add_provider(id, provider);
        }
        id
    }

    /// Like [`Self::disjunction_for`] but, as a dependency target, also
    /// backed by `{name}-pvall` so unconstrained providers can satisfy it.
    fn dep_disjunction_for(&mut self, vpkg: &Vpkg) -> NodeId {
        debug_assert_ne!(vpkg.rel(), Some(RelOp::Eq));
        let key = constraint_key(vpkg);
        if let Some(&id) = self.constv.get(&key) {
            return id;
        }
        let id = self.disjunction_for(vpkg);
        if let Some(&all) = self.constv.get(&pvall_key(&vpkg.name)) {
            self.store.add_provider(id, all);
        }
        id
    }

    /// The `name=v` disjunction, created as a virtual version when the
    /// universe has no such concrete.
    fn version_disjunction(&mut self, name: &str, version: u32) -> NodeId {
        let name_id = self.store.intern_name(name);
        if let Some(&id) = self.specv.get(&name_id).and_then(|m| m.get(&version)) {
            return id;
        }
        let id = self
            .store
            .new_versioned_disjunction(&format!("{name}={version}"), version);
        self.specv.entry(name_id).or_default().insert(version, id);
        tracing::debug!("virtual version added: {name}={version}");
        id
    }

    /// Like [`Self::version_disjunction`] but, as a dependency target, a
    /// fresh virtual is additionally backed by `{name}-pvall`.
    fn dep_version_disjunction(&mut self, name: &str, version: u32) -> NodeId {
        let name_id = self.store.intern_name(name);
        if let Some(&id) = self.specv.get(&name_id).and_then(|m| m.get(&version)) {
            return id;
        }
        let id = self.version_disjunction(name, version);
        let all = self.disjunction_by_key(&pvall_key(name));
        self.store.add_provider(id, all);
        id
    }

    // The five document passes.

    fn process_concrete_packages(&mut self, doc: &CudfDoc) -> Result<(), TranslateError> {
        for pkg in &doc.packages {
            let name = self.store.intern_name(&pkg.name);
            if self
                .concrete
                .get(&name)
                .is_some_and(|m| m.contains_key(&pkg.version))
            {
                return Err(TranslateError::DuplicatePackage {
                    name: pkg.name.clone(),
                    version: pkg.version,
                });
            }

            let p = self.store.new_concrete(name, pkg.version, pkg.installed);
            self.concrete.entry(name).or_default().insert(pkg.version, p);

            // The per-version disjunction: provided by the concrete itself
            // and by the all-versions sink of its name.
            let d = self
                .store
                .new_versioned_disjunction(&format!("(={}){}", pkg.version, pkg.name), pkg.version);
            self.store.add_dep(p, d);
            self.store.add_provider(d, p);

            let all = self.disjunction_by_key(&pvall_key(&pkg.name));
            self.store.add_provider(d, all);
            self.store.add_dep(all, d);

            self.specv.entry(name).or_default().insert(pkg.version, d);

            if pkg.installed {
                let any = self.disjunction_by_key(&pvany_key(&pkg.name));
                self.store.add_provider(any, all);
                self.store.add_dep(all, any);
            }
        }
        Ok(())
    }

    fn process_installed_packages(&mut self, doc: &CudfDoc) {
        // Families with an installed member have a pvany node by now; every
        // version of the family provides it.
        for pkg in &doc.packages {
            let Some(&any) = self.constv.get(&pvany_key(&pkg.name)) else {
                continue;
            };
            let version = self.version_node_raw(&pkg.name, pkg.version);
            self.store.add_provider(any, version);
            self.store.add_dep(version, any);
        }
    }

    fn version_node_raw(&self, name: &str, version: u32) -> NodeId {
        let name = self.store.lookup_name(name).expect("name interned in pass 1");
        self.specv[&name][&version]
    }

    fn process_equality_constraints(&mut self, doc: &CudfDoc) -> Result<(), TranslateError> {
        for pkg in &doc.packages {
            let cpi = self.concrete_of(pkg);

            if pkg.keep == Keep::Version {
                if !pkg.installed {
                    return Err(TranslateError::FailedRequest(format!(
                        "keep version on {}={} which is not installed",
                        pkg.name, pkg.version
                    )));
                }
                self.store.mark_install(cpi, true);
                self.store.mark_keep(cpi, true);
                self.store.add_keep_info(cpi, "keep version");
            }

            for vpkg in &pkg.conflicts {
                if let Some((RelOp::Eq, version)) = vpkg.constraint {
                    let p = self.version_disjunction(&vpkg.name, version);
                    self.store.add_conflict(cpi, p);
                }
            }

            for conjunction in &pkg.depends {
                for vpkg in conjunction {
                    if let Some((RelOp::Eq, version)) = vpkg.constraint {
                        let p = self.dep_version_disjunction(&vpkg.name, version);
                        self.store.add_dep(cpi, p);
                    }
                }
            }

            for vpkg in &pkg.provides {
                if let Some((RelOp::Eq, version)) = vpkg.constraint {
                    let p = self.version_disjunction(&vpkg.name, version);
                    debug_assert!(!self.store.is_concrete(p));
                    self.store.add_provider(p, cpi);
                    self.store.add_dep(cpi, cpi);

                    let all = self.disjunction_by_key(&pvall_key(&vpkg.name));
                    self.store.add_provider(p, all);
                    self.store.add_dep(all, p);
                }
            }
        }

        // Versions named by the request must exist at least as virtuals:
        // removing a nonexistent version is a no-op, installing one becomes
        // a zero-provider pin that fails the request downstream.
        for vpkg in doc.request.install.iter().chain(&doc.request.remove) {
            if let Some((RelOp::Eq, version)) = vpkg.constraint {
                tracing::debug!("request names {}={version}", vpkg.name);
                self.version_disjunction(&vpkg.name, version);
            }
        }
        Ok(())
    }

    fn process_provides(&mut self, doc: &CudfDoc) -> Result<(), TranslateError> {
        for pkg in &doc.packages {
            let cpi = self.concrete_of(pkg);
            for vpkg in &pkg.provides {
                match vpkg.rel() {
                    Some(RelOp::Eq) => {} // handled by the equality pass
                    Some(_) => {
                        return Err(TranslateError::InvalidProvide {
                            package: format!("{}={}", pkg.name, pkg.version),
                            constraint: vpkg.to_string(),
                        });
                    }
                    None => {
                        let all = self.disjunction_by_key(&pvall_key(&vpkg.name));
                        self.store.add_provider(all, cpi);
                        self.store.add_dep(cpi, all);
                    }
                }
            }
        }
        Ok(())
    }

    fn process_range_constraints(&mut self, doc: &CudfDoc) {
        for pkg in &doc.packages {
            let cpi = self.concrete_of(pkg);

            for vpkg in &pkg.conflicts {
                if vpkg.rel() == Some(RelOp::Eq) {
                    continue;
                }
                let matching = self.dep_disjunction_for(vpkg);
                // "conflicts with every version matching, except myself":
                // the exception node wraps the matching set with a but.
                let key = format!("{}-any\\{}={}", vpkg.name, pkg.name, pkg.version);
                let d = self.disjunction_by_key(&key);
                self.store.add_provider(d, matching);
                self.store.set_but(d, cpi);
                self.store.add_conflict(cpi, d);
            }

            for conjunction in &pkg.depends {
                for vpkg in conjunction {
                    if vpkg.rel() != Some(RelOp::Eq) {
                        self.dep_disjunction_for(vpkg);
                    }
                }

                if conjunction.len() > 1 {
                    let key = conjunction.iter().map(constraint_key).join(" | ");
                    if let Some(&id) = self.constv.get(&key) {
                        self.store.add_dep(cpi, id);
                        continue;
                    }
                    let p = self.disjunction_by_key(&key);
                    for vpkg in conjunction {
                        let term = self.term_node(vpkg);
                        self.store.add_provider(p, term);
                    }
                    self.store.add_dep(cpi, p);
                } else {
                    let term = self.term_node(&conjunction[0]);
                    self.store.add_dep(cpi, term);
                }
            }
        }

        // Non-equality request entries get their constraint disjunction
        // materialized (without the pvall backing: the request talks about
        // actual versions).
        for vpkg in doc.request.install.iter().chain(&doc.request.remove) {
            if vpkg.rel() != Some(RelOp::Eq) {
                self.disjunction_for(vpkg);
            }
        }
    }

    /// The node a dependency term resolves to: its constraint disjunction,
    /// or the per-version disjunction for equality terms.
    fn term_node(&self, vpkg: &Vpkg) -> NodeId {
        let key = constraint_key(vpkg);
        if let Some(&id) = self.constv.get(&key) {
            return id;
        }
        match vpkg.constraint {
            Some((RelOp::Eq, version)) => {
                let name = self.store.lookup_name(&vpkg.name);
                *name
                    .and_then(|n| self.specv.get(&n))
                    .and_then(|m| m.get(&version))
                    .unwrap_or_else(|| panic!("unparsed dependency term {vpkg}"))
            }
            _ => panic!("unparsed dependency term {vpkg}"),
        }
    }

    // Flattening, interning, simplification.

    fn flatten_all(&mut self) {
        for id in self.store.ids().collect_vec() {
            if !self.store.is_concrete(id) {
                self.store.flatten(id);
            }
        }
    }

    fn intern_all(&mut self) -> DisjunctionTrie {
        let mut trie = DisjunctionTrie::new();

        // Concretes are seeded first with the set containing only
        // themselves: a disjunction whose flat providers collapse to a single
        // concrete is that concrete.
        let mut singleton = BTreeSet::new();
        for id in self.store.ids().collect_vec() {
            if !self.store.is_concrete(id) {
                continue;
            }
            singleton.insert(id);
            let winner = trie.intern(id, &singleton);
            debug_assert_eq!(winner, id);
            singleton.clear();
        }

        for id in self.store.ids().collect_vec() {
            if self.store.resolve(id) != id || self.store.is_concrete(id) {
                continue;
            }
            let winner = trie.intern(id, self.store.providers(id));
            if winner != id {
                self.store.forward(id, winner);
                self.stats.merged += 1;
            }
        }
        trie
    }

    fn simplify(&mut self) {
        for id in self.store.ids().collect_vec() {
            if self.store.resolve(id) != id || self.store.is_concrete(id) {
                continue;
            }
            match self.store.providers(id).len() {
                // Interning against the concrete singletons should have
                // merged these away.
                1 => panic!(
                    "disjunction {} survived interning with a single provider",
                    id.to_u32()
                ),
                0 => {
                    self.store.mark_install(id, false);
                    self.store.mark_keep(id, true);
                    self.store.add_keep_info(id, "keep x zero providers");
                    self.stats.zero_providers += 1;
                }
                _ => {}
            }
        }
    }

    /// Syncs the install flag of every constraint disjunction with its
    /// providers: installed iff some providing concrete is installed. Nodes
    /// whose polarity was frozen with `keep` are left alone.
    fn fix_install_virtuals(&mut self) {
        for &id in self.constv.values() {
            if self.store.is_concrete(id) || self.store.keep(id) {
                continue;
            }
            let installed = self
                .store
                .providers(id)
                .iter()
                .any(|&p| self.store.is_concrete(p) && self.store.install(p));
            if installed {
                self.store.mark_install(id, true);
            }
        }
    }

    // Request encoding.

    fn process_request(
        &mut self,
        doc: &CudfDoc,
        trie: &mut DisjunctionTrie,
    ) -> Result<(), TranslateError> {
        let mut to_install: BTreeSet<NodeId> = BTreeSet::new();
        let mut to_uninstall: BTreeSet<NodeId> = BTreeSet::new();

        for pkg in &doc.packages {
            self.process_keep(pkg, trie, &mut to_install)?;
        }

        for vpkg in &doc.request.upgrade {
            self.process_upgrade(vpkg, trie, &mut to_install, &mut to_uninstall)?;
        }

        for vpkg in &doc.request.install {
            let id = self.request_node(vpkg);
            self.store.add_keep_info(id, "requested to install");
            to_install.insert(id);
        }
        for vpkg in &doc.request.remove {
            to_uninstall.insert(self.request_node(vpkg));
        }

        // Nothing is marked while the request is examined; the sets are
        // applied at the very end so contradictions surface as errors
        // instead of partial markings.
        for &id in &to_install {
            if self.store.keep(id) && !self.store.install(id) {
                return Err(TranslateError::FailedRequest(format!(
                    "{} is pinned uninstalled ({})",
                    self.store.info(id),
                    self.store.keep_info(id)
                )));
            }
            self.store.mark_install(id, true);
            self.store.mark_keep(id, true);
        }
        for &id in &to_uninstall {
            if self.store.keep(id) && self.store.install(id) {
                return Err(TranslateError::FailedRequest(format!(
                    "{} is pinned installed ({})",
                    self.store.info(id),
                    self.store.keep_info(id)
                )));
            }
            self.store.mark_install(id, false);
            self.store.mark_keep(id, true);
        }
        Ok(())
    }

    /// The node a request entry refers to. Every entry was materialized by
    /// the equality or range passes.
    fn request_node(&self, vpkg: &Vpkg) -> NodeId {
        match vpkg.constraint {
            Some((RelOp::Eq, version)) => self
                .store
                .lookup_name(&vpkg.name)
                .and_then(|n| self.specv.get(&n))
                .and_then(|m| m.get(&version))
                .copied()
                .expect("request version materialized by the equality pass"),
            _ => *self
                .constv
                .get(&constraint_key(vpkg))
                .expect("request constraint materialized by the range pass"),
        }
    }

    fn process_keep(
        &mut self,
        pkg: &CudfPackage,
        trie: &mut DisjunctionTrie,
        to_install: &mut BTreeSet<NodeId>,
    ) -> Result<(), TranslateError> {
        match pkg.keep {
            Keep::None => {}
            Keep::Version => {
                // Marked during the equality pass.
                let cpi = self.concrete_of(pkg);
                debug_assert!(self.store.keep(cpi) && self.store.install(cpi));
            }
            Keep::Package => {
                tracing::debug!("keep package on {}", pkg.name);
                let name = self
                    .store
                    .lookup_name(&pkg.name)
                    .expect("name interned by the concrete pass");
                let range: BTreeSet<NodeId> = self.concrete[&name].values().copied().collect();
                if range.len() == 1 {
                    // A single version: equivalent to keep version.
                    to_install.insert(self.concrete_of(pkg));
                    return Ok(());
                }
                let key = format!("{}-keep-pkg", pkg.name);
                if self.constv.contains_key(&key) {
                    tracing::debug!("keep package for {} already encoded", pkg.name);
                    return Ok(());
                }
                let d = self.disjunction_by_key(&key);
                for &i in &range {
                    self.store.add_provider(d, i);
                }
                self.store.flatten(d);
                let winner = trie.intern(d, self.store.providers(d));
                if winner != d {
                    self.store.forward(d, winner);
                }
                to_install.insert(d);
            }
            Keep::Feature => {
                tracing::debug!("keep feature on {}", pkg.name);
                if pkg.provides.is_empty() {
                    return Err(TranslateError::FailedRequest(format!(
                        "keep feature on {}={} which provides nothing",
                        pkg.name, pkg.version
                    )));
                }
                for vpkg in &pkg.provides {
                    let id = match vpkg.constraint {
                        Some((RelOp::Eq, version)) => self
                            .store
                            .lookup_name(&vpkg.name)
                            .and_then(|n| self.specv.get(&n))
                            .and_then(|m| m.get(&version))
                            .copied()
                            .expect("provided version materialized by the equality pass"),
                        Some(_) => unreachable!("rejected by the provides pass"),
                        None => self.feature_node(&vpkg.name, trie),
                    };
                    to_install.insert(id);
                }
            }
        }
        Ok(())
    }

    /// The `{name}-pvany` node for a kept feature, created on demand when no
    /// earlier constraint referenced the feature name.
    fn feature_node(&mut self, name: &str, trie: &mut DisjunctionTrie) -> NodeId {
        if let Some(&id) = self.constv.get(&pvany_key(name)) {
            return id;
        }
        let id = self.dep_disjunction_for(&Vpkg::any(name));
        self.store.flatten(id);
        let winner = trie.intern(id, self.store.providers(id));
        if winner != id {
            self.store.forward(id, winner);
        }
        id
    }

    fn process_upgrade(
        &mut self,
        vpkg: &Vpkg,
        trie: &mut DisjunctionTrie,
        to_install: &mut BTreeSet<NodeId>,
        to_uninstall: &mut BTreeSet<NodeId>,
    ) -> Result<(), TranslateError> {
        tracing::debug!("requested upgrade: {vpkg}");
        let upg = self
            .store
            .new_disjunction(&format!("{}-req-upg", constraint_key(vpkg)));

        // A package providing every version of the name defeats an upgrade:
        // either it is installed (fail) or it must go.
        if let Some(&all) = self.constv.get(&pvall_key(&vpkg.name)) {
            if self.store.install(all) {
                return Err(TranslateError::FailedRequest(format!(
                    "asked to upgrade {} but a package providing all its versions is installed",
                    vpkg.name
                )));
            }
            to_uninstall.insert(all);
        }

        let Some(versions) = self
            .store
            .lookup_name(&vpkg.name)
            .and_then(|n| self.specv.get(&n))
        else {
            return Err(TranslateError::FailedRequest(format!(
                "asked to upgrade {} but no version of it is known",
                vpkg.name
            )));
        };

        // Walk versions from highest to lowest: matching versions down to
        // the first installed one form the upgrade range, everything else
        // must go.
        let mut range: BTreeSet<NodeId> = BTreeSet::new();
        let mut interested = true;
        for (&version, &id) in versions.iter().rev() {
            if interested && vpkg.matches(version) {
                range.insert(id);
                interested = !self.store.install(id);
            } else {
                to_uninstall.insert(id);
            }
        }

        // At most one version of the range may end up installed.
        self.store.pairwise_conflicts(&range);

        let tmp = self.store.new_disjunction("temporal");
        for &i in &range {
            self.store.add_provider(tmp, i);
        }
        self.store.flatten(tmp);
        let winner = trie.intern(tmp, self.store.providers(tmp));
        if winner != tmp {
            tracing::debug!("upgrade range for {} already interned", vpkg.name);
            self.store.forward(tmp, winner);
        }
        self.store.add_provider(upg, winner);
        to_install.insert(upg);
        Ok(())
    }

    // Diagnostics.

    /// Logs whether the current installation is consistent: every installed
    /// concrete has an installed provider for each dependency and no
    /// installed conflict.
    fn check_consistency(&self) {
        let mut installed = 0u32;
        let mut consistent = 0u32;
        for id in self.store.ids() {
            if !self.is_raw_concrete(id) || !self.store.install(id) {
                continue;
            }
            installed += 1;
            let deps_ok = self
                .store
                .deps(id)
                .iter()
                .all(|&d| self.installed_providers(d) > 0);
            let conflicts_ok = self
                .store
                .conflicts(id)
                .iter()
                .all(|&c| self.installed_providers(c) == 0);
            if deps_ok && conflicts_ok {
                consistent += 1;
            }
        }
        tracing::debug!(
            installed,
            consistent,
            "initial installation is {}",
            if installed == consistent { "consistent" } else { "inconsistent" }
        );
    }

    fn installed_providers(&self, id: NodeId) -> u32 {
        if self.store.is_concrete(id) {
            return self.store.install(id) as u32;
        }
        self.store
            .providers(id)
            .iter()
            .filter(|&&p| self.store.is_concrete(p) && self.store.install(p))
            .count() as u32
    }

    /// Whether `id` itself is a concrete node (concretes are never
    /// forwarded, so no chase is involved).
    fn is_raw_concrete(&self, id: NodeId) -> bool {
        !self.store.is_forwarded(id) && self.store.is_concrete(id)
    }

    // Emission.

    /// Writes the translated universe as KCUDF plus the info sidecar.
    ///
    /// Statement order: packages, dependencies, conflicts, the concrete
    /// self-provides, then the disjunction provides. With `debug` the
    /// human-readable node descriptions are embedded in the `#` comments.
    pub fn translate<W, I>(&self, wrt: &mut W, info: &mut I, debug: bool) -> io::Result<()>
    where
        W: KCudfWriter,
        I: KCudfInfoWriter,
    {
        self.write_packages(wrt, info, debug)?;
        self.write_dependencies(wrt, debug)?;
        self.write_conflicts(wrt, debug)?;
        self.write_concrete_self_provides(wrt, debug)?;
        self.write_provides(wrt, debug)
    }

    fn write_packages<W, I>(&self, wrt: &mut W, info: &mut I, debug: bool) -> io::Result<()>
    where
        W: KCudfWriter,
        I: KCudfInfoWriter,
    {
        let mut done = BTreeSet::new();
        for id in self.store.ids() {
            if !self.store.is_concrete(id) {
                continue;
            }
            let t = self.store.resolve(id);
            if !done.insert(t) {
                continue;
            }
            let name = self.store.name(self.store.concrete_name(t));
            let version = self.store.version(t).expect("concretes are versioned");
            let desc = format!("{version}{name}");
            wrt.package(t.to_u32(), self.store.keep(t), self.store.install(t), &desc)?;
            info.package(t.to_u32(), version, name)?;
        }
        for id in self.store.ids() {
            if self.store.is_concrete(id) {
                continue;
            }
            let t = self.store.resolve(id);
            if !done.insert(t) {
                continue;
            }
            let desc = if debug { self.store.info(t) } else { "" };
            wrt.package(t.to_u32(), self.store.keep(t), self.store.install(t), desc)?;
            info.package(t.to_u32(), ARTIFICIAL_VERSION, desc)?;
        }
        Ok(())
    }

    fn write_dependencies<W: KCudfWriter>(&self, wrt: &mut W, debug: bool) -> io::Result<()> {
        let mut done = BTreeSet::new();
        for id in self.store.ids() {
            let t = self.store.resolve(id);
            if !done.insert(t) {
                continue;
            }
            let mut seen = BTreeSet::new();
            for &d in self.store.deps(t) {
                let dt = self.store.resolve(d);
                if !seen.insert(dt) {
                    continue;
                }
                let desc = if debug {
                    format!("{} -> {}", self.store.info(t), self.store.info(dt))
                } else {
                    String::new()
                };
                wrt.dependency(t.to_u32(), dt.to_u32(), &desc)?;
            }
        }
        Ok(())
    }

    fn write_conflicts<W: KCudfWriter>(&self, wrt: &mut W, debug: bool) -> io::Result<()> {
        let mut done = BTreeSet::new();
        let mut seen_pairs = BTreeSet::new();
        for id in self.store.ids() {
            let t = self.store.resolve(id);
            if !done.insert(t) {
                continue;
            }
            for &c in self.store.conflicts(t) {
                let ct = self.store.resolve(c);
                let (lo, hi) = if t <= ct { (t, ct) } else { (ct, t) };
                if !seen_pairs.insert((lo, hi)) {
                    continue;
                }
                let desc = if debug {
                    format!("{} -- {}", self.store.info(lo), self.store.info(hi))
                } else {
                    String::new()
                };
                wrt.conflict(lo.to_u32(), hi.to_u32(), &desc)?;
            }
        }
        Ok(())
    }

    fn write_concrete_self_provides<W: KCudfWriter>(
        &self,
        wrt: &mut W,
        debug: bool,
    ) -> io::Result<()> {
        let mut done = BTreeSet::new();
        for id in self.store.ids() {
            if !self.store.is_concrete(id) {
                continue;
            }
            let t = self.store.resolve(id);
            if !done.insert(t) {
                continue;
            }
            let desc = if debug {
                let name = self.store.name(self.store.concrete_name(t));
                let version = self.store.version(t).expect("concretes are versioned");
                format!("{version}{name}-self")
            } else {
                String::new()
            };
            wrt.provides(t.to_u32(), t.to_u32(), &desc)?;
        }
        Ok(())
    }

    fn write_provides<W: KCudfWriter>(&self, wrt: &mut W, debug: bool) -> io::Result<()> {
        let mut done = BTreeSet::new();
        for id in self.store.ids() {
            if self.store.is_concrete(id) {
                continue;
            }
            let t = self.store.resolve(id);
            if !done.insert(t) {
                continue;
            }
            let mut seen = BTreeSet::new();
            for &p in self.store.providers(t) {
                let pt = self.store.resolve(p);
                if !seen.insert(pt) {
                    continue;
                }
                let desc = if debug {
                    format!("{} -> {}", self.store.info(t), self.store.info(pt))
                } else {
                    String::new()
                };
                wrt.provides(pt.to_u32(), t.to_u32(), &desc)?;
                wrt.dependency(pt.to_u32(), t.to_u32(), &desc)?;
            }
        }
        Ok(())
    }

    // Paranoid support.

    /// The packages that must enter the search because a same-named sibling
    /// is installed: members of installed families that are neither kept nor
    /// installed themselves.
    pub fn extra_paranoid(&self) -> Vec<NodeId> {
        let mut families: BTreeMap<&str, (bool, Vec<NodeId>)> = BTreeMap::new();
        for id in self.store.ids() {
            if !self.is_raw_concrete(id) {
                continue;
            }
            let name = self.store.name(self.store.concrete_name(id));
            let family = families.entry(name).or_default();
            family.1.push(id);
            family.0 |= self.store.install(id);
        }

        families
            .into_values()
            .filter(|(installed, _)| *installed)
            .flat_map(|(_, members)| members)
            .filter(|&id| !self.store.keep(id) && !self.store.install(id))
            .collect()
    }

    /// Writes the paranoid seed: one id per line.
    pub fn write_paranoid(&self, mut out: impl Write) -> io::Result<()> {
        for id in self.extra_paranoid() {
            writeln!(out, "{}", id.to_u32())?;
        }
        Ok(())
    }
}
