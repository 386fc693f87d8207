//! The reducer: a worklist fixpoint that propagates install/uninstall
//! obligations across a KCUDF instance.
//!
//! Every package carries one of five states (can-uninstall, can-install,
//! must-uninstall, must-install, search), ordered so that `Must*` and
//! `Search` are absorbing. Obligations are delivered as operations through a
//! two-priority FIFO worklist: the urgent list (must-propagation and
//! candidate-counter updates) fully drains before the relaxed list
//! (can-propagation and safe-counter updates) resumes, so a feasibility
//! failure is detected before any exploratory update can mask it.
//!
//! Two counters are maintained per package: the *candidate* providers (not
//! must-uninstall) and the *safe* providers (can/must-install). A package
//! whose candidate count reaches zero must be uninstalled; at one, the last
//! candidate becomes a hard dependency, the only point where the reducer
//! grows the graph.
//!
//! The run classifies every package; the result is either a proof of
//! infeasibility, a complete solution, or a solved slice plus a minimized
//! search slice for a downstream solver.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::io::{self, BufRead};

use ahash::{HashMap, HashSet};
use thiserror::Error;

use crate::graph::TriGraph;
use crate::kcudf::{KCudfWriter, ReadError};

/// State of a package during reduction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// May end up uninstalled; nothing forces it either way yet.
    CanUninstall,
    /// Currently installed (or installable); may still be dropped.
    CanInstall,
    /// Every solution uninstalls this package.
    MustUninstall,
    /// Every solution installs this package.
    MustInstall,
    /// The downstream solver decides.
    Search,
}

impl State {
    /// A provider in this state satisfies its target (isSP).
    fn is_safe(self) -> bool {
        matches!(self, State::CanInstall | State::MustInstall)
    }

    /// A provider in this state satisfies or may yet satisfy its target
    /// (isSPI).
    fn is_safe_or_search(self) -> bool {
        self.is_safe() || self == State::Search
    }

    /// A provider in this state still counts as a candidate (isCP).
    fn is_candidate(self) -> bool {
        self != State::MustUninstall
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let tag = match self {
            State::CanUninstall => "CU",
            State::CanInstall => "CI",
            State::MustUninstall => "MU",
            State::MustInstall => "MI",
            State::Search => "SR",
        };
        write!(f, "{tag}")
    }
}

/// The four state-changing obligations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum StateOp {
    MustUninstall,
    MustInstall,
    CanInstall,
    CanUninstall,
}

impl Display for StateOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let tag = match self {
            StateOp::MustUninstall => "O_MU",
            StateOp::MustInstall => "O_MI",
            StateOp::CanInstall => "O_CI",
            StateOp::CanUninstall => "O_CU",
        };
        write!(f, "{tag}")
    }
}

/// Operations submitted to the worklist.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Op {
    State(StateOp),
    /// Re-examine the candidate-provider count.
    UpdateCandidates,
    /// Re-examine the safe-provider count.
    UpdateSafe,
    /// Re-propagate the current state and re-examine both counts.
    Update,
}

/// Result of applying a [`StateOp`] to a [`State`].
enum Transition {
    To(State),
    /// The obligations contradict: the instance is infeasible.
    Infeasible,
    /// Never produced by a valid run.
    Unreachable,
}

/// The transition table.
///
/// ```text
///          O_MU  O_MI  O_CI  O_CU
///   CU  ->  MU    MI    SR    CU
///   CI  ->  MU    MI    CI    SR
///   MU  ->  MU    FL    MU    MU
///   MI  ->  FL    MI    MI    MI
///   SR  ->  AB    AB    SR    SR
/// ```
fn transition(current: State, op: StateOp) -> Transition {
    use State::*;
    use Transition::*;
    match (current, op) {
        (CanUninstall, StateOp::MustUninstall) => To(MustUninstall),
        (CanUninstall, StateOp::MustInstall) => To(MustInstall),
        (CanUninstall, StateOp::CanInstall) => To(Search),
        (CanUninstall, StateOp::CanUninstall) => To(CanUninstall),

        (CanInstall, StateOp::MustUninstall) => To(MustUninstall),
        (CanInstall, StateOp::MustInstall) => To(MustInstall),
        (CanInstall, StateOp::CanInstall) => To(CanInstall),
        (CanInstall, StateOp::CanUninstall) => To(Search),

        (MustUninstall, StateOp::MustInstall) => Infeasible,
        (MustUninstall, _) => To(MustUninstall),

        (MustInstall, StateOp::MustUninstall) => Infeasible,
        (MustInstall, _) => To(MustInstall),

        (Search, StateOp::MustUninstall | StateOp::MustInstall) => Unreachable,
        (Search, _) => To(Search),
    }
}

/// Final classification of a reducer run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The instance has no solution.
    Fail,
    /// The reducer solved the instance completely.
    Solution,
    /// A residual search problem remains.
    Search,
}

/// Counters collected during reduction.
#[derive(Debug, Default, Clone)]
pub struct ReducerStats {
    /// Packages in the input.
    pub packages: u32,
    /// Packages ending in the search slice.
    pub in_search: u32,
    /// Solved packages that the solver must still look at (no safe
    /// provider yet).
    pub interesting: u32,
    /// Packages fully classified by the reducer.
    pub solved: u32,
    /// Packages classified uninstalled.
    pub not_interesting: u32,
    /// Relations crossing into the search slice.
    pub deps: u32,
    pub conflicts: u32,
    pub provides: u32,
    /// The reducer found a complete solution.
    pub solution: bool,
    /// The transition that proved infeasibility, if any.
    pub failure: Option<String>,
}

impl Display for ReducerStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(failure) = &self.failure {
            return writeln!(f, "FAILURE: {failure}");
        }
        writeln!(f, "General stats:")?;
        writeln!(f, "\tSolution:\t{}", if self.solution { "yes" } else { "no" })?;
        writeln!(f, "Package stats:")?;
        writeln!(f, "\tInitial packages:\t{}", self.packages)?;
        writeln!(f, "\tPackages in search:\t{}", self.in_search)?;
        writeln!(f, "\tPackages solved:\t{}", self.solved)?;
        writeln!(f, "\tNot interesting packages:\t{}", self.not_interesting)?;
        writeln!(f, "\tInteresting packages:\t{}", self.interesting)?;
        writeln!(f, "Package relations:")?;
        writeln!(f, "\tDependencies:\t{}", self.deps)?;
        writeln!(f, "\tConflicts:\t{}", self.conflicts)?;
        writeln!(f, "\tProvides:\t{}", self.provides)
    }
}

/// Error raised while setting up or running a reduction.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("invalid paranoid seed at line {line}: {text:?}")]
    InvalidSeed { line: usize, text: String },
    #[error("paranoid seed {id} is not a package of the input")]
    UnknownSeed { id: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

const TD_1: usize = 0;
const TD_2: usize = 1;

/// The reducer. Populate it with KCUDF statements (it implements
/// [`KCudfWriter`], so [`crate::kcudf::read`] can feed it, as can the
/// translator directly), then call [`Reducer::reduce`].
#[derive(Default, Debug)]
pub struct Reducer {
    graph: TriGraph,
    states: HashMap<u32, State>,
    /// Safe providers per package.
    sp: HashMap<u32, u32>,
    /// Candidate providers per package.
    cp: HashMap<u32, u32>,
    /// The urgent and the relaxed worklist; within each, FIFO.
    todo: [VecDeque<(Op, u32)>; 2],
    /// Packages forced into search by the paranoid seed.
    init_search: HashSet<u32>,
    stats: ReducerStats,
}

impl Reducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a reducer whose seed packages are forced into the search
    /// slice. The seed stream carries one package id per line.
    pub fn with_paranoid(seed: impl BufRead) -> Result<Self, ReduceError> {
        let mut reducer = Self::new();
        for (idx, line) in seed.lines().enumerate() {
            let line = line.map_err(ReadError::from)?;
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let id = text.parse().map_err(|_| ReduceError::InvalidSeed {
                line: idx + 1,
                text: text.to_string(),
            })?;
            reducer.init_search.insert(id);
        }
        Ok(reducer)
    }

    /// The state of package `p`.
    pub fn state(&self, p: u32) -> State {
        self.states[&p]
    }

    /// The number of safe providers of `p`.
    pub fn safe_providers(&self, p: u32) -> u32 {
        self.sp[&p]
    }

    /// The number of candidate providers of `p`.
    pub fn candidate_providers(&self, p: u32) -> u32 {
        self.cp[&p]
    }

    pub fn graph(&self) -> &TriGraph {
        &self.graph
    }

    pub fn stats(&self) -> &ReducerStats {
        &self.stats
    }

    fn push(&mut self, list: usize, op: Op, p: u32) {
        self.todo[list].push_back((op, p));
    }

    fn next_task(&mut self) -> Option<(Op, u32)> {
        if let Some(task) = self.todo[TD_1].pop_front() {
            return Some(task);
        }
        self.todo[TD_2].pop_front()
    }

    /// Runs the reduction and writes the two output slices.
    ///
    /// Every package ending can/must-install goes into `solved` as
    /// keep+install, every can/must-uninstall as keep+uninstall. Search
    /// packages keep their original flags in `search`; an installed package
    /// without a safe provider additionally joins the search with its
    /// provider edges, since the solver must still pick a provider for it.
    pub fn reduce<WS, WR>(&mut self, solved: &mut WS, search: &mut WR) -> Result<Outcome, ReduceError>
    where
        WS: KCudfWriter,
        WR: KCudfWriter,
    {
        for &id in &self.init_search {
            if !self.graph.is_package(id) {
                return Err(ReduceError::UnknownSeed { id });
            }
        }

        if !self.process() {
            return Ok(Outcome::Fail);
        }

        let packages: Vec<u32> = self.graph.packages().collect();
        let mut any_search = false;

        for &p in &packages {
            match self.states[&p] {
                State::CanInstall | State::MustInstall => {
                    if self.sp[&p] == 0 {
                        // Installed but no safe provider yet: a provider
                        // must still be chosen among its search candidates.
                        search.package(p, true, true, "sp=0")?;
                        any_search = true;
                        self.stats.in_search += 1;
                        self.stats.interesting += 1;
                    }
                    solved.package(p, true, true, "MI - CI")?;
                    self.stats.solved += 1;
                }
                State::Search => {
                    let (keep, install) = self.graph.state(p);
                    search.package(p, keep, install, "SR")?;
                    any_search = true;
                    self.stats.in_search += 1;
                }
                State::MustUninstall | State::CanUninstall => {
                    solved.package(p, true, false, "MU - CU")?;
                    self.stats.not_interesting += 1;
                    self.stats.solved += 1;
                }
            }
        }

        for &p in &packages {
            match self.states[&p] {
                State::MustUninstall | State::CanUninstall => {
                    // Reported keep+uninstall; none of its relations can
                    // matter anymore.
                }
                State::CanInstall | State::MustInstall => {
                    if self.sp[&p] == 0 {
                        self.write_search_providers(p, search)?;
                    }
                    self.write_search_relations(p, search)?;
                }
                State::Search => {
                    self.write_search_relations(p, search)?;
                }
            }
        }

        if any_search {
            return Ok(Outcome::Search);
        }
        self.stats.solution = true;
        Ok(Outcome::Solution)
    }

    /// Runs the worklist to its fixpoint. Returns false on infeasibility.
    fn process(&mut self) -> bool {
        let packages: Vec<u32> = self.graph.packages().collect();
        for &p in &packages {
            let mut candidates = 0;
            let mut safe = 0;
            for q in self.graph.providers(p) {
                let st = self.states[&q];
                if st.is_safe() {
                    safe += 1;
                }
                if st.is_candidate() {
                    candidates += 1;
                }
            }
            self.sp.insert(p, safe);
            self.cp.insert(p, candidates);
            self.todo[TD_1].push_back((Op::Update, p));
        }

        while let Some((op, p)) = self.next_task() {
            let current = self.states[&p];
            match op {
                Op::State(state_op) => {
                    let next = match transition(current, state_op) {
                        Transition::To(next) => next,
                        Transition::Infeasible => {
                            let failure = format!("{p}: TF({current},{state_op}): FL");
                            tracing::debug!("infeasible: {failure}");
                            self.stats.failure = Some(failure);
                            return false;
                        }
                        Transition::Unreachable => {
                            unreachable!("{state_op} delivered to search package {p}")
                        }
                    };
                    if next != current {
                        self.change_state(p, current, next);
                    }
                }
                Op::UpdateCandidates => {
                    if self.cp[&p] == 0 {
                        self.push(TD_1, Op::State(StateOp::MustUninstall), p);
                    }
                    if self.cp[&p] == 1 {
                        // Unit propagation on providers: the only remaining
                        // candidate becomes a hard dependency. This is the
                        // single place the reducer grows the graph.
                        let providers: Vec<u32> = self.graph.providers(p).collect();
                        for q in providers {
                            if self.states[&q].is_candidate() && !self.graph.has_dependency(p, q) {
                                tracing::trace!("unit provider: {p} -> {q}");
                                self.graph.add_dependency(p, q);
                                self.push(TD_1, Op::Update, q);
                                self.push(TD_1, Op::Update, p);
                            }
                        }
                    }
                }
                Op::UpdateSafe => {
                    if self.sp[&p] == 0 && self.states[&p].is_safe_or_search() {
                        for q in self.graph.providers(p) {
                            self.todo[TD_2].push_back((Op::State(StateOp::CanInstall), q));
                        }
                        self.push(TD_2, Op::State(StateOp::CanUninstall), p);
                    }
                }
                Op::Update => {
                    self.propagate(p);
                    self.push(TD_1, Op::UpdateCandidates, p);
                    self.push(TD_2, Op::UpdateSafe, p);
                }
            }
        }

        self.stats.packages = self.graph.num_packages() as u32;
        true
    }

    /// Applies a state change: maintains the provider counters of everything
    /// `p` provides, then propagates the new state.
    fn change_state(&mut self, p: u32, current: State, next: State) {
        tracing::trace!("package {p}: {current} -> {next}");

        if !current.is_safe() && next.is_safe() {
            for q in self.graph.provides(p) {
                *self.sp.get_mut(&q).expect("counters initialized") += 1;
            }
        }
        if current.is_safe() && !next.is_safe() {
            for q in self.graph.provides(p) {
                let sp = self.sp.get_mut(&q).expect("counters initialized");
                *sp = sp.checked_sub(1).expect("safe-provider counter underflow");
                if *sp == 0 && self.states[&q].is_safe_or_search() {
                    self.todo[TD_2].push_back((Op::UpdateSafe, q));
                }
            }
        }
        if !current.is_safe_or_search() && next.is_safe_or_search() && self.sp[&p] == 0 {
            self.todo[TD_2].push_back((Op::Update, p));
        }
        if current.is_candidate() && !next.is_candidate() {
            for q in self.graph.provides(p) {
                let cp = self.cp.get_mut(&q).expect("counters initialized");
                *cp = cp
                    .checked_sub(1)
                    .expect("candidate-provider counter underflow");
                if *cp <= 1 {
                    self.todo[TD_1].push_back((Op::UpdateCandidates, q));
                }
            }
        }

        self.states.insert(p, next);
        self.propagate(p);
    }

    /// Queues the obligations the current state of `p` imposes on its
    /// neighborhood.
    fn propagate(&mut self, p: u32) {
        match self.states[&p] {
            State::MustInstall => {
                // Its dependencies must come along; its conflicts must go.
                for q in self.graph.dependencies(p) {
                    self.todo[TD_1].push_back((Op::State(StateOp::MustInstall), q));
                }
                for q in self.graph.conflicts(p) {
                    self.todo[TD_1].push_back((Op::State(StateOp::MustUninstall), q));
                }
            }
            State::MustUninstall => {
                // Whatever depends on it must go too.
                for q in self.graph.dependers(p) {
                    self.todo[TD_1].push_back((Op::State(StateOp::MustUninstall), q));
                }
            }
            State::CanInstall => {
                for q in self.graph.dependencies(p) {
                    self.todo[TD_2].push_back((Op::State(StateOp::CanInstall), q));
                }
                for q in self.graph.conflicts(p) {
                    self.todo[TD_2].push_back((Op::State(StateOp::CanUninstall), q));
                }
            }
            State::CanUninstall => {
                for q in self.graph.dependers(p) {
                    self.todo[TD_2].push_back((Op::State(StateOp::CanUninstall), q));
                }
            }
            State::Search => {
                // The solver may pick either polarity: its dependencies must
                // stay installable, its conflicts and dependers removable.
                for q in self.graph.dependencies(p) {
                    self.todo[TD_2].push_back((Op::State(StateOp::CanInstall), q));
                }
                for q in self.graph.conflicts(p) {
                    self.todo[TD_2].push_back((Op::State(StateOp::CanUninstall), q));
                }
                for q in self.graph.dependers(p) {
                    self.todo[TD_2].push_back((Op::State(StateOp::CanUninstall), q));
                }
            }
        }
    }

    /// Writes the dependency, conflict and provides edges of `p` that cross
    /// into the search slice.
    fn write_search_relations<W: KCudfWriter>(
        &mut self,
        p: u32,
        wrt: &mut W,
    ) -> Result<(), ReduceError> {
        for q in self.graph.dependencies(p) {
            let st = self.states[&q];
            if st == State::Search {
                wrt.dependency(p, q, "DEP-betweenSR")?;
                self.stats.deps += 1;
            } else {
                debug_assert!(st.is_safe(), "dependency of {p} classified {st}");
            }
        }
        for q in self.graph.conflicts(p) {
            let st = self.states[&q];
            if st == State::Search {
                wrt.conflict(p, q, "CONF-betweenSR")?;
                self.stats.conflicts += 1;
            } else {
                debug_assert!(!st.is_safe_or_search(), "conflict of {p} classified {st}");
            }
        }
        for q in self.graph.provides(p) {
            if self.states[&q] == State::Search {
                wrt.provides(p, q, "PVD-betweenSR")?;
                self.stats.provides += 1;
            }
        }
        Ok(())
    }

    /// Writes the provider edges of an installed package without a safe
    /// provider: its search providers carry the choice.
    fn write_search_providers<W: KCudfWriter>(
        &mut self,
        p: u32,
        wrt: &mut W,
    ) -> Result<(), ReduceError> {
        for q in self.graph.providers(p) {
            let st = self.states[&q];
            debug_assert!(
                st == State::Search || st == State::MustUninstall,
                "provider of sp=0 package {p} classified {st}"
            );
            if st == State::Search {
                wrt.provides(q, p, "PVDR-SPI_SR")?;
                self.stats.provides += 1;
            }
        }
        Ok(())
    }
}

impl KCudfWriter for Reducer {
    fn package(&mut self, id: u32, keep: bool, install: bool, _desc: &str) -> io::Result<()> {
        let state = match (keep, install) {
            (false, false) => State::CanUninstall,
            (false, true) => State::CanInstall,
            (true, false) => State::MustUninstall,
            (true, true) => State::MustInstall,
        };
        self.states.entry(id).or_insert(state);
        self.graph.add_package(id, keep, install);

        if self.init_search.contains(&id) {
            tracing::debug!("package {id} forced towards search by the paranoid seed");
            self.todo[TD_2].push_back((Op::State(StateOp::CanInstall), id));
        }
        Ok(())
    }

    fn dependency(&mut self, id: u32, id2: u32, _desc: &str) -> io::Result<()> {
        self.graph.add_dependency(id, id2);
        Ok(())
    }

    fn conflict(&mut self, id: u32, id2: u32, _desc: &str) -> io::Result<()> {
        self.graph.add_conflict(id, id2);
        Ok(())
    }

    fn provides(&mut self, id: u32, id2: u32, _desc: &str) -> io::Result<()> {
        self.graph.add_provides(id, id2);
        Ok(())
    }
}

/// Reads the KCUDF stream `kcudf` and reduces it, writing the solved and
/// search slices. The optional `paranoid` stream seeds packages that must
/// enter the search.
pub fn reduce<R, WS, WR>(
    kcudf: R,
    solved: &mut WS,
    search: &mut WR,
    paranoid: Option<impl BufRead>,
) -> Result<(Outcome, ReducerStats), ReduceError>
where
    R: BufRead,
    WS: KCudfWriter,
    WR: KCudfWriter,
{
    let mut reducer = match paranoid {
        Some(seed) => Reducer::with_paranoid(seed)?,
        None => Reducer::new(),
    };
    crate::kcudf::read(kcudf, &mut reducer)?;
    let outcome = reducer.reduce(solved, search)?;
    Ok((outcome, reducer.stats().clone()))
}
