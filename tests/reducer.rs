//! Tests for the reducer driven by hand-written KCUDF instances.
//!
//! Instances follow the writer's conventions: concretes carry an explicit
//! self-provide (`R p p`), the reader synthesizes the self-dependencies.

use kcudf::reduce::State;
use kcudf::{read, KCudfMemWriter, Outcome, ReduceError, Reducer};

/// Reads `text`, reduces, and returns the reducer with both slices.
fn run(text: &str) -> (Outcome, Reducer, KCudfMemWriter, KCudfMemWriter) {
    run_with_seed(text, None)
}

fn run_with_seed(
    text: &str,
    seed: Option<&str>,
) -> (Outcome, Reducer, KCudfMemWriter, KCudfMemWriter) {
    let mut reducer = match seed {
        Some(seed) => Reducer::with_paranoid(seed.as_bytes()).unwrap(),
        None => Reducer::new(),
    };
    read(text.as_bytes(), &mut reducer).unwrap();
    let mut solved = KCudfMemWriter::new();
    let mut search = KCudfMemWriter::new();
    let outcome = reducer.reduce(&mut solved, &mut search).unwrap();
    (outcome, reducer, solved, search)
}

/// Must-install flows down dependency chains.
#[test]
fn must_install_propagates_to_dependencies() {
    let (outcome, reducer, solved, search) = run(
        "P 0 K I # \nP 1 k i # \nP 2 k i # \n\
         R 0 0 # \nR 1 1 # \nR 2 2 # \n\
         D 0 1 # \nD 1 2 # \n",
    );
    assert_eq!(outcome, Outcome::Solution);
    for p in 0..3 {
        assert_eq!(reducer.state(p), State::MustInstall);
        assert!(solved.keep(p) && solved.install(p));
    }
    assert_eq!(search.num_packages(), 0);
    assert!(reducer.stats().solution);
}

/// Must-uninstall flows up to the dependers.
#[test]
fn must_uninstall_propagates_to_dependers() {
    let (outcome, reducer, solved, _) = run(
        "P 0 K i # \nP 1 k I # \nP 2 k I # \n\
         R 0 0 # \nR 1 1 # \nR 2 2 # \n\
         D 1 0 # \nD 2 1 # \n",
    );
    assert_eq!(outcome, Outcome::Solution);
    for p in 0..3 {
        assert_eq!(reducer.state(p), State::MustUninstall);
        assert!(solved.keep(p) && !solved.install(p));
    }
}

/// Two pinned packages in conflict have no solution, and the failure names
/// the transition that fired.
#[test]
fn pinned_conflict_is_infeasible() {
    let (outcome, reducer, _, _) = run(
        "P 0 K I # \nP 1 K I # \nR 0 0 # \nR 1 1 # \nC 0 1 # \n",
    );
    assert_eq!(outcome, Outcome::Fail);
    let failure = reducer.stats().failure.as_deref().unwrap();
    insta::assert_snapshot!(failure, @"1: TF(MI,O_MU): FL");
}

/// Two merely-installed packages in conflict both defer to the solver.
#[test]
fn installed_conflict_goes_to_search() {
    let (outcome, reducer, _, search) = run(
        "P 0 k I # \nP 1 k I # \nR 0 0 # \nR 1 1 # \nC 0 1 # \n",
    );
    assert_eq!(outcome, Outcome::Search);
    assert_eq!(reducer.state(0), State::Search);
    assert_eq!(reducer.state(1), State::Search);
    // Both enter the search with their original flags, and the conflict
    // crosses with them.
    assert!(search.is_package(0) && search.install(0) && !search.keep(0));
    itertools::assert_equal(search.conflicts_of(0), [1]);
}

/// A package with no candidate provider left must go, and so must
/// everything depending on it.
#[test]
fn exhausted_providers_force_uninstall() {
    // 2 is provided by 0 and 1 only; both are pinned out.
    let (outcome, reducer, solved, _) = run(
        "P 0 K i # \nP 1 K i # \nP 2 k I # \nP 3 k I # \n\
         R 0 2 # \nR 1 2 # \nR 3 3 # \n\
         D 3 2 # \n",
    );
    assert_eq!(outcome, Outcome::Solution);
    assert_eq!(reducer.state(2), State::MustUninstall);
    assert_eq!(reducer.state(3), State::MustUninstall);
    assert!(solved.keep(3) && !solved.install(3));
}

/// With a single candidate provider left, the provider becomes a hard
/// dependency and is dragged in.
#[test]
fn last_candidate_becomes_a_dependency() {
    // 2 is pinned in and provided by 0 (pinned out) and 1.
    let (outcome, reducer, solved, _) = run(
        "P 0 K i # \nP 1 k i # \nP 2 K I # \n\
         R 0 2 # \nR 1 2 # \nR 1 1 # \n",
    );
    assert_eq!(outcome, Outcome::Solution);
    assert_eq!(reducer.state(1), State::MustInstall);
    assert!(reducer.graph().has_dependency(2, 1));
    assert!(solved.keep(1) && solved.install(1));
    assert_eq!(reducer.candidate_providers(2), 1);
}

/// An installed package whose providers are all undecided joins the search
/// pinned, together with its provider edges.
#[test]
fn installed_without_safe_provider_joins_the_search() {
    // 3 must stay, its providers 0 and 1 conflict with each other.
    let (outcome, reducer, solved, search) = run(
        "P 0 k i # \nP 1 k i # \nP 3 K I # \n\
         R 0 3 # \nR 1 3 # \nR 0 0 # \nR 1 1 # \n\
         C 0 1 # \n",
    );
    assert_eq!(outcome, Outcome::Search);
    assert_eq!(reducer.state(3), State::MustInstall);
    assert_eq!(reducer.safe_providers(3), 0);
    assert_eq!(reducer.state(0), State::Search);
    assert_eq!(reducer.state(1), State::Search);
    // Solved and search both carry it, pinned installed. The search
    // providers keep their self-provide and gain the provider edge.
    assert!(solved.keep(3) && solved.install(3));
    assert!(search.keep(3) && search.install(3));
    itertools::assert_equal(search.provides_of(0), [0, 3]);
    itertools::assert_equal(search.provides_of(1), [1, 3]);
}

/// The counters match their definition at the fixpoint.
#[test]
fn provider_counters_are_consistent() {
    let (_, reducer, _, _) = run(
        "P 0 k I # \nP 1 k i # \nP 2 K I # \nP 3 k i # \nP 4 k i # \n\
         R 0 0 # \nR 1 1 # \nR 3 3 # \nR 4 4 # \n\
         R 0 2 # \nR 1 2 # \nR 3 2 # \n\
         D 0 1 # \nC 3 4 # \n",
    );
    let graph = reducer.graph();
    for p in graph.packages() {
        let mut candidates = 0;
        let mut safe = 0;
        for q in graph.providers(p) {
            let st = reducer.state(q);
            if st != State::MustUninstall {
                candidates += 1;
            }
            if st == State::CanInstall || st == State::MustInstall {
                safe += 1;
            }
        }
        assert_eq!(reducer.candidate_providers(p), candidates, "cp of {p}");
        assert_eq!(reducer.safe_providers(p), safe, "sp of {p}");
    }
}

/// Paranoid seeds force otherwise-untouched packages into the search.
#[test]
fn paranoid_seed_forces_search() {
    let text = "P 0 k i # \nP 1 k i # \nR 0 0 # \nR 1 1 # \n";
    let (outcome, reducer, _, _) = run(text);
    assert_eq!(outcome, Outcome::Solution);
    assert_eq!(reducer.state(0), State::CanUninstall);

    let (outcome, reducer, _, search) = run_with_seed(text, Some("0\n"));
    assert_eq!(outcome, Outcome::Search);
    assert_eq!(reducer.state(0), State::Search);
    assert_eq!(reducer.state(1), State::CanUninstall);
    assert!(search.is_package(0));
    assert!(!search.is_package(1));
}

/// A seed id that is not a package of the input is rejected.
#[test]
fn unknown_paranoid_seed_is_rejected() {
    let mut reducer = Reducer::with_paranoid("7\n".as_bytes()).unwrap();
    read("P 0 k i # \n".as_bytes(), &mut reducer).unwrap();
    let mut solved = KCudfMemWriter::new();
    let mut search = KCudfMemWriter::new();
    let err = reducer.reduce(&mut solved, &mut search).unwrap_err();
    assert!(matches!(err, ReduceError::UnknownSeed { id: 7 }));
}

/// A seed line that is not a number is rejected up front.
#[test]
fn malformed_paranoid_seed_is_rejected() {
    let err = Reducer::with_paranoid("zero\n".as_bytes()).unwrap_err();
    assert!(matches!(err, ReduceError::InvalidSeed { line: 1, .. }));
}

/// The reduction halts on a dependency cycle instead of walking it forever.
#[test]
fn dependency_cycles_terminate() {
    let (outcome, reducer, _, _) = run(
        "P 0 K I # \nP 1 k i # \nP 2 k i # \n\
         R 0 0 # \nR 1 1 # \nR 2 2 # \n\
         D 0 1 # \nD 1 2 # \nD 2 1 # \n",
    );
    assert_eq!(outcome, Outcome::Solution);
    assert_eq!(reducer.state(1), State::MustInstall);
    assert_eq!(reducer.state(2), State::MustInstall);
}
