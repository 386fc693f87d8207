//! Translates CUDF package universes into the KCUDF kernel form and reduces
//! them with a deterministic fixpoint.
//!
//! CUDF describes a package universe (named, versioned packages with
//! dependency formulas, conflicts, provides and an installation state) plus
//! a user request. The [`translate::Translator`] rewrites such a document
//! into KCUDF: a tripartite graph over anonymous integer ids with three edge
//! kinds (depends, conflict, provides) and per-node `keep`/`install` flags,
//! where every non-equality constraint has been reified as a *disjunction*
//! node over the versions satisfying it. Structurally equal disjunctions are
//! interned away, so downstream consumers never see duplicates.
//!
//! The [`reduce::Reducer`] then runs a worklist fixpoint over a five-state
//! lattice per node, tracking candidate- and safe-provider counts, and
//! classifies every package as must/can install/uninstall or *search*. The
//! result is a proof of infeasibility, a complete solution, or a residual
//! search problem that is typically a small fraction of the input, ready to
//! hand to a combinatorial solver.
//!
//! Everything is single threaded and deterministic: the same input produces
//! byte-identical output. Names and versions survive only in the info
//! sidecar written next to the KCUDF file.

pub mod cudf;
pub mod graph;
pub(crate) mod internal;
pub mod kcudf;
pub mod reduce;
pub mod store;
pub mod translate;

pub use cudf::{CudfDoc, CudfPackage, Keep, ParseError, RelOp, Request, Vpkg};
pub use graph::TriGraph;
pub use internal::id::{NameId, NodeId};
pub use kcudf::{
    KCudfFileWriter, KCudfInfoFileWriter, KCudfInfoMemWriter, KCudfInfoWriter, KCudfMemWriter,
    KCudfWriter, ReadError, read, read_info,
};
pub use reduce::{Outcome, ReduceError, Reducer, ReducerStats, reduce};
pub use store::NodeStore;
pub use translate::{TranslateError, Translator, TranslatorStats};
