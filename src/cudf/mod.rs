//! The CUDF document model consumed by the translator.
//!
//! A [`CudfDoc`] describes a package universe (every known `(name, version)`
//! pair with its installation status, dependency formula, conflicts and
//! provides) together with the user request. The translator reads the
//! document; it never mutates it.
//!
//! The model covers exactly the CUDF subset the translator understands. A
//! small text parser for the same subset lives in [`parser`].

pub mod parser;

use std::fmt::{self, Display, Formatter};

pub use parser::{parse, ParseError};

/// Relational operator of a versioned package constraint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RelOp {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl Display for RelOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let token = match self {
            RelOp::Eq => "=",
            RelOp::Neq => "!=",
            RelOp::Lt => "<",
            RelOp::Leq => "<=",
            RelOp::Gt => ">",
            RelOp::Geq => ">=",
        };
        write!(f, "{token}")
    }
}

/// A versioned package expression: a package name with an optional
/// `(operator, version)` constraint. Unconstrained expressions match every
/// version of the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Vpkg {
    pub name: String,
    pub constraint: Option<(RelOp, u32)>,
}

impl Vpkg {
    /// An unconstrained expression for `name`.
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    /// A constrained expression `name <op> version`.
    pub fn constrained(name: impl Into<String>, op: RelOp, version: u32) -> Self {
        Self {
            name: name.into(),
            constraint: Some((op, version)),
        }
    }

    /// Returns the relational operator, or `None` when unconstrained.
    pub fn rel(&self) -> Option<RelOp> {
        self.constraint.map(|(op, _)| op)
    }

    /// Tests whether a concrete `version` of this name satisfies the
    /// constraint. Unconstrained expressions match every version.
    pub fn matches(&self, version: u32) -> bool {
        match self.constraint {
            None => true,
            Some((RelOp::Eq, v)) => version == v,
            Some((RelOp::Neq, v)) => version != v,
            Some((RelOp::Lt, v)) => version < v,
            Some((RelOp::Leq, v)) => version <= v,
            Some((RelOp::Gt, v)) => version > v,
            Some((RelOp::Geq, v)) => version >= v,
        }
    }
}

impl Display for Vpkg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.constraint {
            None => write!(f, "{}", self.name),
            Some((op, v)) => write!(f, "{}{op}{v}", self.name),
        }
    }
}

/// The `keep:` property of a package: how much of its current installation
/// state the solution must preserve.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Keep {
    /// No keep obligation.
    #[default]
    None,
    /// This exact version must stay installed.
    Version,
    /// At least one version of this package must stay installed.
    Package,
    /// Every feature this package provides must stay provided.
    Feature,
}

/// One package stanza of the universe.
#[derive(Debug, Clone)]
pub struct CudfPackage {
    pub name: String,
    pub version: u32,
    pub installed: bool,
    pub keep: Keep,
    /// Conjunction of disjunctions: every inner list must have at least one
    /// satisfied member.
    pub depends: Vec<Vec<Vpkg>>,
    pub conflicts: Vec<Vpkg>,
    pub provides: Vec<Vpkg>,
}

impl CudfPackage {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            installed: false,
            keep: Keep::None,
            depends: Vec::new(),
            conflicts: Vec::new(),
            provides: Vec::new(),
        }
    }
}

/// The user request: what to install, remove and upgrade.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub install: Vec<Vpkg>,
    pub remove: Vec<Vpkg>,
    pub upgrade: Vec<Vpkg>,
}

/// A parsed CUDF document: the package universe plus the request.
#[derive(Debug, Clone, Default)]
pub struct CudfDoc {
    pub packages: Vec<CudfPackage>,
    pub request: Request,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_follows_the_operator() {
        let vp = Vpkg::constrained("a", RelOp::Geq, 3);
        assert!(!vp.matches(2));
        assert!(vp.matches(3));
        assert!(vp.matches(4));

        let vp = Vpkg::constrained("a", RelOp::Neq, 3);
        assert!(vp.matches(2));
        assert!(!vp.matches(3));

        assert!(Vpkg::any("a").matches(1));
    }

    #[test]
    fn display_is_the_constraint_key_form() {
        assert_eq!(Vpkg::constrained("gcc", RelOp::Leq, 7).to_string(), "gcc<=7");
        assert_eq!(Vpkg::any("gcc").to_string(), "gcc");
    }
}
