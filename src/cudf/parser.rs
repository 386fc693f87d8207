//! A parser for the CUDF stanza subset the translator consumes.
//!
//! Stanzas are blocks of `key: value` lines separated by blank lines. A
//! stanza starting with `package:` describes one package; the stanza
//! starting with `request:` carries the `install:` / `remove:` / `upgrade:`
//! lines. Dependency formulas are comma-separated conjunction elements, each
//! a `|`-separated disjunction of versioned package expressions.

use std::io::BufRead;

use thiserror::Error;

use super::{CudfDoc, CudfPackage, Keep, RelOp, Request, Vpkg};

/// Error raised while parsing a CUDF document. Carries the 1-based line
/// number of the offending input.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: expected `key: value`, found {text:?}")]
    MalformedLine { line: usize, text: String },
    #[error("line {line}: unknown property {key:?}")]
    UnknownProperty { line: usize, key: String },
    #[error("line {line}: property {key:?} outside of a package or request stanza")]
    StrayProperty { line: usize, key: String },
    #[error("line {line}: invalid value for {key:?}: {text:?}")]
    InvalidValue {
        line: usize,
        key: String,
        text: String,
    },
    #[error("line {line}: invalid package expression {text:?}")]
    InvalidVpkg { line: usize, text: String },
    #[error("package {package} has no version")]
    MissingVersion { package: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum Stanza {
    None,
    Package(CudfPackage),
    Request,
}

/// Parses a CUDF document from `input`.
pub fn parse(input: impl BufRead) -> Result<CudfDoc, ParseError> {
    let mut doc = CudfDoc::default();
    let mut stanza = Stanza::None;

    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let ln = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush(&mut stanza, &mut doc);
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }

        let (key, value) = trimmed
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedLine {
                line: ln,
                text: trimmed.to_string(),
            })?;
        let key = key.trim();
        let value = value.trim();

        match key {
            "package" => {
                flush(&mut stanza, &mut doc);
                stanza = Stanza::Package(CudfPackage::new(value, 0));
            }
            "request" => {
                flush(&mut stanza, &mut doc);
                stanza = Stanza::Request;
            }
            _ => match &mut stanza {
                Stanza::None => {
                    return Err(ParseError::StrayProperty {
                        line: ln,
                        key: key.to_string(),
                    });
                }
                Stanza::Package(pkg) => package_property(pkg, key, value, ln)?,
                Stanza::Request => request_property(&mut doc.request, key, value, ln)?,
            },
        }
    }
    flush(&mut stanza, &mut doc);

    if let Some(pkg) = doc.packages.iter().find(|p| p.version == 0) {
        return Err(ParseError::MissingVersion {
            package: pkg.name.clone(),
        });
    }

    Ok(doc)
}

fn flush(stanza: &mut Stanza, doc: &mut CudfDoc) {
    if let Stanza::Package(pkg) = std::mem::replace(stanza, Stanza::None) {
        doc.packages.push(pkg);
    }
}

fn package_property(
    pkg: &mut CudfPackage,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ParseError> {
    match key {
        "version" => {
            pkg.version = value.parse().map_err(|_| invalid(line, key, value))?;
            if pkg.version == 0 {
                return Err(invalid(line, key, value));
            }
        }
        "installed" => {
            pkg.installed = match value {
                "true" => true,
                "false" => false,
                _ => return Err(invalid(line, key, value)),
            };
        }
        "keep" => {
            pkg.keep = match value {
                "version" => Keep::Version,
                "package" => Keep::Package,
                "feature" => Keep::Feature,
                "none" => Keep::None,
                _ => return Err(invalid(line, key, value)),
            };
        }
        "depends" => pkg.depends = formula(value, line)?,
        "conflicts" => pkg.conflicts = vpkg_list(value, line)?,
        "provides" => pkg.provides = vpkg_list(value, line)?,
        _ => {
            return Err(ParseError::UnknownProperty {
                line,
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

fn request_property(
    request: &mut Request,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ParseError> {
    let target = match key {
        "install" => &mut request.install,
        "remove" => &mut request.remove,
        "upgrade" => &mut request.upgrade,
        _ => {
            return Err(ParseError::UnknownProperty {
                line,
                key: key.to_string(),
            });
        }
    };
    target.extend(vpkg_list(value, line)?);
    Ok(())
}

fn invalid(line: usize, key: &str, text: &str) -> ParseError {
    ParseError::InvalidValue {
        line,
        key: key.to_string(),
        text: text.to_string(),
    }
}

/// Parses a dependency formula: comma-separated conjunction elements, each a
/// `|`-separated disjunction.
fn formula(text: &str, line: usize) -> Result<Vec<Vec<Vpkg>>, ParseError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|conj| {
            conj.split('|')
                .map(|term| vpkg(term, line))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect()
}

/// Parses a comma-separated list of package expressions.
fn vpkg_list(text: &str, line: usize) -> Result<Vec<Vpkg>, ParseError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',').map(|term| vpkg(term, line)).collect()
}

/// Parses a single package expression: `name` or `name <op> version`.
pub(crate) fn vpkg(text: &str, line: usize) -> Result<Vpkg, ParseError> {
    let err = || ParseError::InvalidVpkg {
        line,
        text: text.trim().to_string(),
    };

    let mut tokens = text.split_whitespace();
    let name = tokens.next().ok_or_else(err)?;
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '+')
    {
        return Err(err());
    }

    let Some(op) = tokens.next() else {
        return Ok(Vpkg::any(name));
    };
    let op = match op {
        "=" => RelOp::Eq,
        "!=" => RelOp::Neq,
        "<" => RelOp::Lt,
        "<=" => RelOp::Leq,
        ">" => RelOp::Gt,
        ">=" => RelOp::Geq,
        _ => return Err(err()),
    };
    let version: u32 = tokens
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(err)?;
    if tokens.next().is_some() {
        return Err(err());
    }

    Ok(Vpkg::constrained(name, op, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(text: &str) -> CudfDoc {
        parse(text.as_bytes()).unwrap()
    }

    #[test]
    fn parses_a_small_universe() {
        let doc = parse_str(
            "package: car\n\
             version: 1\n\
             installed: true\n\
             depends: engine >= 2 | electric-engine, wheel\n\
             conflicts: bike\n\
             provides: transport\n\
             keep: package\n\
             \n\
             package: bike\n\
             version: 7\n\
             \n\
             request: \n\
             install: car = 1\n\
             remove: bike\n\
             upgrade: wheel >= 2\n",
        );

        assert_eq!(doc.packages.len(), 2);
        let car = &doc.packages[0];
        assert_eq!(car.name, "car");
        assert_eq!(car.version, 1);
        assert!(car.installed);
        assert_eq!(car.keep, Keep::Package);
        assert_eq!(car.depends.len(), 2);
        assert_eq!(car.depends[0].len(), 2);
        assert_eq!(car.depends[0][0], Vpkg::constrained("engine", RelOp::Geq, 2));
        assert_eq!(car.depends[0][1], Vpkg::any("electric-engine"));
        assert_eq!(car.conflicts, vec![Vpkg::any("bike")]);
        assert_eq!(car.provides, vec![Vpkg::any("transport")]);

        assert_eq!(doc.request.install, vec![Vpkg::constrained("car", RelOp::Eq, 1)]);
        assert_eq!(doc.request.remove, vec![Vpkg::any("bike")]);
        assert_eq!(doc.request.upgrade, vec![Vpkg::constrained("wheel", RelOp::Geq, 2)]);
    }

    #[test]
    fn blank_lines_and_comments_are_ignored() {
        let doc = parse_str("# universe\n\npackage: a\nversion: 1\n\n\n");
        assert_eq!(doc.packages.len(), 1);
    }

    #[test]
    fn rejects_unknown_properties_with_line_numbers() {
        let err = parse("package: a\nversioon: 1\n".as_bytes()).unwrap_err();
        match err {
            ParseError::UnknownProperty { line, key } => {
                assert_eq!(line, 2);
                assert_eq!(key, "versioon");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_version_zero() {
        assert!(parse("package: a\nversion: 0\n".as_bytes()).is_err());
    }

    #[test]
    fn rejects_a_package_without_version() {
        let err = parse("package: a\ninstalled: true\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::MissingVersion { .. }));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse("package: a\nversion: 1\ndepends: b >=\n".as_bytes()).is_err());
        assert!(parse("package: a\nversion: 1\ndepends: b ~ 3\n".as_bytes()).is_err());
    }
}
