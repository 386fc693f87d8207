//! The KCUDF codec: line-oriented reader and writers for the kernel form.
//!
//! One statement per line, the first character selects the kind:
//!
//! ```text
//! P <id> <K|k> <I|i> # <desc>    package; uppercase = keep/install true
//! D <id1> <id2> # <desc>         id1 depends on id2
//! C <id1> <id2> # <desc>         conflict (undirected)
//! R <id1> <id2> # <desc>         id1 provides id2
//! # ...                          comment
//! ```
//!
//! Consumers of parsed statements implement [`KCudfWriter`]; the reader
//! pushes every statement into one. The file writer emits the canonical
//! form: self-dependencies suppressed, conflicts with the smaller id first.
//! The reader synthesizes a self-dependency for every `P` statement, so the
//! two conventions round-trip.
//!
//! The info sidecar maps ids back to names and versions, one
//! `<id> <version> <name>` per line.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, Write};

use thiserror::Error;

/// Error raised while reading a KCUDF or info stream.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unknown statement at line {line}: {text:?}")]
    InvalidStatement { line: usize, text: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A sink for KCUDF statements.
///
/// The descriptions are human-readable diagnostics only; writers are free to
/// drop them.
pub trait KCudfWriter {
    fn package(&mut self, id: u32, keep: bool, install: bool, desc: &str) -> io::Result<()>;
    fn dependency(&mut self, id: u32, id2: u32, desc: &str) -> io::Result<()>;
    fn conflict(&mut self, id: u32, id2: u32, desc: &str) -> io::Result<()>;
    fn provides(&mut self, id: u32, id2: u32, desc: &str) -> io::Result<()>;
}

/// A sink for info-sidecar statements.
pub trait KCudfInfoWriter {
    fn package(&mut self, id: u32, version: u32, name: &str) -> io::Result<()>;
}

/// Writes KCUDF statements to a byte stream in the canonical form.
pub struct KCudfFileWriter<W: Write> {
    out: W,
    #[cfg(debug_assertions)]
    declared: BTreeSet<u32>,
}

impl<W: Write> KCudfFileWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            #[cfg(debug_assertions)]
            declared: BTreeSet::new(),
        }
    }

    /// Consumes the writer, returning the underlying stream.
    pub fn into_inner(self) -> W {
        self.out
    }

    #[cfg(debug_assertions)]
    fn check_declared(&self, id: u32, id2: u32) {
        debug_assert!(self.declared.contains(&id), "relation names undeclared {id}");
        debug_assert!(self.declared.contains(&id2), "relation names undeclared {id2}");
    }

    #[cfg(not(debug_assertions))]
    fn check_declared(&self, _id: u32, _id2: u32) {}
}

impl<W: Write> KCudfWriter for KCudfFileWriter<W> {
    fn package(&mut self, id: u32, keep: bool, install: bool, desc: &str) -> io::Result<()> {
        #[cfg(debug_assertions)]
        self.declared.insert(id);
        writeln!(
            self.out,
            "P {} {} {} # {}",
            id,
            if keep { 'K' } else { 'k' },
            if install { 'I' } else { 'i' },
            desc
        )
    }

    fn dependency(&mut self, id: u32, id2: u32, desc: &str) -> io::Result<()> {
        self.check_declared(id, id2);
        if id != id2 {
            writeln!(self.out, "D {} {} # {}", id, id2, desc)?;
        }
        Ok(())
    }

    fn conflict(&mut self, id: u32, id2: u32, desc: &str) -> io::Result<()> {
        self.check_declared(id, id2);
        let (a, b) = if id <= id2 { (id, id2) } else { (id2, id) };
        writeln!(self.out, "C {} {} # {}", a, b, desc)
    }

    fn provides(&mut self, id: u32, id2: u32, desc: &str) -> io::Result<()> {
        self.check_declared(id, id2);
        writeln!(self.out, "R {} {} # {}", id, id2, desc)
    }
}

/// Writes info statements to a byte stream.
pub struct KCudfInfoFileWriter<W: Write> {
    out: W,
}

impl<W: Write> KCudfInfoFileWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> KCudfInfoWriter for KCudfInfoFileWriter<W> {
    fn package(&mut self, id: u32, version: u32, name: &str) -> io::Result<()> {
        writeln!(self.out, "{} {} {}", id, version, name)
    }
}

/// Stores the content of a KCUDF stream in memory, deduplicated and ordered.
#[derive(Default)]
pub struct KCudfMemWriter {
    packages: BTreeSet<u32>,
    keeps: BTreeSet<u32>,
    installs: BTreeSet<u32>,
    deps: BTreeMap<u32, BTreeSet<u32>>,
    conflicts: BTreeMap<u32, BTreeSet<u32>>,
    provides: BTreeMap<u32, BTreeSet<u32>>,
}

impl KCudfMemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_package(&self, id: u32) -> bool {
        self.packages.contains(&id)
    }

    pub fn packages(&self) -> impl Iterator<Item = u32> + '_ {
        self.packages.iter().copied()
    }

    pub fn num_packages(&self) -> usize {
        self.packages.len()
    }

    pub fn keep(&self, id: u32) -> bool {
        self.keeps.contains(&id)
    }

    pub fn install(&self, id: u32) -> bool {
        self.installs.contains(&id)
    }

    pub fn deps_of(&self, id: u32) -> impl Iterator<Item = u32> + '_ {
        self.deps.get(&id).into_iter().flatten().copied()
    }

    pub fn conflicts_of(&self, id: u32) -> impl Iterator<Item = u32> + '_ {
        self.conflicts.get(&id).into_iter().flatten().copied()
    }

    pub fn provides_of(&self, id: u32) -> impl Iterator<Item = u32> + '_ {
        self.provides.get(&id).into_iter().flatten().copied()
    }

    /// Replays the stored statements into `wrt` in canonical order:
    /// packages ascending, then for each package its dependencies, conflicts
    /// (smaller endpoint only) and provides, targets ascending.
    pub fn write_to<W: KCudfWriter>(&self, wrt: &mut W) -> io::Result<()> {
        for &p in &self.packages {
            wrt.package(p, self.keep(p), self.install(p), "")?;
        }
        for (&p, targets) in &self.deps {
            for &q in targets {
                wrt.dependency(p, q, "")?;
            }
        }
        for (&p, targets) in &self.conflicts {
            for &q in targets.iter().filter(|&&q| p <= q) {
                wrt.conflict(p, q, "")?;
            }
        }
        for (&p, targets) in &self.provides {
            for &q in targets {
                wrt.provides(p, q, "")?;
            }
        }
        Ok(())
    }
}

impl KCudfWriter for KCudfMemWriter {
    fn package(&mut self, id: u32, keep: bool, install: bool, _desc: &str) -> io::Result<()> {
        self.packages.insert(id);
        if keep {
            self.keeps.insert(id);
        }
        if install {
            self.installs.insert(id);
        }
        Ok(())
    }

    fn dependency(&mut self, id: u32, id2: u32, _desc: &str) -> io::Result<()> {
        self.deps.entry(id).or_default().insert(id2);
        Ok(())
    }

    fn conflict(&mut self, id: u32, id2: u32, _desc: &str) -> io::Result<()> {
        self.conflicts.entry(id).or_default().insert(id2);
        self.conflicts.entry(id2).or_default().insert(id);
        Ok(())
    }

    fn provides(&mut self, id: u32, id2: u32, _desc: &str) -> io::Result<()> {
        self.provides.entry(id).or_default().insert(id2);
        Ok(())
    }
}

/// Stores the content of an info stream in memory.
#[derive(Default)]
pub struct KCudfInfoMemWriter {
    entries: BTreeMap<u32, (u32, String)>,
}

impl KCudfInfoMemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<(u32, &str)> {
        self.entries.get(&id).map(|(v, n)| (*v, n.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &str)> {
        self.entries.iter().map(|(&id, (v, n))| (id, *v, n.as_str()))
    }
}

impl KCudfInfoWriter for KCudfInfoMemWriter {
    fn package(&mut self, id: u32, version: u32, name: &str) -> io::Result<()> {
        self.entries.insert(id, (version, name.to_string()));
        Ok(())
    }
}

fn invalid(line: usize, text: &str) -> ReadError {
    ReadError::InvalidStatement {
        line,
        text: text.to_string(),
    }
}

fn next_id<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    line: usize,
    text: &str,
) -> Result<u32, ReadError> {
    fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| invalid(line, text))
}

/// Parses the KCUDF stream `input`, pushing every statement into `wrt`.
///
/// A self-dependency is synthesized for every `P` statement; duplicate
/// relations are passed through as-is, it is up to the writer to deduplicate
/// if it needs to.
pub fn read<R: BufRead, W: KCudfWriter>(input: R, wrt: &mut W) -> Result<(), ReadError> {
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let ln = idx + 1;
        if line.is_empty() {
            continue;
        }
        let mut chars = line.chars();
        let tag = chars.next().expect("line is not empty");
        let mut fields = chars.as_str().split_whitespace();
        match tag {
            'P' => {
                let id = next_id(&mut fields, ln, &line)?;
                let keep = fields.next().ok_or_else(|| invalid(ln, &line))? == "K";
                let install = fields.next().ok_or_else(|| invalid(ln, &line))? == "I";
                wrt.package(id, keep, install, "")?;
                wrt.dependency(id, id, "self-dep")?;
            }
            'D' => {
                let (id, id2) = (next_id(&mut fields, ln, &line)?, next_id(&mut fields, ln, &line)?);
                wrt.dependency(id, id2, "")?;
            }
            'C' => {
                let (id, id2) = (next_id(&mut fields, ln, &line)?, next_id(&mut fields, ln, &line)?);
                wrt.conflict(id, id2, "")?;
            }
            'R' => {
                let (id, id2) = (next_id(&mut fields, ln, &line)?, next_id(&mut fields, ln, &line)?);
                wrt.provides(id, id2, "")?;
            }
            '#' => {}
            _ => return Err(invalid(ln, &line)),
        }
    }
    Ok(())
}

/// Parses the info stream `input` into `wrt`. Lines are
/// `<id> <version> <name>`; the name may be empty for artificial packages.
pub fn read_info<R: BufRead, W: KCudfInfoWriter>(input: R, wrt: &mut W) -> Result<(), ReadError> {
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = (|| {
            let id: u32 = fields.next()?.parse().ok()?;
            let version: u32 = fields.next()?.parse().ok()?;
            Some((id, version, fields.next().unwrap_or("")))
        })();
        let (id, version, name) = parsed.ok_or_else(|| invalid(idx + 1, &line))?;
        wrt.package(id, version, name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_synthesizes_self_deps() {
        let mut mem = KCudfMemWriter::new();
        read("P 3 K i # pinned\n".as_bytes(), &mut mem).unwrap();
        assert!(mem.is_package(3));
        assert!(mem.keep(3));
        assert!(!mem.install(3));
        itertools::assert_equal(mem.deps_of(3), [3]);
    }

    #[test]
    fn conflicts_are_stored_symmetrically() {
        let mut mem = KCudfMemWriter::new();
        read("P 1 k i # \nP 2 k i # \nC 2 1 # \n".as_bytes(), &mut mem).unwrap();
        itertools::assert_equal(mem.conflicts_of(1), [2]);
        itertools::assert_equal(mem.conflicts_of(2), [1]);
    }

    #[test]
    fn unknown_statements_carry_the_line_number() {
        let mut mem = KCudfMemWriter::new();
        let err = read("P 1 k i # \nX 1 2\n".as_bytes(), &mut mem).unwrap_err();
        match err {
            ReadError::InvalidStatement { line, text } => {
                assert_eq!(line, 2);
                assert_eq!(text, "X 1 2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let mut mem = KCudfMemWriter::new();
        read("# header\n\nP 0 k I # \n".as_bytes(), &mut mem).unwrap();
        assert_eq!(mem.num_packages(), 1);
    }

    #[test]
    fn writer_emits_canonical_lines() {
        let mut wrt = KCudfFileWriter::new(Vec::new());
        wrt.package(0, true, false, "zero").unwrap();
        wrt.package(5, false, true, "").unwrap();
        wrt.dependency(0, 0, "self").unwrap();
        wrt.dependency(0, 5, "").unwrap();
        wrt.conflict(5, 0, "flipped").unwrap();
        wrt.provides(5, 0, "").unwrap();
        let text = String::from_utf8(wrt.into_inner()).unwrap();
        assert_eq!(
            text,
            "P 0 K i # zero\nP 5 k I # \nD 0 5 # \nC 0 5 # flipped\nR 5 0 # \n"
        );
    }

    #[test]
    fn canonical_round_trip_is_stable() {
        let input = "P 0 K I # \nP 1 k i # \nD 0 1 # \nC 0 1 # \nR 1 0 # \n";
        let mut mem = KCudfMemWriter::new();
        read(input.as_bytes(), &mut mem).unwrap();
        let mut out = KCudfFileWriter::new(Vec::new());
        mem.write_to(&mut out).unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        // Self-deps synthesized by the reader are suppressed again by the
        // writer, so the canonical form is reproduced byte for byte.
        assert_eq!(text, input);
    }

    #[test]
    fn info_round_trips_through_the_map_writer() {
        let mut info = KCudfInfoMemWriter::new();
        read_info("0 1 alpha\n3 999 \n".as_bytes(), &mut info).unwrap();
        assert_eq!(info.get(0), Some((1, "alpha")));
        assert_eq!(info.get(3), Some((999, "")));
    }
}
