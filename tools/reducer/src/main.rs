//! CLI front-end for the KCUDF reducer.

use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kcudf::{reduce, KCudfFileWriter, Outcome, ReduceError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "reducer",
    about = "Reduces a KCUDF instance into a solved and a search slice",
    version
)]
struct Opts {
    /// File containing the KCUDF description
    kcudf: PathBuf,

    /// File receiving the solved slice
    solved: PathBuf,

    /// File receiving the residual search problem
    search: PathBuf,

    /// File with paranoid seed ids that must enter the search
    #[arg(long)]
    paranoid: Option<PathBuf>,
}

enum Failure {
    Io(std::io::Error),
    Reduce(ReduceError),
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Io(err) => write!(f, "{err}"),
            Failure::Reduce(err) => write!(f, "{err}"),
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::Io(err)
    }
}

impl From<ReduceError> for Failure {
    fn from(err: ReduceError) -> Self {
        Failure::Reduce(err)
    }
}

fn run(opts: &Opts) -> Result<Outcome, Failure> {
    let input = BufReader::new(File::open(&opts.kcudf)?);
    let paranoid = match &opts.paranoid {
        Some(path) => Some(BufReader::new(File::open(path)?)),
        None => None,
    };

    let mut solved = KCudfFileWriter::new(BufWriter::new(File::create(&opts.solved)?));
    let mut search = KCudfFileWriter::new(BufWriter::new(File::create(&opts.search)?));

    eprintln!("*** Reducing: {}", opts.kcudf.display());
    let (outcome, stats) = reduce(input, &mut solved, &mut search, paranoid)?;
    solved.into_inner().flush()?;
    search.into_inner().flush()?;

    eprint!("{stats}");
    eprintln!("The file {} contains the solved part", opts.solved.display());
    eprintln!("The file {} contains the solver input", opts.search.display());
    Ok(outcome)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    match run(&opts) {
        Ok(Outcome::Solution) => {
            eprintln!("** The reducer has found a solution **");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Search) => {
            eprintln!("** Search needed **");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Fail) => {
            eprintln!("** No solution **");
            ExitCode::from(2)
        }
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(1)
        }
    }
}
