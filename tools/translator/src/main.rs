//! CLI front-end for the CUDF → KCUDF translator.

use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use kcudf::{cudf, KCudfFileWriter, KCudfInfoFileWriter, ParseError, TranslateError, Translator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "translator",
    about = "Translates a CUDF document into KCUDF",
    version
)]
struct Opts {
    /// File containing the CUDF description
    cudf: PathBuf,

    /// File receiving the resulting kernel CUDF (default: CUDF + ".kcudf")
    kcudf: Option<PathBuf>,

    /// File receiving the id-to-package info (default: CUDF + ".info")
    info: Option<PathBuf>,

    /// File receiving the paranoid family-expansion search seed
    #[arg(long)]
    paranoid: Option<PathBuf>,

    /// Embed human-readable diagnostics in the # comments (slow on big
    /// inputs)
    #[arg(long)]
    debug: bool,
}

enum Failure {
    Io(std::io::Error),
    Parse(ParseError),
    Translate(TranslateError),
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Io(err) => write!(f, "{err}"),
            Failure::Parse(err) => write!(f, "{err}"),
            Failure::Translate(err) => write!(f, "{err}"),
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::Io(err)
    }
}

impl From<ParseError> for Failure {
    fn from(err: ParseError) -> Self {
        Failure::Parse(err)
    }
}

impl From<TranslateError> for Failure {
    fn from(err: TranslateError) -> Self {
        Failure::Translate(err)
    }
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            // An unfulfillable request is infeasibility, everything else is
            // an input problem.
            Failure::Translate(TranslateError::FailedRequest(_)) => 2,
            _ => 1,
        }
    }
}

fn default_output(input: &Path, extension: &str) -> PathBuf {
    let mut path = input.as_os_str().to_os_string();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

fn run(opts: &Opts) -> Result<(), Failure> {
    let input = BufReader::new(File::open(&opts.cudf)?);
    let doc = cudf::parse(input)?;

    let kcudf_path = opts
        .kcudf
        .clone()
        .unwrap_or_else(|| default_output(&opts.cudf, "kcudf"));
    let info_path = opts
        .info
        .clone()
        .unwrap_or_else(|| default_output(&opts.cudf, "info"));

    let translator = Translator::new(&doc)?;

    let mut out = KCudfFileWriter::new(BufWriter::new(File::create(&kcudf_path)?));
    let mut info = KCudfInfoFileWriter::new(BufWriter::new(File::create(&info_path)?));
    translator.translate(&mut out, &mut info, opts.debug)?;
    out.into_inner().flush()?;
    info.into_inner().flush()?;

    if let Some(path) = &opts.paranoid {
        let mut seed = BufWriter::new(File::create(path)?);
        translator.write_paranoid(&mut seed)?;
        seed.flush()?;
    }

    eprint!("{}", translator.stats());
    println!("Generated KCUDF file: {}", kcudf_path.display());
    println!("Generated INFO file: {}", info_path.display());
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(failure.exit_code())
        }
    }
}
