// Precompiler CLI (spec §6 exit codes), a straight port of
// `original_source/src/dresc.c`'s `--compile`/`--save`/`--test`
// pipeline collapsed into one default mode (parse, finalize, save,
// then verify the saved file loads), with `--check` standing in for
// the original's parse-only dry run.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use dres::policy::Policy;
use dres::resolver_config::ResolverConfig;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser)]
#[command(author, version, about = "Precompile a policy into a loadable bytecode image", long_about = None)]
struct Args {
    /// Policy source file to compile
    input: PathBuf,

    /// Where to write the compiled image (default: input path with a `c` suffix)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Parse and finalize only; do not write an output file
    #[arg(long)]
    check: bool,

    /// Raise logging verbosity; repeatable
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Structured log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Engine tunables (stack depth, scope capacity, unknown-method tolerance)
    #[arg(long)]
    config: Option<PathBuf>,
}

const EXIT_VALIDATION: u8 = 1;
const EXIT_SAME_PATH: u8 = 3;
const EXIT_PARSE: u8 = 4;
const EXIT_FINALIZE: u8 = 5;
const EXIT_SAVE: u8 = 6;
const EXIT_LOAD: u8 = 7;
const EXIT_ENV: u8 = 10;

fn fatal(code: u8, message: impl AsRef<str>) -> ExitCode {
    eprintln!("fatal error: {}", message.as_ref());
    ExitCode::from(code)
}

fn init_logging(args: &Args) {
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = match args.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// `check_env`: this engine stores ids as bare `u32`s rather than the
/// original's pointer-packed scheme, but is still only validated on
/// platforms where a pointer and a `u32` are the same width.
fn check_env() -> bool {
    std::mem::size_of::<*const u8>() == std::mem::size_of::<u32>()
}

fn default_output_path(input: &std::path::Path) -> PathBuf {
    let mut s = input.as_os_str().to_os_string();
    s.push("c");
    PathBuf::from(s)
}

fn run(args: Args) -> Result<(), ExitCode> {
    if !check_env() {
        return Err(fatal(EXIT_ENV, "this operation is not supported in this environment"));
    }

    let config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| fatal(EXIT_VALIDATION, format!("failed to read config {}: {}", path.display(), e)))?;
            ResolverConfig::from_toml(&text)
                .map_err(|e| fatal(EXIT_VALIDATION, format!("invalid config {}: {}", path.display(), e)))?
        }
        None => ResolverConfig::default(),
    };

    let output = args.output.clone().unwrap_or_else(|| default_output_path(&args.input));
    if !args.check && same_file(&args.input, &output) {
        return Err(fatal(EXIT_SAME_PATH, "input and output files cannot be the same"));
    }

    println!("* Loading input file '{}'...", args.input.display());
    let mut policy = Policy::init(None);
    if config.allow_unknown_methods {
        policy.fallback_handler(Some(std::rc::Rc::new(
            |_ctx: &mut dres::method::HandlerCtx, _args: &[dres::value::Value]| {
                dres::method::HandlerStatus::Failure
            },
        )));
    }
    policy
        .parse_file(&args.input)
        .map_err(|e| fatal(EXIT_PARSE, format!("failed to parse input file {}: {}", args.input.display(), e)))?;

    println!("* Compiling targets and actions...");
    policy
        .finalize()
        .map_err(|e| fatal(EXIT_FINALIZE, format!("failed to finalize policy {}: {}", args.input.display(), e)))?;

    if args.verbose > 1 {
        println!("Targets found in input file {}:", args.input.display());
        for target in policy.universe().targets() {
            if let Some(dump) = policy.dump_target(&target.name) {
                print!("{}", dump);
            }
        }
    }

    if args.check {
        println!("* Done.");
        return Ok(());
    }

    println!("* Saving compiled output to '{}'...", output.display());
    let mut buf = Vec::new();
    policy
        .save(&mut buf)
        .map_err(|e| fatal(EXIT_SAVE, format!("failed to precompile {} to {}: {}", args.input.display(), output.display(), e)))?;
    fs::write(&output, &buf)
        .map_err(|e| fatal(EXIT_SAVE, format!("failed to write {}: {}", output.display(), e)))?;

    println!("* Verifying loadability of '{}'...", output.display());
    dres::serializer::load(&mut std::io::Cursor::new(buf))
        .map_err(|e| fatal(EXIT_LOAD, format!("failed to load precompiled file {}: {}", output.display(), e)))?;

    println!("* Done.");
    Ok(())
}

fn same_file(a: &std::path::Path, b: &std::path::Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
