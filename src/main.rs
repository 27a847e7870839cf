// File: src/main.rs
//
// Command-line entry point for the Pyle interpreter. Collapsed from the
// teacher's multi-subcommand shape (run/repl/test/bench/profile) down to
// the single surface the spec asks for: run a `.pyle` file, optionally
// dumping the compiled bytecode instead of executing it.

use clap::Parser as ClapParser;
use pyle::driver;
use pyle::vm::VmConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "pyle",
    about = "Pyle: a small dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to the .pyle file to run
    file: PathBuf,

    /// Print the compiled bytecode instead of running it
    #[arg(short, long)]
    disassemble: bool,

    /// Log every instruction the VM executes (very verbose)
    #[arg(long)]
    trace: bool,

    /// Maximum call-stack depth before raising a stack-overflow error
    #[arg(long, default_value_t = 4096)]
    max_call_depth: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .init();

    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read {}: {}", cli.file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let filename = cli.file.to_string_lossy().to_string();

    if cli.disassemble {
        return match driver::compile_source(&source, &filename) {
            Ok(chunk) => {
                println!("{}", chunk.disassemble(&filename));
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{}", driver::render_error(&err, &source));
                ExitCode::FAILURE
            }
        };
    }

    let config = VmConfig { trace_instructions: cli.trace, max_call_depth: cli.max_call_depth };
    match driver::run_source(&source, &filename, config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", driver::render_error(&err, &source));
            ExitCode::FAILURE
        }
    }
}
