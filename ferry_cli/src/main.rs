use ferry_core::config::{FerryConfig, HarnessKind};
use ferry_core::engine::MutationEngine;
use ferry_core::host::Host;
use ferry_core::input::FuzzData;
use ferry_core::session::Session;
use ferry_core::target::{Mode, TargetReturn};
use ferry_core::{EXIT_OK, SessionEnd};

use anyhow::bail;
use clap::{Parser, ValueEnum};
use std::io;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliMode {
    Sync,
    Async,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Sync => Mode::Sync,
            CliMode::Async => Mode::Async,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long, value_enum)]
    mode: Option<CliMode>,
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Run the seed corpus once and stop.
    #[clap(long)]
    dry_run: bool,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// bad-input, deferred-bad-input or clean.
    #[clap(long)]
    harness: Option<HarnessKind>,
    #[clap(short, long)]
    verbose: bool,
    /// Forwarded to the driving loop, e.g. `-- -max_len=64 corpus/`.
    #[clap(last = true)]
    engine_args: Vec<String>,
}

fn check_input(data: &[u8]) -> anyhow::Result<()> {
    if data.starts_with(b"BAD") {
        bail!("BAD input detected by harness!");
    }
    if data.starts_with(b"CRAS") {
        bail!("CRASH input detected by harness!");
    }
    Ok(())
}

fn bad_input_harness(data: FuzzData) {
    if let Err(e) = check_input(&data) {
        panic!("{e}");
    }
}

fn deferred_bad_input_harness(data: FuzzData) -> TargetReturn {
    TargetReturn::deferred(async move { check_input(&data) })
}

type Harness = Box<dyn Fn(FuzzData) -> TargetReturn>;

fn harness_for(kind: HarnessKind) -> Harness {
    match kind {
        HarnessKind::BadInput => Box::new(|data: FuzzData| {
            bad_input_harness(data);
            TargetReturn::ok()
        }),
        HarnessKind::DeferredBadInput => Box::new(deferred_bad_input_harness),
        HarnessKind::Clean => Box::new(|_data: FuzzData| TargetReturn::ok()),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<FerryConfig, anyhow::Error> {
    let config = match path {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            FerryConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("ferry.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                FerryConfig::load_from_file(&default_config_path)?
            } else {
                println!(
                    "No config file specified and default 'ferry.toml' not found, using built-in defaults."
                );
                FerryConfig::default()
            }
        }
    };
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut config = load_config(cli.config_file)?;

    if let Some(mode) = cli.mode {
        config.fuzzer.mode = mode.into();
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.runs = Some(iterations);
    }
    if cli.dry_run {
        config.fuzzer.dry_run = true;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.fuzzer.timeout_ms = Some(timeout_ms);
    }
    if let Some(kind) = cli.harness {
        config.harness.kind = kind;
    }
    config.fuzzer.fuzzer_options.extend(cli.engine_args);

    println!("Effective configuration: {config:#?}");

    let options = config.session_options()?;
    let session = Session::new(options, Box::new(MutationEngine::new()));
    let stopper = session.stopper();
    let mut host = Host::new();

    println!(
        "Starting {:?} fuzzing session with the {:?} harness...",
        config.fuzzer.mode, config.harness.kind
    );
    let start_time = Instant::now();
    let outcome = session.run(&mut host, harness_for(config.harness.kind))?;
    let elapsed_total = start_time.elapsed();
    info!("Session outcome: {outcome:?}");

    match outcome {
        Ok(SessionEnd::Completed { exit_code }) => {
            println!("\nFuzz session finished in {elapsed_total:.2?}.");
            if exit_code != EXIT_OK {
                std::process::exit(exit_code);
            }
        }
        Ok(SessionEnd::Stopped { code }) => {
            println!("\nFuzz session stopped after {elapsed_total:.2?}.");
            if code != EXIT_OK {
                stopper.stop(Some(code));
            }
        }
        Err(error) => {
            eprintln!(
                "=={}== Uncaught Exception: ferry: {error}",
                std::process::id()
            );
            stopper.stop(None);
        }
    }

    Ok(())
}
