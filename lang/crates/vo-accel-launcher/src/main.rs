//! vo-accel - start native acceleration units the way the VM does.
//!
//! Usage: vo-accel [options] <check|list|version>
//!
//! ```text
//! vo-accel --enable --unit libMathAccel_1 check
//! vo-accel --enable --unit "libMathAccel_1?mode=fast" --search-path ./target/debug list
//! VO_ACCEL_LOG=debug vo-accel --enable --units-list "$(cat units.txt)" check
//! ```
//!
//! Startup failures are fatal, like VM creation failures: the error is
//! printed and the process exits with status 1.

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vo_accel::abi::{ACCEL_ABI_VERSION, ACCEL_VERSION};
use vo_accel::{AccelConfig, AccelError, AccelRuntime, Controller, DylibSource, SearchPath};

const LOG_ENV: &str = "VO_ACCEL_LOG";

#[derive(Parser)]
#[command(name = "vo-accel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Load, check and finalize native acceleration units", long_about = None)]
struct Cli {
    #[command(flatten)]
    accel: AccelArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct AccelArgs {
    /// Enable native acceleration (off by default)
    #[arg(long, global = true)]
    enable: bool,

    /// Declare a unit: feature_version[?key=value[:key=value]...]
    #[arg(long = "unit", value_name = "SPEC", global = true)]
    units: Vec<String>,

    /// Declare units from a newline-separated list
    #[arg(long, value_name = "TEXT", global = true)]
    units_list: Option<String>,

    /// Directory searched for unit libraries, before VO_ACCEL_PATH
    #[arg(long = "search-path", value_name = "DIR", global = true)]
    search_path: Vec<PathBuf>,

    /// Define a host flag units can read and set
    #[arg(long = "flag", value_name = "NAME=VALUE", value_parser = parse_flag, global = true)]
    flags: Vec<(String, String)>,

    /// Log filter, e.g. `debug` or `vo_accel=trace` (default from VO_ACCEL_LOG)
    #[arg(long, value_name = "FILTER", global = true)]
    log: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Start every declared unit, print a summary, then finalize
    Check,
    /// Print every replaced method and its native target
    List,
    /// Print launcher and ABI versions
    Version,
}

fn main() {
    let cli = Cli::parse();

    if cli.command == Commands::Version {
        println!("vo-accel {}", env!("CARGO_PKG_VERSION"));
        println!("accel version {}, ABI version {}", ACCEL_VERSION, ACCEL_ABI_VERSION);
        return;
    }

    init_logging(cli.accel.log.as_deref());

    let config = build_config(&cli.accel, SearchPath::from_env());
    let runtime = match start(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("vo-accel: {}", e);
            eprintln!("Error: Could not create the virtual machine.");
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Check => print_summary(&runtime),
        Commands::List => print_entries(&runtime),
        Commands::Version => {}
    }

    let report = runtime.shutdown();
    for (unit, message) in &report.failures {
        eprintln!("vo-accel: finalize of `{}` failed: {}", unit, message);
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = filter
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_ENV).ok())
        .unwrap_or_else(|| "warn".to_string());
    let filter = EnvFilter::try_new(&filter).unwrap_or_else(|e| {
        eprintln!("vo-accel: invalid log filter `{}`: {}", filter, e);
        EnvFilter::new("warn")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Command-line settings on top of `env_path`. Command-line directories are
/// searched first.
fn build_config(args: &AccelArgs, env_path: SearchPath) -> AccelConfig {
    let mut search_path = SearchPath::new(args.search_path.iter().cloned());
    for dir in env_path.dirs() {
        search_path.push(dir.clone());
    }

    let mut config = AccelConfig::new()
        .enabled(args.enable)
        .units(args.units.iter().cloned())
        .search_path(search_path);
    if let Some(list) = &args.units_list {
        config = config.with_unit_list(list);
    }
    for (name, value) in &args.flags {
        config = config.flag(name.as_str(), value.as_str());
    }
    config
}

fn start(config: AccelConfig) -> Result<AccelRuntime, AccelError> {
    let source = DylibSource::new(config.search_path.clone());
    Controller::new(config, &source).start()
}

fn print_summary(runtime: &AccelRuntime) {
    if !runtime.config().enabled {
        println!("accel: disabled");
        return;
    }
    let units = runtime.units();
    println!("accel: {} unit(s) active, {} entries", units.len(), runtime.registry().len());
    for unit in &units {
        println!(
            "  {} [{}] {} entries from {}",
            unit.name,
            unit.state,
            unit.entries.len(),
            unit.location.as_deref().unwrap_or("?")
        );
    }
}

fn print_entries(runtime: &AccelRuntime) {
    for entry in runtime.registry().entries() {
        println!("{} -> {}::{}", entry.method(), entry.unit(), entry.native_name());
    }
}

fn parse_flag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{}`", s)),
    }
}
