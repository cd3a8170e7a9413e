//! brewkit CLI - resolve, fetch, build and test formulae from JSON manifests.

use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use bk_io::{EngineConfig, InstallOptions, load_universe};

mod commands;
mod display;
mod platform;

use commands::Session;

#[derive(Parser)]
#[command(name = "bk")]
#[command(about = "brewkit - resolve and install formulae with their dependencies")]
#[command(version)]
struct Cli {
    /// Directory of <name>.json formula manifests
    #[arg(long, global = true, default_value = "Formula")]
    formulae: PathBuf,

    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for brewkit data
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Directory for shared executable links
    #[arg(long, global = true)]
    bin: Option<PathBuf>,

    /// Number of concurrent installs
    #[arg(long, short = 'j', global = true)]
    jobs: Option<usize>,

    /// Bottle tag to install for instead of the host (e.g. arm64_sonoma)
    #[arg(long, global = true)]
    platform: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a formula and its dependencies
    Install {
        formula: String,

        /// Build the formula itself from source even if a bottle matches
        #[arg(long, short = 's')]
        build_from_source: bool,

        /// Run the formula's tests after installing
        #[arg(long, short = 't')]
        test: bool,

        /// Also install recommended dependencies
        #[arg(long)]
        include_recommended: bool,

        /// Also install optional dependencies
        #[arg(long)]
        include_optional: bool,
    },

    /// Run a formula's tests, installing it and its test dependencies first
    Test { formula: String },

    /// Show the install order of a formula's dependencies
    Deps {
        formula: String,

        /// Show dependencies as a tree
        #[arg(long)]
        tree: bool,

        /// Include test dependencies
        #[arg(long)]
        test: bool,
    },

    /// Show which artifact would be installed on this platform
    Bottle { formula: String },

    /// Show manifest and install status of a formula
    Info {
        formula: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// `BK_LOG` takes precedence; otherwise `-v` picks the level.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("BK_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig, bk_core::Error> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(bin) = &cli.bin {
        config.shared_bin = Some(bin.clone());
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs;
    }
    config.validate()?;
    Ok(config)
}

/// Returns whether the command succeeded; errors are reported by the caller.
async fn run(cli: Cli) -> Result<bool, bk_core::Error> {
    let session = Session {
        config: load_config(&cli)?,
        universe: load_universe(&cli.formulae)?,
        platform: platform::resolve_platform(cli.platform.as_deref())?,
    };
    debug!(
        root = %session.config.root.display(),
        formulae = session.universe.len(),
        platform = %session.platform,
        "session ready"
    );

    match cli.command {
        Commands::Install {
            formula,
            build_from_source,
            test,
            include_recommended,
            include_optional,
        } => {
            let options = InstallOptions {
                build_from_source,
                run_tests: test,
                include_recommended,
                include_optional,
            };
            commands::install::run(&session, &formula, &options).await
        }

        Commands::Test { formula } => commands::install::run_test(&session, &formula).await,

        Commands::Deps {
            formula,
            tree,
            test,
        } => commands::deps::run_deps(&session, &formula, tree, test).map(|()| true),

        Commands::Bottle { formula } => {
            commands::info::run_bottle(&session, &formula).map(|()| true)
        }

        Commands::Info { formula, json } => {
            commands::info::run_info(&session, &formula, json).map(|()| true)
        }
    }
}
