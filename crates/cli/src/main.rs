use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;
mod prompts;

use cmd::{GlobalOpts, cmd_build, cmd_clean, cmd_inspect, cmd_plan, cmd_run};
use output::OutputFormat;

/// strata - Staged, reproducible runtime image builds
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Stage store directory (default: STRATA_STORE or the user cache)
  #[arg(long, global = true)]
  store: Option<PathBuf>,

  /// Build context directory (default: the plan's directory)
  #[arg(long, global = true)]
  context: Option<PathBuf>,

  /// Maximum number of stages building at once
  #[arg(short = 'j', long, global = true)]
  jobs: Option<usize>,

  /// Rebuild every stage instead of reusing frozen ones
  #[arg(long, global = true)]
  no_cache: bool,

  /// Override the image base directory
  #[arg(long, global = true)]
  base_dir: Option<String>,

  /// Reject floating revisions and unpinned packages
  #[arg(long, global = true)]
  pinned: bool,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text", global = true)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build every stage of a plan and assemble the runtime
  Build {
    /// Path to the plan file
    #[arg(default_value = "strata.toml")]
    plan: PathBuf,

    /// Fail the build when the entry command is missing from the runtime
    #[arg(long)]
    validate_entry: bool,

    /// Cancel the build after this long (e.g., "90s", "10m")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
  },

  /// Show execution waves, stage keys and cache status without building
  Plan {
    /// Path to the plan file
    #[arg(default_value = "strata.toml")]
    plan: PathBuf,
  },

  /// Show the runtime manifest of the last build
  Inspect {
    /// Path to the plan file
    #[arg(default_value = "strata.toml")]
    plan: PathBuf,
  },

  /// Launch the entry command of the last built runtime
  Run {
    /// Path to the plan file
    #[arg(default_value = "strata.toml")]
    plan: PathBuf,

    /// Arguments appended to the entry command
    #[arg(last = true)]
    args: Vec<String>,
  },

  /// Remove the stage store
  Clean {
    /// Skip confirmation prompt
    #[arg(long)]
    force: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "info" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let opts = GlobalOpts {
    store: cli.store,
    context: cli.context,
    jobs: cli.jobs,
    no_cache: cli.no_cache,
    base_dir: cli.base_dir,
    pinned: cli.pinned,
  };

  match cli.command {
    Commands::Build {
      plan,
      validate_entry,
      timeout,
    } => cmd_build(&plan, &opts, validate_entry, timeout, cli.output),
    Commands::Plan { plan } => cmd_plan(&plan, &opts, cli.output),
    Commands::Inspect { plan } => cmd_inspect(&plan, &opts, cli.output),
    Commands::Run { plan, args } => cmd_run(&plan, &opts, &args),
    Commands::Clean { force } => cmd_clean(&opts, force, cli.output),
  }
}
