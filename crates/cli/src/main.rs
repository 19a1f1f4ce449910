//! girder: command-line driver for the girder build engine.
//!
//! The surface is `girder <operation> [config.var=value ...] [target ...]`:
//! - `girder update` - bring targets up to date
//! - `girder clean` - remove built targets
//! - `girder info` - show project information
//!
//! Exit codes: 0 success, 1 user-diagnosed failure, 2 internal error.

mod cmd;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "girder")]
#[command(author, version, about = "Build engine driver")]
struct Cli {
  /// Verbosity level: 0-3 are end-user output, 4-6 tracing
  #[arg(short, long, global = true, default_value_t = 1)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Bring targets up to date
  Update {
    /// config.var=value assignments and target names
    #[arg(value_name = "ARG")]
    args: Vec<String>,
  },

  /// Remove built targets
  Clean {
    /// config.var=value assignments and target names
    #[arg(value_name = "ARG")]
    args: Vec<String>,
  },

  /// Show project information
  Info,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let level = match cli.verbose {
    0 => Level::ERROR,
    1 => Level::WARN,
    2 | 3 => Level::INFO,
    4 | 5 => Level::DEBUG,
    _ => Level::TRACE,
  };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .init();

  let r = match &cli.command {
    Commands::Update { args } => cmd::cmd_update(args),
    Commands::Clean { args } => cmd::cmd_clean(args),
    Commands::Info => cmd::cmd_info(),
  };

  match r {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      output::print_error(&format!("{:#}", e));

      // Internal executor errors are distinguished from user-diagnosed
      // failures.
      let internal = e
        .downcast_ref::<girder_lib::execute::ExecuteError>()
        .map(|x| matches!(x, girder_lib::execute::ExecuteError::Internal(_)))
        .unwrap_or(false);
      ExitCode::from(if internal { 2 } else { 1 })
    }
  }
}
