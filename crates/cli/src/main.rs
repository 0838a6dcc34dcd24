//! knit: an incremental build orchestrator scripted with Lua.
//!
//! `knit [flags] [targets and NAME=VALUE assignments...]`
//!
//! Exit codes: 0 on success (including "nothing to be done"), 1 when a
//! recipe fails, 2 for configuration problems (bad flags, missing
//! knitfile, parse or graph errors).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, ValueEnum};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod printer;
mod run;
mod tools;

use run::{Outcome, RunError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Style {
  #[default]
  Basic,
  Steps,
  Progress,
}

#[derive(Parser)]
#[command(
  name = "knit",
  version,
  about = "An incremental build orchestrator scripted with Lua",
  disable_version_flag = true
)]
pub struct Flags {
  /// Treat every target as out-of-date
  #[arg(short = 'B', long = "always-build")]
  pub always_build: bool,

  /// Build cache location: "." for .knit in the project, "$cache" for the
  /// user cache directory, or an explicit directory
  #[arg(long, value_name = "DIR", default_value = ".")]
  pub cache: String,

  /// Change to this directory before doing anything
  #[arg(short = 'C', long = "directory", value_name = "DIR")]
  pub directory: Option<PathBuf>,

  /// Print recipes without running them
  #[arg(short = 'n', long = "dry-run")]
  pub dry_run: bool,

  /// Rule file name (the capitalized variant is preferred, and parent
  /// directories are searched)
  #[arg(short = 'f', long = "file", value_name = "FILE", default_value = "knitfile")]
  pub file: String,

  /// Use content hashes to decide staleness
  #[arg(
    long,
    value_name = "BOOL",
    default_value_t = true,
    action = ArgAction::Set,
    num_args = 0..=1,
    default_missing_value = "true"
  )]
  pub hash: bool,

  /// Number of parallel jobs (default: CPU count)
  #[arg(short = 'j', long = "jobs", value_name = "N")]
  pub jobs: Option<usize>,

  /// Keep building independent targets after a failure
  #[arg(long = "keep-going")]
  pub keep_going: bool,

  /// Suppress build output
  #[arg(short = 'q', long = "quiet")]
  pub quiet: bool,

  /// Progress style
  #[arg(short = 's', long = "style", value_enum, default_value_t = Style::Basic)]
  pub style: Style,

  /// Shell used to run recipes
  #[arg(long = "shell", value_name = "NAME", default_value = "sh")]
  pub shell: String,

  /// Run a sub-tool instead of building: list, graph, commands, clean
  #[arg(short = 't', long = "tool", value_name = "NAME")]
  pub tool: Option<String>,

  /// Mark a path as updated (repeatable)
  #[arg(short = 'u', long = "updated", value_name = "PATH")]
  pub updated: Vec<String>,

  /// Enable debug logging
  #[arg(short = 'D', long = "debug")]
  pub debug: bool,

  /// Print version
  #[arg(short = 'v', long = "version", action = ArgAction::Version)]
  pub version: Option<bool>,

  /// Targets to build and NAME=VALUE assignments for the cli table
  #[arg(value_name = "ARGS")]
  pub args: Vec<String>,
}

fn main() -> ExitCode {
  let flags = Flags::parse();

  let level = if flags.debug { Level::DEBUG } else { Level::WARN };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  match run::run(flags) {
    Ok(Outcome::Built) | Ok(Outcome::ToolDone) => ExitCode::SUCCESS,
    Ok(Outcome::NothingToDo(targets)) => {
      println!("knit: '{}': nothing to be done", targets);
      ExitCode::SUCCESS
    }
    Err(RunError::Build(msg)) => {
      eprintln!("knit: {}", msg);
      ExitCode::from(1)
    }
    Err(RunError::Config(err)) => {
      eprintln!("knit: {:#}", err);
      ExitCode::from(2)
    }
  }
}
