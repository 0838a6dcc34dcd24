//! The invocation driver: knitfile discovery, Lua evaluation, graph
//! construction, and the build itself.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::debug;

use knit_engine::db::Database;
use knit_engine::exec::{Executor, Options};
use knit_engine::graph::{Graph, collect_rule_sets};
use knit_engine::printer::{NullPrinter, Printer};
use knit_engine::ruleset::clean_path;
use knit_lua::LuaVm;

use crate::printer::{BasicPrinter, ProgressPrinter, StepsPrinter};
use crate::tools;
use crate::{Flags, Style};

pub enum Outcome {
  Built,
  /// No recipe needed to run; carries the requested targets for the
  /// message.
  NothingToDo(String),
  ToolDone,
}

#[derive(Debug, Error)]
pub enum RunError {
  /// Bad flags, missing knitfile, parse or graph problems. Exit 2.
  #[error("{0:#}")]
  Config(anyhow::Error),

  /// One or more recipes failed. Exit 1.
  #[error("{0}")]
  Build(String),
}

fn config(err: impl Into<anyhow::Error>) -> RunError {
  RunError::Config(err.into())
}

pub fn run(flags: Flags) -> Result<Outcome, RunError> {
  if let Some(dir) = &flags.directory {
    env::set_current_dir(dir)
      .with_context(|| format!("cannot enter directory {}", dir.display()))
      .map_err(RunError::Config)?;
  }

  let jobs = match flags.jobs {
    Some(0) => return Err(config(anyhow!("at least one job is required"))),
    Some(n) => n,
    None => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
  };

  // Locate the knitfile: prefer the capitalized variant, search upward,
  // and rebase requested targets onto the knitfile's directory.
  let start_dir = env::current_dir()
    .context("cannot determine working directory")
    .map_err(RunError::Config)?;
  let (knit_dir, knitfile) = find_knitfile(&start_dir, &flags.file)
    .ok_or_else(|| config(anyhow!("no {} found (searched up from {})", flags.file, start_dir.display())))?;
  let rebase = start_dir
    .strip_prefix(&knit_dir)
    .map(|p| p.to_string_lossy().to_string())
    .unwrap_or_default();
  env::set_current_dir(&knit_dir)
    .with_context(|| format!("cannot enter directory {}", knit_dir.display()))
    .map_err(RunError::Config)?;
  debug!(knitfile = %knitfile, dir = %knit_dir.display(), "selected rule file");

  let (assigns, mut targets) = split_args(&flags.args);
  if !rebase.is_empty() {
    for target in &mut targets {
      if !target.starts_with('/') {
        *target = clean_path(&format!("{}/{}", rebase, target));
      }
    }
  }

  // Evaluate the knitfile.
  let vm = LuaVm::new(&knit_dir).map_err(config)?;
  vm.set_table("cli", assigns.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    .map_err(config)?;
  vm.set_table("env", env::vars()).map_err(config)?;
  let root_set = vm.eval_file(Path::new(&knitfile)).map_err(config)?;

  let sets = collect_rule_sets(&vm, &root_set).map_err(config)?;

  if targets.is_empty() {
    let main = sets[&root_set]
      .main_target()
      .ok_or_else(|| config(anyhow!("no targets")))?;
    targets.push(main.to_string());
  }

  let updated: HashSet<String> = flags.updated.iter().map(|u| clean_path(u)).collect();
  let mut graph =
    Graph::build(&sets, &root_set, &targets, updated, Path::new(".")).map_err(config)?;
  graph.expand_recipes(&vm).map_err(config)?;

  // The database and printer live for this one invocation.
  let db = match flags.cache.as_str() {
    "." | "" => Database::new(".knit"),
    "$cache" => {
      let base = dirs::cache_dir().ok_or_else(|| config(anyhow!("no user cache directory")))?;
      Database::in_cache(base.join("knit"), &knit_dir)
    }
    dir => Database::in_cache(dir, &knit_dir),
  };

  let recipe_count = graph
    .graph
    .node_indices()
    .filter(|&i| graph.graph[i].has_recipe())
    .count();
  let printer: Box<dyn Printer> = if flags.quiet {
    Box::new(NullPrinter)
  } else {
    match flags.style {
      Style::Basic => Box::new(BasicPrinter::new()),
      Style::Steps => Box::new(StepsPrinter::new(recipe_count)),
      Style::Progress => Box::new(ProgressPrinter::new(recipe_count)),
    }
  };

  let executor = Executor::new(
    ".",
    &db,
    jobs,
    printer.as_ref(),
    Options {
      dry_run: flags.dry_run,
      shell: flags.shell.clone(),
      keep_going: flags.keep_going,
      build_all: flags.always_build,
      hash: flags.hash,
    },
  );

  if let Some(tool) = &flags.tool {
    tools::run(tool, &graph, &executor).map_err(RunError::Config)?;
    return Ok(Outcome::ToolDone);
  }

  let summary = executor.exec(&graph);

  // Save even after failures: successful intermediate state is progress.
  if !flags.dry_run {
    db.save()
      .context("cannot save build database")
      .map_err(RunError::Config)?;
  }

  if !summary.is_success() {
    let msg = summary
      .errors
      .iter()
      .map(|e| e.to_string())
      .collect::<Vec<_>>()
      .join("\n");
    return Err(RunError::Build(msg));
  }
  if summary.nothing_to_do() {
    return Ok(Outcome::NothingToDo(targets.join(" ")));
  }
  Ok(Outcome::Built)
}

/// Walk up from `start` looking for the rule file; at each level the
/// capitalized variant wins.
fn find_knitfile(start: &Path, name: &str) -> Option<(PathBuf, String)> {
  let title = title_case(name);
  let mut dir = start.to_path_buf();
  loop {
    if dir.join(&title).is_file() {
      return Some((dir, title));
    }
    if dir.join(name).is_file() {
      return Some((dir, name.to_string()));
    }
    if !dir.pop() {
      return None;
    }
  }
}

fn title_case(name: &str) -> String {
  let mut chars = name.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    None => String::new(),
  }
}

/// Split positional arguments into `NAME=VALUE` assignments and targets.
fn split_args(args: &[String]) -> (Vec<(String, String)>, Vec<String>) {
  let mut assigns = Vec::new();
  let mut targets = Vec::new();
  for arg in args {
    match arg.split_once('=') {
      Some((name, value)) => assigns.push((name.to_string(), value.to_string())),
      None => targets.push(arg.clone()),
    }
  }
  (assigns, targets)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_args_separates_assignments() {
    let args = vec![
      "cc=clang".to_string(),
      "hello".to_string(),
      "flags=-O2=fast".to_string(),
    ];
    let (assigns, targets) = split_args(&args);
    assert_eq!(
      assigns,
      vec![
        ("cc".to_string(), "clang".to_string()),
        ("flags".to_string(), "-O2=fast".to_string()),
      ]
    );
    assert_eq!(targets, vec!["hello"]);
  }

  #[test]
  fn title_case_first_letter() {
    assert_eq!(title_case("knitfile"), "Knitfile");
    assert_eq!(title_case("Knitfile"), "Knitfile");
    assert_eq!(title_case(""), "");
  }

  #[test]
  fn find_knitfile_prefers_capitalized_and_searches_up() {
    let temp = tempfile::TempDir::new().unwrap();
    let sub = temp.path().join("a/b");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(temp.path().join("Knitfile"), "").unwrap();
    std::fs::write(temp.path().join("knitfile"), "").unwrap();

    let (dir, file) = find_knitfile(&sub, "knitfile").unwrap();
    assert_eq!(file, "Knitfile");
    assert_eq!(dir, temp.path());
  }
}
