//! Sub-tools (`-t NAME`): inspect or clean the build graph instead of
//! building it.

use std::fs::File;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use knit_engine::exec::Executor;
use knit_engine::graph::Graph;

/// One entry of `compile_commands.json`.
#[derive(Serialize)]
struct CompileCommand {
  directory: String,
  command: String,
  file: String,
  output: String,
}

pub fn run(tool: &str, graph: &Graph, executor: &Executor<'_>) -> Result<()> {
  match tool {
    "list" => list(graph),
    "graph" => dot(graph),
    "commands" => commands(graph),
    "clean" => {
      executor.clean(graph);
      Ok(())
    }
    other => Err(anyhow!(
      "unknown tool '{}' (expected list, graph, commands, or clean)",
      other
    )),
  }
}

/// Print every buildable target reachable from the root.
fn list(graph: &Graph) -> Result<()> {
  for idx in graph.topo_order() {
    let node = &graph.graph[idx];
    if node.leaf || idx == graph.root {
      continue;
    }
    for target in &node.targets {
      println!("{}", target);
    }
  }
  Ok(())
}

/// Dump the graph in dot format, one edge per dependency.
fn dot(graph: &Graph) -> Result<()> {
  println!("digraph build {{");
  println!("  rankdir=\"LR\";");
  for idx in graph.graph.node_indices() {
    let node = &graph.graph[idx];
    for dep in graph.prereqs_of(idx) {
      println!(
        "  \"{}\" -> \"{}\";",
        node.name(),
        graph.graph[dep].name()
      );
    }
  }
  println!("}}");
  Ok(())
}

/// Write `compile_commands.json` from the expanded recipes.
fn commands(graph: &Graph) -> Result<()> {
  let directory = std::env::current_dir()
    .context("cannot determine working directory")?
    .to_string_lossy()
    .to_string();

  let mut entries = Vec::new();
  for idx in graph.topo_order() {
    let node = &graph.graph[idx];
    if node.attrs.is_virtual || node.leaf || !node.has_recipe() {
      continue;
    }
    entries.push(CompileCommand {
      directory: directory.clone(),
      command: node.recipe.join(" && "),
      file: node.prereqs.first().cloned().unwrap_or_default(),
      output: node.targets[0].clone(),
    });
  }

  let file = File::create("compile_commands.json").context("cannot create compile_commands.json")?;
  serde_json::to_writer_pretty(file, &entries).context("cannot write compile_commands.json")?;
  Ok(())
}
