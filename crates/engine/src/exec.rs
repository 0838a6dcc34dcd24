//! The parallel executor.
//!
//! Walks the graph from the leaves up, decides staleness per node, runs
//! recipes through the configured shell with bounded parallelism, and
//! records new state in the database.
//!
//! # Scheduling
//!
//! A single dispatcher owns the pending-prerequisite counters (a node's
//! in-degree) and the ready queue. Worker threads receive ready nodes over
//! a channel, process them, and send the outcome back; the dispatcher then
//! decrements dependents and enqueues any that become ready. A node's
//! recipe therefore runs strictly after every transitive prerequisite has
//! completed; siblings are unordered.
//!
//! # Elision
//!
//! A rebuilt prerequisite does not by itself make dependents stale: after
//! a recipe succeeds, the outputs are re-hashed and compared against the
//! previously recorded hashes. Only a node whose outputs actually changed
//! propagates "changed" to its dependents.
//!
//! # Failure
//!
//! On the first failure the dispatcher sets a cancellation flag and stops
//! dispatching; running recipes finish (workers check the flag between the
//! commands of a multi-line recipe, and a running subprocess is never
//! killed). With `keep_going`, independent subgraphs continue and every
//! failure is reported.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::thread;

use petgraph::graph::NodeIndex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{Database, FileState, NodeKey, NodeRecord};
use crate::depfile::{self, DepfileError};
use crate::graph::{Graph, Node};
use crate::hash::{hash_file, hash_strings};
use crate::printer::{BuildStatus, OutputStream, Printer};
use crate::ruleset::clean_path;

/// Execution options for one invocation.
#[derive(Debug, Clone)]
pub struct Options {
  /// Print recipes without running them; the database is not touched.
  pub dry_run: bool,
  /// Shell used as `<shell> -c <command>`.
  pub shell: String,
  /// Keep dispatching independent work after a failure.
  pub keep_going: bool,
  /// Treat every node as out-of-date.
  pub build_all: bool,
  /// Use content hashes for staleness; when off, fall back to mtimes.
  pub hash: bool,
}

impl Default for Options {
  fn default() -> Self {
    Options {
      dry_run: false,
      shell: "sh".to_string(),
      keep_going: false,
      build_all: false,
      hash: true,
    }
  }
}

#[derive(Debug, Error)]
pub enum ExecError {
  #[error("recipe for '{target}' failed: `{cmd}` exited with status {code}")]
  Recipe {
    target: String,
    cmd: String,
    code: i32,
  },

  #[error("recipe for '{target}' failed: {source}")]
  Io {
    target: String,
    #[source]
    source: io::Error,
  },

  #[error("'{target}': dependency file '{path}' missing after recipe: {source}")]
  DepFile {
    target: String,
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("'{target}': malformed dependency file '{path}': {source}")]
  DepFileFormat {
    target: String,
    path: String,
    #[source]
    source: DepfileError,
  },
}

/// What one invocation did.
#[derive(Debug, Default)]
pub struct Summary {
  /// Number of recipes that ran (or would run, under dry-run).
  pub rebuilt: usize,
  pub errors: Vec<ExecError>,
}

impl Summary {
  pub fn is_success(&self) -> bool {
    self.errors.is_empty()
  }

  /// True when no recipe needed to run: the distinguished
  /// nothing-to-be-done outcome.
  pub fn nothing_to_do(&self) -> bool {
    self.rebuilt == 0 && self.is_success()
  }
}

/// Outcome of one node, as seen by the dispatcher.
#[derive(Debug)]
struct Outcome {
  status: BuildStatus,
  /// Whether this node's outputs differ from the previous build; drives
  /// dependents' staleness.
  changed: bool,
  error: Option<ExecError>,
}

impl Outcome {
  fn up_to_date(changed: bool) -> Outcome {
    Outcome {
      status: BuildStatus::UpToDate,
      changed,
      error: None,
    }
  }

  fn skipped() -> Outcome {
    Outcome {
      status: BuildStatus::Skipped,
      changed: false,
      error: None,
    }
  }
}

struct Job {
  idx: usize,
  prereqs_changed: bool,
}

/// One invocation's executor. Holds the database handle, the printer, and
/// the worker pool configuration; its lifetime is bounded by the
/// invocation.
pub struct Executor<'a> {
  dir: PathBuf,
  db: &'a Database,
  ncpu: usize,
  printer: &'a dyn Printer,
  opts: Options,
  /// Absolute project directory, part of every node's database key.
  workdir: String,
}

impl<'a> Executor<'a> {
  pub fn new(
    dir: impl Into<PathBuf>,
    db: &'a Database,
    ncpu: usize,
    printer: &'a dyn Printer,
    opts: Options,
  ) -> Executor<'a> {
    let dir = dir.into();
    let workdir = fs::canonicalize(&dir)
      .unwrap_or_else(|_| dir.clone())
      .to_string_lossy()
      .to_string();
    Executor {
      dir,
      db,
      ncpu: ncpu.max(1),
      printer,
      opts,
      workdir,
    }
  }

  /// Run the graph. The database is mutated as nodes succeed but not
  /// saved; the caller saves after the run so that successful intermediate
  /// state survives a failed build.
  pub fn exec(&self, graph: &Graph) -> Summary {
    let n = graph.graph.node_count();
    let mut pending: Vec<usize> = (0..n)
      .map(|i| graph.prereqs_of(NodeIndex::new(i)).count())
      .collect();
    let mut outcomes: Vec<Option<Outcome>> = (0..n).map(|_| None).collect();
    let cancelled = AtomicBool::new(false);

    let (job_tx, job_rx) = channel::<Job>();
    let (done_tx, done_rx) = channel::<(usize, Outcome)>();
    let job_rx = Mutex::new(job_rx);

    thread::scope(|s| {
      for _ in 0..self.ncpu {
        let done_tx = done_tx.clone();
        let job_rx = &job_rx;
        let cancelled = &cancelled;
        s.spawn(move || {
          loop {
            let job = {
              let rx = job_rx.lock().unwrap();
              rx.recv()
            };
            let job = match job {
              Ok(job) => job,
              Err(_) => break,
            };
            let node = &graph.graph[NodeIndex::new(job.idx)];
            let outcome = self.process(node, graph, job.prereqs_changed, cancelled);
            if done_tx.send((job.idx, outcome)).is_err() {
              break;
            }
          }
        });
      }

      let mut remaining = n;
      let mut ready: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();

      while remaining > 0 {
        // Dispatch everything that is ready, resolving skips inline.
        while let Some(idx) = ready.pop() {
          let (failed_prereq, prereqs_changed) = self.prereq_state(graph, idx, &outcomes);
          if failed_prereq || cancelled.load(Ordering::SeqCst) {
            self
              .printer
              .finish(graph.graph[NodeIndex::new(idx)].name(), BuildStatus::Skipped);
            outcomes[idx] = Some(Outcome::skipped());
            remaining -= 1;
            for dep in graph.dependents(NodeIndex::new(idx)) {
              let dep = dep.index();
              pending[dep] -= 1;
              if pending[dep] == 0 {
                ready.push(dep);
              }
            }
          } else {
            job_tx
              .send(Job {
                idx,
                prereqs_changed,
              })
              .expect("workers alive while jobs remain");
          }
        }

        if remaining == 0 {
          break;
        }

        let (idx, outcome) = done_rx.recv().expect("dispatcher holds a sender");
        if outcome.error.is_some() && !self.opts.keep_going {
          cancelled.store(true, Ordering::SeqCst);
        }
        for dep in graph.dependents(NodeIndex::new(idx)) {
          let dep = dep.index();
          pending[dep] -= 1;
          if pending[dep] == 0 {
            ready.push(dep);
          }
        }
        outcomes[idx] = Some(outcome);
        remaining -= 1;
      }

      drop(job_tx);
    });

    let mut summary = Summary::default();
    for outcome in outcomes.into_iter().flatten() {
      if outcome.status == BuildStatus::Built {
        summary.rebuilt += 1;
      }
      if let Some(err) = outcome.error {
        summary.errors.push(err);
      }
    }
    debug!(rebuilt = summary.rebuilt, errors = summary.errors.len(), "execution complete");
    summary
  }

  /// Delete every non-virtual output in the graph; recipes do not run.
  pub fn clean(&self, graph: &Graph) {
    for idx in graph.topo_order() {
      let node = &graph.graph[idx];
      if node.leaf || node.attrs.is_virtual || !node.has_recipe() {
        continue;
      }
      for target in &node.targets {
        let path = self.dir.join(target);
        if path.exists() {
          match fs::remove_file(&path) {
            Ok(()) => self.printer.info(&format!("removed {}", target)),
            Err(err) => warn!(target = %target, error = %err, "could not remove output"),
          }
        }
      }
    }
  }

  /// Failure and change state of a node's direct prerequisites.
  fn prereq_state(&self, graph: &Graph, idx: usize, outcomes: &[Option<Outcome>]) -> (bool, bool) {
    let mut failed = false;
    let mut changed = false;
    for prereq in graph.prereqs_of(NodeIndex::new(idx)) {
      if let Some(outcome) = &outcomes[prereq.index()] {
        match outcome.status {
          BuildStatus::Failed | BuildStatus::Skipped => failed = true,
          _ => {}
        }
        changed |= outcome.changed;
      }
    }
    (failed, changed)
  }

  fn process(
    &self,
    node: &Node,
    graph: &Graph,
    prereqs_changed: bool,
    cancelled: &AtomicBool,
  ) -> Outcome {
    if node.leaf {
      return Outcome::up_to_date(false);
    }
    if !node.has_recipe() {
      // Alias node: nothing to run, staleness flows through.
      return Outcome::up_to_date(prereqs_changed);
    }

    let key = NodeKey::new(&node.targets, &node.loc, &self.workdir);
    let record = self.db.lookup(&key);

    if !self.is_stale(node, graph, &record, prereqs_changed) {
      self.printer.finish(node.name(), BuildStatus::UpToDate);
      return Outcome::up_to_date(false);
    }

    if self.opts.dry_run {
      self.printer.start(node.name());
      for cmd in &node.recipe {
        self.printer.info(cmd);
      }
      self.printer.finish(node.name(), BuildStatus::Built);
      return Outcome {
        status: BuildStatus::Built,
        changed: true,
        error: None,
      };
    }

    self.printer.start(node.name());
    for cmd in &node.recipe {
      if cancelled.load(Ordering::SeqCst) {
        self.printer.finish(node.name(), BuildStatus::Skipped);
        return Outcome::skipped();
      }
      if !node.attrs.quiet {
        self.printer.info(cmd);
      }
      let output = Command::new(&self.opts.shell)
        .arg("-c")
        .arg(cmd)
        .current_dir(&self.dir)
        .output();
      let output = match output {
        Ok(output) => output,
        Err(source) => {
          self.printer.finish(node.name(), BuildStatus::Failed);
          return Outcome {
            status: BuildStatus::Failed,
            changed: true,
            error: Some(ExecError::Io {
              target: node.name().to_string(),
              source,
            }),
          };
        }
      };
      if !output.stdout.is_empty() {
        self.printer.output(node.name(), OutputStream::Stdout, &output.stdout);
      }
      if !output.stderr.is_empty() {
        self.printer.output(node.name(), OutputStream::Stderr, &output.stderr);
      }
      if !output.status.success() && !node.attrs.no_fail {
        self.printer.finish(node.name(), BuildStatus::Failed);
        return Outcome {
          status: BuildStatus::Failed,
          changed: true,
          error: Some(ExecError::Recipe {
            target: node.name().to_string(),
            cmd: cmd.clone(),
            code: output.status.code().unwrap_or(-1),
          }),
        };
      }
    }

    match self.finish_node(node, graph, &key, &record) {
      Ok(changed) => {
        self.printer.finish(node.name(), BuildStatus::Built);
        Outcome {
          status: BuildStatus::Built,
          changed,
          error: None,
        }
      }
      Err(error) => {
        self.printer.finish(node.name(), BuildStatus::Failed);
        Outcome {
          status: BuildStatus::Failed,
          changed: true,
          error: Some(error),
        }
      }
    }
  }

  /// The staleness decision. Any single reason suffices.
  fn is_stale(&self, node: &Node, graph: &Graph, record: &NodeRecord, prereqs_changed: bool) -> bool {
    if self.opts.build_all || node.attrs.rebuild {
      return true;
    }
    if prereqs_changed {
      return true;
    }
    if node.prereqs.iter().any(|p| graph.updated.contains(p)) {
      return true;
    }
    if !record.built {
      return true;
    }
    if hash_strings(&node.recipe) != record.recipe_hash {
      return true;
    }

    let mut oldest_output: Option<u64> = None;
    if !node.attrs.is_virtual {
      for target in &node.targets {
        match FileState::observe(self.dir.join(target), false) {
          Ok(state) => {
            oldest_output = Some(oldest_output.map_or(state.mtime, |m: u64| m.min(state.mtime)));
          }
          Err(_) => return true,
        }
      }
    }

    // Prerequisites recorded at the last build include dep-file discoveries.
    let mut prereqs: Vec<&str> = node.prereqs.iter().map(|p| p.as_str()).collect();
    for p in record.prereqs.keys() {
      if !node.prereqs.iter().any(|q| q == p) {
        prereqs.push(p);
      }
    }

    for prereq in prereqs {
      if self.prereq_is_virtual(graph, prereq) {
        continue;
      }
      let path = self.dir.join(prereq);
      if self.opts.hash {
        match hash_file(&path) {
          Ok(hash) => {
            if record.prereqs.get(prereq) != Some(&hash) {
              return true;
            }
          }
          Err(err) => {
            warn!(prereq = %prereq, error = %err, "cannot hash prerequisite, falling back to mtime");
            if self.prereq_newer(&path, oldest_output) {
              return true;
            }
          }
        }
      } else if self.prereq_newer(&path, oldest_output) {
        return true;
      }
    }

    false
  }

  fn prereq_is_virtual(&self, graph: &Graph, prereq: &str) -> bool {
    graph
      .node_for(prereq)
      .map(|idx| graph.graph[idx].attrs.is_virtual)
      .unwrap_or(false)
  }

  /// Mtime comparison used when hashing is off or impossible: stale when
  /// the prerequisite is newer than the oldest output (or unobservable).
  fn prereq_newer(&self, path: &Path, oldest_output: Option<u64>) -> bool {
    match (FileState::observe(path, false), oldest_output) {
      (Ok(state), Some(oldest)) => state.mtime > oldest,
      (Ok(_), None) => false,
      (Err(_), _) => true,
    }
  }

  /// Post-recipe bookkeeping: observe outputs, decide whether they
  /// changed, read the dep-file, and write the database record.
  fn finish_node(
    &self,
    node: &Node,
    graph: &Graph,
    key: &NodeKey,
    prior: &NodeRecord,
  ) -> Result<bool, ExecError> {
    let mut record = NodeRecord {
      built: true,
      recipe_hash: hash_strings(&node.recipe),
      outputs: HashMap::new(),
      prereqs: HashMap::new(),
    };

    let mut changed = false;
    if node.attrs.is_virtual {
      // No outputs to compare; conservatively changed.
      changed = true;
    } else {
      for target in &node.targets {
        match FileState::observe(self.dir.join(target), self.opts.hash) {
          Ok(state) => {
            let prior_hash = prior.outputs.get(target).map(|s| s.hash);
            if !self.opts.hash || prior_hash != Some(state.hash) {
              changed = true;
            }
            record.outputs.insert(target.clone(), state);
          }
          Err(_) => {
            // Output not produced: recorded as absent so the next
            // invocation rebuilds.
            changed = true;
          }
        }
      }
    }

    if self.opts.hash {
      for prereq in &node.prereqs {
        if self.prereq_is_virtual(graph, prereq) {
          continue;
        }
        if let Ok(hash) = hash_file(self.dir.join(prereq)) {
          record.prereqs.insert(prereq.clone(), hash);
        }
      }
    }

    if let Some(dep_path) = &node.dep_file {
      let text = fs::read_to_string(self.dir.join(dep_path)).map_err(|source| ExecError::DepFile {
        target: node.name().to_string(),
        path: dep_path.clone(),
        source,
      })?;
      let discovered = depfile::all_prereqs(&text).map_err(|source| ExecError::DepFileFormat {
        target: node.name().to_string(),
        path: dep_path.clone(),
        source,
      })?;
      for prereq in discovered {
        let prereq = clean_path(&prereq);
        let hash = if self.opts.hash {
          hash_file(self.dir.join(&prereq)).unwrap_or(0)
        } else {
          0
        };
        record.prereqs.entry(prereq).or_insert(hash);
      }
    }

    self.db.record(key, record);
    Ok(changed)
  }
}
