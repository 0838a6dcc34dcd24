//! The persistent build database.
//!
//! One JSON file per project holds, for every node ever built: the digest
//! of its expanded recipe, the observed state of each output, and the
//! content hash of each prerequisite at the last successful build. The
//! executor consults these records for the staleness decision and rewrites
//! them after each successful recipe.
//!
//! Records are never deleted here; sub-tools may prune. Saves are atomic
//! (write to temp, rename). A corrupt or version-skewed file is discarded
//! with a warning: the cost is one full rebuild, never a wrong build.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hash::{hash_file, hash_strings};
use crate::rule::SourceLoc;

const DB_VERSION: u32 = 1;
const DB_FILENAME: &str = "db.json";

/// The observed state of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
  /// Modification time, nanoseconds since the epoch.
  pub mtime: u64,
  pub size: u64,
  /// Content hash; zero when hashing was disabled at record time.
  pub hash: u64,
}

impl FileState {
  /// Observe a file on disk. `with_hash` controls whether the contents are
  /// read and hashed.
  pub fn observe(path: impl AsRef<Path>, with_hash: bool) -> io::Result<FileState> {
    let meta = fs::metadata(path.as_ref())?;
    let mtime = meta
      .modified()?
      .duration_since(UNIX_EPOCH)
      .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
      .unwrap_or(0);
    let hash = if with_hash { hash_file(path)? } else { 0 };
    Ok(FileState {
      mtime,
      size: meta.len(),
      hash,
    })
  }
}

/// Everything remembered about one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
  /// False until the node's recipe first succeeds.
  pub built: bool,
  /// Digest of the fully expanded recipe text.
  pub recipe_hash: u64,
  /// Output path -> state at last successful build.
  pub outputs: HashMap<String, FileState>,
  /// Prerequisite path -> content hash at last successful build. Includes
  /// prerequisites discovered through dep-files.
  pub prereqs: HashMap<String, u64>,
}

/// Stable identity of a node: a digest over its sorted target list, the
/// digest of its declaring rule's source location, and the working
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey(String);

impl NodeKey {
  pub fn new(targets: &[String], loc: &SourceLoc, workdir: &str) -> Self {
    let mut sorted: Vec<&str> = targets.iter().map(|t| t.as_str()).collect();
    sorted.sort_unstable();
    let rule_digest = hash_strings([loc.file.as_str(), &loc.line.to_string()]);
    let mut parts: Vec<String> = sorted.into_iter().map(str::to_string).collect();
    parts.push(format!("{:016x}", rule_digest));
    parts.push(workdir.to_string());
    NodeKey(format!("{:016x}", hash_strings(&parts)))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Store {
  version: u32,
  nodes: HashMap<String, NodeRecord>,
}

impl Default for Store {
  fn default() -> Self {
    Store {
      version: DB_VERSION,
      nodes: HashMap::new(),
    }
  }
}

/// The on-disk database. All mutation happens behind one mutex; the
/// executor's workers call [`Database::record`] as nodes finish and the
/// driver calls [`Database::save`] once at the end of the invocation.
#[derive(Debug)]
pub struct Database {
  path: PathBuf,
  store: Mutex<Store>,
}

impl Database {
  /// Open (or start fresh) a database stored under `dir`.
  pub fn new(dir: impl Into<PathBuf>) -> Database {
    let dir = dir.into();
    let path = dir.join(DB_FILENAME);
    let store = match fs::read_to_string(&path) {
      Ok(content) => match serde_json::from_str::<Store>(&content) {
        Ok(store) if store.version == DB_VERSION => store,
        Ok(store) => {
          warn!(path = %path.display(), version = store.version, "database version mismatch, starting fresh");
          Store::default()
        }
        Err(err) => {
          warn!(path = %path.display(), error = %err, "corrupt database, starting fresh");
          Store::default()
        }
      },
      Err(_) => Store::default(),
    };
    Database {
      path,
      store: Mutex::new(store),
    }
  }

  /// Open a database in a shared cache directory, keyed by the project's
  /// absolute path so distinct projects never collide.
  pub fn in_cache(cache_dir: impl AsRef<Path>, project: impl AsRef<Path>) -> Database {
    let key = format!(
      "{:016x}",
      hash_strings([project.as_ref().to_string_lossy().as_ref()])
    );
    Database::new(cache_dir.as_ref().join(key))
  }

  /// Look up a node's record. Missing keys yield an empty (never-built)
  /// record.
  pub fn lookup(&self, key: &NodeKey) -> NodeRecord {
    let store = self.store.lock().unwrap();
    store.nodes.get(key.as_str()).cloned().unwrap_or_default()
  }

  /// Replace a node's record.
  pub fn record(&self, key: &NodeKey, record: NodeRecord) {
    let mut store = self.store.lock().unwrap();
    store.nodes.insert(key.as_str().to_string(), record);
  }

  /// Write the database to disk atomically.
  pub fn save(&self) -> io::Result<()> {
    let content = {
      let store = self.store.lock().unwrap();
      serde_json::to_string(&*store)?
    };
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    let temp = self.path.with_extension("json.tmp");
    fs::write(&temp, content)?;
    fs::rename(&temp, &self.path)?;
    Ok(())
  }
}
