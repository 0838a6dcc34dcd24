//! Build-graph construction.
//!
//! From a map of rule sets, a root set name, and the requested targets,
//! the builder produces a DAG of concrete build steps: meta rules are
//! instantiated for the targets that demanded them, `linked` multi-output
//! rules become a single shared node, and every path is project-root
//! relative. A synthetic `:all` node roots the graph, with the requested
//! targets as its prerequisites.
//!
//! Rule selection, per target:
//! 1. a plain rule whose target list contains the name always wins; plain
//!    rules are strictly local, so only the demanding set's are
//!    considered;
//! 2. among meta rules (which may also come from referenced sets whose
//!    directory covers the target), percent patterns beat regexes;
//! 3. among the same kind, the shortest matched stem wins;
//! 4. remaining ties go to search order and then declaration order.
//!
//! Plain rules without a recipe only contribute prerequisites; they merge
//! into whichever rule is selected.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::expand::{self, ExpandError, Expander, NodeScope};
use crate::parse::{self, ParseError, RuleSource};
use crate::rule::{AttrSet, MatchData, Rule, SourceLoc, Target};
use crate::ruleset::{RuleSet, clean_path};

/// Name of the synthetic root target.
pub const ROOT_TARGET: &str = ":all";

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("rule set not found: {0}")]
  RuleSetNotFound(String),

  #[error("target not found: {0}")]
  TargetNotFound(String),

  #[error("cycle detected: '{target}' (rule at {from}) is required again by rule at {to}")]
  Cycle {
    target: String,
    from: SourceLoc,
    to: SourceLoc,
  },

  #[error("ambiguous rules for target '{target}': declared at {a} and {b}")]
  Ambiguous {
    target: String,
    a: SourceLoc,
    b: SourceLoc,
  },

  #[error(transparent)]
  Parse(#[from] ParseError),

  #[error("cannot expand recipe for '{target}': {source}")]
  Expand {
    target: String,
    #[source]
    source: ExpandError,
  },
}

/// One concrete build step.
#[derive(Debug, Clone)]
pub struct Node {
  /// The full output set. More than one entry only for `linked` rules.
  pub targets: Vec<String>,
  pub prereqs: Vec<String>,
  /// Recipe lines before expansion.
  pub recipe_template: Vec<String>,
  /// Recipe lines after expansion; filled by [`Graph::expand_recipes`].
  pub recipe: Vec<String>,
  pub attrs: AttrSet,
  pub loc: SourceLoc,
  /// The value bound to `$match` during expansion.
  pub matched: String,
  /// Instantiated `D[...]` path.
  pub dep_file: Option<String>,
  /// True for a source file with no rule: a leaf that merely has to exist.
  pub leaf: bool,
}

impl Node {
  /// Display name: the first target.
  pub fn name(&self) -> &str {
    &self.targets[0]
  }

  /// A leaf or an alias (recipe-less) node has nothing to run.
  pub fn has_recipe(&self) -> bool {
    !self.recipe_template.is_empty()
  }
}

/// The build graph. Edges run from dependency to dependent, so a node's
/// in-degree is its pending-prerequisite count.
#[derive(Debug)]
pub struct Graph {
  pub graph: DiGraph<Node, ()>,
  pub root: NodeIndex,
  /// Paths the user declared updated (`-u`).
  pub updated: HashSet<String>,
  targets: HashMap<String, NodeIndex>,
}

/// Resolve the transitive closure of rule sets reachable from `root`,
/// parsing each set's blocks exactly once.
pub fn collect_rule_sets(
  source: &dyn RuleSource,
  root: &str,
) -> Result<HashMap<String, RuleSet>, GraphError> {
  let mut sets = HashMap::new();
  let mut pending = vec![root.to_string()];

  while let Some(name) = pending.pop() {
    if sets.contains_key(&name) {
      continue;
    }
    let src = source
      .rules(&name)
      .ok_or_else(|| GraphError::RuleSetNotFound(name.clone()))?;
    let mut rs = RuleSet::new(&name, src.dir);
    let mut refs = Vec::new();
    for block in &src.blocks {
      refs.extend(parse::parse_into(block, &mut rs)?);
    }
    rs.refs = refs.clone();
    debug!(set = %name, rules = rs.len(), refs = refs.len(), "parsed rule set");
    sets.insert(name, rs);
    pending.extend(refs);
  }

  Ok(sets)
}

impl Graph {
  /// Build the graph for `targets`, starting resolution in `root_set`.
  /// `dir` is the project root, against which source files are looked up.
  pub fn build(
    sets: &HashMap<String, RuleSet>,
    root_set: &str,
    targets: &[String],
    updated: HashSet<String>,
    dir: &Path,
  ) -> Result<Graph, GraphError> {
    if !sets.contains_key(root_set) {
      return Err(GraphError::RuleSetNotFound(root_set.to_string()));
    }

    let mut builder = Builder {
      sets,
      dir,
      graph: DiGraph::new(),
      targets: HashMap::new(),
      visiting: HashMap::new(),
      order_cache: HashMap::new(),
    };

    let root_loc = SourceLoc::new("<knit>", 0);
    let prereqs: Vec<String> = targets.iter().map(|t| clean_path(t)).collect();
    let root = builder.graph.add_node(Node {
      targets: vec![ROOT_TARGET.to_string()],
      prereqs: prereqs.clone(),
      recipe_template: Vec::new(),
      recipe: Vec::new(),
      attrs: AttrSet {
        is_virtual: true,
        no_meta: true,
        rebuild: true,
        ..AttrSet::default()
      },
      loc: root_loc.clone(),
      matched: String::new(),
      dep_file: None,
      leaf: false,
    });

    for target in &prereqs {
      let idx = builder.resolve(target, root_set, &root_loc)?;
      builder.graph.add_edge(idx, root, ());
    }

    let graph = Graph {
      graph: builder.graph,
      root,
      updated,
      targets: builder.targets,
    };
    debug_assert!(toposort(&graph.graph, None).is_ok());
    Ok(graph)
  }

  /// Number of nodes, including the synthetic root.
  pub fn size(&self) -> usize {
    self.graph.node_count()
  }

  /// The node that produces `target`, if present in the graph.
  pub fn node_for(&self, target: &str) -> Option<NodeIndex> {
    self.targets.get(target).copied()
  }

  /// Nodes in dependency order (prerequisites before dependents).
  pub fn topo_order(&self) -> Vec<NodeIndex> {
    toposort(&self.graph, None).expect("graph is acyclic by construction")
  }

  /// Direct dependents of a node.
  pub fn dependents(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.neighbors_directed(idx, Direction::Outgoing)
  }

  /// Direct prerequisites of a node.
  pub fn prereqs_of(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.neighbors_directed(idx, Direction::Incoming)
  }

  /// Expand every node's recipe template (deferred until after structural
  /// construction so expressions can observe the complete prerequisite
  /// set).
  pub fn expand_recipes(&mut self, host: &dyn Expander) -> Result<(), GraphError> {
    let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
    for idx in indices {
      let (templates, prereqs, targets, matched, dep_file) = {
        let node = &self.graph[idx];
        if !node.has_recipe() {
          continue;
        }
        (
          node.recipe_template.clone(),
          node.prereqs.clone(),
          node.targets.clone(),
          node.matched.clone(),
          node.dep_file.clone(),
        )
      };
      let scope = NodeScope::new(host, &prereqs, &targets, &matched, dep_file.as_deref());
      let mut recipe = Vec::with_capacity(templates.len());
      for line in &templates {
        let expanded = expand::expand(line, &scope).map_err(|source| GraphError::Expand {
          target: self.graph[idx].name().to_string(),
          source,
        })?;
        recipe.push(expanded);
      }
      self.graph[idx].recipe = recipe;
    }
    Ok(())
  }
}

struct Selected {
  rule: Rule,
  matched: String,
  set: String,
}

struct Builder<'a> {
  sets: &'a HashMap<String, RuleSet>,
  dir: &'a Path,
  graph: DiGraph<Node, ()>,
  targets: HashMap<String, NodeIndex>,
  /// Target -> location of the rule currently being resolved for it.
  visiting: HashMap<String, SourceLoc>,
  order_cache: HashMap<String, Vec<String>>,
}

impl<'a> Builder<'a> {
  fn resolve(
    &mut self,
    target: &str,
    set: &str,
    demanded_by: &SourceLoc,
  ) -> Result<NodeIndex, GraphError> {
    if let Some(from) = self.visiting.get(target) {
      return Err(GraphError::Cycle {
        target: target.to_string(),
        from: from.clone(),
        to: demanded_by.clone(),
      });
    }
    if let Some(&idx) = self.targets.get(target) {
      return Ok(idx);
    }

    let selected = self.select_rule(target, set)?;
    let selected = match selected {
      Some(sel) => sel,
      None => {
        if self.dir.join(target).exists() {
          let idx = self.graph.add_node(Node {
            targets: vec![target.to_string()],
            prereqs: Vec::new(),
            recipe_template: Vec::new(),
            recipe: Vec::new(),
            attrs: AttrSet::default(),
            loc: SourceLoc::new("<file>", 0),
            matched: String::new(),
            dep_file: None,
            leaf: true,
          });
          self.targets.insert(target.to_string(), idx);
          return Ok(idx);
        }
        return Err(GraphError::TargetNotFound(target.to_string()));
      }
    };

    let rule = &selected.rule;
    let node_targets: Vec<String> = if rule.attrs.linked {
      rule
        .targets
        .iter()
        .map(|t| match t {
          Target::Plain(name) => clean_path(name),
          other => other.to_string(),
        })
        .collect()
    } else {
      vec![target.to_string()]
    };

    let prereqs: Vec<String> = rule.prereqs.iter().map(|p| clean_path(p)).collect();
    let idx = self.graph.add_node(Node {
      targets: node_targets.clone(),
      prereqs: prereqs.clone(),
      recipe_template: rule.recipe.clone(),
      recipe: Vec::new(),
      attrs: rule.attrs.clone(),
      loc: rule.loc.clone(),
      matched: selected.matched.clone(),
      dep_file: rule.attrs.dep_file.clone(),
      leaf: false,
    });
    for t in &node_targets {
      self.targets.insert(t.clone(), idx);
      self.visiting.insert(t.clone(), rule.loc.clone());
    }

    let loc = rule.loc.clone();
    let set = selected.set.clone();
    for prereq in &prereqs {
      let child = self.resolve(prereq, &set, &loc)?;
      self.graph.add_edge(child, idx, ());
    }

    for t in &node_targets {
      self.visiting.remove(t);
    }
    Ok(idx)
  }

  /// Pick the rule for `target` per the tie-break. Plain rules are
  /// strictly local to the demanding set; only meta rules are searched
  /// across referenced sets.
  fn select_rule(&mut self, target: &str, start_set: &str) -> Result<Option<Selected>, GraphError> {
    let sets = self.sets;

    // Plain rules: a recipe rule wins outright, recipe-less rules only
    // contribute prerequisites.
    let mut extra_prereqs: Vec<String> = Vec::new();
    let mut alias: Option<&Rule> = None;
    let mut no_meta = false;
    let mut chosen: Option<&Rule> = None;

    for rule in sets[start_set].rules() {
      if rule.is_meta() || rule.matches(target).is_none() {
        continue;
      }
      no_meta |= rule.attrs.no_meta;
      if rule.recipe.is_empty() {
        extra_prereqs.extend(rule.prereqs.iter().cloned());
        if alias.is_none() {
          alias = Some(rule);
        }
      } else if let Some(prev) = chosen {
        return Err(GraphError::Ambiguous {
          target: target.to_string(),
          a: prev.loc.clone(),
          b: rule.loc.clone(),
        });
      } else {
        chosen = Some(rule);
      }
    }
    if let Some(rule) = chosen {
      let mut concrete = rule.instantiate(target, &MatchData::default());
      merge_prereqs(&mut concrete, &extra_prereqs);
      return Ok(Some(Selected {
        rule: concrete,
        matched: String::new(),
        set: start_set.to_string(),
      }));
    }

    let order = self.search_order(start_set);

    // Meta rules, unless a plain rule claimed the target with `M`.
    if !no_meta {
      let mut best: Option<((u8, usize, usize, usize), &Rule, MatchData, &str)> = None;
      for (set_pos, set_name) in order.iter().enumerate() {
        let rs = &sets[set_name];
        let local = match set_relative(target, &rs.dir) {
          Some(local) => local,
          None => continue,
        };
        for (decl, rule) in rs.rules().iter().enumerate() {
          if !rule.is_meta() {
            continue;
          }
          let probe = if rule.attrs.regex { local } else { target };
          if let Some(m) = rule.matches(probe) {
            let (kind, stem_len) = rule.specificity(&m);
            let key = (kind, stem_len, set_pos, decl);
            if best.as_ref().map_or(true, |(bk, ..)| key < *bk) {
              best = Some((key, rule, m, set_name));
            }
          }
        }
      }
      if let Some((_, rule, m, set_name)) = best {
        let mut concrete = rule.instantiate(target, &m);
        merge_prereqs(&mut concrete, &extra_prereqs);
        return Ok(Some(Selected {
          matched: m.matched().to_string(),
          rule: concrete,
          set: set_name.to_string(),
        }));
      }
    }

    // Only prerequisite-contributing rules: the target is an alias.
    if let Some(rule) = alias {
      let mut concrete = rule.instantiate(target, &MatchData::default());
      concrete.prereqs = Vec::new();
      merge_prereqs(&mut concrete, &extra_prereqs);
      return Ok(Some(Selected {
        rule: concrete,
        matched: String::new(),
        set: start_set.to_string(),
      }));
    }

    Ok(None)
  }

  /// Depth-first order over rule sets reachable from `start`.
  fn search_order(&mut self, start: &str) -> Vec<String> {
    if let Some(order) = self.order_cache.get(start) {
      return order.clone();
    }
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(name) = stack.pop() {
      if !seen.insert(name.clone()) {
        continue;
      }
      if let Some(rs) = self.sets.get(&name) {
        for r in rs.refs.iter().rev() {
          stack.push(r.clone());
        }
        order.push(name);
      }
    }
    self.order_cache.insert(start.to_string(), order.clone());
    order
  }
}

/// Append contributed prerequisites, skipping duplicates.
fn merge_prereqs(rule: &mut Rule, extra: &[String]) {
  for p in extra {
    if !rule.prereqs.contains(p) {
      rule.prereqs.push(p.clone());
    }
  }
}

/// `target` relative to a set's directory, or `None` when the target lives
/// outside it. Regex rules match against this relative form.
fn set_relative<'t>(target: &'t str, dir: &str) -> Option<&'t str> {
  if dir.is_empty() {
    return Some(target);
  }
  target
    .strip_prefix(dir)
    .and_then(|rest| rest.strip_prefix('/'))
}
