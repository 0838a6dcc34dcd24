//! The rule value type.
//!
//! A rule binds target patterns to prerequisites and a recipe template.
//! Rules are immutable after construction; meta rules (percent patterns or
//! regexes) are instantiated into concrete rules by the graph builder.

use std::fmt;

use regex::Regex;

/// Where a rule was declared, for diagnostics and database keying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLoc {
  pub file: String,
  pub line: u32,
}

impl SourceLoc {
  pub fn new(file: impl Into<String>, line: u32) -> Self {
    SourceLoc {
      file: file.into(),
      line,
    }
  }
}

impl fmt::Display for SourceLoc {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.file, self.line)
  }
}

/// One target of a rule.
#[derive(Debug, Clone)]
pub enum Target {
  /// A concrete path or virtual name.
  Plain(String),
  /// A pattern containing exactly one `%` placeholder.
  Percent { prefix: String, suffix: String },
  /// A regular expression (rules with the `R` attribute). The original
  /// pattern text is kept so equality stays structural.
  Pattern { source: String, regex: Regex },
}

impl PartialEq for Target {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Target::Plain(a), Target::Plain(b)) => a == b,
      (
        Target::Percent {
          prefix: ap,
          suffix: asf,
        },
        Target::Percent {
          prefix: bp,
          suffix: bsf,
        },
      ) => ap == bp && asf == bsf,
      (Target::Pattern { source: a, .. }, Target::Pattern { source: b, .. }) => a == b,
      _ => false,
    }
  }
}

impl Eq for Target {}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Target::Plain(s) => write!(f, "{}", s),
      Target::Percent { prefix, suffix } => write!(f, "{}%{}", prefix, suffix),
      Target::Pattern { source, .. } => write!(f, "{}", source),
    }
  }
}

/// Boolean rule attributes, plus the `D[...]` dep-file pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrSet {
  /// `V`: targets are not files.
  pub is_virtual: bool,
  /// `B`: always out-of-date.
  pub rebuild: bool,
  /// `M`: meta rules do not apply to this rule's targets.
  pub no_meta: bool,
  /// `Q`: do not echo recipe lines.
  pub quiet: bool,
  /// `K`: a failure under this rule does not stop independent work.
  pub keep_going: bool,
  /// `E`: a nonzero exit status is not a failure.
  pub no_fail: bool,
  /// `L`: one recipe invocation produces all targets.
  pub linked: bool,
  /// `R`: targets are regular expressions.
  pub regex: bool,
  /// `D[pattern]`: the recipe writes a Makefile-style dependency file here.
  pub dep_file: Option<String>,
}

/// The result of matching a target name against a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchData {
  /// The `%` substring for percent rules.
  pub stem: Option<String>,
  /// Regex captures; index 0 is the whole match.
  pub captures: Vec<String>,
}

impl MatchData {
  /// The value bound to `$match` during recipe expansion.
  pub fn matched(&self) -> &str {
    if let Some(stem) = &self.stem {
      stem
    } else if let Some(whole) = self.captures.first() {
      whole
    } else {
      ""
    }
  }
}

/// A single build rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
  pub targets: Vec<Target>,
  pub prereqs: Vec<String>,
  pub recipe: Vec<String>,
  pub attrs: AttrSet,
  pub loc: SourceLoc,
}

impl Rule {
  /// True if any target is a pattern rather than a plain name.
  pub fn is_meta(&self) -> bool {
    self
      .targets
      .iter()
      .any(|t| !matches!(t, Target::Plain(_)))
  }

  /// Match `target` against this rule.
  ///
  /// Plain rules match when any declared target equals `target`. Percent
  /// rules yield the `%` stem, regex rules yield their captures. The first
  /// matching declared target wins.
  pub fn matches(&self, target: &str) -> Option<MatchData> {
    for t in &self.targets {
      match t {
        Target::Plain(name) => {
          if name == target {
            return Some(MatchData::default());
          }
        }
        Target::Percent { prefix, suffix } => {
          if let Some(stem) = percent_stem(prefix, suffix, target) {
            return Some(MatchData {
              stem: Some(stem.to_string()),
              captures: Vec::new(),
            });
          }
        }
        Target::Pattern { regex, .. } => {
          if let Some(caps) = regex.captures(target) {
            // Only full-name matches instantiate a rule.
            if caps.get(0).map(|m| m.as_str()) == Some(target) {
              let captures = caps
                .iter()
                .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();
              return Some(MatchData {
                stem: None,
                captures,
              });
            }
          }
        }
      }
    }
    None
  }

  /// Produce a concrete rule for `target` from this (possibly meta) rule.
  ///
  /// `%` and `$0`..`$9` back-references are substituted into the target
  /// list, the prerequisites, and the dep-file pattern.
  pub fn instantiate(&self, target: &str, m: &MatchData) -> Rule {
    let targets = self
      .targets
      .iter()
      .map(|t| match t {
        Target::Plain(name) => Target::Plain(name.clone()),
        Target::Percent { prefix, suffix } => match &m.stem {
          Some(stem) => Target::Plain(format!("{}{}{}", prefix, stem, suffix)),
          None => Target::Plain(target.to_string()),
        },
        Target::Pattern { .. } => Target::Plain(target.to_string()),
      })
      .collect();

    let prereqs = self
      .prereqs
      .iter()
      .map(|p| substitute_match(p, m))
      .collect();

    let mut attrs = self.attrs.clone();
    attrs.regex = false;
    attrs.dep_file = attrs.dep_file.map(|d| substitute_match(&d, m));

    Rule {
      targets,
      prereqs,
      recipe: self.recipe.clone(),
      attrs,
      loc: self.loc.clone(),
    }
  }

  /// Specificity of a match, used by the graph builder's tie-break: lower
  /// is more specific. Percent rules rank by stem length; regex rules rank
  /// below every percent rule.
  pub fn specificity(&self, m: &MatchData) -> (u8, usize) {
    match &m.stem {
      Some(stem) => (0, stem.len()),
      None => (1, m.captures.first().map(|c| c.len()).unwrap_or(0)),
    }
  }
}

/// Match `target` against a `prefix%suffix` pattern, returning the stem.
/// The stem must be non-empty.
fn percent_stem<'a>(prefix: &str, suffix: &str, target: &'a str) -> Option<&'a str> {
  if target.len() <= prefix.len() + suffix.len() {
    return None;
  }
  if !target.starts_with(prefix) || !target.ends_with(suffix) {
    return None;
  }
  Some(&target[prefix.len()..target.len() - suffix.len()])
}

/// Substitute `%` with the stem and `$0`..`$9` with regex captures.
fn substitute_match(text: &str, m: &MatchData) -> String {
  let mut out = String::with_capacity(text.len());
  let mut chars = text.chars().peekable();
  while let Some(ch) = chars.next() {
    match ch {
      '%' => match &m.stem {
        Some(stem) => out.push_str(stem),
        None => out.push('%'),
      },
      '$' => match chars.peek() {
        Some(d) if d.is_ascii_digit() => {
          let idx = d.to_digit(10).unwrap() as usize;
          chars.next();
          if let Some(cap) = m.captures.get(idx) {
            out.push_str(cap);
          }
        }
        _ => out.push('$'),
      },
      '\\' => match chars.peek() {
        Some(&next) if matches!(next, '%' | '\\' | '$') => {
          out.push(next);
          chars.next();
        }
        _ => out.push('\\'),
      },
      _ => out.push(ch),
    }
  }
  out
}
