//! The rule-text parser.
//!
//! Converts blocks of mk-style rule text into [`Rule`]s appended to a
//! [`RuleSet`]. A block looks like:
//!
//! ```text
//! prog: main.o util.o
//! 	cc main.o util.o -o prog
//!
//! %.o:D[%.d]: %.c
//! 	cc -MD -MF $dep -c $input -o $output
//!
//! @subset
//! ```
//!
//! A rule line has two or three `:`-separated sections: targets, optional
//! attribute letters, prerequisites. Recipe lines are indented. `#` starts
//! a comment, and a line of the form `@name` references another rule set;
//! parsing returns every referenced name so the graph builder can resolve
//! them transitively.
//!
//! The scripting host supplies blocks through the [`RuleSource`] trait and
//! is otherwise invisible to the engine.

use regex::Regex;
use thiserror::Error;

use crate::rule::{AttrSet, Rule, SourceLoc, Target};
use crate::ruleset::{RuleSet, join_dir};

/// One block of rule text, with its origin for diagnostics.
#[derive(Debug, Clone)]
pub struct RuleBlock {
  pub text: String,
  pub file: String,
  pub line: u32,
}

/// The rule text making up one named rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleSetSource {
  pub blocks: Vec<RuleBlock>,
  /// Directory of the declaring file, relative to the project root.
  pub dir: String,
}

/// Supplier of rule text, implemented by the scripting host.
pub trait RuleSource {
  /// The blocks for a named rule set, or `None` if no such set exists.
  fn rules(&self, name: &str) -> Option<RuleSetSource>;
}

#[derive(Debug, Error)]
pub enum ParseError {
  #[error("{file}:{line}: recipe line outside a rule")]
  OrphanRecipe { file: String, line: u32 },

  #[error("{file}:{line}: expected 'targets [: attrs] : prereqs', found {found} sections")]
  BadSections { file: String, line: u32, found: usize },

  #[error("{file}:{line}: rule has no targets")]
  NoTargets { file: String, line: u32 },

  #[error("{file}:{line}: unknown attribute '{attr}'")]
  UnknownAttr { file: String, line: u32, attr: char },

  #[error("{file}:{line}: malformed attribute list: {msg}")]
  BadAttrs { file: String, line: u32, msg: String },

  #[error("{file}:{line}: target pattern may contain only one '%'")]
  MultiplePercents { file: String, line: u32 },

  #[error("{file}:{line}: invalid regex target: {source}")]
  BadRegex {
    file: String,
    line: u32,
    #[source]
    source: regex::Error,
  },
}

/// Parse one block of rule text, appending the rules to `rs`.
///
/// Declared paths are joined with the set's directory so every stored path
/// is project-root-relative. Returns the names of rule sets referenced by
/// `@name` lines.
pub fn parse_into(block: &RuleBlock, rs: &mut RuleSet) -> Result<Vec<String>, ParseError> {
  let mut refs = Vec::new();
  let lines: Vec<&str> = block.text.lines().collect();
  let mut i = 0;

  while i < lines.len() {
    let raw = lines[i];
    let lineno = block.line + i as u32;

    if raw.trim().is_empty() {
      i += 1;
      continue;
    }
    if raw.starts_with(' ') || raw.starts_with('\t') {
      return Err(ParseError::OrphanRecipe {
        file: block.file.clone(),
        line: lineno,
      });
    }

    let line = raw.trim_end();
    if line.starts_with('#') {
      i += 1;
      continue;
    }
    if let Some(name) = line.strip_prefix('@') {
      refs.push(name.trim().to_string());
      i += 1;
      continue;
    }

    let sections = split_sections(line);
    let (targets_text, attrs_text, prereqs_text) = match sections.len() {
      2 => (&sections[0], None, &sections[1]),
      3 => (&sections[0], Some(&sections[1]), &sections[2]),
      found => {
        return Err(ParseError::BadSections {
          file: block.file.clone(),
          line: lineno,
          found,
        });
      }
    };

    let loc = SourceLoc::new(&block.file, lineno);
    let attrs = match attrs_text {
      Some(text) => parse_attrs(text, &block.file, lineno, &rs.dir)?,
      None => AttrSet::default(),
    };

    let mut targets = Vec::new();
    for word in split_words(targets_text) {
      targets.push(parse_target(&word, &attrs, &rs.dir, &block.file, lineno)?);
    }
    if targets.is_empty() {
      return Err(ParseError::NoTargets {
        file: block.file.clone(),
        line: lineno,
      });
    }

    let prereqs = split_words(prereqs_text)
      .into_iter()
      .map(|p| join_dir(&rs.dir, &p))
      .collect();

    i += 1;
    let mut recipe = Vec::new();
    while i < lines.len() {
      let rline = lines[i];
      if rline.trim().is_empty() || !(rline.starts_with(' ') || rline.starts_with('\t')) {
        break;
      }
      recipe.push(rline.trim_start().to_string());
      i += 1;
    }

    rs.add(Rule {
      targets,
      prereqs,
      recipe,
      attrs,
      loc,
    });
  }

  Ok(refs)
}

/// Split a rule line on `:` at bracket depth zero, leaving escapes intact
/// for the word splitter.
fn split_sections(line: &str) -> Vec<String> {
  let mut sections = Vec::new();
  let mut current = String::new();
  let mut depth = 0usize;
  let mut chars = line.chars();

  while let Some(ch) = chars.next() {
    match ch {
      '\\' => {
        current.push('\\');
        if let Some(next) = chars.next() {
          current.push(next);
        }
      }
      '[' => {
        depth += 1;
        current.push(ch);
      }
      ']' => {
        depth = depth.saturating_sub(1);
        current.push(ch);
      }
      ':' if depth == 0 => {
        sections.push(std::mem::take(&mut current));
      }
      _ => current.push(ch),
    }
  }
  sections.push(current);
  sections
}

/// Split a section into words. `\ ` and `\:` unescape here; other escape
/// pairs are preserved for match substitution.
fn split_words(text: &str) -> Vec<String> {
  let mut words = Vec::new();
  let mut current = String::new();
  let mut chars = text.chars();

  while let Some(ch) = chars.next() {
    match ch {
      '\\' => match chars.next() {
        Some(' ') => current.push(' '),
        Some(':') => current.push(':'),
        Some(other) => {
          current.push('\\');
          current.push(other);
        }
        None => current.push('\\'),
      },
      c if c.is_whitespace() => {
        if !current.is_empty() {
          words.push(std::mem::take(&mut current));
        }
      }
      _ => current.push(ch),
    }
  }
  if !current.is_empty() {
    words.push(current);
  }
  words
}

fn parse_target(
  word: &str,
  attrs: &AttrSet,
  dir: &str,
  file: &str,
  line: u32,
) -> Result<Target, ParseError> {
  if attrs.regex {
    let regex = Regex::new(word).map_err(|source| ParseError::BadRegex {
      file: file.to_string(),
      line,
      source,
    })?;
    return Ok(Target::Pattern {
      source: word.to_string(),
      regex,
    });
  }

  let mut prefix = String::new();
  let mut suffix = String::new();
  let mut seen_percent = false;
  let mut chars = word.chars();

  while let Some(ch) = chars.next() {
    let buf = if seen_percent { &mut suffix } else { &mut prefix };
    match ch {
      '\\' => match chars.next() {
        Some(next) => buf.push(next),
        None => buf.push('\\'),
      },
      '%' => {
        if seen_percent {
          return Err(ParseError::MultiplePercents {
            file: file.to_string(),
            line,
          });
        }
        seen_percent = true;
      }
      _ => buf.push(ch),
    }
  }

  if seen_percent {
    let prefix = if dir.is_empty() {
      prefix
    } else {
      format!("{}/{}", dir, prefix)
    };
    Ok(Target::Percent { prefix, suffix })
  } else {
    Ok(Target::Plain(join_dir(dir, &prefix)))
  }
}

fn parse_attrs(text: &str, file: &str, line: u32, dir: &str) -> Result<AttrSet, ParseError> {
  let mut attrs = AttrSet::default();
  let mut chars = text.chars();

  while let Some(ch) = chars.next() {
    match ch {
      'V' => attrs.is_virtual = true,
      'B' => attrs.rebuild = true,
      'M' => attrs.no_meta = true,
      'Q' => attrs.quiet = true,
      'K' => attrs.keep_going = true,
      'E' => attrs.no_fail = true,
      'L' => attrs.linked = true,
      'R' => attrs.regex = true,
      'D' => {
        if chars.next() != Some('[') {
          return Err(ParseError::BadAttrs {
            file: file.to_string(),
            line,
            msg: "'D' must be followed by '[pattern]'".to_string(),
          });
        }
        let mut pattern = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
          if c == ']' {
            closed = true;
            break;
          }
          pattern.push(c);
        }
        if !closed {
          return Err(ParseError::BadAttrs {
            file: file.to_string(),
            line,
            msg: "unclosed 'D[' attribute".to_string(),
          });
        }
        attrs.dep_file = Some(if dir.is_empty() {
          pattern
        } else {
          format!("{}/{}", dir, pattern)
        });
      }
      c if c.is_whitespace() => {}
      other => {
        return Err(ParseError::UnknownAttr {
          file: file.to_string(),
          line,
          attr: other,
        });
      }
    }
  }

  Ok(attrs)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn block(text: &str) -> RuleBlock {
    RuleBlock {
      text: text.to_string(),
      file: "knitfile".to_string(),
      line: 1,
    }
  }

  fn parse(text: &str) -> (RuleSet, Vec<String>) {
    let mut rs = RuleSet::new("main", "");
    let refs = parse_into(&block(text), &mut rs).unwrap();
    (rs, refs)
  }

  #[test]
  fn simple_rule_with_recipe() {
    let (rs, refs) = parse("prog: main.o util.o\n\tcc main.o util.o -o prog\n");
    assert!(refs.is_empty());
    assert_eq!(rs.len(), 1);

    let rule = &rs.rules()[0];
    assert_eq!(
      rule.targets,
      vec![Target::Plain("prog".to_string())]
    );
    assert_eq!(rule.prereqs, vec!["main.o", "util.o"]);
    assert_eq!(rule.recipe, vec!["cc main.o util.o -o prog"]);
    assert_eq!(rule.loc, SourceLoc::new("knitfile", 1));
  }

  #[test]
  fn multiple_rules_and_comments() {
    let (rs, _) = parse(
      "# build everything\nall:V: prog\n\nprog: main.o\n\tcc main.o -o prog\n%.o: %.c\n\tcc -c $input -o $output\n",
    );
    assert_eq!(rs.len(), 3);
    assert!(rs.rules()[0].attrs.is_virtual);
    assert!(rs.rules()[0].recipe.is_empty());
    assert!(rs.rules()[2].is_meta());
    assert_eq!(rs.rules()[2].loc.line, 6);
  }

  #[test]
  fn attribute_letters() {
    let (rs, _) = parse("out:VBQKEL: in\n");
    let attrs = &rs.rules()[0].attrs;
    assert!(attrs.is_virtual);
    assert!(attrs.rebuild);
    assert!(attrs.quiet);
    assert!(attrs.keep_going);
    assert!(attrs.no_fail);
    assert!(attrs.linked);
    assert!(!attrs.no_meta);
  }

  #[test]
  fn dep_file_attribute() {
    let (rs, _) = parse("%.o:D[%.d]: %.c\n\tcc -MD -MF $dep -c $input -o $output\n");
    assert_eq!(rs.rules()[0].attrs.dep_file.as_deref(), Some("%.d"));
  }

  #[test]
  fn ruleset_references() {
    let (rs, refs) = parse("@sub\nprog: sub/lib.a\n\tcc -o prog sub/lib.a\n@other\n");
    assert_eq!(refs, vec!["sub".to_string(), "other".to_string()]);
    assert_eq!(rs.len(), 1);
  }

  #[test]
  fn orphan_recipe_is_an_error() {
    let mut rs = RuleSet::new("main", "");
    let err = parse_into(&block("\tcc -c foo.c\n"), &mut rs).unwrap_err();
    assert!(matches!(err, ParseError::OrphanRecipe { line: 1, .. }));
  }

  #[test]
  fn too_many_sections_is_an_error() {
    let mut rs = RuleSet::new("main", "");
    let err = parse_into(&block("a: b: c: d\n"), &mut rs).unwrap_err();
    assert!(matches!(err, ParseError::BadSections { found: 4, .. }));
  }

  #[test]
  fn unknown_attribute_is_an_error() {
    let mut rs = RuleSet::new("main", "");
    let err = parse_into(&block("a:Z: b\n"), &mut rs).unwrap_err();
    assert!(matches!(err, ParseError::UnknownAttr { attr: 'Z', .. }));
  }

  #[test]
  fn double_percent_is_an_error() {
    let mut rs = RuleSet::new("main", "");
    let err = parse_into(&block("%.%: x\n"), &mut rs).unwrap_err();
    assert!(matches!(err, ParseError::MultiplePercents { .. }));
  }

  #[test]
  fn escaped_percent_is_literal() {
    let (rs, _) = parse("odd\\%name: in\n\ttouch $output\n");
    assert_eq!(
      rs.rules()[0].targets,
      vec![Target::Plain("odd%name".to_string())]
    );
  }

  #[test]
  fn escaped_colon_and_space_in_words() {
    let (rs, _) = parse("a\\:b: c\\ d\n");
    assert_eq!(rs.rules()[0].targets, vec![Target::Plain("a:b".to_string())]);
    assert_eq!(rs.rules()[0].prereqs, vec!["c d"]);
  }

  #[test]
  fn regex_rule_targets() {
    let (rs, _) = parse("test-(\\w+):RV: bin/$1\n\t./bin/$1\n");
    let rule = &rs.rules()[0];
    assert!(rule.attrs.regex);
    assert!(rule.is_meta());
    assert!(rule.matches("test-core").is_some());
    assert!(rule.matches("check-core").is_none());
  }

  #[test]
  fn invalid_regex_is_an_error() {
    let mut rs = RuleSet::new("main", "");
    let err = parse_into(&block("(unclosed:R: x\n"), &mut rs).unwrap_err();
    assert!(matches!(err, ParseError::BadRegex { .. }));
  }

  #[test]
  fn paths_join_the_set_directory() {
    let mut rs = RuleSet::new("sub", "sub");
    parse_into(&block("%.o:D[%.d]: %.c extra/util.h\n\tcc -c $input\n"), &mut rs).unwrap();
    let rule = &rs.rules()[0];
    assert_eq!(
      rule.targets,
      vec![Target::Percent {
        prefix: "sub/".to_string(),
        suffix: ".o".to_string(),
      }]
    );
    assert_eq!(rule.prereqs, vec!["sub/%.c", "sub/extra/util.h"]);
    assert_eq!(rule.attrs.dep_file.as_deref(), Some("sub/%.d"));

    assert_eq!(
      rule.matches("sub/hello.o").unwrap().stem.as_deref(),
      Some("hello")
    );
  }

  #[test]
  fn recipe_ends_at_blank_line() {
    let (rs, _) = parse("a: b\n\tfirst\n\nc: d\n\tsecond\n");
    assert_eq!(rs.len(), 2);
    assert_eq!(rs.rules()[0].recipe, vec!["first"]);
    assert_eq!(rs.rules()[1].recipe, vec!["second"]);
  }

  #[test]
  fn indented_line_after_blank_is_orphan() {
    let mut rs = RuleSet::new("main", "");
    let err = parse_into(&block("a: b\n\tfirst\n\n\tstray\n"), &mut rs).unwrap_err();
    assert!(matches!(err, ParseError::OrphanRecipe { line: 4, .. }));
  }
}
