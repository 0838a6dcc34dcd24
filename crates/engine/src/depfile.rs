//! Makefile-style dependency file parsing.
//!
//! Rules with a `D[path]` attribute promise that their recipe writes a
//! dependency file of the form produced by `cc -MD`:
//!
//! ```text
//! hello.o: hello.c hello.h \
//!   util.h
//! ```
//!
//! The executor reads the file after a successful recipe and records the
//! listed prerequisites for the next invocation's staleness bookkeeping.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DepfileError {
  #[error("line {0}: missing ':' separator")]
  MissingSeparator(u32),
}

/// One `targets: prereqs` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepEntry {
  pub targets: Vec<String>,
  pub prereqs: Vec<String>,
}

/// Parse dependency-file text into entries.
///
/// Backslash-newline continues a line, `#` starts a comment, and paths are
/// whitespace-separated with `\ ` escaping a space inside a path.
pub fn parse(text: &str) -> Result<Vec<DepEntry>, DepfileError> {
  let mut entries = Vec::new();

  for (lineno, logical) in logical_lines(text) {
    let trimmed = logical.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
      continue;
    }
    let (targets, prereqs) = trimmed
      .split_once(':')
      .ok_or(DepfileError::MissingSeparator(lineno))?;
    entries.push(DepEntry {
      targets: split_paths(targets),
      prereqs: split_paths(prereqs),
    });
  }

  Ok(entries)
}

/// All prerequisites across every entry, in order, without duplicates.
pub fn all_prereqs(text: &str) -> Result<Vec<String>, DepfileError> {
  let mut seen = std::collections::HashSet::new();
  let mut out = Vec::new();
  for entry in parse(text)? {
    for prereq in entry.prereqs {
      if seen.insert(prereq.clone()) {
        out.push(prereq);
      }
    }
  }
  Ok(out)
}

/// Join backslash-continued lines, yielding (starting line number, text).
fn logical_lines(text: &str) -> Vec<(u32, String)> {
  let mut out: Vec<(u32, String)> = Vec::new();
  let mut continuing = false;

  for (i, line) in text.lines().enumerate() {
    let lineno = i as u32 + 1;
    let (content, continues) = match line.strip_suffix('\\') {
      Some(stripped) => (stripped, true),
      None => (line, false),
    };
    if continuing {
      let last = out.last_mut().unwrap();
      last.1.push(' ');
      last.1.push_str(content);
    } else {
      out.push((lineno, content.to_string()));
    }
    continuing = continues;
  }
  out
}

fn split_paths(text: &str) -> Vec<String> {
  let mut paths = Vec::new();
  let mut current = String::new();
  let mut chars = text.chars();

  while let Some(ch) = chars.next() {
    match ch {
      '\\' => match chars.next() {
        Some(' ') => current.push(' '),
        Some(other) => {
          current.push('\\');
          current.push(other);
        }
        None => current.push('\\'),
      },
      c if c.is_whitespace() => {
        if !current.is_empty() {
          paths.push(std::mem::take(&mut current));
        }
      }
      _ => current.push(ch),
    }
  }
  if !current.is_empty() {
    paths.push(current);
  }
  paths
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_entry() {
    let entries = parse("hello.o: hello.c hello.h\n").unwrap();
    assert_eq!(
      entries,
      vec![DepEntry {
        targets: vec!["hello.o".to_string()],
        prereqs: vec!["hello.c".to_string(), "hello.h".to_string()],
      }]
    );
  }

  #[test]
  fn continuation_lines() {
    let entries = parse("hello.o: hello.c \\\n  hello.h \\\n  util.h\n").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].prereqs, vec!["hello.c", "hello.h", "util.h"]);
  }

  #[test]
  fn comments_and_blanks_skipped() {
    let entries = parse("# produced by cc -MD\n\nhello.o: hello.c\n").unwrap();
    assert_eq!(entries.len(), 1);
  }

  #[test]
  fn multiple_entries() {
    let entries = parse("a.o: a.c\nb.o: b.c b.h\n").unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].targets, vec!["b.o"]);
  }

  #[test]
  fn missing_colon_is_an_error() {
    assert_eq!(
      parse("no separator here\n").unwrap_err(),
      DepfileError::MissingSeparator(1)
    );
  }

  #[test]
  fn escaped_spaces_in_paths() {
    let entries = parse("out.o: my\\ file.c\n").unwrap();
    assert_eq!(entries[0].prereqs, vec!["my file.c"]);
  }

  #[test]
  fn empty_prereq_list() {
    let entries = parse("phony:\n").unwrap();
    assert!(entries[0].prereqs.is_empty());
  }

  #[test]
  fn all_prereqs_deduplicates() {
    let prereqs = all_prereqs("a.o: x.h y.h\nb.o: y.h z.h\n").unwrap();
    assert_eq!(prereqs, vec!["x.h", "y.h", "z.h"]);
  }
}
