//! Recipe-template expansion.
//!
//! Recipe lines contain `$var` and `$(expr)` references that are resolved
//! just before execution. The engine parses templates into segments and
//! resolves them through the [`Expander`] trait, which the scripting host
//! implements. Node-local variables (`input`, `output`, `match`, `dep`, and
//! their indexed forms) shadow the host via [`NodeScope`].
//!
//! # Syntax
//!
//! - `$name` - a variable reference; names are `[A-Za-z_][A-Za-z0-9_]*`
//! - `$(expr)` - an expression evaluated by the scripting host; parentheses
//!   nest
//! - `$$` - a literal `$` (for shell variables in recipes)
//! - `$` followed by anything else passes through as a literal `$`

use std::collections::HashMap;

use thiserror::Error;

/// A piece of a parsed recipe template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text.
  Literal(String),
  /// `$name`.
  Var(String),
  /// `$(expr)`.
  Expr(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
  #[error("unclosed '$(' at position {0}")]
  Unclosed(usize),

  #[error("undefined variable '{0}'")]
  UndefinedVar(String),

  #[error("expression `{expr}` failed: {msg}")]
  Eval { expr: String, msg: String },
}

/// Resolver for variable and expression references, implemented by the
/// scripting host.
pub trait Expander {
  /// Resolve `$name`.
  fn expand_var(&self, name: &str) -> Result<String, ExpandError>;

  /// Evaluate `$(expr)`. `locals` carries the node-local variables so the
  /// host can make them visible inside the expression.
  fn expand_expr(&self, expr: &str, locals: &HashMap<String, String>) -> Result<String, ExpandError>;
}

/// Parse a template into segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, ExpandError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }
    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        literal.push('$');
      }
      Some((_, '(')) => {
        chars.next();
        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        let mut expr = String::new();
        let mut depth = 1usize;
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          match c {
            '(' => depth += 1,
            ')' => {
              depth -= 1;
              if depth == 0 {
                closed = true;
                break;
              }
            }
            _ => {}
          }
          expr.push(c);
        }
        if !closed {
          return Err(ExpandError::Unclosed(pos));
        }
        segments.push(Segment::Expr(expr));
      }
      Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        let mut name = String::new();
        while let Some((_, c)) = chars.peek() {
          if c.is_ascii_alphanumeric() || *c == '_' {
            name.push(*c);
            chars.next();
          } else {
            break;
          }
        }
        segments.push(Segment::Var(name));
      }
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }
  Ok(segments)
}

/// Parse and resolve a template in one step.
pub fn expand(input: &str, scope: &NodeScope<'_>) -> Result<String, ExpandError> {
  let segments = parse(input)?;
  let mut out = String::new();
  for segment in &segments {
    match segment {
      Segment::Literal(text) => out.push_str(text),
      Segment::Var(name) => out.push_str(&scope.var(name)?),
      Segment::Expr(expr) => out.push_str(&scope.host.expand_expr(expr, &scope.locals)?),
    }
  }
  Ok(out)
}

/// The variable environment of one node: locals layered over the host.
pub struct NodeScope<'a> {
  pub locals: HashMap<String, String>,
  pub host: &'a dyn Expander,
}

impl<'a> NodeScope<'a> {
  /// Build the scope for a node from its resolved inputs and outputs.
  ///
  /// Binds `input`, `output`, `match`, `dep`, and the indexed forms
  /// `input0`, `input1`, ... `output0`, ...
  pub fn new(
    host: &'a dyn Expander,
    inputs: &[String],
    outputs: &[String],
    matched: &str,
    dep: Option<&str>,
  ) -> Self {
    let mut locals = HashMap::new();
    locals.insert("input".to_string(), inputs.join(" "));
    locals.insert("output".to_string(), outputs.join(" "));
    locals.insert("match".to_string(), matched.to_string());
    locals.insert("dep".to_string(), dep.unwrap_or_default().to_string());
    for (i, input) in inputs.iter().enumerate() {
      locals.insert(format!("input{}", i), input.clone());
    }
    for (i, output) in outputs.iter().enumerate() {
      locals.insert(format!("output{}", i), output.clone());
    }
    NodeScope { locals, host }
  }

  fn var(&self, name: &str) -> Result<String, ExpandError> {
    if let Some(value) = self.locals.get(name) {
      return Ok(value.clone());
    }
    self.host.expand_var(name)
  }
}
