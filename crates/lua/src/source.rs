//! Engine trait implementations: the VM as a rule source and expander.

use std::collections::HashMap;

use mlua::prelude::*;

use knit_engine::expand::{ExpandError, Expander};
use knit_engine::parse::{RuleSetSource, RuleSource};

use crate::runtime::LuaVm;

impl RuleSource for LuaVm {
  fn rules(&self, name: &str) -> Option<RuleSetSource> {
    self.state.borrow().sets.get(name).map(|set| RuleSetSource {
      blocks: set.blocks.clone(),
      dir: set.dir.clone(),
    })
  }
}

impl Expander for LuaVm {
  fn expand_var(&self, name: &str) -> Result<String, ExpandError> {
    let value: LuaValue = self
      .lua
      .globals()
      .get(name)
      .map_err(|err| eval_error(name, err))?;
    stringify(&value).ok_or_else(|| ExpandError::UndefinedVar(name.to_string()))
  }

  fn expand_expr(&self, expr: &str, locals: &HashMap<String, String>) -> Result<String, ExpandError> {
    let run = || -> LuaResult<LuaValue> {
      let table = self.lua.create_table()?;
      for (key, value) in locals {
        table.set(key.as_str(), value.as_str())?;
      }
      let eval: LuaFunction = self.lua.globals().get("__knit_eval")?;
      eval.call((expr, table))
    };
    let value = run().map_err(|err| eval_error(expr, err))?;
    stringify(&value).ok_or_else(|| ExpandError::Eval {
      expr: expr.to_string(),
      msg: format!("expression produced {}", value.type_name()),
    })
  }
}

fn eval_error(expr: &str, err: LuaError) -> ExpandError {
  ExpandError::Eval {
    expr: expr.to_string(),
    msg: err.to_string(),
  }
}

/// Recipe interpolation of a Lua value: scalars print as Lua would print
/// them, sequences join their elements with spaces (so a list of paths
/// drops into a command line). `nil` and everything else is undefined.
fn stringify(value: &LuaValue) -> Option<String> {
  match value {
    LuaValue::String(s) => Some(s.to_string_lossy().to_string()),
    LuaValue::Integer(i) => Some(i.to_string()),
    LuaValue::Number(n) => Some(n.to_string()),
    LuaValue::Boolean(b) => Some(b.to_string()),
    LuaValue::Table(table) => {
      let mut parts = Vec::new();
      for item in table.clone().sequence_values::<LuaValue>() {
        let item = item.ok()?;
        parts.push(stringify(&item)?);
      }
      Some(parts.join(" "))
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn vm_with(code: &str) -> (TempDir, LuaVm) {
    let temp = TempDir::new().unwrap();
    let vm = LuaVm::new(temp.path()).unwrap();
    vm.lua.load(code).exec().unwrap();
    (temp, vm)
  }

  fn no_locals() -> HashMap<String, String> {
    HashMap::new()
  }

  #[test]
  fn vars_resolve_from_globals() {
    let (_temp, vm) = vm_with("cc = 'gcc'\nflags = { '-O2', '-Wall' }\njobs = 4");
    assert_eq!(vm.expand_var("cc").unwrap(), "gcc");
    assert_eq!(vm.expand_var("flags").unwrap(), "-O2 -Wall");
    assert_eq!(vm.expand_var("jobs").unwrap(), "4");
  }

  #[test]
  fn undefined_var_is_an_error() {
    let (_temp, vm) = vm_with("");
    assert!(matches!(
      vm.expand_var("missing"),
      Err(ExpandError::UndefinedVar(name)) if name == "missing"
    ));
  }

  #[test]
  fn expressions_evaluate() {
    let (_temp, vm) = vm_with("function double(x) return x * 2 end");
    assert_eq!(vm.expand_expr("double(21)", &no_locals()).unwrap(), "42");
    assert_eq!(
      vm.expand_expr("('a.c'):gsub('%.c$', '.o')", &no_locals()).unwrap(),
      "a.o"
    );
  }

  #[test]
  fn expressions_see_node_locals() {
    let (_temp, vm) = vm_with("");
    let mut locals = HashMap::new();
    locals.insert("input".to_string(), "x.c y.c".to_string());
    assert_eq!(
      vm.expand_expr("input:upper()", &locals).unwrap(),
      "X.C Y.C"
    );
  }

  #[test]
  fn locals_shadow_globals_in_expressions() {
    let (_temp, vm) = vm_with("input = 'global'");
    let mut locals = HashMap::new();
    locals.insert("input".to_string(), "local".to_string());
    assert_eq!(vm.expand_expr("input", &locals).unwrap(), "local");
    // But unrelated globals stay reachable.
    assert_eq!(vm.expand_expr("input .. ''", &no_locals()).unwrap(), "global");
  }

  #[test]
  fn failing_expression_is_an_error() {
    let (_temp, vm) = vm_with("");
    assert!(matches!(
      vm.expand_expr("error('boom')", &no_locals()),
      Err(ExpandError::Eval { .. })
    ));
  }

  #[test]
  fn nil_expression_is_an_error() {
    let (_temp, vm) = vm_with("");
    assert!(matches!(
      vm.expand_expr("nil", &no_locals()),
      Err(ExpandError::Eval { .. })
    ));
  }
}
