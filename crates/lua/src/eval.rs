//! Knitfile evaluation.

use std::io;
use std::path::Path;

use mlua::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::runtime::LuaVm;

#[derive(Debug, Error)]
pub enum EvalError {
  #[error("lua error: {0}")]
  Lua(#[from] LuaError),

  #[error("cannot read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("knitfile returned {0}, expected a rule set")]
  NotARuleSet(String),
}

impl LuaVm {
  /// Evaluate the root knitfile. Its return value must be a rule set
  /// handle (from `r{...}` or `include(...)`); the handle's name becomes
  /// the root rule set.
  pub fn eval_file(&self, path: &Path) -> Result<String, EvalError> {
    let code = std::fs::read_to_string(path).map_err(|source| EvalError::Read {
      path: path.display().to_string(),
      source,
    })?;

    let name = path.display().to_string();
    self
      .state
      .borrow_mut()
      .files
      .push((name.clone(), String::new()));
    let result = self.lua.load(&code).set_name(name.as_str()).eval::<LuaValue>();
    self.state.borrow_mut().files.pop();

    let value = result?;
    let root = match &value {
      LuaValue::Table(handle) => handle.get::<Option<String>>("__knit_ruleset")?,
      _ => None,
    };
    match root {
      Some(root) => {
        debug!(knitfile = %name, root = %root, "evaluated knitfile");
        Ok(root)
      }
      None => Err(EvalError::NotARuleSet(value.type_name().to_string())),
    }
  }
}
