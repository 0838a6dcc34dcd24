//! VM construction and the knit globals.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use mlua::prelude::*;

use knit_engine::parse::RuleBlock;
use knit_engine::ruleset::{clean_path, join_dir};

/// Rule blocks registered for one named set.
#[derive(Debug, Default, Clone)]
pub(crate) struct SetData {
  pub blocks: Vec<RuleBlock>,
  /// Directory of the declaring file, relative to the project root.
  pub dir: String,
  next_line: u32,
}

/// Shared interpreter state: the rule-set registry and the include stack.
#[derive(Debug, Default)]
pub(crate) struct VmState {
  pub sets: HashMap<String, SetData>,
  counter: usize,
  /// (file name, directory) of the knitfile currently being evaluated.
  pub files: Vec<(String, String)>,
}

impl VmState {
  pub fn current_file(&self) -> (String, String) {
    self
      .files
      .last()
      .cloned()
      .unwrap_or_else(|| ("<knitfile>".to_string(), String::new()))
  }
}

/// The expression evaluator installed as a Lua helper: resolves recipe
/// `$(expr)` references with node-local variables layered over globals.
const EVAL_HELPER: &str = r#"
function __knit_eval(expr, locals)
  local env = setmetatable(locals, { __index = _G })
  local f, err = load("return " .. expr, "=expr", "t", env)
  if not f then error(err, 0) end
  return f()
end
"#;

/// The embedded Lua interpreter plus knit's registries. Implements the
/// engine's `RuleSource` and `Expander` traits (see [`crate::source`]).
pub struct LuaVm {
  pub(crate) lua: Lua,
  pub(crate) state: Rc<RefCell<VmState>>,
  /// Project root; `include` paths resolve against it.
  pub(crate) root: PathBuf,
}

impl LuaVm {
  pub fn new(root: impl Into<PathBuf>) -> LuaResult<LuaVm> {
    let lua = Lua::new();
    let state = Rc::new(RefCell::new(VmState::default()));
    let root = root.into();

    lua.load(EVAL_HELPER).exec()?;
    register_globals(&lua, state.clone(), root.clone())?;

    Ok(LuaVm { lua, state, root })
  }

  /// Expose a string-to-string table as a Lua global (used for `cli` and
  /// `env`).
  pub fn set_table<I, K, V>(&self, name: &str, pairs: I) -> LuaResult<()>
  where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
  {
    let table = self.lua.create_table()?;
    for (key, value) in pairs {
      table.set(key.as_ref(), value.as_ref())?;
    }
    self.lua.globals().set(name, table)
  }
}

fn register_globals(lua: &Lua, state: Rc<RefCell<VmState>>, root: PathBuf) -> LuaResult<()> {
  // rule(text): readability sugar, the identity on strings.
  let rule = lua.create_function(|_, text: String| Ok(text))?;
  lua.globals().set("rule", rule)?;

  // r{...}: register a fresh rule set from blocks and referenced sets.
  let r_state = state.clone();
  let r = lua.create_function(move |lua, items: LuaTable| {
    let mut state = r_state.borrow_mut();
    let name = format!("rs{}", state.counter);
    state.counter += 1;
    let (file, dir) = state.current_file();

    let mut data = SetData {
      dir,
      next_line: 1,
      ..SetData::default()
    };
    for item in items.sequence_values::<LuaValue>() {
      let text = match item? {
        LuaValue::String(text) => text.to_string_lossy().to_string(),
        LuaValue::Table(handle) => {
          let referenced: Option<String> = handle.get("__knit_ruleset")?;
          match referenced {
            Some(referenced) => format!("@{}", referenced),
            None => {
              return Err(LuaError::external(
                "r{}: table element is not a rule set handle",
              ));
            }
          }
        }
        other => {
          return Err(LuaError::external(format!(
            "r{{}}: expected rule text or rule set, got {}",
            other.type_name()
          )));
        }
      };
      let line = data.next_line;
      data.next_line += text.lines().count() as u32;
      data.blocks.push(RuleBlock {
        text,
        file: file.clone(),
        line,
      });
    }
    state.sets.insert(name.clone(), data);

    let handle = lua.create_table()?;
    handle.set("__knit_ruleset", name)?;
    Ok(handle)
  })?;
  lua.globals().set("r", r)?;

  // include(path): evaluate another knitfile relative to the current one;
  // rule sets it defines live in its directory.
  let inc_state = state.clone();
  let include = lua.create_function(move |lua, path: String| {
    let (_, current_dir) = inc_state.borrow().current_file();
    let rel = join_dir(&current_dir, &path);
    let dir = match rel.rsplit_once('/') {
      Some((dir, _)) => dir.to_string(),
      None => String::new(),
    };

    let full = root.join(&rel);
    let code = std::fs::read_to_string(&full).map_err(|err| {
      LuaError::external(format!("include: cannot read {}: {}", full.display(), err))
    })?;

    inc_state
      .borrow_mut()
      .files
      .push((clean_path(&rel), dir));
    let result = lua.load(&code).set_name(rel).eval::<LuaValue>();
    inc_state.borrow_mut().files.pop();
    result
  })?;
  lua.globals().set("include", include)?;

  Ok(())
}
