//! knit-lua: the Lua scripting host for knit.
//!
//! A Knitfile is a plain Lua program. It builds rule sets with `r{...}`
//! (each element a block of rule text, or another rule set to reference)
//! and returns the root set. CLI assignments and the process environment
//! are visible as the `cli` and `env` tables, and any Lua global can be
//! interpolated into recipes with `$name` or `$(expr)`.
//!
//! ```lua
//! cc = cli.cc or "cc"
//!
//! return r{
//! [[
//! hello: hello.o
//! 	$cc hello.o -o $output
//! ]],
//! [[
//! %.o: %.c
//! 	$cc -c $input -o $output
//! ]],
//! }
//! ```
//!
//! The engine sees this crate only through `knit_engine::parse::RuleSource`
//! and `knit_engine::expand::Expander`.

pub mod eval;
pub mod runtime;
pub mod source;

pub use eval::EvalError;
pub use runtime::LuaVm;
