//! knit-engine: the incremental build core.
//!
//! This crate contains everything between "a set of rules" and "an updated
//! filesystem": the rule model, the rule-text parser, graph construction
//! with meta-rule instantiation, the content-hash build database, and the
//! parallel executor with dynamic task elision.
//!
//! The embedded scripting host stays outside. It is reached through two
//! narrow traits: [`parse::RuleSource`] supplies rule text for named rule
//! sets, and [`expand::Expander`] resolves `$var` and `$(expr)` references
//! in recipes. Any host that implements both can drive the engine.

pub mod db;
pub mod depfile;
pub mod exec;
pub mod expand;
pub mod graph;
pub mod hash;
pub mod parse;
pub mod printer;
pub mod rule;
pub mod ruleset;
