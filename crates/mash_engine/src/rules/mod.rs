//! The rule language
//!
//! Rules are declared in a small word-oriented surface syntax
//! (`rule`, `using ... define`, `claim`, `map`), compiled once at load
//! time, and evaluated many times by the worklist engine.

pub mod expr;
pub mod lexer;
pub mod model;
pub mod parser;
pub mod registry;
pub mod script;

pub use model::{
    BodyOutcome, CondKind, Condition, OutcomeKind, Rule, RuleBody, RuleKind, DYNAMIC_SOURCE,
};
pub use parser::{load_rules_dir, load_rules_file, load_rules_source};
pub use registry::RuleRegistry;
pub use script::Builtins;
