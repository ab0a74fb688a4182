//! mash engine - tag inference for directory-based objects
//!
//! Objects are directories whose `#`-prefixed files encode string
//! tags; nested directories form dotted namespaces. A declarative
//! ruleset derives new tags from existing ones. The pipeline is:
//!
//! ```text
//! paths -> scanner -> reader -> per-object tag map
//!       -> evaluator (worklist fixed point, against the shared ruleset)
//!       -> spill stream -> report + writeback (+ optional CSV)
//! ```
//!
//! The registry is built once and read-only during evaluation; each
//! object is evaluated in isolation, so the batch fans out over plain
//! worker threads.

pub mod config;
pub mod csv_export;
pub mod error;
pub mod eval;
pub mod pool;
pub mod reader;
pub mod report;
pub mod rules;
pub mod scanner;
pub mod spill;
pub mod tags;
pub mod writeback;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use eval::{evaluate, ErrorKind, EvalError, Evaluation};
pub use pool::{run_batch, BatchSummary};
pub use rules::{load_rules_dir, load_rules_file, load_rules_source, Rule, RuleRegistry};
pub use spill::{ObjectRecord, SpillReader, SpillWriter};
pub use tags::TagMap;
