//! Compiled rule records
//!
//! A rule is plain data plus a compiled body. Running a body always
//! produces a normalized [`BodyOutcome`] so the evaluator never has to
//! reason about the three body kinds separately.

use super::expr::{self, Expr};
use super::script::{self, Builtins, Scope, Script, Signal};
use crate::tags::TagMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source-file sentinel for rules registered programmatically rather
/// than loaded from a rules file.
pub const DYNAMIC_SOURCE: &str = "<dynamic>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Default,
    Claim,
    Map,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Default => "default",
            RuleKind::Claim => "claim",
            RuleKind::Map => "map",
        }
    }
}

/// A gating condition. `source` is the verbatim surface text, used both
/// for display ("condition N requires: ...") and for deduplication.
#[derive(Debug, Clone)]
pub struct Condition {
    pub kind: CondKind,
    pub source: String,
    pub compiled: CondCompiled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    /// `if <expr>` - the expression itself is the guard
    If,
    /// `when <cmd>` - a command invocation whose result is the guard
    When,
}

#[derive(Debug, Clone)]
pub enum CondCompiled {
    Expr(Expr),
    Command(script::CmdCall),
}

impl Condition {
    /// Evaluate the guard against the bound inputs.
    pub fn check(&self, bound: &TagMap, builtins: &Builtins<'_>) -> Result<bool, String> {
        let scope = Scope {
            vars: bound,
            builtins,
        };
        let value = match &self.compiled {
            CondCompiled::Expr(e) => expr::eval(e, &scope)?,
            CondCompiled::Command(cmd) => scope.call(cmd)?,
        };
        expr::truthy(&value)
    }

    /// Dedup identity: kind plus verbatim text.
    pub fn key(&self) -> (CondKind, &str) {
        (self.kind, self.source.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RuleBody {
    /// Default rule: a statement block; outputs are the final values of
    /// block variables named like the `out` entries.
    Block(Script),
    /// Claim rule: a boolean assertion, no outputs.
    Claim { expr: Expr, source: String },
    /// Map rule: fixed table from input tuples to output tuples.
    Map {
        table: Vec<(Vec<String>, Vec<String>)>,
    },
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub source_file: String,
    /// Input patterns: exact tag names or `prefix.*`. Deduplicated,
    /// order preserved.
    pub inputs: Vec<String>,
    /// Output tag names, always exact.
    pub outputs: Vec<String>,
    /// Guards, evaluated left to right. Deduplicated, order preserved.
    pub conditions: Vec<Condition>,
    pub kind: RuleKind,
    pub body: RuleBody,
    /// Verbatim declaration text, for the report's definitions section.
    pub source_text: String,
}

impl Rule {
    pub fn display_ref(&self) -> String {
        format!("{}.\"{}\"", self.id, self.name)
    }

    pub fn default_name(id: &str) -> String {
        format!("Unnamed Rule ({})", id)
    }
}

/// Normalized result of one body run.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    /// Normal completion or explicit `return`: all outputs must be set,
    /// otherwise every output is discarded and problems are recorded.
    Completed,
    /// The `continue` signal: whatever outputs were set are accepted.
    Partial,
    /// `exception` (or a map miss): outputs discarded, message logged,
    /// no error.
    Exception,
    /// Body error: recorded, evaluation moves on.
    Error,
}

#[derive(Debug, Clone)]
pub struct BodyOutcome {
    pub kind: OutcomeKind,
    pub outputs: BTreeMap<String, String>,
    /// "Didn't set output {x}" notes from a completed body.
    pub problems: Vec<String>,
    /// Exception or error message.
    pub message: Option<String>,
}

impl BodyOutcome {
    fn error(message: String) -> Self {
        Self {
            kind: OutcomeKind::Error,
            outputs: BTreeMap::new(),
            problems: Vec::new(),
            message: Some(message),
        }
    }

    fn exception(message: Option<String>) -> Self {
        Self {
            kind: OutcomeKind::Exception,
            outputs: BTreeMap::new(),
            problems: Vec::new(),
            message,
        }
    }
}

impl Rule {
    /// Run the body against the bound inputs and normalize the outcome.
    pub fn run_body(&self, bound: &TagMap, builtins: &Builtins<'_>) -> BodyOutcome {
        match &self.body {
            RuleBody::Block(script) => self.run_block(script, bound, builtins),
            RuleBody::Claim { expr, source } => {
                let scope = Scope {
                    vars: bound,
                    builtins,
                };
                match expr::eval(expr, &scope).and_then(|v| expr::truthy(&v)) {
                    Ok(true) => BodyOutcome {
                        kind: OutcomeKind::Completed,
                        outputs: BTreeMap::new(),
                        problems: Vec::new(),
                        message: None,
                    },
                    Ok(false) => BodyOutcome::error(format!("Claim violated: {}", source.trim())),
                    Err(e) => BodyOutcome::error(e),
                }
            }
            RuleBody::Map { table } => self.run_map(table, bound),
        }
    }

    fn run_block(&self, script: &Script, bound: &TagMap, builtins: &Builtins<'_>) -> BodyOutcome {
        let mut locals = bound.clone();
        let signal = match script::run_script(script, &mut locals, builtins) {
            Ok(signal) => signal,
            Err(e) => return BodyOutcome::error(e),
        };
        match signal {
            Signal::Exception(message) => BodyOutcome::exception(message),
            Signal::Continue => {
                let outputs = self
                    .outputs
                    .iter()
                    .filter_map(|name| locals.get(name).map(|v| (name.clone(), v.clone())))
                    .collect();
                BodyOutcome {
                    kind: OutcomeKind::Partial,
                    outputs,
                    problems: Vec::new(),
                    message: None,
                }
            }
            Signal::Normal | Signal::Return => {
                let mut outputs = BTreeMap::new();
                let mut problems = Vec::new();
                for name in &self.outputs {
                    match locals.get(name) {
                        Some(value) => {
                            outputs.insert(name.clone(), value.clone());
                        }
                        None => problems.push(format!("Didn't set output {{{}}}", name)),
                    }
                }
                if !problems.is_empty() {
                    // One unset output discards them all
                    outputs.clear();
                }
                BodyOutcome {
                    kind: OutcomeKind::Completed,
                    outputs,
                    problems,
                    message: None,
                }
            }
        }
    }

    fn run_map(&self, table: &[(Vec<String>, Vec<String>)], bound: &TagMap) -> BodyOutcome {
        let mut key = Vec::with_capacity(self.inputs.len());
        for pattern in &self.inputs {
            match bound.get(pattern) {
                Some(value) => key.push(value.clone()),
                None => {
                    return BodyOutcome::error(format!(
                        "map input {} not bound to a value",
                        pattern
                    ))
                }
            }
        }
        match table.iter().find(|(inputs, _)| *inputs == key) {
            Some((_, out_values)) => BodyOutcome {
                kind: OutcomeKind::Completed,
                outputs: self
                    .outputs
                    .iter()
                    .cloned()
                    .zip(out_values.iter().cloned())
                    .collect(),
                problems: Vec::new(),
                message: None,
            },
            None => BodyOutcome::exception(Some(format!("No mapping for {{{}}}", key.join(" ")))),
        }
    }
}
