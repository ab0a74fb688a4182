//! Worklist fixed-point evaluator
//!
//! One object at a time: seed the worklist with every rule in registry
//! order, then pop FIFO. Each pop binds inputs, checks guards, runs the
//! body under a wall-clock timer, and merges outputs into the context.
//! A changed write reactivates every rule subscribed to that tag; a
//! write whose value equals the current one never does, which is what
//! keeps trivial oscillation from looping. Pathological reactivation
//! cycles hit the step cap and record a single NonConvergence error.
//!
//! Write conflicts (a different rule previously wrote the tag) record
//! an error *and* still update the value - later evaluation may
//! stabilize, and the last writer wins observably either way.

use crate::report::inline_value;
use crate::rules::{Builtins, OutcomeKind, RuleRegistry};
use crate::tags::{self, TagMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Instant;

/// One step of the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub index: usize,
    /// Rule id evaluated at this step.
    pub rule: String,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    RuleBodyError,
    MissingOutput,
    WriteConflict,
    NonConvergence,
    ObjectNotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleBodyError => "RuleBodyError",
            Self::MissingOutput => "MissingOutput",
            Self::WriteConflict => "WriteConflict",
            Self::NonConvergence => "NonConvergence",
            Self::ObjectNotFound => "ObjectNotFound",
        }
    }
}

/// An accumulated per-object error. Never fatal to the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalError {
    pub trace_index: usize,
    /// Rule reference (`id."name"`), or empty when not rule-scoped.
    pub rule: String,
    /// Affected tag, or empty.
    pub tag: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Render an error the way the report and the `#errors` tag show it.
pub fn format_error_line(error: &EvalError) -> String {
    let mut line = format!("[step {}]", error.trace_index);
    if !error.rule.is_empty() {
        line.push(' ');
        line.push_str(&error.rule);
    }
    if !error.tag.is_empty() {
        line.push_str(&format!(" {{{}}}", error.tag));
    }
    line.push_str(&format!(" {}: {}", error.kind.as_str(), error.message));
    line
}

/// Complete result of one object evaluation.
#[derive(Debug)]
pub struct Evaluation {
    pub initial: TagMap,
    pub context: TagMap,
    pub trace: Vec<TraceEntry>,
    pub rule_log: BTreeMap<String, Vec<String>>,
    pub property_log: BTreeMap<String, Vec<String>>,
    /// Every write per tag as `(rule id, trace index)`, in write order.
    pub property_writers: BTreeMap<String, Vec<(String, usize)>>,
    pub errors: Vec<EvalError>,
    /// Accumulated body wall-clock per rule id, plus the pseudo-key
    /// `total`, in fractional milliseconds.
    pub profiling: BTreeMap<String, f64>,
}

impl Evaluation {
    /// Tags whose final value differs from the initial load (or that
    /// did not exist initially).
    pub fn changed(&self) -> TagMap {
        self.context
            .iter()
            .filter(|(tag, value)| self.initial.get(*tag) != Some(*value))
            .map(|(tag, value)| (tag.clone(), value.clone()))
            .collect()
    }
}

/// Evaluate one object to a fixed point.
pub fn evaluate(
    registry: &RuleRegistry,
    object_path: &Path,
    initial: TagMap,
    step_cap: usize,
) -> Evaluation {
    let mut context = initial.clone();
    let mut trace: Vec<TraceEntry> = Vec::new();
    let mut rule_log: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut property_log: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut property_writers: BTreeMap<String, Vec<(String, usize)>> = BTreeMap::new();
    let mut errors: Vec<EvalError> = Vec::new();
    let mut profiling: BTreeMap<String, f64> = BTreeMap::new();

    let mut worklist: VecDeque<String> = registry.all_rules().map(|r| r.id.clone()).collect();
    let mut scheduled: HashSet<String> = worklist.iter().cloned().collect();
    let mut steps = 0usize;

    while let Some(id) = worklist.pop_front() {
        scheduled.remove(&id);
        steps += 1;
        if steps > step_cap {
            errors.push(EvalError {
                trace_index: trace.len(),
                rule: String::new(),
                tag: String::new(),
                kind: ErrorKind::NonConvergence,
                message: format!("evaluation exceeded step cap ({})", step_cap),
            });
            break;
        }

        let Some(rule) = registry.get(&id) else {
            continue;
        };
        let rule_ref = rule.display_ref();
        let trace_index = trace.len();
        trace.push(TraceEntry {
            index: trace_index,
            rule: id.clone(),
            notes: Vec::new(),
        });

        let note = |trace: &mut Vec<TraceEntry>,
                    rule_log: &mut BTreeMap<String, Vec<String>>,
                    text: String| {
            rule_log
                .entry(id.clone())
                .or_default()
                .push(format!("step {}: {}", trace_index, text));
            trace[trace_index].notes.push(text);
        };

        // 1. Bind inputs
        let mut missing: Vec<&str> = Vec::new();
        let mut bound = TagMap::new();
        for pattern in &rule.inputs {
            let matches = tags::matching_tags(&context, pattern);
            if matches.is_empty() {
                missing.push(pattern);
            }
            for (tag, value) in matches {
                bound.insert(tag.to_string(), value.to_string());
            }
        }
        if !missing.is_empty() {
            note(
                &mut trace,
                &mut rule_log,
                format!(
                    "not evaluated because inputs are missing: {}",
                    missing.join(", ")
                ),
            );
            continue;
        }

        // 2. Check conditions
        let mut skip_note: Option<String> = None;
        {
            let builtins = Builtins {
                object_path,
                rule_file: &rule.source_file,
                rule_name: &rule.name,
                context: &context,
            };
            for (n, cond) in rule.conditions.iter().enumerate() {
                match cond.check(&bound, &builtins) {
                    Ok(true) => {}
                    Ok(false) => {
                        skip_note = Some(format!("condition {} requires: {}", n + 1, cond.source));
                        break;
                    }
                    Err(e) => {
                        errors.push(EvalError {
                            trace_index,
                            rule: rule_ref.clone(),
                            tag: String::new(),
                            kind: ErrorKind::RuleBodyError,
                            message: format!("condition {} failed: {}", n + 1, e),
                        });
                        skip_note =
                            Some(format!("condition {} could not be evaluated: {}", n + 1, e));
                        break;
                    }
                }
            }
        }
        if let Some(text) = skip_note {
            note(&mut trace, &mut rule_log, text);
            continue;
        }

        // 3. Run body
        let timer = Instant::now();
        let outcome = {
            let builtins = Builtins {
                object_path,
                rule_file: &rule.source_file,
                rule_name: &rule.name,
                context: &context,
            };
            rule.run_body(&bound, &builtins)
        };
        let elapsed_ms = timer.elapsed().as_secs_f64() * 1000.0;
        *profiling.entry(id.clone()).or_insert(0.0) += elapsed_ms;
        *profiling.entry("total".to_string()).or_insert(0.0) += elapsed_ms;

        match outcome.kind {
            OutcomeKind::Exception => {
                let text = match &outcome.message {
                    Some(msg) => format!("exception: {}", msg),
                    None => "exception".to_string(),
                };
                note(&mut trace, &mut rule_log, text);
                continue;
            }
            OutcomeKind::Error => {
                let message = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "rule body failed".to_string());
                note(&mut trace, &mut rule_log, format!("error: {}", message));
                errors.push(EvalError {
                    trace_index,
                    rule: rule_ref.clone(),
                    tag: String::new(),
                    kind: ErrorKind::RuleBodyError,
                    message,
                });
                continue;
            }
            OutcomeKind::Completed | OutcomeKind::Partial => {}
        }

        // 4. Merge outputs
        for (tag, value) in &outcome.outputs {
            property_writers
                .entry(tag.clone())
                .or_default()
                .push((id.clone(), trace_index));

            if context.get(tag) == Some(value) {
                let text = format!("{} written but unchanged (= {})", tag, inline_value(value));
                note(&mut trace, &mut rule_log, text);
                property_log.entry(tag.clone()).or_default().push(format!(
                    "written but unchanged by {} at step {}",
                    rule_ref, trace_index
                ));
                continue;
            }

            let writers = &property_writers[tag];
            if let Some((prev_id, prev_index)) = writers[..writers.len() - 1]
                .iter()
                .rev()
                .find(|(writer, _)| writer != &id)
            {
                let prev_ref = registry
                    .get(prev_id)
                    .map(|r| r.display_ref())
                    .unwrap_or_else(|| prev_id.clone());
                let message = format!(
                    "conflicting write to {}: previously set by {} at step {}",
                    tag, prev_ref, prev_index
                );
                note(&mut trace, &mut rule_log, format!("conflict: {}", message));
                property_log
                    .entry(tag.clone())
                    .or_default()
                    .push(format!("conflict: {}", message));
                errors.push(EvalError {
                    trace_index,
                    rule: rule_ref.clone(),
                    tag: tag.clone(),
                    kind: ErrorKind::WriteConflict,
                    message,
                });
            }

            let old = context.insert(tag.clone(), value.clone());
            let text = match &old {
                Some(old) => format!(
                    "set {} = {} (was {})",
                    tag,
                    inline_value(value),
                    inline_value(old)
                ),
                None => format!("set {} = {}", tag, inline_value(value)),
            };
            note(&mut trace, &mut rule_log, text);
            property_log.entry(tag.clone()).or_default().push(format!(
                "set to {} by {} at step {}",
                inline_value(value),
                rule_ref,
                trace_index
            ));

            for reactivated in registry.rules_by_input(tag) {
                if scheduled.insert(reactivated.to_string()) {
                    worklist.push_back(reactivated.to_string());
                }
            }
        }

        // 5. Record problems
        for problem in &outcome.problems {
            note(&mut trace, &mut rule_log, problem.clone());
            errors.push(EvalError {
                trace_index,
                rule: rule_ref.clone(),
                tag: String::new(),
                kind: ErrorKind::MissingOutput,
                message: problem.clone(),
            });
        }
    }

    Evaluation {
        initial,
        context,
        trace,
        rule_log,
        property_log,
        property_writers,
        errors,
        profiling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_STEP_CAP;
    use crate::rules::load_rules_source;

    fn registry_from(src: &str) -> RuleRegistry {
        let mut registry = RuleRegistry::new();
        let recovered = load_rules_source(&mut registry, "#test_rules", src).unwrap();
        assert!(recovered.is_empty(), "unexpected recovered errors");
        registry
    }

    fn tagmap(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn run(src: &str, initial: &[(&str, &str)]) -> Evaluation {
        let registry = registry_from(src);
        evaluate(
            &registry,
            Path::new("/obj"),
            tagmap(initial),
            DEFAULT_STEP_CAP,
        )
    }

    #[test]
    fn empty_ruleset_changes_nothing() {
        let ev = run("", &[("k", "v")]);
        assert!(ev.changed().is_empty());
        assert!(ev.trace.is_empty());
        assert!(ev.errors.is_empty());
    }

    #[test]
    fn simple_default_rule_with_using_context() {
        let ev = run(
            "using { in {x} } define {\n  rule out {y} always { set y [expr {$x + 1}] }\n}",
            &[("x", "41")],
        );
        assert_eq!(ev.changed(), tagmap(&[("y", "42")]));
        assert!(ev.errors.is_empty());
    }

    #[test]
    fn missing_input_skips_without_error() {
        let ev = run("rule in {nope} out {y} { set y 1 }", &[("x", "1")]);
        assert!(ev.changed().is_empty());
        assert!(ev.errors.is_empty());
        assert_eq!(ev.trace.len(), 1);
        assert!(ev.trace[0].notes[0].contains("inputs are missing: nope"));
        // P6: the body never ran, so no profiling entry exists
        assert!(!ev.profiling.contains_key("r001"));
    }

    #[test]
    fn false_condition_skips() {
        let ev = run(
            "rule in {x} out {y} if {$x > 100} { set y 1 }",
            &[("x", "5")],
        );
        assert!(ev.changed().is_empty());
        assert!(ev.errors.is_empty());
        assert!(ev.trace[0].notes[0].contains("condition 1 requires: $x > 100"));
    }

    #[test]
    fn when_condition_gates_on_command() {
        let src = "rule in {x} out {y} when {has color.*} { set y 1 }";
        let ev = run(src, &[("x", "1"), ("color.red", "on")]);
        assert_eq!(ev.changed(), tagmap(&[("y", "1")]));

        let ev = run(src, &[("x", "1")]);
        assert!(ev.changed().is_empty());
    }

    #[test]
    fn claim_violation_records_body_error() {
        let ev = run("rule in {count} always claim {$count >= 0}", &[("count", "-3")]);
        assert!(ev.changed().is_empty());
        assert_eq!(ev.errors.len(), 1);
        assert_eq!(ev.errors[0].kind, ErrorKind::RuleBodyError);
        assert!(ev.errors[0].message.starts_with("Claim violated:"));
    }

    #[test]
    fn map_miss_is_silent_exception() {
        let ev = run(
            "rule in {color} out {hex} map { {red} {#f00}  {green} {#0f0} }",
            &[("color", "blue")],
        );
        assert!(ev.changed().is_empty());
        assert!(ev.errors.is_empty());
        assert!(ev.trace[0].notes[0].contains("No mapping for {blue}"));
    }

    #[test]
    fn write_conflict_errors_and_updates() {
        let ev = run(
            "rule First in {seed} out {color} always { set color red }\nrule Second in {seed} out {color} always { set color blue }",
            &[("seed", "1")],
        );
        let conflicts: Vec<&EvalError> = ev
            .errors
            .iter()
            .filter(|e| e.kind == ErrorKind::WriteConflict)
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].message.contains("r001.\"First\""));
        assert!(conflicts[0].message.contains("at step 0"));
        assert_eq!(conflicts[0].tag, "color");
        // The value still updates to the later writer's
        assert_eq!(ev.context.get("color").unwrap(), "blue");
    }

    #[test]
    fn reactivation_after_dependency_written() {
        // Dependent rule first, so its initial pop skips on missing input
        let ev = run(
            "rule AddOne in {y} out {z} { set z [expr {$y + 1}] }\nrule Double in {x} out {y} { set y [expr {$x * 2}] }",
            &[("x", "5")],
        );
        assert_eq!(ev.changed(), tagmap(&[("y", "10"), ("z", "11")]));

        // Trace: AddOne skipped, Double ran, AddOne reactivated and ran
        assert_eq!(ev.trace.len(), 3);
        assert_eq!(ev.trace[0].rule, "r001");
        assert!(ev.trace[0].notes[0].contains("inputs are missing"));
        assert_eq!(ev.trace[1].rule, "r002");
        assert_eq!(ev.trace[2].rule, "r001");
        assert!(ev.trace[2].notes[0].contains("set z"));
    }

    #[test]
    fn unchanged_write_never_reactivates() {
        // P7: writing the value already present schedules nothing
        let ev = run(
            "rule Fix in {x} out {y} { set y 5 }\nrule Chase in {y} out {z} { set z [expr {$y + 1}] }",
            &[("x", "1"), ("y", "5")],
        );
        // Both rules run exactly once from the initial worklist
        assert_eq!(ev.trace.len(), 2);
        assert_eq!(ev.changed(), tagmap(&[("z", "6")]));
        assert!(ev.trace[0].notes[0].contains("written but unchanged"));
    }

    #[test]
    fn equal_value_write_by_second_rule_is_not_a_conflict() {
        let ev = run(
            "rule A in {seed} out {color} { set color red }\nrule B in {seed} out {color} { set color red }",
            &[("seed", "1")],
        );
        assert!(ev.errors.is_empty());
        assert_eq!(ev.context.get("color").unwrap(), "red");
    }

    #[test]
    fn missing_output_discards_and_errors() {
        let ev = run("rule in {x} out {y z} { set y 1 }", &[("x", "1")]);
        assert!(ev.changed().is_empty());
        assert_eq!(ev.errors.len(), 1);
        assert_eq!(ev.errors[0].kind, ErrorKind::MissingOutput);
        assert_eq!(ev.errors[0].message, "Didn't set output {z}");
    }

    #[test]
    fn continue_keeps_partial_outputs() {
        let ev = run("rule in {x} out {y z} { set y 1\ncontinue }", &[("x", "1")]);
        assert_eq!(ev.changed(), tagmap(&[("y", "1")]));
        assert!(ev.errors.is_empty());
    }

    #[test]
    fn step_cap_records_non_convergence() {
        let registry = registry_from("rule Loop in {n} out {n} { set n [expr {$n + 1}] }");
        let ev = evaluate(&registry, Path::new("/obj"), tagmap(&[("n", "0")]), 10);
        assert!(ev
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::NonConvergence));
        assert!(ev.trace.len() <= 10);
    }

    #[test]
    fn glob_input_binds_every_tag_under_prefix() {
        let ev = run(
            "rule in {cfg.*} out {summary} { set summary [expr {[has cfg.port] && [has cfg.host]}] }",
            &[("cfg.port", "8080"), ("cfg.host", "localhost")],
        );
        assert_eq!(ev.changed(), tagmap(&[("summary", "1")]));
    }

    #[test]
    fn trace_indices_are_dense_and_unique() {
        let ev = run(
            "rule A in {x} out {y} { set y 1 }\nrule B in {y} out {z} { set z 2 }\nrule C in {z} out {w} { set w 3 }",
            &[("x", "1")],
        );
        // P2: every index equals its position
        for (position, entry) in ev.trace.iter().enumerate() {
            assert_eq!(entry.index, position);
        }
        // P4: property writers ordered by ascending trace index
        for writers in ev.property_writers.values() {
            let indices: Vec<usize> = writers.iter().map(|(_, i)| *i).collect();
            let mut sorted = indices.clone();
            sorted.sort_unstable();
            assert_eq!(indices, sorted);
        }
    }

    #[test]
    fn deterministic_trace_for_fixed_rule_order() {
        // P5: single-threaded evaluation is reproducible
        let src = "rule A in {x} out {y} { set y [expr {$x * 2}] }\nrule B in {y} out {z} { set z [expr {$y + 1}] }";
        let first = run(src, &[("x", "3")]);
        let second = run(src, &[("x", "3")]);
        let first_notes: Vec<&Vec<String>> = first.trace.iter().map(|t| &t.notes).collect();
        let second_notes: Vec<&Vec<String>> = second.trace.iter().map(|t| &t.notes).collect();
        assert_eq!(first_notes, second_notes);
        assert_eq!(first.changed(), second.changed());
    }

    #[test]
    fn error_line_format() {
        let error = EvalError {
            trace_index: 3,
            rule: "r002.\"Check\"".to_string(),
            tag: "color".to_string(),
            kind: ErrorKind::WriteConflict,
            message: "conflicting write".to_string(),
        };
        assert_eq!(
            format_error_line(&error),
            "[step 3] r002.\"Check\" {color} WriteConflict: conflicting write"
        );
    }
}
