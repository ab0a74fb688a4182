//! Report rendering
//!
//! Builds the human-readable per-object report written to `mash.log`:
//! summary counts, errors, updated tags, the execution trace, per-rule
//! and per-property logs, profiling, and the rule definitions.

use crate::eval::format_error_line;
use crate::rules::RuleRegistry;
use crate::spill::ObjectRecord;
use std::collections::BTreeSet;
use std::fmt::Write;

const INLINE_LIMIT: usize = 32;

/// Inline rendering of a tag value: values longer than 32 characters
/// are truncated to 29 plus `...`.
pub fn inline_value(value: &str) -> String {
    if value.chars().count() <= INLINE_LIMIT {
        value.to_string()
    } else {
        let head: String = value.chars().take(INLINE_LIMIT - 3).collect();
        format!("{}...", head)
    }
}

fn rule_ref(registry: &RuleRegistry, id: &str) -> String {
    registry
        .get(id)
        .map(|rule| rule.display_ref())
        .unwrap_or_else(|| id.to_string())
}

/// Render the full report for one object.
pub fn render(record: &ObjectRecord, registry: &RuleRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "mash report for {}", record.object_path);
    let _ = writeln!(
        out,
        "evaluated at {}",
        record.evaluated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out);

    // Summary
    let _ = writeln!(out, "== summary ==");
    let _ = writeln!(out, "rules:        {}", registry.len());
    let _ = writeln!(out, "steps:        {}", record.trace_log.len());
    let _ = writeln!(out, "tags loaded:  {}", record.initial_tags.len());
    let _ = writeln!(out, "tags changed: {}", record.changed_tags.len());
    let _ = writeln!(out, "errors:       {}", record.errors.len());
    let _ = writeln!(out);

    // Errors
    if !record.errors.is_empty() {
        let _ = writeln!(out, "== errors ==");
        for error in &record.errors {
            let _ = writeln!(out, "{}", format_error_line(error));
        }
        let _ = writeln!(out);
    }

    // Updated tags
    let _ = writeln!(out, "== updated tags ==");
    if record.changed_tags.is_empty() {
        let _ = writeln!(out, "(none)");
    }
    for (tag, value) in &record.changed_tags {
        match record.initial_tags.get(tag) {
            Some(old) => {
                let _ = writeln!(
                    out,
                    "{} = {} (was {})",
                    tag,
                    inline_value(value),
                    inline_value(old)
                );
            }
            None => {
                let _ = writeln!(out, "{} = {} (new)", tag, inline_value(value));
            }
        }
    }
    let _ = writeln!(out);

    // Execution trace
    let _ = writeln!(out, "== trace ==");
    for entry in &record.trace_log {
        let _ = writeln!(out, "step {}: {}", entry.index, rule_ref(registry, &entry.rule));
        for line in &entry.notes {
            let _ = writeln!(out, "  {}", line);
        }
    }
    let _ = writeln!(out);

    // Rule evaluations, one block per rule, ordered by id
    let _ = writeln!(out, "== rule evaluations ==");
    let rule_ids: Vec<String> = registry.all_rules().map(|r| r.id.clone()).collect();
    let mut ids: BTreeSet<&String> = record.rule_log.keys().collect();
    ids.extend(rule_ids.iter());
    for id in ids {
        let _ = writeln!(out, "{}", rule_ref(registry, id));
        match record.rule_log.get(id) {
            Some(lines) => {
                for line in lines {
                    let _ = writeln!(out, "  {}", line);
                }
            }
            None => {
                let _ = writeln!(out, "  (nothing logged)");
            }
        }
    }
    let _ = writeln!(out);

    // Property evaluations
    let _ = writeln!(out, "== property evaluations ==");
    let mut properties: BTreeSet<&String> = record.property_log.keys().collect();
    properties.extend(record.changed_tags.keys());
    for tag in properties {
        let _ = writeln!(out, "{}", tag);
        let writers = registry.writers_of(tag);
        if !writers.is_empty() {
            let names: Vec<String> = writers.iter().map(|r| r.display_ref()).collect();
            let _ = writeln!(out, "  written by: {}", names.join(", "));
        }
        let readers = registry.readers_of(tag);
        if !readers.is_empty() {
            let names: Vec<String> = readers.iter().map(|r| r.display_ref()).collect();
            let _ = writeln!(out, "  read by: {}", names.join(", "));
        }
        if let Some(lines) = record.property_log.get(tag) {
            for line in lines {
                let _ = writeln!(out, "  {}", line);
            }
        }
    }
    let _ = writeln!(out);

    // Profiling, descending by accumulated time, total last
    let _ = writeln!(out, "== profiling ==");
    let mut timings: Vec<(&String, f64)> = record
        .profiling
        .iter()
        .filter(|(key, _)| key.as_str() != "total")
        .map(|(key, ms)| (key, *ms))
        .collect();
    timings.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (id, ms) in timings {
        let _ = writeln!(out, "{}: {:.3} ms", rule_ref(registry, id), ms);
    }
    if let Some(total) = record.profiling.get("total") {
        let _ = writeln!(out, "total: {:.3} ms", total);
    }
    let _ = writeln!(out);

    // Rule definitions
    let _ = writeln!(out, "== rule definitions ==");
    for rule in registry.all_rules() {
        let _ = writeln!(out, "{} ({})", rule.display_ref(), rule.source_file);
        let _ = writeln!(out, "{}", rule.source_text);
        let _ = writeln!(out);
    }

    out
}
