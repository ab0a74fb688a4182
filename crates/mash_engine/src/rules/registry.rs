//! Rule registry
//!
//! Indexed collection of compiled rules: by id, in insertion order, and
//! reverse-indexed from input-tag patterns so the evaluator can find
//! every rule a tag write should reactivate. Built once per run, then
//! read-only from all workers.

use super::model::{Rule, RuleBody, RuleKind};
use crate::error::{EngineError, Result};
use crate::tags;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Lexical gate: rules cannot conditionally define other rules, so a
/// default body whose text contains `rule` at a line start is rejected
/// outright at registration time.
fn conditional_rule_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*rule\s").expect("static regex"))
}

#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: HashMap<String, Rule>,
    order: Vec<String>,
    /// Pattern key (exact name or `prefix.*`) -> rule ids triggered by
    /// it, in registration order. Holds an entry for every output name
    /// too, so lookups never fail.
    by_input: HashMap<String, Vec<String>>,
    next_id: u32,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next rule id. Ids are sequential and stable for the
    /// rest of the run.
    pub fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("r{:03}", self.next_id)
    }

    /// Install a compiled rule.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if self.rules.contains_key(&rule.id) {
            return Err(EngineError::InvalidState(format!(
                "duplicate rule id {}",
                rule.id
            )));
        }
        if let Some(bad) = rule.outputs.iter().find(|o| o.ends_with(".*")) {
            return Err(EngineError::syntax_in_rule(
                &rule.source_file,
                0,
                &rule.name,
                format!("output {{{}}} must be an exact tag name", bad),
            ));
        }
        if rule.kind == RuleKind::Claim && !rule.outputs.is_empty() {
            return Err(EngineError::syntax_in_rule(
                &rule.source_file,
                0,
                &rule.name,
                "a claim rule cannot declare outputs",
            ));
        }
        if let RuleBody::Block(script) = &rule.body {
            if conditional_rule_re().is_match(&script.source) {
                return Err(EngineError::syntax_in_rule(
                    &rule.source_file,
                    0,
                    &rule.name,
                    "rules cannot conditionally define other rules",
                ));
            }
        }

        for pattern in &rule.inputs {
            let entry = self.by_input.entry(pattern.clone()).or_default();
            if !entry.contains(&rule.id) {
                entry.push(rule.id.clone());
            }
        }
        for output in &rule.outputs {
            self.by_input.entry(output.clone()).or_default();
        }

        self.order.push(rule.id.clone());
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.get(id)
    }

    /// Rules in insertion order.
    pub fn all_rules(&self) -> impl Iterator<Item = &Rule> {
        self.order.iter().filter_map(|id| self.rules.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ordered set of rule ids triggered by a write to `tag`: rules
    /// whose `in` names the tag exactly, plus rules whose `prefix.*`
    /// pattern covers it. Order is registration order.
    pub fn rules_by_input(&self, tag: &str) -> Vec<&str> {
        let mut hits: Vec<&str> = Vec::new();
        for (pattern, ids) in &self.by_input {
            if tags::pattern_matches(pattern, tag) {
                for id in ids {
                    if !hits.contains(&id.as_str()) {
                        hits.push(id);
                    }
                }
            }
        }
        let index_of = |id: &str| self.order.iter().position(|o| o == id).unwrap_or(usize::MAX);
        hits.sort_by_key(|id| index_of(id));
        hits
    }

    /// Rules whose outputs name `tag`, in registration order (for the
    /// report's property section).
    pub fn writers_of(&self, tag: &str) -> Vec<&Rule> {
        self.all_rules()
            .filter(|rule| rule.outputs.iter().any(|o| o == tag))
            .collect()
    }

    /// Rules whose inputs cover `tag`, in registration order.
    pub fn readers_of(&self, tag: &str) -> Vec<&Rule> {
        self.all_rules()
            .filter(|rule| rule.inputs.iter().any(|p| tags::pattern_matches(p, tag)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::DYNAMIC_SOURCE;
    use crate::rules::script::compile_script;

    fn rule(id: &str, inputs: &[&str], outputs: &[&str], body: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: Rule::default_name(id),
            source_file: DYNAMIC_SOURCE.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            conditions: Vec::new(),
            kind: RuleKind::Default,
            body: RuleBody::Block(compile_script(body).unwrap()),
            source_text: body.to_string(),
        }
    }

    #[test]
    fn ids_are_sequential() {
        let mut registry = RuleRegistry::new();
        assert_eq!(registry.next_id(), "r001");
        assert_eq!(registry.next_id(), "r002");
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(rule("r001", &["x"], &["y"], "set y 1")).unwrap();
        assert!(registry.add_rule(rule("r001", &["a"], &[], "")).is_err());
    }

    #[test]
    fn by_input_exact_and_glob() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(rule("r001", &["x"], &["y"], "set y 1")).unwrap();
        registry.add_rule(rule("r002", &["cfg.*"], &["z"], "set z 1")).unwrap();
        registry.add_rule(rule("r003", &["x", "cfg.a"], &[], "set q 1")).unwrap();

        assert_eq!(registry.rules_by_input("x"), vec!["r001", "r003"]);
        assert_eq!(registry.rules_by_input("cfg.a"), vec!["r002", "r003"]);
        assert_eq!(registry.rules_by_input("cfg.deep.b"), vec!["r002"]);
        assert!(registry.rules_by_input("unrelated").is_empty());
    }

    #[test]
    fn outputs_get_empty_index_entries() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(rule("r001", &["x"], &["y"], "set y 1")).unwrap();
        // Lookup on an output-only name must not fail
        assert!(registry.rules_by_input("y").is_empty());
        assert!(registry.by_input.contains_key("y"));
    }

    #[test]
    fn conditional_rule_definition_rejected() {
        let mut registry = RuleRegistry::new();
        let bad = rule("r001", &["x"], &["y"], "set y 1\n  rule other { set z 1 }");
        let err = registry.add_rule(bad).unwrap_err();
        assert!(err.to_string().contains("conditionally define"));
    }

    #[test]
    fn glob_output_rejected() {
        let mut registry = RuleRegistry::new();
        let bad = rule("r001", &["x"], &["y.*"], "set y 1");
        assert!(registry.add_rule(bad).is_err());
    }

    #[test]
    fn insertion_order_preserved() {
        let mut registry = RuleRegistry::new();
        for id in ["r003", "r001", "r002"] {
            registry.add_rule(rule(id, &["x"], &[], "set q 1")).unwrap();
        }
        let order: Vec<&str> = registry.all_rules().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["r003", "r001", "r002"]);
    }

    #[test]
    fn writers_and_readers() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(rule("r001", &["x"], &["color"], "set color red")).unwrap();
        registry.add_rule(rule("r002", &["color"], &["z"], "set z 1")).unwrap();

        let writers: Vec<&str> = registry.writers_of("color").iter().map(|r| r.id.as_str()).collect();
        assert_eq!(writers, vec!["r001"]);
        let readers: Vec<&str> = registry.readers_of("color").iter().map(|r| r.id.as_str()).collect();
        assert_eq!(readers, vec!["r002"]);
    }
}
