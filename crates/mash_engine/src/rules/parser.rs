//! Rules-file loader
//!
//! Parses `rule`, `using ... define`, and `metric` declarations into
//! compiled [`Rule`] records and installs them in a registry. The
//! using-context stack is an explicit frame stack: entering a `using`
//! block pushes the accumulated `(in, out, conditions)` prefix and the
//! frame is popped on every exit path, including parse errors.
//!
//! Error recovery is file-scoped: declarations *deferred* inside a
//! `define` block are skipped individually on error (the error is
//! collected and loading continues); an error in an immediate top-level
//! declaration aborts the whole file.

use super::expr;
use super::lexer::{self, Command, Word, WordKind};
use super::model::{CondCompiled, CondKind, Condition, Rule, RuleBody, RuleKind};
use super::registry::RuleRegistry;
use super::script::{self, compile_script};
use crate::error::{EngineError, Result};
use std::path::Path;
use tracing::{debug, info};

/// Load every rules file (basename starting with `#`) in a directory,
/// in name order. Returns the recovered (non-fatal) syntax errors.
pub fn load_rules_dir(registry: &mut RuleRegistry, dir: &Path) -> Result<Vec<EngineError>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('#'))
        })
        .collect();
    paths.sort();

    let mut recovered = Vec::new();
    for path in paths {
        recovered.extend(load_rules_file(registry, &path)?);
    }
    Ok(recovered)
}

/// Load a single rules file.
pub fn load_rules_file(registry: &mut RuleRegistry, path: &Path) -> Result<Vec<EngineError>> {
    let src = std::fs::read_to_string(path)?;
    let before = registry.len();
    let recovered = load_rules_source(registry, &path.display().to_string(), &src)?;
    info!(
        file = %path.display(),
        rules = registry.len() - before,
        recovered_errors = recovered.len(),
        "Loaded rules file"
    );
    Ok(recovered)
}

/// Load rule declarations from source text.
pub fn load_rules_source(
    registry: &mut RuleRegistry,
    source_file: &str,
    src: &str,
) -> Result<Vec<EngineError>> {
    let commands = lexer::scan_commands(src)
        .map_err(|e| EngineError::syntax(source_file, e.line, e.message))?;
    let mut loader = Loader {
        registry,
        source_file: source_file.to_string(),
        frames: Vec::new(),
        recovered: Vec::new(),
    };
    loader.run_commands(&commands, false)?;
    Ok(loader.recovered)
}

/// One accumulated using-context: the prefix prepended to every rule
/// declared beneath it.
#[derive(Debug, Clone, Default)]
struct Frame {
    inputs: Vec<String>,
    outputs: Vec<String>,
    conditions: Vec<Condition>,
}

struct Loader<'r> {
    registry: &'r mut RuleRegistry,
    source_file: String,
    frames: Vec<Frame>,
    recovered: Vec<EngineError>,
}

enum ParsedBody {
    Block(String),
    Claim(String),
    Map(String),
}

impl<'r> Loader<'r> {
    fn run_commands(&mut self, commands: &[Command], deferred: bool) -> Result<()> {
        for command in commands {
            let head = command.words[0].text.as_str();
            let result = match head {
                "rule" => self.handle_rule(command),
                "using" => self.handle_using(command),
                "metric" => {
                    debug!(line = command.line, "Ignoring metric declaration");
                    Ok(())
                }
                other => Err(self.syntax(
                    command.line,
                    None,
                    format!("unknown declaration \"{}\"", other),
                )),
            };
            if let Err(err) = result {
                if deferred {
                    self.recovered.push(err);
                } else {
                    return Err(self.abort_summary(err));
                }
            }
        }
        Ok(())
    }

    /// A fatal top-level error aborts the file; fold any previously
    /// recovered errors into its message so the caller sees the whole
    /// picture.
    fn abort_summary(&mut self, err: EngineError) -> EngineError {
        if self.recovered.is_empty() {
            return err;
        }
        EngineError::InvalidState(format!(
            "{} (after {} recovered error(s) earlier in the file)",
            err,
            self.recovered.len()
        ))
    }

    fn syntax(&self, line: usize, rule: Option<&str>, message: impl Into<String>) -> EngineError {
        match rule {
            Some(name) => EngineError::syntax_in_rule(&self.source_file, line, name, message),
            None => EngineError::syntax(&self.source_file, line, message),
        }
    }

    fn top_frame(&self) -> Frame {
        self.frames.last().cloned().unwrap_or_default()
    }

    // -- using ------------------------------------------------------------

    fn handle_using(&mut self, command: &Command) -> Result<()> {
        let words = &command.words;
        let line = command.line;
        if words.len() != 4 || words[2].text != "define" {
            return Err(self.syntax(
                line,
                None,
                "wrong # args: should be \"using {spec} define {rules}\"",
            ));
        }
        if words[1].kind != WordKind::Braced || words[3].kind != WordKind::Braced {
            return Err(self.syntax(line, None, "using spec and define block must be braced"));
        }

        let new_parts = self.parse_using_spec(&words[1], line)?;
        let mut combined = self.top_frame();
        combined.inputs.extend(new_parts.inputs);
        combined.outputs.extend(new_parts.outputs);
        combined.conditions.extend(new_parts.conditions);

        let inner = lexer::scan_commands(&words[3].text)
            .map_err(|e| self.syntax(line + e.line - 1, None, e.message))?;

        self.frames.push(combined);
        let result = self.run_commands(&inner, true);
        self.frames.pop();
        result
    }

    fn parse_using_spec(&self, spec: &Word, line: usize) -> Result<Frame> {
        let words = lexer::scan_words(&spec.text)
            .map_err(|e| self.syntax(line, None, e.message))?;
        let mut frame = Frame::default();
        let mut i = 0;
        while i < words.len() {
            let keyword = words[i].text.as_str();
            match keyword {
                "always" => {
                    i += 1;
                    continue;
                }
                "in" | "out" | "if" | "when" => {}
                other => {
                    return Err(self.syntax(
                        line,
                        None,
                        format!("unknown keyword \"{}\" in using spec", other),
                    ));
                }
            }
            let Some(arg) = words.get(i + 1) else {
                return Err(self.syntax(
                    line,
                    None,
                    format!("incomplete statement: \"{}\" needs an argument", keyword),
                ));
            };
            match keyword {
                "in" => frame.inputs.extend(self.word_list(arg, line)?),
                "out" => frame.outputs.extend(self.word_list(arg, line)?),
                "if" => frame.conditions.push(self.compile_if(arg, line, None)?),
                "when" => frame.conditions.push(self.compile_when(arg, line, None)?),
                _ => unreachable!(),
            }
            i += 2;
        }
        Ok(frame)
    }

    // -- rule -------------------------------------------------------------

    fn handle_rule(&mut self, command: &Command) -> Result<()> {
        let words = &command.words;
        let line = command.line;
        let mut name: Option<String> = None;
        let mut inputs: Vec<String> = Vec::new();
        let mut outputs: Vec<String> = Vec::new();
        let mut conditions: Vec<Condition> = Vec::new();
        let mut body: Option<ParsedBody> = None;
        let mut seen_out = false;

        let mut i = 1;
        while i < words.len() {
            let word = &words[i];
            if body.is_some() {
                return Err(self.syntax(
                    line,
                    name.as_deref(),
                    "unexpected argument after rule body",
                ));
            }
            let keyword = if word.kind == WordKind::Bare {
                word.text.as_str()
            } else {
                ""
            };
            match keyword {
                "in" => {
                    if seen_out {
                        return Err(self.syntax(
                            line,
                            name.as_deref(),
                            "in {...} must come before out {...}",
                        ));
                    }
                    let arg = self.need_arg(words, i, "in", line, name.as_deref())?;
                    inputs.extend(self.word_list(arg, line)?);
                    i += 2;
                }
                "out" => {
                    seen_out = true;
                    let arg = self.need_arg(words, i, "out", line, name.as_deref())?;
                    outputs.extend(self.word_list(arg, line)?);
                    i += 2;
                }
                "if" => {
                    let arg = self.need_arg(words, i, "if", line, name.as_deref())?;
                    conditions.push(self.compile_if(arg, line, name.as_deref())?);
                    i += 2;
                }
                "when" => {
                    let arg = self.need_arg(words, i, "when", line, name.as_deref())?;
                    conditions.push(self.compile_when(arg, line, name.as_deref())?);
                    i += 2;
                }
                "always" | "then" => i += 1,
                "claim" => {
                    let arg = self.need_arg(words, i, "claim", line, name.as_deref())?;
                    body = Some(ParsedBody::Claim(arg.text.clone()));
                    i += 2;
                }
                "map" => {
                    let arg = self.need_arg(words, i, "map", line, name.as_deref())?;
                    body = Some(ParsedBody::Map(arg.text.clone()));
                    i += 2;
                }
                _ => {
                    if word.kind == WordKind::Braced && i == words.len() - 1 {
                        body = Some(ParsedBody::Block(word.text.clone()));
                        i += 1;
                    } else if name.is_none() && i == 1 {
                        name = Some(word.text.clone());
                        i += 1;
                    } else {
                        return Err(self.syntax(
                            line,
                            name.as_deref(),
                            format!("wrong # args: unexpected word \"{}\"", word.text),
                        ));
                    }
                }
            }
        }

        let Some(body) = body else {
            return Err(self.syntax(line, name.as_deref(), "missing rule body"));
        };

        // Prepend the using-context prefix, then dedup preserving the
        // first occurrence.
        let frame = self.top_frame();
        let inputs = dedup_strings(frame.inputs.into_iter().chain(inputs));
        let outputs: Vec<String> = frame.outputs.into_iter().chain(outputs).collect();
        let conditions = dedup_conditions(frame.conditions.into_iter().chain(conditions));

        let id = self.registry.next_id();
        let name = name.unwrap_or_else(|| Rule::default_name(&id));

        let (kind, compiled) = match body {
            ParsedBody::Block(src) => {
                let script = compile_script(&src).map_err(|e| {
                    self.syntax(line + e.line - 1, Some(&name), e.message)
                })?;
                (RuleKind::Default, RuleBody::Block(script))
            }
            ParsedBody::Claim(src) => {
                if !outputs.is_empty() {
                    return Err(self.syntax(
                        line,
                        Some(&name),
                        "a claim rule cannot declare outputs",
                    ));
                }
                let parsed = expr::parse(&src)
                    .map_err(|e| self.syntax(line, Some(&name), e))?;
                (
                    RuleKind::Claim,
                    RuleBody::Claim {
                        expr: parsed,
                        source: src,
                    },
                )
            }
            ParsedBody::Map(src) => {
                let table = self.parse_map_table(&src, line, &name, &inputs, &outputs)?;
                (RuleKind::Map, RuleBody::Map { table })
            }
        };

        let source_text = render_source(&name, &inputs, &outputs, &conditions, &compiled);
        let rule = Rule {
            id,
            name,
            source_file: self.source_file.clone(),
            inputs,
            outputs,
            conditions,
            kind,
            body: compiled,
            source_text,
        };
        self.registry.add_rule(rule)
    }

    fn need_arg<'w>(
        &self,
        words: &'w [Word],
        i: usize,
        keyword: &str,
        line: usize,
        rule: Option<&str>,
    ) -> Result<&'w Word> {
        words.get(i + 1).ok_or_else(|| {
            self.syntax(
                line,
                rule,
                format!("incomplete statement: \"{}\" needs an argument", keyword),
            )
        })
    }

    fn word_list(&self, word: &Word, line: usize) -> Result<Vec<String>> {
        let words = lexer::scan_words(&word.text)
            .map_err(|e| self.syntax(line, None, e.message))?;
        Ok(words.into_iter().map(|w| w.text).collect())
    }

    fn compile_if(&self, word: &Word, line: usize, rule: Option<&str>) -> Result<Condition> {
        let compiled = expr::parse(&word.text).map_err(|e| self.syntax(line, rule, e))?;
        Ok(Condition {
            kind: CondKind::If,
            source: word.text.trim().to_string(),
            compiled: CondCompiled::Expr(compiled),
        })
    }

    fn compile_when(&self, word: &Word, line: usize, rule: Option<&str>) -> Result<Condition> {
        let compiled =
            script::parse_cmd_call(&word.text).map_err(|e| self.syntax(line, rule, e))?;
        Ok(Condition {
            kind: CondKind::When,
            source: word.text.trim().to_string(),
            compiled: CondCompiled::Command(compiled),
        })
    }

    fn parse_map_table(
        &self,
        src: &str,
        line: usize,
        rule: &str,
        inputs: &[String],
        outputs: &[String],
    ) -> Result<Vec<(Vec<String>, Vec<String>)>> {
        if let Some(glob) = inputs.iter().find(|p| p.ends_with(".*")) {
            return Err(self.syntax(
                line,
                Some(rule),
                format!("map rule inputs must be exact tag names, got {{{}}}", glob),
            ));
        }
        let words = lexer::scan_words(src)
            .map_err(|e| self.syntax(line, Some(rule), e.message))?;
        if words.len() % 2 != 0 {
            return Err(self.syntax(
                line,
                Some(rule),
                "map table must contain {in-tuple} {out-tuple} pairs",
            ));
        }
        let mut table = Vec::with_capacity(words.len() / 2);
        for pair in words.chunks(2) {
            let in_tuple = self.tuple_items(&pair[0], line, rule)?;
            let out_tuple = self.tuple_items(&pair[1], line, rule)?;
            if in_tuple.len() != inputs.len() || out_tuple.len() != outputs.len() {
                return Err(self.syntax(
                    line,
                    Some(rule),
                    format!(
                        "mapping arity mismatch: expected {} input(s) and {} output(s), got {} and {}",
                        inputs.len(),
                        outputs.len(),
                        in_tuple.len(),
                        out_tuple.len()
                    ),
                ));
            }
            table.push((in_tuple, out_tuple));
        }
        Ok(table)
    }

    fn tuple_items(&self, word: &Word, line: usize, rule: &str) -> Result<Vec<String>> {
        let words = lexer::scan_words(&word.text)
            .map_err(|e| self.syntax(line, Some(rule), e.message))?;
        Ok(words.into_iter().map(|w| w.text).collect())
    }
}

fn dedup_strings(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn dedup_conditions(items: impl Iterator<Item = Condition>) -> Vec<Condition> {
    let mut out: Vec<Condition> = Vec::new();
    for item in items {
        if !out.iter().any(|c| c.key() == item.key()) {
            out.push(item);
        }
    }
    out
}

/// Canonical declaration text for the report's definitions section.
fn render_source(
    name: &str,
    inputs: &[String],
    outputs: &[String],
    conditions: &[Condition],
    body: &RuleBody,
) -> String {
    let mut text = format!("rule {{{}}}", name);
    if !inputs.is_empty() {
        text.push_str(&format!(" in {{{}}}", inputs.join(" ")));
    }
    if !outputs.is_empty() {
        text.push_str(&format!(" out {{{}}}", outputs.join(" ")));
    }
    for cond in conditions {
        let keyword = match cond.kind {
            CondKind::If => "if",
            CondKind::When => "when",
        };
        text.push_str(&format!(" {} {{{}}}", keyword, cond.source));
    }
    if conditions.is_empty() {
        text.push_str(" always");
    }
    match body {
        RuleBody::Block(script) => {
            text.push_str(&format!(" {{{}}}", script.source));
        }
        RuleBody::Claim { source, .. } => {
            text.push_str(&format!(" claim {{{}}}", source.trim()));
        }
        RuleBody::Map { table } => {
            let pairs: Vec<String> = table
                .iter()
                .map(|(i, o)| format!("{{{}}} {{{}}}", i.join(" "), o.join(" ")))
                .collect();
            text.push_str(&format!(" map {{ {} }}", pairs.join("  ")));
        }
    }
    text
}
