//! Statement interpreter for default rule bodies
//!
//! A body is compiled once at load time into a statement list and
//! walked per evaluation. The statement set is deliberately small:
//! `set`, `if`/`else`, `exception`, `continue`, `return`. Words
//! substitute `$var` and `[command ...]`; braced words stay literal.
//!
//! The evaluator built-ins (`rule_file`, `rule_name`,
//! `object_relative_path`, `has`) are resolved here, against a
//! [`Builtins`] view handed in by the evaluator.

use super::expr::{self, Expr};
use super::lexer::{self, LexError, Word, WordKind};
use crate::tags::{self, TagMap};
use std::path::Path;

// ---------------------------------------------------------------------------
// Compiled forms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum WordPart {
    Lit(String),
    Var(String),
    Cmd(CmdCall),
}

/// A word with its substitutions pre-parsed.
#[derive(Debug, Clone)]
pub struct WordTmpl {
    parts: Vec<WordPart>,
}

/// A bracket call to one of the evaluator built-ins.
#[derive(Debug, Clone)]
pub enum CmdCall {
    Expr(Expr),
    Has(WordTmpl),
    ObjectRelativePath(Vec<WordTmpl>),
    RuleFile,
    RuleName,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Set {
        name: String,
        value: WordTmpl,
    },
    If {
        cond: Expr,
        then_block: Vec<Stmt>,
        else_block: Vec<Stmt>,
    },
    Exception {
        message: Option<WordTmpl>,
    },
    Continue,
    Return,
}

/// A compiled body block plus its original text (kept for the
/// conditional-definition check and for rendering rule definitions).
#[derive(Debug, Clone)]
pub struct Script {
    pub stmts: Vec<Stmt>,
    pub source: String,
}

/// How a body run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Normal,
    Continue,
    Return,
    Exception(Option<String>),
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

pub fn compile_script(src: &str) -> Result<Script, LexError> {
    let stmts = compile_block(src)?;
    Ok(Script {
        stmts,
        source: src.to_string(),
    })
}

fn compile_block(src: &str) -> Result<Vec<Stmt>, LexError> {
    let commands = lexer::scan_commands(src)?;
    let mut stmts = Vec::with_capacity(commands.len());
    for command in commands {
        stmts.push(compile_stmt(&command.words, command.line)?);
    }
    Ok(stmts)
}

fn compile_stmt(words: &[Word], line: usize) -> Result<Stmt, LexError> {
    let fail = |message: String| LexError { line, message };
    let name = words[0].text.as_str();
    match name {
        "set" => {
            if words.len() != 3 {
                return Err(fail(format!(
                    "wrong # args: should be \"set varName value\", got {}",
                    words.len()
                )));
            }
            Ok(Stmt::Set {
                name: words[1].text.clone(),
                value: parse_word_tmpl(&words[2]).map_err(fail)?,
            })
        }
        "if" => {
            if words.len() != 3 && !(words.len() == 5 && words[3].text == "else") {
                return Err(fail(
                    "wrong # args: should be \"if {expr} {block} ?else {block}?\"".to_string(),
                ));
            }
            let cond = expr::parse(&words[1].text).map_err(fail)?;
            let then_block = compile_block(&words[2].text)?;
            let else_block = if words.len() == 5 {
                compile_block(&words[4].text)?
            } else {
                Vec::new()
            };
            Ok(Stmt::If {
                cond,
                then_block,
                else_block,
            })
        }
        "exception" => {
            if words.len() > 2 {
                return Err(fail(
                    "wrong # args: should be \"exception ?message?\"".to_string(),
                ));
            }
            let message = match words.get(1) {
                Some(word) => Some(parse_word_tmpl(word).map_err(fail)?),
                None => None,
            };
            Ok(Stmt::Exception { message })
        }
        "continue" => Ok(Stmt::Continue),
        "return" => {
            if words.len() > 2 {
                return Err(fail("wrong # args: should be \"return ?value?\"".to_string()));
            }
            Ok(Stmt::Return)
        }
        other => Err(fail(format!("unknown command \"{}\" in rule body", other))),
    }
}

/// Parse a `[command ...]` invocation into a compiled call.
pub fn parse_cmd_call(src: &str) -> Result<CmdCall, String> {
    let words = lexer::scan_words(src).map_err(|e| e.message)?;
    let Some(head) = words.first() else {
        return Err("empty command substitution".to_string());
    };
    match head.text.as_str() {
        "expr" => {
            if words.len() < 2 {
                return Err("wrong # args: should be \"expr arg ?arg ...?\"".to_string());
            }
            let source = if words.len() == 2 {
                words[1].text.clone()
            } else {
                words[1..]
                    .iter()
                    .map(|w| w.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            Ok(CmdCall::Expr(expr::parse(&source)?))
        }
        "has" => {
            if words.len() != 2 {
                return Err("wrong # args: should be \"has tagPattern\"".to_string());
            }
            Ok(CmdCall::Has(parse_word_tmpl(&words[1])?))
        }
        "object_relative_path" => {
            if words.len() < 2 {
                return Err(
                    "wrong # args: should be \"object_relative_path segment ?segment ...?\""
                        .to_string(),
                );
            }
            let args = words[1..]
                .iter()
                .map(parse_word_tmpl)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CmdCall::ObjectRelativePath(args))
        }
        "rule_file" => Ok(CmdCall::RuleFile),
        "rule_name" => Ok(CmdCall::RuleName),
        other => Err(format!("unknown command \"{}\"", other)),
    }
}

/// Parse a word into its substitution template.
pub fn parse_word_tmpl(word: &Word) -> Result<WordTmpl, String> {
    match word.kind {
        WordKind::Braced => Ok(WordTmpl {
            parts: vec![WordPart::Lit(word.text.clone())],
        }),
        WordKind::Bracketed => Ok(WordTmpl {
            parts: vec![WordPart::Cmd(parse_cmd_call(&word.text)?)],
        }),
        WordKind::Bare | WordKind::Quoted => parse_substitutions(&word.text),
    }
}

fn parse_substitutions(text: &str) -> Result<WordTmpl, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                lit.push(match chars[i + 1] {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
                i += 2;
            }
            '$' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len()
                    && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.')
                {
                    j += 1;
                }
                if j == start {
                    lit.push('$');
                    i += 1;
                    continue;
                }
                if !lit.is_empty() {
                    parts.push(WordPart::Lit(std::mem::take(&mut lit)));
                }
                parts.push(WordPart::Var(chars[start..j].iter().collect()));
                i = j;
            }
            '[' => {
                let mut depth = 1;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && depth > 0 {
                    match chars[j] {
                        '[' => depth += 1,
                        ']' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                if depth > 0 {
                    return Err("missing closing ']' in word".to_string());
                }
                if !lit.is_empty() {
                    parts.push(WordPart::Lit(std::mem::take(&mut lit)));
                }
                let inner: String = chars[start..j - 1].iter().collect();
                parts.push(WordPart::Cmd(parse_cmd_call(&inner)?));
                i = j;
            }
            other => {
                lit.push(other);
                i += 1;
            }
        }
    }
    if !lit.is_empty() || parts.is_empty() {
        parts.push(WordPart::Lit(lit));
    }
    Ok(WordTmpl { parts })
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Read-only data the built-ins close over for one rule pop.
pub struct Builtins<'a> {
    pub object_path: &'a Path,
    pub rule_file: &'a str,
    pub rule_name: &'a str,
    /// Full tag context of the object (the `has` builtin sees all tags,
    /// not just the bound inputs).
    pub context: &'a TagMap,
}

/// Variable scope for expression and word evaluation.
pub struct Scope<'a> {
    pub vars: &'a TagMap,
    pub builtins: &'a Builtins<'a>,
}

impl<'a> Scope<'a> {
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn call(&self, cmd: &CmdCall) -> Result<String, String> {
        match cmd {
            CmdCall::Expr(e) => expr::eval(e, self),
            CmdCall::Has(pattern) => {
                let pattern = self.eval_word(pattern)?;
                Ok(if tags::has_match(self.builtins.context, &pattern) {
                    "1".to_string()
                } else {
                    "0".to_string()
                })
            }
            CmdCall::ObjectRelativePath(args) => {
                let mut path = self.builtins.object_path.to_path_buf();
                for arg in args {
                    path.push(self.eval_word(arg)?);
                }
                Ok(path.to_string_lossy().into_owned())
            }
            CmdCall::RuleFile => Ok(self.builtins.rule_file.to_string()),
            CmdCall::RuleName => Ok(self.builtins.rule_name.to_string()),
        }
    }

    pub fn eval_word(&self, tmpl: &WordTmpl) -> Result<String, String> {
        let mut out = String::new();
        for part in &tmpl.parts {
            match part {
                WordPart::Lit(text) => out.push_str(text),
                WordPart::Var(name) => match self.var(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(format!("can't read \"{}\": no such variable", name)),
                },
                WordPart::Cmd(cmd) => out.push_str(&self.call(cmd)?),
            }
        }
        Ok(out)
    }
}

/// Run a compiled body. `locals` starts out holding the bound inputs
/// and accumulates `set` variables; outputs are collected from it by
/// the caller afterwards.
pub fn run_script(
    script: &Script,
    locals: &mut TagMap,
    builtins: &Builtins<'_>,
) -> Result<Signal, String> {
    run_block(&script.stmts, locals, builtins)
}

fn run_block(
    stmts: &[Stmt],
    locals: &mut TagMap,
    builtins: &Builtins<'_>,
) -> Result<Signal, String> {
    for stmt in stmts {
        match stmt {
            Stmt::Set { name, value } => {
                let value = Scope {
                    vars: locals,
                    builtins,
                }
                .eval_word(value)?;
                locals.insert(name.clone(), value);
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                let scope = Scope {
                    vars: locals,
                    builtins,
                };
                let taken = expr::truthy(&expr::eval(cond, &scope)?)?;
                let block = if taken { then_block } else { else_block };
                let signal = run_block(block, locals, builtins)?;
                if signal != Signal::Normal {
                    return Ok(signal);
                }
            }
            Stmt::Exception { message } => {
                let message = match message {
                    Some(tmpl) => Some(
                        Scope {
                            vars: locals,
                            builtins,
                        }
                        .eval_word(tmpl)?,
                    ),
                    None => None,
                };
                return Ok(Signal::Exception(message));
            }
            Stmt::Continue => return Ok(Signal::Continue),
            Stmt::Return => return Ok(Signal::Return),
        }
    }
    Ok(Signal::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str, inputs: &[(&str, &str)]) -> (Result<Signal, String>, TagMap) {
        let script = compile_script(src).expect("script should compile");
        let mut locals: TagMap = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let context = locals.clone();
        let builtins = Builtins {
            object_path: Path::new("/data/obj1"),
            rule_file: "#base_rules",
            rule_name: "Test Rule",
            context: &context,
        };
        let signal = run_script(&script, &mut locals, &builtins);
        (signal, locals)
    }

    #[test]
    fn set_with_expr_substitution() {
        let (signal, locals) = run("set y [expr {$x + 1}]", &[("x", "41")]);
        assert_eq!(signal.unwrap(), Signal::Normal);
        assert_eq!(locals.get("y").unwrap(), "42");
    }

    #[test]
    fn set_concatenates_parts() {
        let (signal, locals) = run(r#"set label "v$x-end""#, &[("x", "7")]);
        assert_eq!(signal.unwrap(), Signal::Normal);
        assert_eq!(locals.get("label").unwrap(), "v7-end");
    }

    #[test]
    fn braced_word_is_literal() {
        let (_, locals) = run("set raw {$x + [expr {1}]}", &[("x", "1")]);
        assert_eq!(locals.get("raw").unwrap(), "$x + [expr {1}]");
    }

    #[test]
    fn if_else_branches() {
        let src = "if {$x > 10} { set size big } else { set size small }";
        let (_, locals) = run(src, &[("x", "20")]);
        assert_eq!(locals.get("size").unwrap(), "big");
        let (_, locals) = run(src, &[("x", "3")]);
        assert_eq!(locals.get("size").unwrap(), "small");
    }

    #[test]
    fn exception_carries_message() {
        let (signal, _) = run("exception {not applicable}", &[]);
        assert_eq!(
            signal.unwrap(),
            Signal::Exception(Some("not applicable".to_string()))
        );
    }

    #[test]
    fn continue_and_return_signals() {
        let (signal, locals) = run("set a 1\ncontinue\nset b 2", &[]);
        assert_eq!(signal.unwrap(), Signal::Continue);
        assert!(locals.contains_key("a"));
        assert!(!locals.contains_key("b"));

        let (signal, _) = run("return", &[]);
        assert_eq!(signal.unwrap(), Signal::Return);
    }

    #[test]
    fn builtin_calls() {
        let (_, locals) = run("set f [rule_file]\nset n [rule_name]", &[]);
        assert_eq!(locals.get("f").unwrap(), "#base_rules");
        assert_eq!(locals.get("n").unwrap(), "Test Rule");

        let (_, locals) = run("set p [object_relative_path cfg data.txt]", &[]);
        assert_eq!(locals.get("p").unwrap(), "/data/obj1/cfg/data.txt");

        let (_, locals) = run("set present [has co*]", &[("color", "red")]);
        assert_eq!(locals.get("present").unwrap(), "1");
        let (_, locals) = run("set present [has co*]", &[("count", "3")]);
        assert_eq!(locals.get("present").unwrap(), "1");
        let (_, locals) = run("set present [has zz*]", &[("count", "3")]);
        assert_eq!(locals.get("present").unwrap(), "0");
    }

    #[test]
    fn missing_variable_is_body_error() {
        let (signal, _) = run("set y $missing", &[]);
        assert!(signal.unwrap_err().contains("no such variable"));
    }

    #[test]
    fn unknown_command_rejected_at_compile_time() {
        assert!(compile_script("frobnicate a b").is_err());
    }

    #[test]
    fn exception_inside_if() {
        let (signal, _) = run(
            "if {$n == 0} { exception {zero input} }\nset y 1",
            &[("n", "0")],
        );
        assert_eq!(signal.unwrap(), Signal::Exception(Some("zero input".to_string())));
    }
}
