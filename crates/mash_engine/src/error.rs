//! Error types for the tag engine

use std::io;
use thiserror::Error;

/// Engine error type. These are fatal to the caller: a rules file that
/// cannot be loaded or an I/O failure outside the per-object pipeline.
/// Errors scoped to a single object's evaluation are accumulated as
/// [`crate::eval::EvalError`] records instead and never abort a batch.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("syntax error in {file} line {line}{}: {message}", rule_suffix(.rule))]
    Syntax {
        file: String,
        line: usize,
        rule: Option<String>,
        message: String,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

fn rule_suffix(rule: &Option<String>) -> String {
    match rule {
        Some(name) => format!(" (rule \"{}\")", name),
        None => String::new(),
    }
}

impl EngineError {
    pub fn syntax(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        EngineError::Syntax {
            file: file.into(),
            line,
            rule: None,
            message: message.into(),
        }
    }

    pub fn syntax_in_rule(
        file: impl Into<String>,
        line: usize,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::Syntax {
            file: file.into(),
            line,
            rule: Some(rule.into()),
            message: message.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_display() {
        let err = EngineError::syntax("#rules", 4, "wrong # args");
        assert_eq!(
            err.to_string(),
            "syntax error in #rules line 4: wrong # args"
        );

        let err = EngineError::syntax_in_rule("#rules", 9, "Color Map", "mapping arity mismatch");
        assert_eq!(
            err.to_string(),
            "syntax error in #rules line 9 (rule \"Color Map\"): mapping arity mismatch"
        );
    }
}
