//! Word scanner for the rule language
//!
//! The surface syntax is word-oriented: a script is a sequence of
//! commands separated by newlines or `;`, and each command is a
//! sequence of words. A word is bare, `{braced}` (literal, nests),
//! `[bracketed]` (substitution, nests) or `"quoted"`. `#` in command
//! position starts a comment. Unterminated groups at end of input are
//! syntax errors, not silent truncation.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    Bare,
    Braced,
    Bracketed,
    Quoted,
}

/// One scanned word. `text` is the inner content for grouped words
/// (delimiters stripped) and the raw text for bare words.
#[derive(Debug, Clone)]
pub struct Word {
    pub kind: WordKind,
    pub text: String,
    pub line: usize,
}

/// One command: a non-empty word sequence.
#[derive(Debug, Clone)]
pub struct Command {
    pub words: Vec<Word>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct LexError {
    pub line: usize,
    pub message: String,
}

impl LexError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Scanner {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_blank(&mut self, newlines_are_blank: bool) {
        while let Some(c) = self.peek() {
            if c == ' ' || c == '\t' || c == '\r' || (newlines_are_blank && c == '\n') {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    /// Consume a `{...}` or `[...]` group (opening delimiter already
    /// positioned at `pos`), returning the inner text.
    fn group(&mut self, open: char, close: char) -> Result<String, LexError> {
        let start_line = self.line;
        self.bump(); // opening delimiter
        let mut depth = 1usize;
        let mut text = String::new();
        while let Some(c) = self.bump() {
            if c == '\\' {
                text.push(c);
                if let Some(next) = self.bump() {
                    text.push(next);
                }
                continue;
            }
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(text);
                }
            }
            text.push(c);
        }
        Err(LexError::new(
            start_line,
            format!("incomplete statement: missing closing '{}' at end of input", close),
        ))
    }

    fn quoted(&mut self) -> Result<String, LexError> {
        let start_line = self.line;
        self.bump(); // opening quote
        let mut text = String::new();
        while let Some(c) = self.bump() {
            match c {
                '"' => return Ok(text),
                '\\' => {
                    text.push(c);
                    if let Some(next) = self.bump() {
                        text.push(next);
                    }
                }
                _ => text.push(c),
            }
        }
        Err(LexError::new(
            start_line,
            "incomplete statement: unterminated quote at end of input",
        ))
    }

    fn bare(&mut self) -> Result<String, LexError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' | ';' => break,
                '[' => {
                    // Brackets embed whole commands; whitespace inside
                    // them does not split the word.
                    let inner = self.group('[', ']')?;
                    text.push('[');
                    text.push_str(&inner);
                    text.push(']');
                }
                '\\' => {
                    self.bump();
                    text.push('\\');
                    if let Some(next) = self.bump() {
                        text.push(next);
                    }
                }
                _ => {
                    self.bump();
                    text.push(c);
                }
            }
        }
        Ok(text)
    }

    fn word(&mut self) -> Result<Word, LexError> {
        let line = self.line;
        match self.peek() {
            Some('{') => Ok(Word {
                kind: WordKind::Braced,
                text: self.group('{', '}')?,
                line,
            }),
            Some('[') => Ok(Word {
                kind: WordKind::Bracketed,
                text: self.group('[', ']')?,
                line,
            }),
            Some('"') => Ok(Word {
                kind: WordKind::Quoted,
                text: self.quoted()?,
                line,
            }),
            _ => Ok(Word {
                kind: WordKind::Bare,
                text: self.bare()?,
                line,
            }),
        }
    }
}

/// Split a script into commands.
pub fn scan_commands(src: &str) -> Result<Vec<Command>, LexError> {
    let mut scanner = Scanner::new(src);
    let mut commands = Vec::new();
    let mut words: Vec<Word> = Vec::new();
    let mut command_line = 1usize;

    loop {
        scanner.skip_blank(false);
        match scanner.peek() {
            None => {
                if !words.is_empty() {
                    commands.push(Command {
                        words: std::mem::take(&mut words),
                        line: command_line,
                    });
                }
                return Ok(commands);
            }
            Some('\n') | Some(';') => {
                scanner.bump();
                if !words.is_empty() {
                    commands.push(Command {
                        words: std::mem::take(&mut words),
                        line: command_line,
                    });
                }
            }
            Some('#') if words.is_empty() => {
                scanner.skip_line();
            }
            Some(_) => {
                if words.is_empty() {
                    command_line = scanner.line;
                }
                words.push(scanner.word()?);
            }
        }
    }
}

/// Scan a plain word list (no command structure: newlines are blanks).
/// Used for `in`/`out` pattern lists, `using` specs, map tables and
/// bracket-call arguments.
pub fn scan_words(src: &str) -> Result<Vec<Word>, LexError> {
    let mut scanner = Scanner::new(src);
    let mut words = Vec::new();
    loop {
        scanner.skip_blank(true);
        if scanner.peek().is_none() {
            return Ok(words);
        }
        words.push(scanner.word()?);
    }
}
