//! Scanner turning source text into position-annotated tokens.

use std::{fmt, sync::Arc};

use strum::Display;

use crate::{
    ast::CodeLoc,
    errors::{ErrorKind, EvalResult, RuntimeError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TokenKind {
    Ident,
    Number,
    Str,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,

    Assign,
    /// A single `=`, valid only as the parameter default separator.
    EqSingle,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,

    And,
    Or,
    Not,
    In,
    NotIn,
    True,
    False,
    Null,
    If,
    Elif,
    Else,
    For,
    Break,
    Continue,
    Return,
    Func,
    Sink,
    Kindmatch,
    Statematch,
    Suppresses,
    Priority,
    Import,
    As,
    Try,
    Except,
    Otherwise,
    Finally,
    Mutex,

    Eof,
}

/// A scanned token. `lit` holds identifier names and decoded string bodies;
/// `num` holds the parsed value of number literals.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lit: String,
    pub num: f64,
    pub line: u32,
    pub pos: u32,
}

impl Token {
    pub fn loc(&self, source: &Arc<str>) -> CodeLoc {
        CodeLoc::new(source, self.line, self.pos)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Ident | TokenKind::Number => f.write_str(&self.lit),
            TokenKind::Str => write!(f, "{:?}", self.lit),
            other => other.fmt(f),
        }
    }
}

fn keyword(ident: &str) -> Option<TokenKind> {
    Some(match ident {
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "in" => TokenKind::In,
        "notin" => TokenKind::NotIn,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        "if" => TokenKind::If,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        "func" => TokenKind::Func,
        "sink" => TokenKind::Sink,
        "kindmatch" => TokenKind::Kindmatch,
        "statematch" => TokenKind::Statematch,
        "suppresses" => TokenKind::Suppresses,
        "priority" => TokenKind::Priority,
        "import" => TokenKind::Import,
        "as" => TokenKind::As,
        "try" => TokenKind::Try,
        "except" => TokenKind::Except,
        "otherwise" => TokenKind::Otherwise,
        "finally" => TokenKind::Finally,
        "mutex" => TokenKind::Mutex,
        _ => return None,
    })
}

struct Scanner {
    source: Arc<str>,
    chars: Vec<char>,
    idx: usize,
    line: u32,
    pos: u32,
    tokens: Vec<Token>,
}

/// Scans `text` into tokens. The returned list always ends with an `Eof`
/// token carrying the final position.
pub fn lex(source: &str, text: &str) -> EvalResult<Vec<Token>> {
    let mut scanner = Scanner {
        source: Arc::from(source),
        chars: text.chars().collect(),
        idx: 0,
        line: 1,
        pos: 1,
        tokens: Vec::new(),
    };
    scanner.run()?;
    Ok(scanner.tokens)
}

impl Scanner {
    fn error(&self, detail: String) -> RuntimeError {
        let mut err = RuntimeError::new(ErrorKind::InvalidConstruct, detail);
        err.source = self.source.to_string();
        err.loc = Some(CodeLoc::new(&self.source, self.line, self.pos));
        err
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.idx).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.chars.get(self.idx + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.idx += 1;
        if c == '\n' {
            self.line += 1;
            self.pos = 1;
        } else {
            self.pos += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, lit: String, line: u32, pos: u32) {
        self.tokens.push(Token {
            kind,
            lit,
            num: 0.0,
            line,
            pos,
        });
    }

    fn run(&mut self) -> EvalResult<()> {
        while let Some(c) = self.peek() {
            let (line, pos) = (self.line, self.pos);
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                '"' | '\'' => self.scan_string(c)?,
                '0'..='9' => self.scan_number()?,
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                        ident.push(self.advance().expect("peeked above"));
                    }
                    let kind = keyword(&ident).unwrap_or(TokenKind::Ident);
                    self.push(kind, ident, line, pos);
                }
                _ => {
                    self.advance();
                    let kind = match c {
                        '(' => TokenKind::LParen,
                        ')' => TokenKind::RParen,
                        '[' => TokenKind::LBracket,
                        ']' => TokenKind::RBracket,
                        '{' => TokenKind::LBrace,
                        '}' => TokenKind::RBrace,
                        ',' => TokenKind::Comma,
                        '.' => TokenKind::Dot,
                        ';' => TokenKind::Semicolon,
                        '+' => TokenKind::Plus,
                        '-' => TokenKind::Minus,
                        '*' => TokenKind::Star,
                        '%' => TokenKind::Percent,
                        ':' => {
                            if self.peek() == Some('=') {
                                self.advance();
                                TokenKind::Assign
                            } else {
                                TokenKind::Colon
                            }
                        }
                        '/' => {
                            if self.peek() == Some('/') {
                                self.advance();
                                TokenKind::SlashSlash
                            } else {
                                TokenKind::Slash
                            }
                        }
                        '=' => {
                            if self.peek() == Some('=') {
                                self.advance();
                                TokenKind::Eq
                            } else {
                                TokenKind::EqSingle
                            }
                        }
                        '!' => {
                            if self.peek() == Some('=') {
                                self.advance();
                                TokenKind::Neq
                            } else {
                                return Err(self.error("Expected != not !".into()));
                            }
                        }
                        '>' => {
                            if self.peek() == Some('=') {
                                self.advance();
                                TokenKind::Gte
                            } else {
                                TokenKind::Gt
                            }
                        }
                        '<' => {
                            if self.peek() == Some('=') {
                                self.advance();
                                TokenKind::Lte
                            } else {
                                TokenKind::Lt
                            }
                        }
                        other => {
                            return Err(self.error(format!("Unexpected character: {other}")));
                        }
                    };
                    self.push(kind, String::new(), line, pos);
                }
            }
        }
        let (line, pos) = (self.line, self.pos);
        self.push(TokenKind::Eof, String::new(), line, pos);
        Ok(())
    }

    fn scan_string(&mut self, quote: char) -> EvalResult<()> {
        let (line, pos) = (self.line, self.pos);
        self.advance();
        let mut body = String::new();
        loop {
            match self.advance() {
                None => return Err(self.error("Unterminated string".into())),
                Some(c) if c == quote => break,
                Some('\\') => match self.advance() {
                    Some('n') => body.push('\n'),
                    Some('t') => body.push('\t'),
                    Some('r') => body.push('\r'),
                    Some('\\') => body.push('\\'),
                    Some(c) if c == quote => body.push(c),
                    Some(c) => {
                        body.push('\\');
                        body.push(c);
                    }
                    None => return Err(self.error("Unterminated string".into())),
                },
                Some(c) => body.push(c),
            }
        }
        self.push(TokenKind::Str, body, line, pos);
        Ok(())
    }

    fn scan_number(&mut self) -> EvalResult<()> {
        let (line, pos) = (self.line, self.pos);
        let mut lit = String::new();
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            lit.push(self.advance().expect("peeked above"));
        }
        // fractional part, but not a dotted path access like 1.x
        if self.peek() == Some('.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            lit.push(self.advance().expect("peeked above"));
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                lit.push(self.advance().expect("peeked above"));
            }
        }
        if self.peek() == Some('e') || self.peek() == Some('E') {
            let mut exp = String::new();
            let (save_idx, save_pos) = (self.idx, self.pos);
            exp.push(self.advance().expect("peeked above"));
            if self.peek() == Some('+') || self.peek() == Some('-') {
                exp.push(self.advance().expect("peeked above"));
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    exp.push(self.advance().expect("peeked above"));
                }
                lit.push_str(&exp);
            } else {
                self.idx = save_idx;
                self.pos = save_pos;
            }
        }
        let num: f64 = lit
            .parse()
            .map_err(|_| self.error(format!("Invalid number literal: {lit}")))?;
        self.tokens.push(Token {
            kind: TokenKind::Number,
            lit,
            num,
            line,
            pos,
        });
        Ok(())
    }
}
