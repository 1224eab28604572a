//! SQL tokenizer shared by the DDL parser and the query validator

use std::fmt;

/// A lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare word: keyword or unquoted identifier
    Word(String),
    /// Identifier quoted with `"`, backticks or `[]`
    Quoted(String),
    /// Single-quoted string literal
    Str(String),
    Number(String),
    /// Any other single character (punctuation, operators)
    Symbol(char),
}

impl Token {
    /// Case-insensitive keyword match on bare words
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    pub fn is_symbol(&self, c: char) -> bool {
        matches!(self, Token::Symbol(s) if *s == c)
    }

    /// Identifier text for bare or quoted words
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{}", w),
            Token::Quoted(q) => write!(f, "\"{}\"", q),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Number(n) => write!(f, "{}", n),
            Token::Symbol(c) => write!(f, "{}", c),
        }
    }
}

/// Lexing failure with the byte offset where it was detected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

/// Split SQL text into tokens, dropping whitespace and comments
pub fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                for (_, n) in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for (_, n) in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        closed = true;
                        break;
                    }
                    prev = n;
                }
                if !closed {
                    return Err(LexError {
                        offset: start,
                        message: "unterminated block comment".to_string(),
                    });
                }
            }
            '\'' => tokens.push(Token::Str(read_delimited(&mut chars, start, '\'')?)),
            '"' => tokens.push(Token::Quoted(read_delimited(&mut chars, start, '"')?)),
            '`' => tokens.push(Token::Quoted(read_delimited(&mut chars, start, '`')?)),
            '[' => tokens.push(Token::Quoted(read_delimited(&mut chars, start, ']')?)),
            c if c.is_ascii_digit() => {
                let mut num = String::from(c);
                while let Some(&(_, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '.' {
                        num.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&(_, n)) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' || n == '$' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => tokens.push(Token::Symbol(other)),
        }
    }

    Ok(tokens)
}

/// Read up to the closing delimiter; a doubled delimiter is an escaped one
fn read_delimited(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    start: usize,
    close: char,
) -> Result<String, LexError> {
    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        if c == close {
            if matches!(chars.peek(), Some((_, n)) if *n == close) {
                chars.next();
                out.push(close);
                continue;
            }
            return Ok(out);
        }
        out.push(c);
    }
    Err(LexError {
        offset: start,
        message: format!("unterminated literal opened with {:?}", close),
    })
}
