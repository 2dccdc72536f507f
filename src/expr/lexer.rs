//! Tokenizer for mapping expressions.

use std::iter::Peekable;
use std::str::Chars;

/// Piece of a string literal: plain text or an interpolated `\(...)` source.
#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Text(String),
    Interp { source: String, position: usize },
}

/// A token in the expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare identifier (field name after `.`, function name)
    Ident(String),
    /// `$name`
    Variable(String),
    /// String literal, possibly interpolated
    Str(Vec<StrPart>),
    Number(f64),

    // Keywords
    And,
    Or,
    If,
    Then,
    Elif,
    Else,
    End,
    True,
    False,
    Null,

    // Operators
    Dot,
    Pipe,
    Comma,
    Colon,
    Semicolon,
    Question,
    /// `//`
    Alternative,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,

    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier '{s}'"),
            Token::Variable(s) => write!(f, "variable '${s}'"),
            Token::Str(_) => write!(f, "string"),
            Token::Number(n) => write!(f, "number {n}"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::If => write!(f, "if"),
            Token::Then => write!(f, "then"),
            Token::Elif => write!(f, "elif"),
            Token::Else => write!(f, "else"),
            Token::End => write!(f, "end"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Null => write!(f, "null"),
            Token::Dot => write!(f, "."),
            Token::Pipe => write!(f, "|"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::Question => write!(f, "?"),
            Token::Alternative => write!(f, "//"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Equal => write!(f, "=="),
            Token::NotEqual => write!(f, "!="),
            Token::LessThan => write!(f, "<"),
            Token::LessThanOrEqual => write!(f, "<="),
            Token::GreaterThan => write!(f, ">"),
            Token::GreaterThanOrEqual => write!(f, ">="),
            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
            Token::LeftBracket => write!(f, "["),
            Token::RightBracket => write!(f, "]"),
            Token::LeftBrace => write!(f, "{{"),
            Token::RightBrace => write!(f, "}}"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// Token plus its character offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Error during lexical analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct LexerError {
    pub message: String,
    pub position: usize,
}

impl std::fmt::Display for LexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at position {}", self.message, self.position)
    }
}

impl std::error::Error for LexerError {}

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.chars().peekable(),
            position: 0,
        }
    }

    /// Tokenize the whole input. The last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let position = self.position;
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(Spanned { token, position });
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexerError> {
        let Some(&ch) = self.input.peek() else {
            return Ok(Token::Eof);
        };

        let single = |token: Token, lexer: &mut Self| -> Result<Token, LexerError> {
            lexer.advance();
            Ok(token)
        };

        match ch {
            '.' => single(Token::Dot, self),
            '|' => single(Token::Pipe, self),
            ',' => single(Token::Comma, self),
            ':' => single(Token::Colon, self),
            ';' => single(Token::Semicolon, self),
            '?' => single(Token::Question, self),
            '+' => single(Token::Plus, self),
            '-' => single(Token::Minus, self),
            '*' => single(Token::Star, self),
            '%' => single(Token::Percent, self),
            '(' => single(Token::LeftParen, self),
            ')' => single(Token::RightParen, self),
            '[' => single(Token::LeftBracket, self),
            ']' => single(Token::RightBracket, self),
            '{' => single(Token::LeftBrace, self),
            '}' => single(Token::RightBrace, self),
            '/' => {
                self.advance();
                if self.input.peek() == Some(&'/') {
                    self.advance();
                    Ok(Token::Alternative)
                } else {
                    Ok(Token::Slash)
                }
            }
            '=' => {
                self.advance();
                if self.input.peek() == Some(&'=') {
                    self.advance();
                    Ok(Token::Equal)
                } else {
                    Err(self.error("Assignment is not supported, use '=='"))
                }
            }
            '!' => {
                self.advance();
                if self.input.peek() == Some(&'=') {
                    self.advance();
                    Ok(Token::NotEqual)
                } else {
                    Err(self.error("Expected '=' after '!'"))
                }
            }
            '<' => {
                self.advance();
                if self.input.peek() == Some(&'=') {
                    self.advance();
                    Ok(Token::LessThanOrEqual)
                } else {
                    Ok(Token::LessThan)
                }
            }
            '>' => {
                self.advance();
                if self.input.peek() == Some(&'=') {
                    self.advance();
                    Ok(Token::GreaterThanOrEqual)
                } else {
                    Ok(Token::GreaterThan)
                }
            }
            '"' => self.read_string(),
            '$' => {
                self.advance();
                let name = self.read_word();
                if name.is_empty() {
                    Err(self.error("Expected variable name after '$'"))
                } else {
                    Ok(Token::Variable(name))
                }
            }
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphabetic() || c == '_' => Ok(keyword_or_ident(self.read_word())),
            other => Err(self.error(&format!("Unexpected character '{other}'"))),
        }
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.input.next();
        if ch.is_some() {
            self.position += 1;
        }
        ch
    }

    fn error(&self, message: &str) -> LexerError {
        LexerError {
            message: message.to_string(),
            position: self.position,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&ch) = self.input.peek() {
            if ch == '#' {
                // comment to end of line
                while let Some(c) = self.advance() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(&ch) = self.input.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                word.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        word
    }

    fn read_number(&mut self) -> Result<Token, LexerError> {
        let start = self.position;
        let mut text = String::new();
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(&ch) = self.input.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
            } else if ch == '.' && !seen_dot && !seen_exp {
                seen_dot = true;
                text.push(ch);
            } else if (ch == 'e' || ch == 'E') && !seen_exp {
                seen_exp = true;
                text.push(ch);
                self.advance();
                if let Some(&sign) = self.input.peek() {
                    if sign == '+' || sign == '-' {
                        text.push(sign);
                        self.advance();
                    }
                }
                continue;
            } else {
                break;
            }
            self.advance();
        }
        text.parse::<f64>().map(Token::Number).map_err(|_| LexerError {
            message: format!("Invalid number '{text}'"),
            position: start,
        })
    }

    fn read_string(&mut self) -> Result<Token, LexerError> {
        let start = self.position;
        self.advance(); // opening quote

        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            let Some(ch) = self.advance() else {
                return Err(LexerError {
                    message: "Unterminated string".to_string(),
                    position: start,
                });
            };
            match ch {
                '"' => break,
                '\\' => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some('/') => text.push('/'),
                    Some('(') => {
                        if !text.is_empty() {
                            parts.push(StrPart::Text(std::mem::take(&mut text)));
                        }
                        let position = self.position;
                        let source = self.read_interpolation()?;
                        parts.push(StrPart::Interp { source, position });
                    }
                    Some(other) => {
                        return Err(self.error(&format!("Invalid escape '\\{other}'")));
                    }
                    None => {
                        return Err(LexerError {
                            message: "Unterminated string".to_string(),
                            position: start,
                        })
                    }
                },
                other => text.push(other),
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(StrPart::Text(text));
        }
        Ok(Token::Str(parts))
    }

    /// Collect the source of `\( ... )` up to the matching close paren.
    fn read_interpolation(&mut self) -> Result<String, LexerError> {
        let start = self.position;
        let mut source = String::new();
        let mut depth = 1usize;
        let mut in_string = false;
        loop {
            let Some(ch) = self.advance() else {
                return Err(LexerError {
                    message: "Unterminated interpolation".to_string(),
                    position: start,
                });
            };
            if in_string {
                source.push(ch);
                if ch == '\\' {
                    if let Some(next) = self.advance() {
                        source.push(next);
                    }
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(source);
                    }
                }
                _ => {}
            }
            source.push(ch);
        }
    }
}

fn keyword_or_ident(word: String) -> Token {
    match word.as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "if" => Token::If,
        "then" => Token::Then,
        "elif" => Token::Elif,
        "else" => Token::Else,
        "end" => Token::End,
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        _ => Token::Ident(word),
    }
}
