//! Recursive descent parser for mapping expressions.
//!
//! Precedence, lowest first: `|`, `,`, `//`, `or`, `and`, comparisons,
//! `+ -`, `* / %`, unary minus, postfix (`.name`, `[...]`, `?`).

use super::ast::{Ast, BinaryOp, FormatPart, ObjectKey};
use super::functions;
use super::lexer::{Lexer, LexerError, Spanned, StrPart, Token};
use serde_json::Value;

/// Error during parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at position {}", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

impl From<LexerError> for ParseError {
    fn from(err: LexerError) -> Self {
        ParseError {
            message: err.message,
            position: err.position,
        }
    }
}

pub struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
}

impl Parser {
    /// Parse an expression string into an AST.
    pub fn parse(input: &str) -> Result<Ast, ParseError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        if parser.check(&Token::Eof) {
            return Err(parser.error("Empty expression"));
        }

        let ast = parser.parse_pipe()?;

        if !parser.check(&Token::Eof) {
            return Err(parser.error(&format!(
                "Unexpected token after expression: {}",
                parser.current_token()
            )));
        }

        Ok(ast)
    }

    fn parse_pipe(&mut self) -> Result<Ast, ParseError> {
        let left = self.parse_comma()?;
        if self.match_token(&Token::Pipe) {
            let right = self.parse_pipe()?;
            return Ok(Ast::Pipe(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_comma(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.parse_alternative()?;
        while self.match_token(&Token::Comma) {
            let right = self.parse_alternative()?;
            left = Ast::Comma(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_alternative(&mut self) -> Result<Ast, ParseError> {
        let left = self.parse_or()?;
        if self.match_token(&Token::Alternative) {
            let right = self.parse_alternative()?;
            return Ok(Ast::Alternative(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.parse_and()?;
        while self.match_token(&Token::Or) {
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.parse_comparison()?;
        while self.match_token(&Token::And) {
            let right = self.parse_comparison()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Ast, ParseError> {
        let left = self.parse_additive()?;
        let op = match self.current_token() {
            Token::Equal => BinaryOp::Equal,
            Token::NotEqual => BinaryOp::NotEqual,
            Token::LessThan => BinaryOp::LessThan,
            Token::LessThanOrEqual => BinaryOp::LessThanOrEqual,
            Token::GreaterThan => BinaryOp::GreaterThan,
            Token::GreaterThanOrEqual => BinaryOp::GreaterThanOrEqual,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current_token() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Subtract,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current_token() {
                Token::Star => BinaryOp::Multiply,
                Token::Slash => BinaryOp::Divide,
                Token::Percent => BinaryOp::Modulo,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Ast, ParseError> {
        if self.match_token(&Token::Minus) {
            let inner = self.parse_unary()?;
            return Ok(Ast::Negate(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Ast, ParseError> {
        let mut ast = self.parse_term()?;
        loop {
            match self.current_token() {
                Token::Dot => {
                    let next = self.peek_token();
                    if matches!(next, Token::LeftBracket) {
                        self.advance();
                        continue;
                    }
                    if !matches!(next, Token::Ident(_) | Token::Str(_)) {
                        return Ok(ast);
                    }
                    self.advance();
                    let name = self.field_name()?;
                    ast = Ast::Field {
                        target: Box::new(ast),
                        name,
                    };
                }
                Token::LeftBracket => {
                    self.advance();
                    ast = self.parse_bracket_suffix(ast)?;
                }
                Token::Question => {
                    self.advance();
                    ast = Ast::Try(Box::new(ast));
                }
                _ => return Ok(ast),
            }
        }
    }

    /// After `[`: `]`, `index]`, `from:to]`, `:to]` or `from:]`.
    fn parse_bracket_suffix(&mut self, target: Ast) -> Result<Ast, ParseError> {
        let target = Box::new(target);
        if self.match_token(&Token::RightBracket) {
            return Ok(Ast::Iterate(target));
        }

        if self.match_token(&Token::Colon) {
            let to = self.parse_pipe()?;
            self.expect_token(&Token::RightBracket)?;
            return Ok(Ast::Slice {
                target,
                from: None,
                to: Some(Box::new(to)),
            });
        }

        let index = self.parse_pipe()?;
        if self.match_token(&Token::Colon) {
            let to = if self.check(&Token::RightBracket) {
                None
            } else {
                Some(Box::new(self.parse_pipe()?))
            };
            self.expect_token(&Token::RightBracket)?;
            return Ok(Ast::Slice {
                target,
                from: Some(Box::new(index)),
                to,
            });
        }

        self.expect_token(&Token::RightBracket)?;
        Ok(Ast::Index {
            target,
            index: Box::new(index),
        })
    }

    fn parse_term(&mut self) -> Result<Ast, ParseError> {
        let position = self.current_position();
        match self.current_token().clone() {
            Token::Dot => {
                self.advance();
                if matches!(self.current_token(), Token::Ident(_) | Token::Str(_)) {
                    let name = self.field_name()?;
                    return Ok(Ast::Field {
                        target: Box::new(Ast::Identity),
                        name,
                    });
                }
                Ok(Ast::Identity)
            }
            Token::Number(n) => {
                self.advance();
                Ok(Ast::Literal(super::eval::number(n)))
            }
            Token::Str(parts) => {
                self.advance();
                format_string(parts)
            }
            Token::True => {
                self.advance();
                Ok(Ast::Literal(Value::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Ast::Literal(Value::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Ast::Literal(Value::Null))
            }
            Token::Variable(name) => {
                self.advance();
                check_variable(&name, position)?;
                Ok(Ast::Variable(name))
            }
            Token::LeftParen => {
                self.advance();
                let inner = self.parse_pipe()?;
                self.expect_token(&Token::RightParen)?;
                Ok(inner)
            }
            Token::LeftBracket => {
                self.advance();
                if self.match_token(&Token::RightBracket) {
                    return Ok(Ast::Array(None));
                }
                let inner = self.parse_pipe()?;
                self.expect_token(&Token::RightBracket)?;
                Ok(Ast::Array(Some(Box::new(inner))))
            }
            Token::LeftBrace => {
                self.advance();
                self.parse_object()
            }
            Token::If => {
                self.advance();
                self.parse_if()
            }
            Token::Ident(name) => {
                self.advance();
                self.parse_call(name, position)
            }
            other => Err(self.error(&format!("Unexpected {other}"))),
        }
    }

    fn parse_call(&mut self, name: String, position: usize) -> Result<Ast, ParseError> {
        let mut args = Vec::new();
        if self.match_token(&Token::LeftParen) {
            loop {
                args.push(self.parse_pipe()?);
                if !self.match_token(&Token::Semicolon) {
                    break;
                }
            }
            self.expect_token(&Token::RightParen)?;
        }

        if !functions::is_builtin(&name, args.len()) {
            return Err(ParseError {
                message: format!("Unknown function '{}/{}'", name, args.len()),
                position,
            });
        }
        Ok(Ast::Call { name, args })
    }

    fn parse_if(&mut self) -> Result<Ast, ParseError> {
        let mut branches = Vec::new();
        loop {
            let condition = self.parse_pipe()?;
            self.expect_token(&Token::Then)?;
            let then = self.parse_pipe()?;
            branches.push((condition, then));
            if !self.match_token(&Token::Elif) {
                break;
            }
        }

        let otherwise = if self.match_token(&Token::Else) {
            Some(Box::new(self.parse_pipe()?))
        } else {
            None
        };
        self.expect_token(&Token::End)?;

        Ok(Ast::If {
            branches,
            otherwise,
        })
    }

    fn parse_object(&mut self) -> Result<Ast, ParseError> {
        let mut entries = Vec::new();
        if self.match_token(&Token::RightBrace) {
            return Ok(Ast::Object(entries));
        }

        loop {
            let position = self.current_position();
            let key = match self.current_token().clone() {
                Token::Ident(name) => {
                    self.advance();
                    ObjectKey::Name(name)
                }
                Token::Str(parts) => {
                    self.advance();
                    match format_string(parts)? {
                        Ast::Literal(Value::String(s)) => ObjectKey::Name(s),
                        computed => ObjectKey::Computed(computed),
                    }
                }
                Token::Variable(name) => {
                    self.advance();
                    check_variable(&name, position)?;
                    ObjectKey::Variable(name)
                }
                Token::LeftParen => {
                    self.advance();
                    let key = self.parse_pipe()?;
                    self.expect_token(&Token::RightParen)?;
                    ObjectKey::Computed(key)
                }
                // keywords are valid keys
                ref keyword @ (Token::If
                | Token::Then
                | Token::Elif
                | Token::Else
                | Token::End
                | Token::And
                | Token::Or
                | Token::True
                | Token::False
                | Token::Null) => {
                    self.advance();
                    ObjectKey::Name(keyword.to_string())
                }
                other => return Err(self.error(&format!("Expected object key, found {other}"))),
            };

            let value = if self.match_token(&Token::Colon) {
                Some(self.parse_alternative()?)
            } else {
                if matches!(key, ObjectKey::Computed(_)) {
                    return Err(self.error("Computed object key requires a value"));
                }
                None
            };
            entries.push((key, value));

            if self.match_token(&Token::RightBrace) {
                return Ok(Ast::Object(entries));
            }
            self.expect_token(&Token::Comma)?;
        }
    }

    fn field_name(&mut self) -> Result<String, ParseError> {
        match self.current_token().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            Token::Str(parts) => {
                self.advance();
                match format_string(parts)? {
                    Ast::Literal(Value::String(s)) => Ok(s),
                    _ => Err(self.error("Field names cannot be interpolated")),
                }
            }
            other => Err(self.error(&format!("Expected field name, found {other}"))),
        }
    }

    // Helper methods

    fn current_token(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_token(&self) -> &Token {
        self.tokens
            .get(self.position + 1)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn current_position(&self) -> usize {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|s| s.position)
            .unwrap_or(0)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn check(&self, token: &Token) -> bool {
        self.current_token() == token
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_token(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.match_token(token) {
            Ok(())
        } else {
            Err(self.error(&format!(
                "Expected {}, found {}",
                token,
                self.current_token()
            )))
        }
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            position: self.current_position(),
        }
    }
}

fn binary(op: BinaryOp, left: Ast, right: Ast) -> Ast {
    Ast::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn check_variable(name: &str, position: usize) -> Result<(), ParseError> {
    if name == "ENV" {
        Ok(())
    } else {
        Err(ParseError {
            message: format!("Undefined variable '${name}'"),
            position,
        })
    }
}

fn format_string(parts: Vec<StrPart>) -> Result<Ast, ParseError> {
    if let [StrPart::Text(text)] = parts.as_slice() {
        return Ok(Ast::Literal(Value::String(text.clone())));
    }

    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            StrPart::Text(text) => out.push(FormatPart::Text(text)),
            StrPart::Interp { source, position } => {
                let inner = Parser::parse(&source).map_err(|e| ParseError {
                    message: e.message,
                    position: position + e.position,
                })?;
                out.push(FormatPart::Expr(inner));
            }
        }
    }
    Ok(Ast::Format(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(target: Ast, name: &str) -> Ast {
        Ast::Field {
            target: Box::new(target),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_parse_identity() {
        assert_eq!(Parser::parse(".").unwrap(), Ast::Identity);
    }

    #[test]
    fn test_parse_field_chain() {
        assert_eq!(
            Parser::parse(".owner.login").unwrap(),
            field(field(Ast::Identity, "owner"), "login")
        );
        assert_eq!(
            Parser::parse(r#"."full name""#).unwrap(),
            field(Ast::Identity, "full name")
        );
    }

    #[test]
    fn test_parse_index_and_iterate() {
        match Parser::parse(".labels[0]").unwrap() {
            Ast::Index { target, index } => {
                assert_eq!(*target, field(Ast::Identity, "labels"));
                assert_eq!(*index, Ast::Literal(serde_json::json!(0)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            Parser::parse(".labels[].name").unwrap(),
            Ast::Field { target, .. } if matches!(*target, Ast::Iterate(_))
        ));
        assert!(matches!(
            Parser::parse(".[1:3]").unwrap(),
            Ast::Slice { from: Some(_), to: Some(_), .. }
        ));
    }

    #[test]
    fn test_pipe_binds_loosest() {
        match Parser::parse(".a, .b | length").unwrap() {
            Ast::Pipe(left, right) => {
                assert!(matches!(*left, Ast::Comma(_, _)));
                assert!(matches!(*right, Ast::Call { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        match Parser::parse("1 + 2 * 3").unwrap() {
            Ast::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => assert!(matches!(
                *right,
                Ast::Binary {
                    op: BinaryOp::Multiply,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_alternative_lower_than_or() {
        assert!(matches!(
            Parser::parse(".a or .b // false").unwrap(),
            Ast::Alternative(left, _) if matches!(*left, Ast::Or(_, _))
        ));
    }

    #[test]
    fn test_parse_object_forms() {
        match Parser::parse(r#"{name, "id": .id, (.k): 1, if: 2}"#).unwrap() {
            Ast::Object(entries) => {
                assert_eq!(entries.len(), 4);
                assert_eq!(entries[0], (ObjectKey::Name("name".into()), None));
                assert!(matches!(entries[2].0, ObjectKey::Computed(_)));
                assert_eq!(entries[3].0, ObjectKey::Name("if".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_if_elif_else() {
        match Parser::parse(r#"if .a then 1 elif .b then 2 else 3 end"#).unwrap() {
            Ast::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = Parser::parse(".name | frobnicate").unwrap_err();
        assert!(err.message.contains("frobnicate/0"));
        assert_eq!(err.position, 8);
    }

    #[test]
    fn test_wrong_arity_rejected() {
        assert!(Parser::parse("map").is_err());
        assert!(Parser::parse("length(1)").is_err());
    }

    #[test]
    fn test_undefined_variable_rejected() {
        assert!(Parser::parse("$foo").is_err());
        assert!(Parser::parse("$ENV.HOME").is_ok());
    }

    #[test]
    fn test_interpolation_error_position() {
        let err = Parser::parse(r#""x\(.a | )""#).unwrap_err();
        assert!(err.position >= 4);
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(Parser::parse(".a )").is_err());
        assert!(Parser::parse("").is_err());
    }
}
