//! Parser for the canonical expression string form.
//!
//! Grammar (precedence low to high):
//!   or     := and (OR and)*
//!   and    := not (AND not)*
//!   not    := NOT not | cmp
//!   cmp    := add (( = | != | < | <= | > | >= ) add)?
//!   add    := mul (( + | - ) mul)*
//!   mul    := unary (( * | / ) unary)*
//!   unary  := - unary | postfix
//!   postfix:= primary (. identifier)*
//!   primary:= literal | identifier | ( or )

use serde_json::Value;

use super::{BinaryOp, Expr};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected character `{0}` at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("malformed literal: {0}")]
    BadLiteral(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(&'static str),
    LParen,
    RParen,
    Dot,
    And,
    Or,
    Not,
}

/// Parse a canonical expression string.
pub fn parse(text: &str) -> Result<Expr, ParseError> {
    let tokens = lex(text)?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_or()?;
    match p.peek() {
        None => Ok(expr),
        Some(t) => Err(ParseError::UnexpectedToken(format!("{:?}", t))),
    }
}

fn lex(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("!="));
                i += 2;
            }
            '<' | '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(if c == '<' { "<=" } else { ">=" }));
                    i += 2;
                } else {
                    tokens.push(Token::Op(if c == '<' { "<" } else { ">" }));
                    i += 1;
                }
            }
            '+' | '*' | '/' | '-' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '*' => "*",
                    '/' => "/",
                    _ => "-",
                }));
                i += 1;
            }
            '"' => {
                // JSON string literal, including escapes
                let start = i;
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\\' {
                        i += 2;
                        continue;
                    }
                    if chars[i] == '"' {
                        break;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ParseError::UnexpectedEnd);
                }
                i += 1;
                let raw: String = chars[start..i].iter().collect();
                let v: Value =
                    serde_json::from_str(&raw).map_err(|e| ParseError::BadLiteral(e.to_string()))?;
                tokens.push(Token::Literal(v));
            }
            '[' | '{' => {
                // JSON array/object literal, scanned to its balancing
                // bracket with string contents opaque
                let start = i;
                let mut depth = 0usize;
                let mut in_str = false;
                while i < chars.len() {
                    let c = chars[i];
                    if in_str {
                        if c == '\\' {
                            i += 2;
                            continue;
                        }
                        if c == '"' {
                            in_str = false;
                        }
                        i += 1;
                        continue;
                    }
                    match c {
                        '"' => in_str = true,
                        '[' | '{' => depth += 1,
                        ']' | '}' => {
                            depth -= 1;
                            if depth == 0 {
                                i += 1;
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                if depth != 0 || in_str {
                    return Err(ParseError::UnexpectedEnd);
                }
                let raw: String = chars[start..i].iter().collect();
                let v: Value =
                    serde_json::from_str(&raw).map_err(|e| ParseError::BadLiteral(e.to_string()))?;
                tokens.push(Token::Literal(v));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '+' || chars[i] == '-')
                            && matches!(chars.get(i - 1), Some('e') | Some('E'))))
                {
                    i += 1;
                }
                // a trailing dot belongs to field navigation, not the number
                if chars.get(i - 1) == Some(&'.') {
                    i -= 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let v: Value =
                    serde_json::from_str(&raw).map_err(|e| ParseError::BadLiteral(e.to_string()))?;
                tokens.push(Token::Literal(v));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "null" => Token::Literal(Value::Null),
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ParseError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Op("=")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Neq,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Lte,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Gte,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_add()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_add(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Op("-")) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut e = self.parse_primary()?;
        while self.eat(&Token::Dot) {
            match self.next() {
                Some(Token::Ident(name)) => e = Expr::Field(Box::new(e), name),
                Some(t) => return Err(ParseError::UnexpectedToken(format!("{:?}", t))),
                None => return Err(ParseError::UnexpectedEnd),
            }
        }
        Ok(e)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Ident(name)) => Ok(Expr::Identifier(name)),
            Some(Token::LParen) => {
                let e = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(ParseError::UnexpectedEnd);
                }
                Ok(e)
            }
            Some(t) => Err(ParseError::UnexpectedToken(format!("{:?}", t))),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(e: &Expr) {
        let text = e.to_string();
        let parsed = parse(&text).unwrap();
        assert_eq!(&parsed, e, "canonical form `{}` did not round-trip", text);
    }

    #[test]
    fn test_roundtrip_paths_and_literals() {
        roundtrip(&Expr::path("src.id"));
        roundtrip(&Expr::literal(42));
        roundtrip(&Expr::literal("k1"));
        roundtrip(&Expr::Literal(json!(null)));
        roundtrip(&Expr::Neg(Box::new(Expr::literal(3))));
    }

    #[test]
    fn test_roundtrip_composite_literals() {
        roundtrip(&Expr::Literal(json!(["k1", "k2"])));
        roundtrip(&Expr::Literal(json!({"a": 1, "b": ["x", "]"]})));
        assert!(parse("[1, 2").is_err());
    }

    #[test]
    fn test_roundtrip_compound() {
        let e = Expr::path("t.b")
            .eq(Expr::literal(1))
            .and(Expr::path("t.c").eq(Expr::literal(2)));
        roundtrip(&e);

        let e = Expr::Or(
            Box::new(Expr::Not(Box::new(Expr::ident("a")))),
            Box::new(Expr::Binary(
                BinaryOp::Lt,
                Box::new(Expr::Binary(
                    BinaryOp::Add,
                    Box::new(Expr::path("t.x")),
                    Box::new(Expr::literal(1)),
                )),
                Box::new(Expr::literal(10)),
            )),
        );
        roundtrip(&e);
    }

    #[test]
    fn test_parse_parenthesized() {
        let e = parse("(a OR b) AND c").unwrap();
        assert_eq!(
            e,
            Expr::And(
                Box::new(Expr::Or(
                    Box::new(Expr::ident("a")),
                    Box::new(Expr::ident("b"))
                )),
                Box::new(Expr::ident("c")),
            )
        );
    }

    #[test]
    fn test_parse_string_with_escape() {
        let e = parse(r#"t.s = "a\"b""#).unwrap();
        assert_eq!(
            e,
            Expr::path("t.s").eq(Expr::literal(json!("a\"b")))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("a ??? b").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("").is_err());
    }
}
