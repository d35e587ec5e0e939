//! Expression trees
//!
//! A compact expression model: field paths, literals, comparison, logic,
//! and arithmetic. Every expression has a canonical string form; the
//! parser in this module reads that form back. Plans serialize
//! expressions as canonical strings.

pub mod parser;

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::value::{self, AnnotatedValue};

pub use parser::{parse, ParseError};

/// Evaluation failure, attributed to the operator evaluating the row.
#[derive(Debug, thiserror::Error)]
#[error("evaluation of `{expr}` failed: {reason}")]
pub struct EvalError {
    pub expr: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Neq
                | BinaryOp::Lt
                | BinaryOp::Lte
                | BinaryOp::Gt
                | BinaryOp::Gte
        )
    }
}

/// An expression over row values.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A bare name, resolved against the row object.
    Identifier(String),
    /// `base.name` field navigation.
    Field(Box<Expr>, String),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
}

impl Expr {
    pub fn literal(v: impl Into<Value>) -> Self {
        Expr::Literal(v.into())
    }

    pub fn ident(name: &str) -> Self {
        Expr::Identifier(name.to_string())
    }

    /// `alias.field` shorthand.
    pub fn field(alias: &str, name: &str) -> Self {
        Expr::Field(Box::new(Expr::ident(alias)), name.to_string())
    }

    /// Dotted path shorthand: `path("a.b.c")`.
    pub fn path(dotted: &str) -> Self {
        let mut parts = dotted.split('.');
        let mut e = Expr::ident(parts.next().unwrap_or_default());
        for p in parts {
            e = Expr::Field(Box::new(e), p.to_string());
        }
        e
    }

    pub fn eq(self, other: Expr) -> Self {
        Expr::Binary(BinaryOp::Eq, Box::new(self), Box::new(other))
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(other))
    }

    /// Evaluate against a row. Unknown identifiers and missing fields
    /// evaluate to null.
    pub fn evaluate(&self, row: &AnnotatedValue) -> Result<Value, EvalError> {
        self.eval_value(row.value())
    }

    fn eval_value(&self, row: &Value) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Identifier(name) => Ok(row
                .as_object()
                .and_then(|m| m.get(name))
                .cloned()
                .unwrap_or(Value::Null)),
            Expr::Field(base, name) => {
                let base = base.eval_value(row)?;
                Ok(base
                    .as_object()
                    .and_then(|m| m.get(name))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            Expr::Binary(op, l, r) => {
                let (lv, rv) = (l.eval_value(row)?, r.eval_value(row)?);
                if op.is_comparison() {
                    let ord = value::compare(&lv, &rv);
                    let b = match op {
                        BinaryOp::Eq => ord == Ordering::Equal,
                        BinaryOp::Neq => ord != Ordering::Equal,
                        BinaryOp::Lt => ord == Ordering::Less,
                        BinaryOp::Lte => ord != Ordering::Greater,
                        BinaryOp::Gt => ord == Ordering::Greater,
                        BinaryOp::Gte => ord != Ordering::Less,
                        _ => unreachable!(),
                    };
                    Ok(Value::Bool(b))
                } else {
                    let (Some(x), Some(y)) = (lv.as_f64(), rv.as_f64()) else {
                        // arithmetic over non-numbers yields null
                        return Ok(Value::Null);
                    };
                    let out = match op {
                        BinaryOp::Add => x + y,
                        BinaryOp::Sub => x - y,
                        BinaryOp::Mul => x * y,
                        BinaryOp::Div => {
                            if y == 0.0 {
                                return Err(EvalError {
                                    expr: self.to_string(),
                                    reason: "division by zero".to_string(),
                                });
                            }
                            x / y
                        }
                        _ => unreachable!(),
                    };
                    Ok(number(out))
                }
            }
            Expr::And(l, r) => {
                if !value::is_truthy(&l.eval_value(row)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(value::is_truthy(&r.eval_value(row)?)))
            }
            Expr::Or(l, r) => {
                if value::is_truthy(&l.eval_value(row)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(value::is_truthy(&r.eval_value(row)?)))
            }
            Expr::Not(e) => Ok(Value::Bool(!value::is_truthy(&e.eval_value(row)?))),
            Expr::Neg(e) => match e.eval_value(row)?.as_f64() {
                Some(x) => Ok(number(-x)),
                None => Ok(Value::Null),
            },
        }
    }

    /// Whether evaluation reads the binding named `alias`.
    pub fn depends_on(&self, alias: &str) -> bool {
        match self {
            Expr::Literal(_) => false,
            Expr::Identifier(name) => name == alias,
            Expr::Field(base, _) => base.depends_on(alias),
            Expr::Binary(_, l, r) | Expr::And(l, r) | Expr::Or(l, r) => {
                l.depends_on(alias) || r.depends_on(alias)
            }
            Expr::Not(e) | Expr::Neg(e) => e.depends_on(alias),
        }
    }

    /// Static integer value, when the expression is a numeric literal.
    /// Used for limit/offset pushdown.
    pub fn as_static_i64(&self) -> Option<i64> {
        match self {
            Expr::Literal(Value::Number(n)) => n.as_i64(),
            Expr::Neg(inner) => inner.as_static_i64().map(|v| -v),
            _ => None,
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Or(..) => 1,
            Expr::And(..) => 2,
            Expr::Not(..) => 3,
            Expr::Binary(op, ..) if op.is_comparison() => 4,
            Expr::Binary(BinaryOp::Add | BinaryOp::Sub, ..) => 5,
            Expr::Binary(..) => 6,
            Expr::Neg(..) => 7,
            _ => 8,
        }
    }

    fn fmt_child(&self, child: &Expr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if child.precedence() < self.precedence() {
            write!(f, "({})", child)
        } else {
            write!(f, "{}", child)
        }
    }
}

fn number(x: f64) -> Value {
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Identifier(name) => write!(f, "{}", name),
            Expr::Field(base, name) => {
                self.fmt_child(base, f)?;
                write!(f, ".{}", name)
            }
            Expr::Binary(op, l, r) => {
                self.fmt_child(l, f)?;
                write!(f, " {} ", op.symbol())?;
                self.fmt_child(r, f)
            }
            Expr::And(l, r) => {
                self.fmt_child(l, f)?;
                write!(f, " AND ")?;
                self.fmt_child(r, f)
            }
            Expr::Or(l, r) => {
                self.fmt_child(l, f)?;
                write!(f, " OR ")?;
                self.fmt_child(r, f)
            }
            Expr::Not(e) => {
                write!(f, "NOT ")?;
                self.fmt_child(e, f)
            }
            Expr::Neg(e) => {
                write!(f, "-")?;
                self.fmt_child(e, f)
            }
        }
    }
}

/// Serde adapters serializing expressions as canonical strings.
pub mod expr_serde {
    use super::Expr;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(expr: &Expr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&expr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Expr, D::Error> {
        let text = String::deserialize(d)?;
        super::parse(&text).map_err(de::Error::custom)
    }
}

/// As `expr_serde`, for optional expressions.
pub mod opt_expr_serde {
    use super::Expr;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(expr: &Option<Expr>, s: S) -> Result<S::Ok, S::Error> {
        match expr {
            Some(e) => s.serialize_some(&e.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Expr>, D::Error> {
        let text = Option::<String>::deserialize(d)?;
        match text {
            Some(t) => super::parse(&t).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

/// As `expr_serde`, for expression lists.
pub mod expr_vec_serde {
    use super::Expr;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(exprs: &[Expr], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(exprs.iter().map(|e| e.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Expr>, D::Error> {
        let texts = Vec::<String>::deserialize(d)?;
        texts
            .iter()
            .map(|t| super::parse(t).map_err(de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eval_field_path() {
        let row = AnnotatedValue::bind("t", json!({"x": {"y": 7}}));
        let e = Expr::path("t.x.y");
        assert_eq!(e.evaluate(&row).unwrap(), json!(7));
    }

    #[test]
    fn test_missing_field_is_null() {
        let row = AnnotatedValue::bind("t", json!({}));
        assert_eq!(Expr::path("t.nope").evaluate(&row).unwrap(), Value::Null);
    }

    #[test]
    fn test_comparison_and_logic() {
        let row = AnnotatedValue::bind("t", json!({"a": 3, "b": "x"}));
        let e = Expr::path("t.a")
            .eq(Expr::literal(3))
            .and(Expr::path("t.b").eq(Expr::literal("x")));
        assert_eq!(e.evaluate(&row).unwrap(), json!(true));
    }

    #[test]
    fn test_arithmetic_on_non_number_is_null() {
        let row = AnnotatedValue::bind("t", json!({"a": "s"}));
        let e = Expr::Binary(
            BinaryOp::Add,
            Box::new(Expr::path("t.a")),
            Box::new(Expr::literal(1)),
        );
        assert_eq!(e.evaluate(&row).unwrap(), Value::Null);
    }

    #[test]
    fn test_division_by_zero_errors() {
        let row = AnnotatedValue::new(json!({}));
        let e = Expr::Binary(
            BinaryOp::Div,
            Box::new(Expr::literal(1)),
            Box::new(Expr::literal(0)),
        );
        assert!(e.evaluate(&row).is_err());
    }

    #[test]
    fn test_canonical_form_parenthesizes_by_precedence() {
        let e = Expr::Or(
            Box::new(Expr::ident("a").and(Expr::ident("b"))),
            Box::new(Expr::ident("c")),
        );
        assert_eq!(e.to_string(), "a AND b OR c");

        let e = Expr::And(
            Box::new(Expr::Or(
                Box::new(Expr::ident("a")),
                Box::new(Expr::ident("b")),
            )),
            Box::new(Expr::ident("c")),
        );
        assert_eq!(e.to_string(), "(a OR b) AND c");
    }

    #[test]
    fn test_static_i64() {
        assert_eq!(Expr::literal(10).as_static_i64(), Some(10));
        assert_eq!(Expr::ident("x").as_static_i64(), None);
    }
}
