//! Predicate expression trees.
//!
//! Expressions reference bean properties by logical path (for example
//! `customer.name` or `details.qty`). The engine translates paths into
//! columns and extracts bind values; this module only describes structure.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Comparison operator for [`Expr::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl CompareOp {
    /// SQL operator text.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A predicate expression over bean properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// `path <op> value`. Comparing with [`Value::Null`] renders `is null` / `is not null`.
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    /// `path like pattern`, optionally case insensitive.
    Like {
        path: String,
        pattern: String,
        case_insensitive: bool,
    },
    /// `path in (values..)` or `path not in (values..)`.
    In {
        path: String,
        values: Vec<Value>,
        negated: bool,
    },
    /// `path between low and high`.
    Between { path: String, low: Value, high: Value },
    /// `path is null` or `path is not null`.
    IsNull { path: String, negated: bool },
    /// Raw SQL fragment with positional `?` parameters. Property paths in the
    /// fragment are translated to columns.
    Raw { sql: String, params: Vec<Value> },
    /// Conjunction.
    And(Vec<Expr>),
    /// Disjunction.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
}

impl Expr {
    /// `path = value`.
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    /// `path <> value`.
    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ne, value)
    }

    /// `path < value`.
    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Lt, value)
    }

    /// `path <= value`.
    pub fn le(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Le, value)
    }

    /// `path > value`.
    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Gt, value)
    }

    /// `path >= value`.
    pub fn ge(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ge, value)
    }

    fn compare(path: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Expr::Compare {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    /// `path like pattern`.
    pub fn like(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Expr::Like {
            path: path.into(),
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    /// Case insensitive like.
    pub fn ilike(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Expr::Like {
            path: path.into(),
            pattern: pattern.into(),
            case_insensitive: true,
        }
    }

    /// `path in (values..)`.
    pub fn in_values(path: impl Into<String>, values: Vec<Value>) -> Self {
        Expr::In {
            path: path.into(),
            values,
            negated: false,
        }
    }

    /// `path not in (values..)`.
    pub fn not_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Expr::In {
            path: path.into(),
            values,
            negated: true,
        }
    }

    /// `path between low and high`.
    pub fn between(path: impl Into<String>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Expr::Between {
            path: path.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    /// `path is null`.
    pub fn is_null(path: impl Into<String>) -> Self {
        Expr::IsNull {
            path: path.into(),
            negated: false,
        }
    }

    /// `path is not null`.
    pub fn is_not_null(path: impl Into<String>) -> Self {
        Expr::IsNull {
            path: path.into(),
            negated: true,
        }
    }

    /// Raw SQL with positional parameters.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Expr::Raw {
            sql: sql.into(),
            params,
        }
    }

    /// Conjunction of expressions.
    pub fn and(exprs: Vec<Expr>) -> Self {
        Expr::And(exprs)
    }

    /// Disjunction of expressions.
    pub fn or(exprs: Vec<Expr>) -> Self {
        Expr::Or(exprs)
    }

    /// Negation of an expression.
    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// Property paths referenced directly by this expression.
    ///
    /// Raw fragments are not included; their paths are discovered when the
    /// fragment is parsed against the bean mapping.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Compare { path, .. }
            | Expr::Like { path, .. }
            | Expr::In { path, .. }
            | Expr::Between { path, .. }
            | Expr::IsNull { path, .. } => out.push(path),
            Expr::Raw { .. } => {}
            Expr::And(exprs) | Expr::Or(exprs) => {
                for e in exprs {
                    e.collect_paths(out);
                }
            }
            Expr::Not(inner) => inner.collect_paths(out),
        }
    }

    /// Raw SQL fragments embedded anywhere in this expression.
    pub fn raw_fragments(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_raw(&mut out);
        out
    }

    fn collect_raw<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Raw { sql, .. } => out.push(sql),
            Expr::And(exprs) | Expr::Or(exprs) => {
                for e in exprs {
                    e.collect_raw(out);
                }
            }
            Expr::Not(inner) => inner.collect_raw(out),
            _ => {}
        }
    }

    /// Structural description of this expression without bind values.
    ///
    /// Two expressions with the same shape generate the same SQL text, so the
    /// shape is what participates in query plan keys. In-list cardinality and
    /// null comparisons change the SQL and are part of the shape.
    pub fn shape(&self) -> String {
        let mut out = String::new();
        self.write_shape(&mut out);
        out
    }

    fn write_shape(&self, out: &mut String) {
        match self {
            Expr::Compare { path, op, value } => {
                let null = if value.is_null() { "null" } else { "?" };
                let _ = write!(out, "{path}{}{null}", op.sql());
            }
            Expr::Like {
                path,
                case_insensitive,
                ..
            } => {
                let kind = if *case_insensitive { "ilike" } else { "like" };
                let _ = write!(out, "{path} {kind} ?");
            }
            Expr::In {
                path,
                values,
                negated,
            } => {
                let kind = if *negated { "not in" } else { "in" };
                let _ = write!(out, "{path} {kind} [{}]", values.len());
            }
            Expr::Between { path, .. } => {
                let _ = write!(out, "{path} between");
            }
            Expr::IsNull { path, negated } => {
                let kind = if *negated { "notnull" } else { "null" };
                let _ = write!(out, "{path} {kind}");
            }
            Expr::Raw { sql, .. } => {
                let _ = write!(out, "raw[{sql}]");
            }
            Expr::And(exprs) | Expr::Or(exprs) => {
                out.push_str(if matches!(self, Expr::And(_)) { "and(" } else { "or(" });
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    e.write_shape(out);
                }
                out.push(')');
            }
            Expr::Not(inner) => {
                out.push_str("not(");
                inner.write_shape(out);
                out.push(')');
            }
        }
    }
}
