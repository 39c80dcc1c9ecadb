//! Store-side condition expressions.
//!
//! These are what the storage adapter receives as a filter expression on
//! query/scan, or as a condition expression on put/delete. They are evaluated
//! against stored rows (or an empty object for a missing row), and are
//! serializable for transport.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FilterError;
use crate::filter::{Condition, Operator, compare_values, lookup, values_equal};
use crate::types::Item;

/// Maximum nesting depth for filter/condition expressions.
const MAX_EXPRESSION_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A condition over a stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Compare {
        path: String,
        cmp: Comparison,
        value: Value,
    },
    Between {
        path: String,
        low: Value,
        high: Value,
    },
    BeginsWith {
        path: String,
        prefix: String,
    },
    Contains {
        path: String,
        value: Value,
    },
    In {
        path: String,
        values: Vec<Value>,
    },
    Exists(String),
    NotExists(String),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Evaluate against a row. Enforces a maximum nesting depth of 16.
    pub fn eval(&self, row: &Item) -> Result<bool, FilterError> {
        self.eval_inner(row, 0)
    }

    fn eval_inner(&self, row: &Item, depth: usize) -> Result<bool, FilterError> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(FilterError::InvalidExpression(
                "expression depth exceeds maximum of 16".to_string(),
            ));
        }
        let get = |path: &str| lookup(row, path).unwrap_or(&Value::Null);

        Ok(match self {
            Expr::Compare { path, cmp, value } => {
                let actual = get(path);
                match cmp {
                    Comparison::Eq => values_equal(actual, value),
                    Comparison::Ne => !values_equal(actual, value),
                    Comparison::Lt => compare_values(actual, value) == Some(Ordering::Less),
                    Comparison::Le => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    Comparison::Gt => compare_values(actual, value) == Some(Ordering::Greater),
                    Comparison::Ge => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                }
            }
            Expr::Between { path, low, high } => {
                let actual = get(path);
                matches!(
                    compare_values(actual, low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare_values(actual, high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            Expr::BeginsWith { path, prefix } => get(path)
                .as_str()
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Expr::Contains { path, value } => match (get(path), value) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                _ => false,
            },
            Expr::In { path, values } => {
                let actual = get(path);
                values.iter().any(|v| values_equal(actual, v))
            }
            Expr::Exists(path) => !get(path).is_null(),
            Expr::NotExists(path) => get(path).is_null(),
            Expr::And(exprs) => {
                for expr in exprs {
                    if !expr.eval_inner(row, depth + 1)? {
                        return Ok(false);
                    }
                }
                true
            }
            Expr::Or(exprs) => {
                for expr in exprs {
                    if expr.eval_inner(row, depth + 1)? {
                        return Ok(true);
                    }
                }
                false
            }
            Expr::Not(expr) => !expr.eval_inner(row, depth + 1)?,
        })
    }

    /// Translate a filter condition. `SUBCLASS_OF` needs the model registry
    /// and has no store-side form.
    pub fn from_condition(c: &Condition) -> Option<Expr> {
        let path = c.property.clone();
        let value = c.value.clone();
        Some(match c.op {
            Operator::Eq => Expr::compare(path, Comparison::Eq, value),
            Operator::Neq => Expr::compare(path, Comparison::Ne, value),
            Operator::Lt => Expr::compare(path, Comparison::Lt, value),
            Operator::Lte => Expr::compare(path, Comparison::Le, value),
            Operator::Gt => Expr::compare(path, Comparison::Gt, value),
            Operator::Gte => Expr::compare(path, Comparison::Ge, value),
            Operator::Between => match value {
                Value::Array(mut bounds) if bounds.len() == 2 => {
                    let high = bounds.pop()?;
                    let low = bounds.pop()?;
                    Expr::Between { path, low, high }
                }
                _ => return None,
            },
            Operator::StartsWith => Expr::BeginsWith {
                path,
                prefix: value.as_str()?.to_string(),
            },
            Operator::Contains => Expr::Contains { path, value },
            Operator::NotContains => Expr::not(Expr::Contains { path, value }),
            Operator::In => Expr::In {
                path,
                values: value.as_array()?.clone(),
            },
            Operator::NotIn => Expr::not(Expr::In {
                path,
                values: value.as_array()?.clone(),
            }),
            Operator::Null => match value.as_bool()? {
                true => Expr::NotExists(path),
                false => Expr::Exists(path),
            },
            Operator::SubclassOf => return None,
        })
    }

    pub fn compare(path: impl Into<String>, cmp: Comparison, value: impl Into<Value>) -> Self {
        Expr::Compare {
            path: path.into(),
            cmp,
            value: value.into(),
        }
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Comparison::Eq, value)
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Comparison::Lt, value)
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Expr::Exists(path.into())
    }

    pub fn not_exists(path: impl Into<String>) -> Self {
        Expr::NotExists(path.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// Conjunction of `exprs`; `None` when empty, the expression itself when
    /// there is only one.
    pub fn all(mut exprs: Vec<Expr>) -> Option<Self> {
        match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(Expr::And(exprs)),
        }
    }

    pub fn any(mut exprs: Vec<Expr>) -> Option<Self> {
        match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(Expr::Or(exprs)),
        }
    }
}
