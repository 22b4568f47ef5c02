//! Predicate trees
//!
//! Predicates combine range tests over path expressions with boolean
//! connectives. A range test exposes inclusive value-space bounds for the
//! push-down planner; the bounds are *tight* when membership in the range
//! is exactly equivalent to satisfying the test, which lets the planner
//! drop the residual filter.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::document::DocRef;
use crate::encoding::compare_values;
use crate::error::QueryResult;

use super::expression::PathExpression;

/// Range test applied to each value a path expression produces
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTest {
    Eq(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    /// Inclusive on both ends
    Between(Value, Value),
    OneOf(Vec<Value>),
}

impl ValueTest {
    /// Whether `value` satisfies the test
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueTest::Eq(v) => compare_values(value, v) == Ordering::Equal,
            ValueTest::Lt(v) => compare_values(value, v) == Ordering::Less,
            ValueTest::Le(v) => compare_values(value, v) != Ordering::Greater,
            ValueTest::Gt(v) => compare_values(value, v) == Ordering::Greater,
            ValueTest::Ge(v) => compare_values(value, v) != Ordering::Less,
            ValueTest::Between(low, high) => {
                compare_values(value, low) != Ordering::Less
                    && compare_values(value, high) != Ordering::Greater
            }
            ValueTest::OneOf(options) => options
                .iter()
                .any(|v| compare_values(value, v) == Ordering::Equal),
        }
    }

    /// Inclusive value-space bounds over-approximating the test
    pub fn range(&self) -> (Option<Value>, Option<Value>) {
        match self {
            ValueTest::Eq(v) => (Some(v.clone()), Some(v.clone())),
            ValueTest::Lt(v) | ValueTest::Le(v) => (None, Some(v.clone())),
            ValueTest::Gt(v) | ValueTest::Ge(v) => (Some(v.clone()), None),
            ValueTest::Between(low, high) => (Some(low.clone()), Some(high.clone())),
            ValueTest::OneOf(options) => {
                let min = options
                    .iter()
                    .min_by(|a, b| compare_values(a, b))
                    .cloned();
                let max = options
                    .iter()
                    .max_by(|a, b| compare_values(a, b))
                    .cloned();
                (min, max)
            }
        }
    }

    /// True when every value inside `range()` also satisfies the test
    pub fn range_is_tight(&self) -> bool {
        matches!(
            self,
            ValueTest::Eq(_) | ValueTest::Le(_) | ValueTest::Ge(_) | ValueTest::Between(_, _)
        )
    }
}

impl fmt::Display for ValueTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueTest::Eq(v) => write!(f, "== {v}"),
            ValueTest::Lt(v) => write!(f, "< {v}"),
            ValueTest::Le(v) => write!(f, "<= {v}"),
            ValueTest::Gt(v) => write!(f, "> {v}"),
            ValueTest::Ge(v) => write!(f, ">= {v}"),
            ValueTest::Between(low, high) => write!(f, "in [{low}, {high}]"),
            ValueTest::OneOf(options) => {
                write!(f, "one of {}", Value::Array(options.clone()))
            }
        }
    }
}

/// Predicate over a document
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every document
    All,
    /// Matches no document
    None,
    /// Some value of the expression satisfies the test
    Any {
        expr: PathExpression,
        test: ValueTest,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Convenience constructor for a field test
    pub fn field(path: impl Into<String>, test: ValueTest) -> Predicate {
        Predicate::Any {
            expr: PathExpression::new(path),
            test,
        }
    }

    /// Whether `doc` satisfies this predicate
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Predicate::All => true,
            Predicate::None => false,
            Predicate::Any { expr, test } => expr.values(doc).iter().any(|v| test.matches(v)),
            Predicate::And(terms) => terms.iter().all(|t| t.matches(doc)),
            Predicate::Or(terms) => terms.iter().any(|t| t.matches(doc)),
            Predicate::Not(inner) => !inner.matches(doc),
        }
    }

    /// Evaluate against a document reference
    pub async fn evaluate(&self, doc: &DocRef) -> QueryResult<bool> {
        Ok(self.matches(&doc.value().await?))
    }

    /// Flatten nested connectives and fold away constant terms
    pub fn simplify(self) -> Predicate {
        match self {
            Predicate::And(terms) => {
                let mut flat = Vec::new();
                for term in terms {
                    match term.simplify() {
                        Predicate::All => {}
                        Predicate::None => return Predicate::None,
                        Predicate::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => Predicate::All,
                    1 => flat.remove(0),
                    _ => Predicate::And(flat),
                }
            }
            Predicate::Or(terms) => {
                let mut flat = Vec::new();
                for term in terms {
                    match term.simplify() {
                        Predicate::None => {}
                        Predicate::All => return Predicate::All,
                        Predicate::Or(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => Predicate::None,
                    1 => flat.remove(0),
                    _ => Predicate::Or(flat),
                }
            }
            Predicate::Not(inner) => match inner.simplify() {
                Predicate::All => Predicate::None,
                Predicate::None => Predicate::All,
                Predicate::Not(doubled) => *doubled,
                other => Predicate::Not(Box::new(other)),
            },
            leaf => leaf,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "all"),
            Predicate::None => write!(f, "none"),
            Predicate::Any { expr, test } => write!(f, "any({} {})", expr.path(), test),
            Predicate::And(terms) => {
                write!(f, "and(")?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            Predicate::Or(terms) => {
                write!(f, "or(")?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            Predicate::Not(inner) => write!(f, "not({inner})"),
        }
    }
}
