//! Sandboxed expressions for data transforms and filters.
//!
//! The grammar supports:
//! - Literals: `42`, `2.5`, `'text'`, `"text"`, `true`, `false`, `null`
//! - Field paths: `status`, `address.city`
//! - Arithmetic: `+ - * / %` and unary `-`; `||` concatenates
//! - Comparison: `== != < <= > >=`, `is null`, `is not null`
//! - Logic: `and`, `or`, `not`, with parentheses for grouping
//!
//! There are no function calls and no assignment; an expression can only
//! read the item it is evaluated against.

pub mod eval;
pub mod lexer;
pub mod parser;
pub mod transform;

pub use transform::{CompiledTransform, ItemTransform};

use crate::backend::Item;
use parser::Expr;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    /// The expression text is malformed.
    #[error("syntax error at offset {position}: {message}")]
    Syntax {
        /// What went wrong.
        message: String,
        /// Byte offset in the source.
        position: usize,
    },

    /// An operator was applied to operands of the wrong type.
    #[error("type mismatch: '{operator}' cannot be applied to {operands}")]
    TypeMismatch {
        /// Operator spelling.
        operator: String,
        /// Operand type names.
        operands: String,
    },

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Arithmetic produced NaN or infinity.
    #[error("arithmetic result is not a finite number")]
    NonFinite,

    /// An error in the expression assigned to a field.
    #[error("field '{field}': {source}")]
    InField {
        /// Target field.
        field: String,
        /// Underlying error.
        #[source]
        source: Box<ExpressionError>,
    },
}

impl ExpressionError {
    pub(crate) fn syntax(message: impl Into<String>, position: usize) -> Self {
        ExpressionError::Syntax {
            message: message.into(),
            position,
        }
    }

    pub(crate) fn in_field(field: impl Into<String>, source: ExpressionError) -> Self {
        ExpressionError::InField {
            field: field.into(),
            source: Box::new(source),
        }
    }
}

/// A parsed expression, ready to evaluate against items.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse an expression.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            source: source.to_string(),
            root: parser::parse(source)?,
        })
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an item.
    pub fn evaluate(&self, item: &Item) -> Result<Value, ExpressionError> {
        eval::evaluate(&self.root, item)
    }

    /// Evaluate as a predicate: only a boolean `true` matches.
    pub fn matches(&self, item: &Item) -> Result<bool, ExpressionError> {
        Ok(self.evaluate(item)? == Value::Bool(true))
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}
