//! Expression evaluation against a single item.
//!
//! Values are JSON values. Null propagates through arithmetic and
//! concatenation; logic treats null as false.

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::ExpressionError;
use crate::backend::Item;
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Evaluate `expr` with field references resolved against `item`.
pub fn evaluate(expr: &Expr, item: &Item) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(path) => Ok(lookup(item, path)),
        Expr::IsNull { operand, negated } => {
            let is_null = evaluate(operand, item)?.is_null();
            Ok(Value::Bool(is_null != *negated))
        }
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, item)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy("not", &value)?)),
                UnaryOp::Neg => negate(value),
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                if !truthy("and", &evaluate(left, item)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy("and", &evaluate(right, item)?)?))
            }
            BinaryOp::Or => {
                if truthy("or", &evaluate(left, item)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy("or", &evaluate(right, item)?)?))
            }
            _ => {
                let l = evaluate(left, item)?;
                let r = evaluate(right, item)?;
                apply_binary(*op, l, r)
            }
        },
    }
}

/// Resolve a dotted path. Missing fields and non-object intermediates yield null.
fn lookup(item: &Item, path: &[String]) -> Value {
    let Some((first, rest)) = path.split_first() else {
        return Value::Null;
    };
    let mut current = match item.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        match current.get(segment) {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(operator: &str, left: &Value, right: Option<&Value>) -> ExpressionError {
    let operands = match right {
        Some(right) => format!("{} and {}", type_name(left), type_name(right)),
        None => type_name(left).to_string(),
    };
    ExpressionError::TypeMismatch {
        operator: operator.to_string(),
        operands,
    }
}

fn truthy(operator: &str, value: &Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(mismatch(operator, other, None)),
    }
}

fn negate(value: Value) -> Result<Value, ExpressionError> {
    match &value {
        Value::Null => Ok(Value::Null),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(i64::checked_neg) {
                Ok(Value::from(i))
            } else {
                float(-n.as_f64().unwrap_or_default())
            }
        }
        _ => Err(mismatch("-", &value, None)),
    }
}

fn float(x: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(x)
        .map(Value::Number)
        .ok_or(ExpressionError::NonFinite)
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Bool(false));
            }
            let ordering = compare(&left, &right)
                .ok_or_else(|| mismatch(op.symbol(), &left, Some(&right)))?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Concat => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            match (as_text(&left), as_text(&right)) {
                (Some(l), Some(r)) => Ok(Value::String(l + &r)),
                _ => Err(mismatch("||", &left, Some(&right))),
            }
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            match (&left, &right) {
                (Value::Number(l), Value::Number(r)) => arithmetic(op, l, r),
                _ => Err(mismatch(op.symbol(), &left, Some(&right))),
            }
        }
        BinaryOp::And => Ok(Value::Bool(
            truthy("and", &left)? && truthy("and", &right)?,
        )),
        BinaryOp::Or => Ok(Value::Bool(
            truthy("or", &left)? || truthy("or", &right)?,
        )),
    }
}

fn arithmetic(op: BinaryOp, l: &Number, r: &Number) -> Result<Value, ExpressionError> {
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0 {
            return Err(ExpressionError::DivisionByZero);
        }
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Rem => a.checked_rem(b),
            // Integer division stays integral only when exact.
            _ => a.checked_rem(b).filter(|rem| *rem == 0).and_then(|_| a.checked_div(b)),
        };
        if let Some(value) = exact {
            return Ok(Value::from(value));
        }
    }

    let a = l.as_f64().unwrap_or_default();
    let b = r.as_f64().unwrap_or_default();
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    float(result)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => l.as_f64() == r.as_f64(),
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
