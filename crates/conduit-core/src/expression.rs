// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime expressions.
//!
//! [`PathExpressionEvaluator`] understands a jq-flavoured subset:
//!
//! - `${ . }`, `${ .order.items[0].sku }`: paths into the input
//! - `${ $context.count }`, `${ $error.status }`: paths into a named argument
//! - `${ .status == "paid" }`, `${ $input.n != 0 }`: comparison with another
//!   path or a JSON literal
//!
//! Strings that are not wrapped in `${ }` are literals. Objects and arrays are
//! evaluated recursively. A missing path yields `null`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ProblemDetails;

/// Named arguments available to expressions (`$name`), without the `$`.
pub type Arguments = BTreeMap<String, Value>;

/// Evaluates runtime expressions embedded in definitions.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate an expression (or a structure containing expressions).
    fn evaluate(&self, expression: &Value, input: &Value, arguments: &Arguments) -> Result<Value, ProblemDetails>;

    /// Evaluate a guard expression to a boolean.
    fn evaluate_condition(&self, expression: &str, input: &Value, arguments: &Arguments) -> Result<bool, ProblemDetails> {
        self.evaluate(&Value::String(expression.to_string()), input, arguments)
            .map(|v| is_truthy(&v))
    }
}

/// jq truthiness: everything but `null` and `false` is true.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// The default expression evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathExpressionEvaluator;

impl PathExpressionEvaluator {
    /// Create the evaluator.
    pub fn new() -> Self {
        Self
    }

    fn evaluate_expression(&self, expression: &str, input: &Value, arguments: &Arguments) -> Result<Value, ProblemDetails> {
        if let Some((lhs, negated, rhs)) = split_comparison(expression) {
            let lhs = self.evaluate_operand(lhs, input, arguments)?;
            let rhs = self.evaluate_operand(rhs, input, arguments)?;
            return Ok(Value::Bool(values_equal(&lhs, &rhs) != negated));
        }
        self.evaluate_operand(expression, input, arguments)
    }

    fn evaluate_operand(&self, operand: &str, input: &Value, arguments: &Arguments) -> Result<Value, ProblemDetails> {
        let operand = operand.trim();
        if operand.starts_with('.') {
            return resolve_path(input, operand);
        }
        if let Some(rest) = operand.strip_prefix('$') {
            let end = rest
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(rest.len());
            let (name, path) = rest.split_at(end);
            let root = arguments.get(name).ok_or_else(|| {
                ProblemDetails::expression(format!("unknown argument '${}' in '{}'", name, operand))
            })?;
            return resolve_path(root, path);
        }
        serde_json::from_str(operand)
            .map_err(|_| ProblemDetails::expression(format!("unsupported expression '{}'", operand)))
    }
}

impl ExpressionEvaluator for PathExpressionEvaluator {
    fn evaluate(&self, expression: &Value, input: &Value, arguments: &Arguments) -> Result<Value, ProblemDetails> {
        match expression {
            Value::String(s) => match strip_expression(s) {
                Some(inner) => self.evaluate_expression(inner, input, arguments),
                None => Ok(expression.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.evaluate(item, input, arguments))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.evaluate(v, input, arguments)?)))
                .collect::<Result<serde_json::Map<_, _>, ProblemDetails>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn evaluate_condition(&self, expression: &str, input: &Value, arguments: &Arguments) -> Result<bool, ProblemDetails> {
        // Guards may be written with or without the `${ }` wrapper
        let inner = strip_expression(expression).unwrap_or(expression);
        self.evaluate_expression(inner, input, arguments)
            .map(|v| is_truthy(&v))
    }
}

/// The body of a `${ ... }` expression.
fn strip_expression(s: &str) -> Option<&str> {
    s.trim()
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
}

/// Split on the first `==` or `!=` outside string literals.
fn split_comparison(expression: &str) -> Option<(&str, bool, &str)> {
    let bytes = expression.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    for i in 0..bytes.len().saturating_sub(1) {
        let c = bytes[i];
        if in_string {
            match c {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match (c, bytes[i + 1]) {
            (b'"', _) => in_string = true,
            (b'=', b'=') => return Some((&expression[..i], false, &expression[i + 2..])),
            (b'!', b'=') => return Some((&expression[..i], true, &expression[i + 2..])),
            _ => {}
        }
    }
    None
}

/// Numbers compare by value so that `1 == 1.0`.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment<'_>>, ProblemDetails> {
    let invalid = || ProblemDetails::expression(format!("invalid path '{}'", path));
    let mut segments = Vec::new();
    let mut rest = path.trim();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(after.len());
            if end > 0 {
                segments.push(Segment::Key(&after[..end]));
            }
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']').ok_or_else(invalid)?;
            let inner = after[..end].trim();
            match inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                Some(key) => segments.push(Segment::Key(key)),
                None => segments.push(Segment::Index(inner.parse().map_err(|_| invalid())?)),
            }
            rest = &after[end + 1..];
        } else {
            return Err(invalid());
        }
    }
    Ok(segments)
}

fn resolve_path(root: &Value, path: &str) -> Result<Value, ProblemDetails> {
    let mut current = root;
    for segment in parse_path(path)? {
        let next = match segment {
            Segment::Key(key) => current.get(key),
            Segment::Index(index) => current.get(index),
        };
        match next {
            Some(value) => current = value,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}
