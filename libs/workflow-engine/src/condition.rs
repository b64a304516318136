//! Condition evaluation for step gating
//!
//! A step's optional `condition` is evaluated against the instance
//! context before execution. The evaluator is pluggable behind
//! [`ConditionEvaluator`]; the default is a whitelisted comparison DSL,
//! deterministic and side-effect-free. Supported expressions:
//!
//! - `context.field op literal` with ops `>=, <=, ==, !=, >, <`
//!   (the `context.` prefix is optional)
//! - `branch == "tag"` against the branch tag captured by a branching step
//! - a bare field path, true when the value is truthy
//!
//! Evaluation errors are reported to the caller; the engine treats them
//! as false and logs.

use serde_json::{Map, Value};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur during condition evaluation
#[derive(Debug, Error)]
pub enum ConditionError {
    /// Failed to parse expression
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Missing required context field
    #[error("Missing context: {0}")]
    MissingContext(String),

    /// Type mismatch in comparison
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },
}

// =============================================================================
// Evaluator Trait
// =============================================================================

/// Pluggable condition evaluator
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate an expression against the instance context
    fn evaluate(&self, expr: &str, context: &Map<String, Value>) -> Result<bool, ConditionError>;
}

// =============================================================================
// Expression Evaluator
// =============================================================================

/// Default whitelisted-DSL evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(&self, expr: &str, context: &Map<String, Value>) -> Result<bool, ConditionError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ConditionError::ParseError("Empty expression".to_string()));
        }

        // Comparison: "field op value"
        if let Some(result) = try_parse_comparison(expr, context)? {
            return Ok(result);
        }

        // Bare field path: truthiness check
        let value = resolve_path(expr, context)
            .ok_or_else(|| ConditionError::MissingContext(expr.to_string()))?;
        Ok(is_truthy(value))
    }
}

/// Try to parse the expression as a comparison (e.g., `score >= 0.8`)
fn try_parse_comparison(
    expr: &str,
    context: &Map<String, Value>,
) -> Result<Option<bool>, ConditionError> {
    // Two-character operators first so ">=" is not split as ">"
    let operators = [">=", "<=", "==", "!=", ">", "<"];

    for op in operators {
        if let Some(idx) = expr.find(op) {
            let field = expr[..idx].trim();
            let value = expr[idx + op.len()..].trim();

            let field_value = resolve_path(field, context)
                .map(json_to_field_value)
                .ok_or_else(|| ConditionError::MissingContext(field.to_string()))?;
            let compare_value = parse_literal(value);

            return Ok(Some(compare_values(&field_value, op, &compare_value)?));
        }
    }

    Ok(None)
}

/// Resolve a dot-separated field path against the context
///
/// A leading `context.` segment is accepted and stripped.
fn resolve_path<'a>(path: &str, context: &'a Map<String, Value>) -> Option<&'a Value> {
    let path = path.strip_prefix("context.").unwrap_or(path);

    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Internal value type for comparisons
#[derive(Debug, Clone)]
enum FieldValue {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
}

/// Convert a JSON value to a FieldValue
fn json_to_field_value(value: &Value) -> FieldValue {
    match value {
        Value::Number(n) => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Null => FieldValue::Null,
        _ => FieldValue::String(value.to_string()),
    }
}

/// Parse a literal from the right-hand side of a comparison
fn parse_literal(value: &str) -> FieldValue {
    if let Ok(n) = value.parse::<f64>() {
        return FieldValue::Number(n);
    }

    match value {
        "true" => return FieldValue::Bool(true),
        "false" => return FieldValue::Bool(false),
        "null" => return FieldValue::Null,
        _ => {}
    }

    if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
        || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
    {
        return FieldValue::String(value[1..value.len() - 1].to_string());
    }

    FieldValue::String(value.to_string())
}

/// Truthiness for bare field checks
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Compare two field values with an operator
fn compare_values(
    left: &FieldValue,
    op: &str,
    right: &FieldValue,
) -> Result<bool, ConditionError> {
    match (left, right) {
        (FieldValue::Number(l), FieldValue::Number(r)) => match op {
            "==" => Ok((l - r).abs() < f64::EPSILON),
            "!=" => Ok((l - r).abs() >= f64::EPSILON),
            ">" => Ok(l > r),
            "<" => Ok(l < r),
            ">=" => Ok(l >= r),
            "<=" => Ok(l <= r),
            _ => Err(ConditionError::ParseError(format!(
                "Unknown operator: {op}"
            ))),
        },

        (FieldValue::String(l), FieldValue::String(r)) => match op {
            "==" => Ok(l == r),
            "!=" => Ok(l != r),
            _ => Err(ConditionError::TypeMismatch {
                expected: "number for ordered comparison".to_string(),
                got: "string".to_string(),
            }),
        },

        (FieldValue::Bool(l), FieldValue::Bool(r)) => match op {
            "==" => Ok(l == r),
            "!=" => Ok(l != r),
            _ => Err(ConditionError::TypeMismatch {
                expected: "number for ordered comparison".to_string(),
                got: "boolean".to_string(),
            }),
        },

        (FieldValue::Null, FieldValue::Null) => match op {
            "==" => Ok(true),
            "!=" => Ok(false),
            _ => Err(ConditionError::TypeMismatch {
                expected: "comparable values".to_string(),
                got: "null".to_string(),
            }),
        },

        _ => Err(ConditionError::TypeMismatch {
            expected: "matching types".to_string(),
            got: "mismatched types".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_numeric_comparison() {
        let ctx = context(json!({"score": 0.85}));
        let eval = ExpressionEvaluator;

        assert!(eval.evaluate("score >= 0.8", &ctx).unwrap());
        assert!(eval.evaluate("context.score >= 0.8", &ctx).unwrap());
        assert!(!eval.evaluate("score > 0.9", &ctx).unwrap());
        assert!(eval.evaluate("score != 1", &ctx).unwrap());
    }

    #[test]
    fn test_string_comparison() {
        let ctx = context(json!({"branch": "seo"}));
        let eval = ExpressionEvaluator;

        assert!(eval.evaluate("branch == \"seo\"", &ctx).unwrap());
        assert!(eval.evaluate("branch == 'seo'", &ctx).unwrap());
        assert!(eval.evaluate("branch != \"quality\"", &ctx).unwrap());
        assert!(!eval.evaluate("branch == \"quality\"", &ctx).unwrap());
    }

    #[test]
    fn test_string_ordering_is_type_error() {
        let ctx = context(json!({"branch": "seo"}));
        let result = ExpressionEvaluator.evaluate("branch > \"a\"", &ctx);
        assert!(matches!(result, Err(ConditionError::TypeMismatch { .. })));
    }

    #[test]
    fn test_nested_path() {
        let ctx = context(json!({"analysis": {"seo": {"score": 42}}}));
        let eval = ExpressionEvaluator;

        assert!(eval.evaluate("analysis.seo.score == 42", &ctx).unwrap());
        assert!(eval
            .evaluate("context.analysis.seo.score >= 40", &ctx)
            .unwrap());
    }

    #[test]
    fn test_bare_truthiness() {
        let ctx = context(json!({
            "enabled": true,
            "disabled": false,
            "empty": "",
            "keywords": ["rust"],
            "zero": 0
        }));
        let eval = ExpressionEvaluator;

        assert!(eval.evaluate("enabled", &ctx).unwrap());
        assert!(!eval.evaluate("disabled", &ctx).unwrap());
        assert!(!eval.evaluate("empty", &ctx).unwrap());
        assert!(eval.evaluate("keywords", &ctx).unwrap());
        assert!(!eval.evaluate("zero", &ctx).unwrap());
    }

    #[test]
    fn test_missing_field_is_error() {
        let ctx = context(json!({}));
        let result = ExpressionEvaluator.evaluate("score >= 0.8", &ctx);
        assert!(matches!(result, Err(ConditionError::MissingContext(_))));

        let result = ExpressionEvaluator.evaluate("missing", &ctx);
        assert!(matches!(result, Err(ConditionError::MissingContext(_))));
    }

    #[test]
    fn test_bool_literal_comparison() {
        let ctx = context(json!({"approved": true}));
        let eval = ExpressionEvaluator;

        assert!(eval.evaluate("approved == true", &ctx).unwrap());
        assert!(!eval.evaluate("approved == false", &ctx).unwrap());
    }

    #[test]
    fn test_empty_expression_is_error() {
        let ctx = context(json!({}));
        let result = ExpressionEvaluator.evaluate("  ", &ctx);
        assert!(matches!(result, Err(ConditionError::ParseError(_))));
    }
}
