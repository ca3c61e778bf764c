//! Rule expression DSL.
//!
//! A rule is a boolean expression over request-derived fields, written as a
//! flat token sequence:
//!
//! ```text
//! path equals /admin/* and ip isnotin ["10.0.0.1","10.0.0.2"]
//! ```
//!
//! Connectives have no precedence or parentheses: the first `and`/`or` found
//! scanning left to right splits the expression, so `A and B or C` is
//! `A and (B or C)`. A terminal is exactly three tokens: field, operator,
//! literal. Values are parsed as JSON where possible (`3`, `true`,
//! `["a","b"]`), otherwise taken as bare strings.
//!
//! Matching fails closed: an absent field, an unrecognized operator, or a
//! type-inapplicable comparison all evaluate to `false`. A misconfigured
//! rule must never grant elevated trust.

use std::collections::HashMap;

use log::warn;
use serde_json::Value;

use crate::error::{Result, RiskError};

/// Per-request field name to value mapping.
pub type FieldMap = HashMap<String, Value>;

/// Comparison operator of a rule atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    StartsWith,
    EndsWith,
}

impl Op {
    /// Resolve an operator token, case-insensitive, with the synonym set the
    /// rule format accepts. Returns `None` for unrecognized tokens.
    pub fn parse(token: &str) -> Option<Op> {
        let token = token.trim().to_lowercase();
        match token.as_str() {
            "==" | "equals" | "equal" | "is" | "isthesameas" => Some(Op::Equals),
            "!=" | "doesnotequal" | "doesnotequals" | "notequals" | "notequal" | "notis" => {
                Some(Op::NotEquals)
            }
            "contains" | "contain" => Some(Op::Contains),
            "doesnotcontain" | "doesnotcontains" | "notcontain" | "notcontains" => {
                Some(Op::NotContains)
            }
            "isin" | "in" => Some(Op::In),
            "isnotin" | "notisin" | "notin" => Some(Op::NotIn),
            "greaterthan" | "largerthan" | ">" => Some(Op::GreaterThan),
            "lessthan" | "<" => Some(Op::LessThan),
            "startswith" | "beginswith" => Some(Op::StartsWith),
            "endswith" | "concludeswith" | "finisheswith" => Some(Op::EndsWith),
            _ => None,
        }
    }

    /// Evaluate `field_data <op> value`. Inapplicable type combinations
    /// evaluate to `false`.
    fn eval(&self, field_data: &Value, value: &Value) -> bool {
        match self {
            Op::Equals => value_equals(field_data, value),
            Op::NotEquals => !value_equals(field_data, value),
            Op::Contains => value_contains(field_data, value),
            Op::NotContains => is_container(field_data) && !value_contains(field_data, value),
            Op::In => value_contains(value, field_data),
            Op::NotIn => is_container(value) && !value_contains(value, field_data),
            Op::GreaterThan => compare_numbers(field_data, value, true),
            Op::LessThan => compare_numbers(field_data, value, false),
            Op::StartsWith => string_start_end(field_data, value, true),
            Op::EndsWith => string_start_end(field_data, value, false),
        }
    }
}

/// Parsed rule expression tree, built once at configuration load.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleExpr {
    /// Terminal comparison. `op` is `None` when the operator token was not
    /// recognized; such an atom always evaluates to `false`.
    Atom {
        field: String,
        op: Option<Op>,
        value: Value,
    },
    And(Box<RuleExpr>, Box<RuleExpr>),
    Or(Box<RuleExpr>, Box<RuleExpr>),
}

impl RuleExpr {
    /// Convenience constructor for a terminal atom.
    pub fn atom(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        RuleExpr::Atom {
            field: field.into(),
            op: Some(op),
            value: value.into(),
        }
    }

    /// Evaluate the expression against resolved field data with
    /// short-circuit boolean semantics.
    pub fn matches(&self, fields: &FieldMap) -> bool {
        match self {
            RuleExpr::And(left, right) => left.matches(fields) && right.matches(fields),
            RuleExpr::Or(left, right) => left.matches(fields) || right.matches(fields),
            RuleExpr::Atom { field, op, value } => {
                let Some(field_data) = fields.get(field) else {
                    return false;
                };
                if field_data.is_null() {
                    return false;
                }
                let Some(op) = op else {
                    return false;
                };
                op.eval(field_data, value)
            }
        }
    }

    /// Collect every field name the expression references.
    pub fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RuleExpr::And(left, right) | RuleExpr::Or(left, right) => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            RuleExpr::Atom { field, .. } => {
                if !out.contains(&field.as_str()) {
                    out.push(field);
                }
            }
        }
    }
}

/// Parse a rule expression from its textual token form.
pub fn parse_expr(text: &str) -> Result<RuleExpr> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Err(RiskError::InvalidRule("empty rule expression".to_string()));
    }
    build_expr(&tokens)
}

/// Split the first `and`/`or` connective and recurse; a terminal must be
/// exactly three tokens. This reproduces left-to-right evaluation without
/// operator precedence.
fn build_expr(tokens: &[String]) -> Result<RuleExpr> {
    for (i, token) in tokens.iter().enumerate() {
        let connective = token.to_lowercase();
        if connective == "and" || connective == "or" {
            if i == 0 || i + 1 == tokens.len() {
                return Err(RiskError::InvalidRule(format!(
                    "dangling '{}' connective",
                    connective
                )));
            }
            let left = Box::new(build_expr(&tokens[..i])?);
            let right = Box::new(build_expr(&tokens[i + 1..])?);
            return Ok(if connective == "and" {
                RuleExpr::And(left, right)
            } else {
                RuleExpr::Or(left, right)
            });
        }
    }

    if tokens.len() != 3 {
        return Err(RiskError::InvalidRule(format!(
            "expected 'field operator value', got {} token(s): {}",
            tokens.len(),
            tokens.join(" ")
        )));
    }

    let op = Op::parse(&tokens[1]);
    if op.is_none() {
        // Fail closed rather than hard: the atom stays in the tree and
        // always evaluates to false.
        warn!("unrecognized rule operator '{}', atom will never match", tokens[1]);
    }

    Ok(RuleExpr::Atom {
        field: tokens[0].clone(),
        op,
        value: parse_value(&tokens[2]),
    })
}

/// Whitespace tokenizer that keeps quoted strings and bracketed JSON
/// literals (`[...]`, `{...}`) as single tokens.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut depth = 0usize;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                current.push(ch);
            }
            '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Interpret a value token: JSON literal where it parses, bare string
/// otherwise.
fn parse_value(token: &str) -> Value {
    serde_json::from_str(token).unwrap_or_else(|_| Value::String(token.to_string()))
}

/// Equality with `*`-wildcard support when both sides are strings and the
/// pattern carries at least one asterisk. A single `*` splits the pattern
/// into required prefix and suffix; with multiple asterisks the span between
/// the first and last one must additionally appear as a substring.
pub fn matches_asterisk(obj: &str, pattern: &str) -> bool {
    let Some(first) = pattern.find('*') else {
        return obj == pattern;
    };
    let last = pattern.rfind('*').unwrap_or(first);
    let start = &pattern[..first];
    let end = &pattern[last + 1..];

    if first == last {
        return obj.starts_with(start) && obj.ends_with(end);
    }

    let middle = &pattern[first + 1..last];
    obj.starts_with(start) && obj.ends_with(end) && obj.contains(middle)
}

fn value_equals(field_data: &Value, value: &Value) -> bool {
    match (field_data, value) {
        (Value::String(data), Value::String(pattern)) => matches_asterisk(data, pattern),
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => a == b,
            }
        }
        (a, b) => a == b,
    }
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Array(_) | Value::Object(_))
}

/// Containment: substring for strings, membership for arrays, key presence
/// for objects.
fn value_contains(container: &Value, needle: &Value) -> bool {
    match container {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| value_equals(item, needle)),
        Value::Object(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        _ => false,
    }
}

/// Numeric comparison; digit strings are accepted on the field side, any
/// non-numeric operand evaluates to `false`.
fn compare_numbers(field_data: &Value, value: &Value, greater: bool) -> bool {
    let left = match field_data {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let right = match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    match (left, right) {
        (Some(left), Some(right)) => {
            if greater {
                left > right
            } else {
                left < right
            }
        }
        _ => false,
    }
}

/// starts-with/ends-with; integer field data is stringified first, anything
/// else non-string evaluates to `false`.
fn string_start_end(field_data: &Value, value: &Value, starts: bool) -> bool {
    let Value::String(value) = value else {
        return false;
    };
    let owned;
    let data = match field_data {
        Value::String(s) => s.as_str(),
        Value::Number(n) => {
            owned = n.to_string();
            owned.as_str()
        }
        _ => return false,
    };
    if starts {
        data.starts_with(value.as_str())
    } else {
        data.ends_with(value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parse_terminal_atom() {
        let expr = parse_expr("path equals /admin").unwrap();
        assert_eq!(
            expr,
            RuleExpr::Atom {
                field: "path".to_string(),
                op: Some(Op::Equals),
                value: json!("/admin"),
            }
        );
    }

    #[test]
    fn test_parse_connective_splits_at_first() {
        // The first connective splits: A and B or C == A and (B or C)
        let expr = parse_expr("a is 1 and b is 2 or c is 3").unwrap();
        match expr {
            RuleExpr::And(left, right) => {
                assert!(matches!(*left, RuleExpr::Atom { .. }));
                assert!(matches!(*right, RuleExpr::Or(_, _)));
            }
            other => panic!("expected And at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!(parse_expr("path equals").is_err());
        assert!(parse_expr("path equals a b").is_err());
        assert!(parse_expr("and").is_err());
        assert!(parse_expr("a is 1 and").is_err());
        assert!(parse_expr("").is_err());
    }

    #[test]
    fn test_unknown_operator_never_matches() {
        let expr = parse_expr("path resembles /admin").unwrap();
        let data = fields(&[("path", json!("/admin"))]);
        assert!(!expr.matches(&data));
    }

    #[test]
    fn test_missing_field_fails_closed() {
        let expr = parse_expr("nosuchfield equals x and path equals /").unwrap();
        let data = fields(&[("path", json!("/"))]);
        assert!(!expr.matches(&data));

        let expr = parse_expr("nosuchfield equals x or path equals /").unwrap();
        assert!(expr.matches(&data));
    }

    #[test]
    fn test_matches_asterisk() {
        assert!(matches_asterisk("abc123xyz", "abc*xyz"));
        assert!(matches_asterisk("abcxyz", "abc*xyz"));
        assert!(matches_asterisk("abc123xyz", "abc*123*xyz"));
        assert!(!matches_asterisk("abcxyz", "abc*123*xyz"));
        assert!(matches_asterisk("anything", "*"));
        assert!(matches_asterisk("exact", "exact"));
        assert!(!matches_asterisk("exact", "other"));
        assert!(matches_asterisk("/admin/users", "/admin/*"));
        assert!(!matches_asterisk("/public", "/admin/*"));
    }

    #[test]
    fn test_operator_synonyms() {
        assert_eq!(Op::parse("=="), Some(Op::Equals));
        assert_eq!(Op::parse("IS"), Some(Op::Equals));
        assert_eq!(Op::parse(" notequal "), Some(Op::NotEquals));
        assert_eq!(Op::parse("largerthan"), Some(Op::GreaterThan));
        assert_eq!(Op::parse("beginswith"), Some(Op::StartsWith));
        assert_eq!(Op::parse("concludeswith"), Some(Op::EndsWith));
        assert_eq!(Op::parse("bogus"), None);
    }

    #[test]
    fn test_contains_and_membership() {
        let data = fields(&[
            ("user_agent", json!("Mozilla/5.0 (X11; Linux)")),
            ("ip", json!("203.0.113.7")),
        ]);

        assert!(parse_expr("user_agent contains Linux").unwrap().matches(&data));
        assert!(!parse_expr("user_agent contains Windows").unwrap().matches(&data));
        assert!(parse_expr("user_agent notcontains Windows").unwrap().matches(&data));

        let expr = parse_expr(r#"ip isin ["203.0.113.7","203.0.113.8"]"#).unwrap();
        assert!(expr.matches(&data));
        let expr = parse_expr(r#"ip isnotin ["198.51.100.1"]"#).unwrap();
        assert!(expr.matches(&data));
    }

    #[test]
    fn test_numeric_comparison_fails_closed() {
        let data = fields(&[("hardness", json!(3)), ("path", json!("/"))]);
        assert!(parse_expr("hardness greaterthan 2").unwrap().matches(&data));
        assert!(parse_expr("hardness lessthan 5").unwrap().matches(&data));
        assert!(!parse_expr("hardness greaterthan 3").unwrap().matches(&data));
        // Non-numeric operand never matches
        assert!(!parse_expr("path greaterthan 2").unwrap().matches(&data));
    }

    #[test]
    fn test_numeric_comparison_accepts_digit_strings() {
        let data = fields(&[("asn", json!("13335"))]);
        assert!(parse_expr("asn greaterthan 1000").unwrap().matches(&data));
    }

    #[test]
    fn test_starts_and_ends_with() {
        let data = fields(&[("path", json!("/admin/users")), ("port", json!(8080))]);
        assert!(parse_expr("path startswith /admin").unwrap().matches(&data));
        assert!(parse_expr("path endswith users").unwrap().matches(&data));
        assert!(parse_expr("port startswith 80").unwrap().matches(&data));
        assert!(!parse_expr("path startswith /api").unwrap().matches(&data));
    }

    #[test]
    fn test_quoted_value_with_spaces() {
        let expr = parse_expr(r#"user_agent equals "Mozilla/5.0 (X11; Linux)""#).unwrap();
        let data = fields(&[("user_agent", json!("Mozilla/5.0 (X11; Linux)"))]);
        assert!(expr.matches(&data));
    }

    #[test]
    fn test_collect_fields_deduplicates() {
        let expr = parse_expr("path is / or path is /index and host is example.com").unwrap();
        let mut out = Vec::new();
        expr.collect_fields(&mut out);
        assert_eq!(out, vec!["path", "host"]);
    }

    #[test]
    fn test_null_field_fails_closed() {
        let expr = parse_expr("json equals x").unwrap();
        let data = fields(&[("json", Value::Null)]);
        assert!(!expr.matches(&data));
    }

    #[test]
    fn test_boolean_field_equality() {
        let expr = parse_expr("is_ip_tor is true").unwrap();
        let data = fields(&[("is_ip_tor", json!(true))]);
        assert!(expr.matches(&data));
        let data = fields(&[("is_ip_tor", json!(false))]);
        assert!(!expr.matches(&data));
    }
}
