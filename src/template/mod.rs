//! `{{.x.y}}` substitution engine (§4.7) used to render agent prompts,
//! script environment values, merge commit messages, and `when`/loop
//! `condition` expressions against the workflow context.
//!
//! The context is a `serde_json::Value` tree built by the Workflow
//! Engine out of `task`, `previous`, `secrets`, and named step outputs.

use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").unwrap());

/// Look up a dotted path (leading `.` optional) inside the context tree.
/// Numeric segments index into arrays; anything else indexes into
/// objects. A missing segment yields `None`, not an error — the caller
/// decides whether that renders as empty or fails the step.
pub fn lookup<'a>(path: &str, ctx: &'a Value) -> Option<&'a Value> {
    let path = path.strip_prefix('.').unwrap_or(path);
    let mut current = ctx;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = if let Ok(index) = segment.parse::<usize>() {
            current.as_array()?.get(index)?
        } else {
            current.as_object()?.get(segment)?
        };
    }
    Some(current)
}

fn value_to_template_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `{{.path}}` placeholder in `template` with the
/// stringified context value, or an empty string when the path is
/// absent. Text outside placeholders passes through unchanged.
pub fn render(template: &str, ctx: &Value) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            let path = caps[1].trim();
            lookup(path, ctx).map(value_to_template_string).unwrap_or_default()
        })
        .into_owned()
}

fn is_falsy(rendered: &str) -> bool {
    matches!(rendered.trim(), "" | "false" | "0")
}

/// Evaluate a `when`/loop `condition` expression (§4.7). Supports a bare
/// placeholder or literal text (falsy iff empty, `"false"`, or `"0"`
/// after rendering) and a single `==`/`!=` comparison between two
/// operands, each of which may itself be a placeholder or literal.
/// Comparing a number-typed operand against a non-numeric one is a
/// step-failing error rather than a silent `false`.
pub fn evaluate_condition(expr: &str, ctx: &Value) -> Result<bool> {
    let expr = expr.trim();
    for op in ["==", "!="] {
        if let Some((lhs, rhs)) = split_once_operator(expr, op) {
            let (lhs_val, lhs_str) = resolve_operand(lhs.trim(), ctx);
            let (rhs_val, rhs_str) = resolve_operand(rhs.trim(), ctx);
            let equal = match (lhs_val, rhs_val) {
                (Some(Value::Number(a)), Some(Value::Number(b))) => a == b,
                (Some(Value::Number(_)), _) | (_, Some(Value::Number(_))) => {
                    bail!("type-mismatched comparison in condition '{expr}'");
                }
                _ => lhs_str == rhs_str,
            };
            return Ok(if op == "==" { equal } else { !equal });
        }
    }
    Ok(!is_falsy(&render(expr, ctx)))
}

fn split_once_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.split_once(op)
}

fn resolve_operand<'a>(operand: &str, ctx: &'a Value) -> (Option<&'a Value>, String) {
    let trimmed = operand.trim_matches('"');
    if let Some(path) = operand
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        let value = lookup(path.trim(), ctx);
        let rendered = value.map(value_to_template_string).unwrap_or_default();
        (value, rendered)
    } else {
        (None, trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "task": {"title": "Fix the bug", "body": "details"},
            "previous": {"success": true, "failed": false, "output": {}},
            "count": 3,
        })
    }

    #[test]
    fn renders_nested_path_substitution() {
        let out = render("Implement {{.task.title}}\n\n{{.task.body}}", &ctx());
        assert_eq!(out, "Implement Fix the bug\n\ndetails");
    }

    #[test]
    fn missing_path_renders_empty_string() {
        let out = render("value=[{{.task.missing}}]", &ctx());
        assert_eq!(out, "value=[]");
    }

    #[test]
    fn bare_placeholder_condition_is_truthy_when_present() {
        assert!(evaluate_condition("{{.task.title}}", &ctx()).unwrap());
    }

    #[test]
    fn missing_path_condition_is_falsy() {
        assert!(!evaluate_condition("{{.task.missing}}", &ctx()).unwrap());
    }

    #[test]
    fn literal_false_and_zero_are_falsy() {
        assert!(!evaluate_condition("false", &ctx()).unwrap());
        assert!(!evaluate_condition("0", &ctx()).unwrap());
    }

    #[test]
    fn equality_comparison_against_literal() {
        assert!(evaluate_condition(r#"{{.task.title}} == "Fix the bug""#, &ctx()).unwrap());
        assert!(evaluate_condition(r#"{{.task.title}} != "other""#, &ctx()).unwrap());
    }

    #[test]
    fn numeric_vs_string_comparison_errors() {
        assert!(evaluate_condition(r#"{{.count}} == "3""#, &ctx()).is_err());
    }
}
