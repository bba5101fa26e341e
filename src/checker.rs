//! Compares an actual response against a behavior's response template.

use crate::context::Context;
use crate::model::{Check, CheckResult, ExecutionResult, ResponseCheckResult, ResponseTemplate};
use crate::path;
use crate::rules::{display_value, Rule};
use serde_json::Value;
use tracing::debug;

/// Check status, every field rule and every declared header.
///
/// Field rules are evaluated in field-path order; header checks follow
/// with fields named `header:<name>`.
pub fn check(
    expected: &ResponseTemplate,
    actual: &ExecutionResult,
    ctx: &Context,
) -> ResponseCheckResult {
    let mut checks = Vec::with_capacity(expected.checks.len() + expected.headers.len());

    for (field, check) in &expected.checks {
        checks.push(check_field(field, check, actual.body.as_ref(), ctx));
    }

    for (name, value) in &expected.headers {
        checks.push(check_header(name, value, actual, ctx));
    }

    let result = ResponseCheckResult {
        status_ok: actual.status == expected.status,
        expected_status: expected.status,
        actual_status: actual.status,
        checks,
    };
    debug!(
        "Checked response: status_ok={} failed_checks={}",
        result.status_ok,
        result.failures().count()
    );
    result
}

fn check_field(field: &str, check: &Check, body: Option<&Value>, ctx: &Context) -> CheckResult {
    let failed = |expected: String, actual: String, explanation: String| CheckResult::Failed {
        field: field.to_string(),
        rule: check.rule.clone(),
        expected,
        actual,
        explanation: with_why(explanation, check.why.as_deref()),
    };

    let rule = match Rule::parse(&check.rule) {
        Ok(rule) => rule,
        Err(e) => return failed(check.rule.clone(), "<not evaluated>".to_string(), e.to_string()),
    };

    let value = match body {
        Some(body) => match path::lookup(body, field) {
            Ok(value) => Some(value),
            Err(e) if e.is_missing() => None,
            Err(e) => return failed(rule.describe(), "<not evaluated>".to_string(), e.to_string()),
        },
        None => None,
    };

    let evaluation = rule.evaluate(value, ctx);
    if evaluation.passed {
        return CheckResult::Passed {
            field: field.to_string(),
            rule: check.rule.clone(),
        };
    }

    let explanation = if body.is_none() {
        format!("{} (response has no JSON body)", evaluation.explanation)
    } else {
        evaluation.explanation
    };
    failed(evaluation.expected, evaluation.actual, explanation)
}

/// An empty expected value only asserts presence.
fn check_header(
    name: &str,
    expected: &str,
    actual: &ExecutionResult,
    ctx: &Context,
) -> CheckResult {
    let field = format!("header:{name}");
    let rule = if expected.is_empty() {
        "present".to_string()
    } else {
        format!("== {expected}")
    };
    let failed = |expected: String, actual: String, explanation: String| CheckResult::Failed {
        field: field.clone(),
        rule: rule.clone(),
        expected,
        actual,
        explanation,
    };

    let found = actual.headers.get(&name.to_ascii_lowercase());
    let Some(found) = found else {
        return failed(
            if expected.is_empty() { "<present>".to_string() } else { expected.to_string() },
            display_value(None),
            format!("header '{name}' is missing from the response"),
        );
    };

    if !expected.is_empty() {
        let expected = match ctx.resolve(expected) {
            Ok(resolved) => resolved,
            Err(e) => {
                return failed(
                    expected.to_string(),
                    found.clone(),
                    format!("cannot resolve expected value: {e}"),
                )
            }
        };
        if *found != expected {
            return failed(
                expected,
                found.clone(),
                format!("header '{name}' has a different value"),
            );
        }
    }

    CheckResult::Passed { field, rule }
}

fn with_why(explanation: String, why: Option<&str>) -> String {
    match why {
        Some(why) if !why.is_empty() => format!("{explanation}; {why}"),
        _ => explanation,
    }
}
