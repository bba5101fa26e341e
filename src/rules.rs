//! Field rule language used by response checks.
//!
//! Rules read like `is uuid`, `== 201`, `length between 1 and 50` or
//! `one of ["active", "pending"]`. Operands may contain `${...}`
//! placeholders; they are resolved against the run context when the
//! rule is evaluated.

use crate::context::{value_to_text, Context};
use crate::error::RuleError;
use crate::expression;
use crate::path::type_name;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("failed to compile uuid regex")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s.]+$").expect("failed to compile email regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Null,
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl JsonType {
    fn name(&self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::String => "string",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::Boolean => "boolean",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::Null => value.is_null(),
            JsonType::String => value.is_string(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Number => value.is_number(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Uuid,
    Email,
    Iso8601,
    Uri,
}

impl Format {
    fn name(&self) -> &'static str {
        match self {
            Format::Uuid => "uuid",
            Format::Email => "email",
            Format::Iso8601 => "iso8601",
            Format::Uri => "uri",
        }
    }

    fn matches(&self, s: &str) -> bool {
        match self {
            Format::Uuid => UUID_RE.is_match(s),
            Format::Email => EMAIL_RE.is_match(s),
            Format::Iso8601 => is_iso8601(s),
            Format::Uri => url::Url::parse(s).is_ok(),
        }
    }
}

fn is_iso8601(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        }
    }

    fn holds<T: PartialOrd>(&self, left: T, right: T) -> bool {
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Gt => left > right,
            CmpOp::Ge => left >= right,
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
        }
    }
}

/// Right-hand side of a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// Text with `${...}` placeholders, resolved at evaluation time.
    Template(String),
}

impl Operand {
    fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.contains("${") {
            let unquoted = text
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .unwrap_or(text);
            return Operand::Template(unquoted.to_string());
        }
        Operand::Literal(parse_literal(text))
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) if s.contains("${") => Operand::Template(s),
            other => Operand::Literal(other),
        }
    }

    fn resolve(&self, ctx: &Context) -> Result<Value, String> {
        match self {
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Template(template) => ctx
                .resolve_value(&Value::String(template.clone()))
                .map_err(|e| e.to_string()),
        }
    }
}

/// JSON literal if it parses, bare string otherwise.
fn parse_literal(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// A parsed rule expression.
#[derive(Debug, Clone)]
pub enum Rule {
    Present,
    Absent,
    IsType(JsonType),
    IsFormat(Format),
    NonEmptyString,
    NonEmpty,
    Equals(Operand),
    NotEquals(Operand),
    Compare(CmpOp, Operand),
    Between(Operand, Operand),
    Matches(Regex),
    StartsWith(Operand),
    EndsWith(Operand),
    Contains(Operand),
    Length(CmpOp, usize),
    LengthBetween(usize, usize),
    OneOf(Vec<Operand>),
    Expr(String),
}

/// Case-insensitive ASCII prefix strip.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Split `a and b` on the first case-insensitive ` and `.
fn split_and(s: &str) -> Option<(&str, &str)> {
    let pos = s.to_ascii_lowercase().find(" and ")?;
    Some((s[..pos].trim(), s[pos + 5..].trim()))
}

fn parse_cmp(s: &str) -> Option<(CmpOp, &str)> {
    for (symbol, op) in [
        (">=", CmpOp::Ge),
        ("<=", CmpOp::Le),
        ("==", CmpOp::Eq),
        (">", CmpOp::Gt),
        ("<", CmpOp::Lt),
    ] {
        if let Some(rest) = s.strip_prefix(symbol) {
            return Some((op, rest.trim()));
        }
    }
    None
}

impl Rule {
    /// Parse a rule expression.
    pub fn parse(rule: &str) -> Result<Rule, RuleError> {
        let text = rule.trim();
        let err = |message: &str| RuleError::new(rule, message);

        if text.is_empty() {
            return Err(err("empty rule"));
        }
        if let Some(expr) = strip_prefix_ci(text, "expr ") {
            return Ok(Rule::Expr(expr.trim().to_string()));
        }

        match text.to_ascii_lowercase().as_str() {
            "present" | "exists" | "required" => return Ok(Rule::Present),
            "absent" | "not present" | "missing" => return Ok(Rule::Absent),
            "non-empty string" => return Ok(Rule::NonEmptyString),
            "non-empty" | "not empty" => return Ok(Rule::NonEmpty),
            _ => {}
        }

        if let Some(rest) = strip_prefix_ci(text, "is ") {
            let rest = rest.trim();
            if let Some(list) = strip_prefix_ci(rest, "one of ") {
                return Self::parse_one_of(rule, list);
            }
            let word = strip_prefix_ci(rest, "an ")
                .or_else(|| strip_prefix_ci(rest, "a "))
                .unwrap_or(rest)
                .trim()
                .to_ascii_lowercase();
            return match word.as_str() {
                "null" => Ok(Rule::IsType(JsonType::Null)),
                "string" => Ok(Rule::IsType(JsonType::String)),
                "integer" | "int" => Ok(Rule::IsType(JsonType::Integer)),
                "number" => Ok(Rule::IsType(JsonType::Number)),
                "boolean" | "bool" => Ok(Rule::IsType(JsonType::Boolean)),
                "array" | "list" => Ok(Rule::IsType(JsonType::Array)),
                "object" => Ok(Rule::IsType(JsonType::Object)),
                "uuid" => Ok(Rule::IsFormat(Format::Uuid)),
                "email" => Ok(Rule::IsFormat(Format::Email)),
                "iso8601" | "timestamp" | "datetime" | "date" => {
                    Ok(Rule::IsFormat(Format::Iso8601))
                }
                "uri" | "url" => Ok(Rule::IsFormat(Format::Uri)),
                _ => Err(err(&format!("unknown type or format '{word}'"))),
            };
        }

        if let Some(list) = strip_prefix_ci(text, "one of ") {
            return Self::parse_one_of(rule, list);
        }

        if let Some(rest) =
            strip_prefix_ci(text, "length ").or_else(|| strip_prefix_ci(text, "len "))
        {
            let rest = rest.trim();
            let count = |s: &str| {
                s.trim()
                    .parse::<usize>()
                    .map_err(|_| err(&format!("invalid length '{}'", s.trim())))
            };
            if let Some(range) = strip_prefix_ci(rest, "between ") {
                let (lo, hi) = split_and(range)
                    .ok_or_else(|| err("expected 'between <min> and <max>'"))?;
                return Ok(Rule::LengthBetween(count(lo)?, count(hi)?));
            }
            let (op, n) =
                parse_cmp(rest).ok_or_else(|| err("expected a comparison after 'length'"))?;
            return Ok(Rule::Length(op, count(n)?));
        }

        if let Some(range) = strip_prefix_ci(text, "between ") {
            let (lo, hi) =
                split_and(range).ok_or_else(|| err("expected 'between <min> and <max>'"))?;
            return Ok(Rule::Between(Operand::parse(lo), Operand::parse(hi)));
        }

        if let Some(pattern) = strip_prefix_ci(text, "matches ")
            .or_else(|| strip_prefix_ci(text, "string matching "))
        {
            let pattern = pattern.trim();
            let pattern = pattern
                .strip_prefix('/')
                .and_then(|p| p.strip_suffix('/'))
                .unwrap_or(pattern);
            let regex = Regex::new(pattern).map_err(|e| err(&format!("invalid regex: {e}")))?;
            return Ok(Rule::Matches(regex));
        }

        if let Some(rest) = strip_prefix_ci(text, "starts with ") {
            return Ok(Rule::StartsWith(Operand::parse(rest)));
        }
        if let Some(rest) = strip_prefix_ci(text, "ends with ") {
            return Ok(Rule::EndsWith(Operand::parse(rest)));
        }
        if let Some(rest) = strip_prefix_ci(text, "contains ") {
            return Ok(Rule::Contains(Operand::parse(rest)));
        }
        if let Some(rest) = strip_prefix_ci(text, "equals ") {
            return Ok(Rule::Equals(Operand::parse(rest)));
        }
        if let Some(rest) = text.strip_prefix("!=") {
            return Ok(Rule::NotEquals(Operand::parse(rest)));
        }
        if let Some((op, rest)) = parse_cmp(text) {
            if rest.is_empty() {
                return Err(err("missing operand"));
            }
            return Ok(match op {
                CmpOp::Eq => Rule::Equals(Operand::parse(rest)),
                other => Rule::Compare(other, Operand::parse(rest)),
            });
        }

        Err(err("unrecognized rule"))
    }

    fn parse_one_of(rule: &str, list: &str) -> Result<Rule, RuleError> {
        let list = list.trim();
        let operands = if list.starts_with('[') {
            match serde_json::from_str::<Value>(list) {
                Ok(Value::Array(items)) => items.into_iter().map(Operand::from_value).collect(),
                _ => {
                    let inner = list.trim_start_matches('[').trim_end_matches(']');
                    inner.split(',').map(Operand::parse).collect()
                }
            }
        } else {
            list.split(',').map(Operand::parse).collect::<Vec<_>>()
        };
        if operands.is_empty() {
            return Err(RuleError::new(rule, "'one of' needs at least one value"));
        }
        Ok(Rule::OneOf(operands))
    }
}

/// Result of evaluating one rule against one value.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    pub expected: String,
    pub actual: String,
    pub explanation: String,
}

impl Evaluation {
    fn pass(expected: String, actual: String) -> Self {
        Self {
            passed: true,
            expected,
            actual,
            explanation: String::new(),
        }
    }

    fn fail(expected: String, actual: String, explanation: impl Into<String>) -> Self {
        Self {
            passed: false,
            expected,
            actual,
            explanation: explanation.into(),
        }
    }

    fn check(ok: bool, expected: String, actual: String, explanation: impl Into<String>) -> Self {
        if ok {
            Self::pass(expected, actual)
        } else {
            Self::fail(expected, actual, explanation)
        }
    }
}

/// Text shown for an actual value in reports.
pub fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "<missing>".to_string(),
    }
}

/// Integers compare exactly; `f64` only once a float is involved.
fn values_equal(a: &Value, b: &Value) -> bool {
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return a == b;
    };
    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        x == y
    } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
        x == y
    } else if x.is_f64() || y.is_f64() {
        x.as_f64() == y.as_f64()
    } else {
        // negative i64 against a u64 above i64::MAX
        false
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

impl Rule {
    /// Evaluate against the field's value (`None` when the field is
    /// missing).
    pub fn evaluate(&self, actual: Option<&Value>, ctx: &Context) -> Evaluation {
        let shown = display_value(actual);
        let Some(value) = actual else {
            return match self {
                Rule::Absent => Evaluation::pass("<absent>".to_string(), shown),
                _ => Evaluation::fail(self.describe(), shown, "field is missing from the response"),
            };
        };

        match self.evaluate_value(value, &shown, ctx) {
            Ok(evaluation) => evaluation,
            Err(e) => Evaluation::fail(
                self.describe(),
                shown,
                format!("cannot resolve expected value: {e}"),
            ),
        }
    }

    /// Evaluate against a present value. `Err` means an operand could
    /// not be resolved.
    fn evaluate_value(
        &self,
        value: &Value,
        shown: &str,
        ctx: &Context,
    ) -> Result<Evaluation, String> {
        let shown = shown.to_string();
        let evaluation = match self {
            Rule::Present => Evaluation::pass("<present>".to_string(), shown),
            Rule::Absent => {
                Evaluation::fail("<absent>".to_string(), shown, "field should be absent")
            }
            Rule::IsType(t) => Evaluation::check(
                t.matches(value),
                t.name().to_string(),
                shown,
                format!("expected {}, got {}", t.name(), type_name(value)),
            ),
            Rule::IsFormat(f) => Evaluation::check(
                value.as_str().is_some_and(|s| f.matches(s)),
                f.name().to_string(),
                shown,
                format!("value is not a valid {}", f.name()),
            ),
            Rule::NonEmptyString => Evaluation::check(
                value.as_str().is_some_and(|s| !s.is_empty()),
                "non-empty string".to_string(),
                shown,
                "expected a non-empty string",
            ),
            Rule::NonEmpty => Evaluation::check(
                length_of(value).is_some_and(|n| n > 0),
                "non-empty".to_string(),
                shown,
                "expected a non-empty string, array or object",
            ),
            Rule::Equals(op) => {
                let expected = op.resolve(ctx)?;
                Evaluation::check(
                    values_equal(value, &expected),
                    expected.to_string(),
                    shown,
                    "values are not equal",
                )
            }
            Rule::NotEquals(op) => {
                let expected = op.resolve(ctx)?;
                Evaluation::check(
                    !values_equal(value, &expected),
                    format!("!= {expected}"),
                    shown,
                    "value must differ",
                )
            }
            Rule::Compare(cmp, op) => {
                let expected = op.resolve(ctx)?;
                let describe = format!("{} {}", cmp.symbol(), expected);
                match (value.as_f64(), expected.as_f64()) {
                    (Some(a), Some(b)) => Evaluation::check(
                        cmp.holds(a, b),
                        describe,
                        shown,
                        format!("comparison {} failed", cmp.symbol()),
                    ),
                    _ => Evaluation::fail(describe, shown, "numeric comparison needs two numbers"),
                }
            }
            Rule::Between(lo, hi) => {
                let lo = lo.resolve(ctx)?;
                let hi = hi.resolve(ctx)?;
                let describe = format!("between {lo} and {hi}");
                match (value.as_f64(), lo.as_f64(), hi.as_f64()) {
                    (Some(v), Some(l), Some(h)) => Evaluation::check(
                        l <= v && v <= h,
                        describe,
                        shown,
                        "value is out of range",
                    ),
                    _ => Evaluation::fail(describe, shown, "range check needs numbers"),
                }
            }
            Rule::Matches(re) => {
                let describe = format!("matches /{}/", re.as_str());
                match value.as_str() {
                    Some(s) => Evaluation::check(
                        re.is_match(s),
                        describe,
                        shown,
                        "value does not match the pattern",
                    ),
                    None => Evaluation::fail(describe, shown, "pattern match needs a string"),
                }
            }
            Rule::StartsWith(op) | Rule::EndsWith(op) => {
                let needle = value_to_text(&op.resolve(ctx)?);
                let prefix = matches!(self, Rule::StartsWith(_));
                let describe = if prefix {
                    format!("starts with {needle}")
                } else {
                    format!("ends with {needle}")
                };
                match value.as_str() {
                    Some(s) => {
                        let ok = if prefix {
                            s.starts_with(&needle)
                        } else {
                            s.ends_with(&needle)
                        };
                        let explanation = format!("value does not {describe}");
                        Evaluation::check(ok, describe, shown, explanation)
                    }
                    None => Evaluation::fail(describe, shown, "expected a string"),
                }
            }
            Rule::Contains(op) => {
                let expected = op.resolve(ctx)?;
                let ok = match value {
                    Value::String(s) => s.contains(&value_to_text(&expected)),
                    Value::Array(items) => items.iter().any(|item| values_equal(item, &expected)),
                    Value::Object(map) => expected.as_str().is_some_and(|k| map.contains_key(k)),
                    _ => false,
                };
                Evaluation::check(ok, format!("contains {expected}"), shown, "value not found")
            }
            Rule::Length(cmp, n) => {
                let describe = format!("length {} {}", cmp.symbol(), n);
                match length_of(value) {
                    Some(len) => Evaluation::check(
                        cmp.holds(len, *n),
                        describe,
                        format!("length {len}"),
                        format!("length {len} is not {} {n}", cmp.symbol()),
                    ),
                    None => Evaluation::fail(describe, shown, "value has no length"),
                }
            }
            Rule::LengthBetween(lo, hi) => {
                let describe = format!("length between {lo} and {hi}");
                match length_of(value) {
                    Some(len) => Evaluation::check(
                        *lo <= len && len <= *hi,
                        describe,
                        format!("length {len}"),
                        "length is out of range",
                    ),
                    None => Evaluation::fail(describe, shown, "value has no length"),
                }
            }
            Rule::OneOf(options) => {
                let resolved = options
                    .iter()
                    .map(|op| op.resolve(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                let ok = resolved.iter().any(|opt| values_equal(value, opt));
                Evaluation::check(
                    ok,
                    format!("one of {}", Value::Array(resolved)),
                    shown,
                    "value is not one of the allowed values",
                )
            }
            Rule::Expr(expr) => match expression::evaluate_rule(expr, value, ctx.vars()) {
                Ok(ok) => Evaluation::check(
                    ok,
                    format!("expr {expr}"),
                    shown,
                    "expression evaluated to false",
                ),
                Err(e) => Evaluation::fail(
                    format!("expr {expr}"),
                    shown,
                    format!("expression error: {e}"),
                ),
            },
        };
        Ok(evaluation)
    }

    /// Short description of what the rule expects.
    pub fn describe(&self) -> String {
        match self {
            Rule::Present => "<present>".to_string(),
            Rule::Absent => "<absent>".to_string(),
            Rule::IsType(t) => t.name().to_string(),
            Rule::IsFormat(f) => f.name().to_string(),
            Rule::NonEmptyString => "non-empty string".to_string(),
            Rule::NonEmpty => "non-empty".to_string(),
            Rule::Equals(op) => format!("== {}", describe_operand(op)),
            Rule::NotEquals(op) => format!("!= {}", describe_operand(op)),
            Rule::Compare(cmp, op) => format!("{} {}", cmp.symbol(), describe_operand(op)),
            Rule::Between(lo, hi) => {
                format!("between {} and {}", describe_operand(lo), describe_operand(hi))
            }
            Rule::Matches(re) => format!("matches /{}/", re.as_str()),
            Rule::StartsWith(op) => format!("starts with {}", describe_operand(op)),
            Rule::EndsWith(op) => format!("ends with {}", describe_operand(op)),
            Rule::Contains(op) => format!("contains {}", describe_operand(op)),
            Rule::Length(cmp, n) => format!("length {} {}", cmp.symbol(), n),
            Rule::LengthBetween(lo, hi) => format!("length between {lo} and {hi}"),
            Rule::OneOf(ops) => format!(
                "one of [{}]",
                ops.iter().map(describe_operand).collect::<Vec<_>>().join(", ")
            ),
            Rule::Expr(expr) => format!("expr {expr}"),
        }
    }
}

fn describe_operand(op: &Operand) -> String {
    match op {
        Operand::Literal(v) => v.to_string(),
        Operand::Template(t) => t.clone(),
    }
}
