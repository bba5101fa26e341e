//! CEL evaluation for `expr ...` rules.
//!
//! The checked field is bound as `value`; every captured variable is
//! bound under its own name.

use anyhow::{anyhow, Result};
use cel::{Context, Program};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Evaluate `expr` with `value` bound to the field under test.
///
/// Non-boolean results are coerced: non-zero / non-empty is true.
pub fn evaluate_rule(expr: &str, value: &Value, vars: &HashMap<String, Value>) -> Result<bool> {
    let program = compile(expr)?;
    let mut context = build_context(vars)?;
    context
        .add_variable("value", value.clone())
        .map_err(|e| anyhow!("Failed to bind 'value' in CEL context: {e}"))?;

    let result = program
        .execute(&context)
        .map_err(|e| anyhow!("CEL execution error: {e}"))?;

    Ok(cel_value_is_truthy(&result))
}

/// Accept `len(x)` as an alias of `size(x)` and `type(x)` as
/// `type_of(x)`.
fn preprocess_expr(expr: &str) -> String {
    use regex::Regex;
    use std::sync::LazyLock;

    static LEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\blen\(").expect("failed to compile len regex"));

    static TYPE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\btype\(").expect("failed to compile type regex"));

    let result = LEN_RE.replace_all(expr, "size(").into_owned();
    TYPE_RE.replace_all(&result, "type_of(").into_owned()
}

fn compile(expr: &str) -> Result<Program> {
    let processed = preprocess_expr(expr);
    debug!("Compiling CEL expression: {processed}");
    Program::compile(&processed).map_err(|e| anyhow!("CEL compile error for '{processed}': {e}"))
}

fn build_context<'a>(vars: &HashMap<String, Value>) -> Result<Context<'a>> {
    let mut context = Context::default();

    for (key, value) in vars {
        context
            .add_variable(key.as_str(), value.clone())
            .map_err(|e| anyhow!("Failed to add variable '{key}' to CEL context: {e}"))?;
    }

    register_custom_functions(&mut context);

    Ok(context)
}

fn register_custom_functions(context: &mut Context<'_>) {
    // compare(a, b): deep equality
    context.add_function("compare", |a: cel::Value, b: cel::Value| -> bool { a == b });

    // type_of(x): JSON-ish type name
    context.add_function("type_of", |v: cel::Value| -> Arc<String> {
        let t = match v {
            cel::Value::Int(_) | cel::Value::UInt(_) => "integer",
            cel::Value::Float(_) => "number",
            cel::Value::String(_) => "string",
            cel::Value::Bool(_) => "boolean",
            cel::Value::List(_) => "array",
            cel::Value::Map(_) => "object",
            cel::Value::Null => "null",
            _ => "unknown",
        };
        Arc::new(t.to_string())
    });
}

fn cel_value_is_truthy(value: &cel::Value) -> bool {
    match value {
        cel::Value::Bool(b) => *b,
        cel::Value::Int(i) => *i != 0,
        cel::Value::UInt(u) => *u != 0,
        cel::Value::Float(f) => *f != 0.0,
        cel::Value::String(s) => !s.is_empty(),
        cel::Value::Null => false,
        cel::Value::List(list) => !list.is_empty(),
        cel::Value::Map(map) => !map.map.is_empty(),
        _ => true,
    }
}
