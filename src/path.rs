//! Path walking over JSON values.
//!
//! Shared by interpolation, captures and the checker so all three agree
//! on `a.b[0].c` / `items[-1]` semantics.

use crate::error::PathError;
use serde_json::Value;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(i64),
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Index(idx) => write!(f, "[{idx}]"),
        }
    }
}

/// Parse `a.b[0].c` into segments. An empty path yields no segments.
pub fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    let syntax = |message: &str| PathError::Syntax {
        path: path.to_string(),
        message: message.to_string(),
    };

    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut key = String::new();
    // A `.` must be followed by a key; tracks whether one is pending.
    let mut expect_key = false;

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if key.is_empty() {
                    if segments.is_empty() || expect_key {
                        return Err(syntax("empty key"));
                    }
                } else {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
                expect_key = true;
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                } else if expect_key {
                    return Err(syntax("empty key"));
                }
                expect_key = false;

                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(c) => digits.push(c),
                        None => return Err(syntax("missing ']'")),
                    }
                }
                let index = digits
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| syntax(&format!("invalid index '{digits}'")))?;
                segments.push(Segment::Index(index));

                if let Some(&next) = chars.peek() {
                    if next != '.' && next != '[' {
                        return Err(syntax("expected '.' or '[' after ']'"));
                    }
                }
            }
            ']' => return Err(syntax("unexpected ']'")),
            c => {
                key.push(c);
                expect_key = false;
            }
        }
    }

    if expect_key {
        return Err(syntax("trailing '.'"));
    }
    if !key.is_empty() {
        segments.push(Segment::Key(key));
    }

    Ok(segments)
}

/// Walk `value` along already-parsed segments.
pub fn walk<'a>(value: &'a Value, segments: &[Segment]) -> Result<&'a Value, PathError> {
    let mut current = value;

    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => {
                map.get(key).ok_or_else(|| PathError::NotFound {
                    segment: key.clone(),
                })?
            }
            (Segment::Key(key), other) => {
                return Err(PathError::NotAnObject {
                    segment: key.clone(),
                    found: type_name(other).to_string(),
                })
            }
            (Segment::Index(index), Value::Array(items)) => {
                let len = items.len();
                let resolved = if *index < 0 {
                    len.checked_sub(index.unsigned_abs() as usize)
                } else {
                    Some(*index as usize)
                };
                resolved
                    .and_then(|i| items.get(i))
                    .ok_or(PathError::IndexOutOfRange { index: *index, len })?
            }
            (Segment::Index(index), other) => {
                return Err(PathError::NotAnArray {
                    segment: format!("[{index}]"),
                    found: type_name(other).to_string(),
                })
            }
        };
    }

    Ok(current)
}

/// Parse and walk in one step.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    let segments = parse(path)?;
    walk(value, &segments)
}

/// JSON type name used in error messages and `is <type>` rules.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
