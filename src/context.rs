//! Interpolation context: captured variables plus the current
//! request/response bodies, and `${...}` template rendering.

use crate::error::{InterpolationError, PathError};
use crate::path::{self, Segment};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Maximum nesting when a captured value itself contains `${...}`.
pub const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Reserved root resolving against the request body just sent.
pub const REQUEST_BODY: &str = "request_body";
/// Reserved root resolving against the response body just received.
pub const RESPONSE_BODY: &str = "response_body";

const OPEN: &str = "${";

/// Variables captured during one spec run.
///
/// Only the runner mutates a context; everything else borrows it.
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: HashMap<String, Value>,
    request_body: Option<Value>,
    response_body: Option<Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a captured value. Last writer wins.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if self.vars.contains_key(&name) {
            debug!("Overwriting captured variable '{}'", name);
        }
        self.vars.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn vars(&self) -> &HashMap<String, Value> {
        &self.vars
    }

    pub fn set_request_body(&mut self, body: Option<Value>) {
        self.request_body = body;
    }

    pub fn set_response_body(&mut self, body: Option<Value>) {
        self.response_body = body;
    }

    pub fn response_body(&self) -> Option<&Value> {
        self.response_body.as_ref()
    }

    /// Render every `${...}` span in `template` to text.
    ///
    /// Strings are inserted verbatim, other JSON values as compact JSON.
    pub fn resolve(&self, template: &str) -> Result<String, InterpolationError> {
        let value = self.render_string(template, &mut Vec::new(), 0)?;
        Ok(value_to_text(&value))
    }

    /// Render every string leaf of a JSON value.
    ///
    /// A leaf that is exactly one placeholder keeps the referenced
    /// value's JSON type.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, InterpolationError> {
        self.render_value(value, &mut Vec::new(), 0)
    }

    /// Read a path out of the current response body.
    pub fn extract(&self, path: &str) -> Result<Value, InterpolationError> {
        let body = self
            .response_body
            .as_ref()
            .ok_or_else(|| InterpolationError::NoBody {
                expression: path.to_string(),
            })?;
        path::lookup(body, path)
            .cloned()
            .map_err(|source| InterpolationError::Path {
                expression: path.to_string(),
                source,
            })
    }

    fn render_value(
        &self,
        value: &Value,
        chain: &mut Vec<String>,
        depth: usize,
    ) -> Result<Value, InterpolationError> {
        match value {
            Value::String(s) => self.render_string(s, chain, depth),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, chain, depth))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = Map::new();
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(item, chain, depth)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_string(
        &self,
        template: &str,
        chain: &mut Vec<String>,
        depth: usize,
    ) -> Result<Value, InterpolationError> {
        if !template.contains(OPEN) {
            return Ok(Value::String(template.to_string()));
        }

        let mut out = String::new();
        let mut rest = template;

        while let Some(start) = rest.find(OPEN) {
            let after = &rest[start + OPEN.len()..];
            let end = after
                .find('}')
                .ok_or_else(|| InterpolationError::Unterminated {
                    template: template.to_string(),
                })?;
            let expression = after[..end].trim();
            let value = self.resolve_expression(expression, chain, depth)?;

            // A lone placeholder keeps its JSON type.
            if start == 0 && rest.len() == template.len() && end + 1 == after.len() {
                return Ok(value);
            }

            out.push_str(&rest[..start]);
            out.push_str(&value_to_text(&value));
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        Ok(Value::String(out))
    }

    fn resolve_expression(
        &self,
        expression: &str,
        chain: &mut Vec<String>,
        depth: usize,
    ) -> Result<Value, InterpolationError> {
        let path_error = |source| InterpolationError::Path {
            expression: expression.to_string(),
            source,
        };
        let segments = path::parse(expression).map_err(path_error)?;
        let (root, rest) = match segments.split_first() {
            Some((Segment::Key(root), rest)) => (root.as_str(), rest),
            _ => {
                return Err(path_error(PathError::Syntax {
                    path: expression.to_string(),
                    message: "expected a variable name".to_string(),
                }))
            }
        };
        let walk = |base: &Value| path::walk(base, rest).cloned().map_err(path_error);

        // Bodies come from the wire and are never re-interpolated.
        match root {
            REQUEST_BODY | RESPONSE_BODY => {
                let body = if root == REQUEST_BODY {
                    self.request_body.as_ref()
                } else {
                    self.response_body.as_ref()
                };
                let body = body.ok_or_else(|| InterpolationError::NoBody {
                    expression: expression.to_string(),
                })?;
                return walk(body);
            }
            _ => {}
        }

        // Keyed on the whole expression so sibling fields of one
        // variable may refer to each other.
        if chain.iter().any(|seen| seen == expression) {
            let mut cycle = chain.clone();
            cycle.push(expression.to_string());
            return Err(InterpolationError::CircularReference { chain: cycle });
        }
        if depth >= MAX_INTERPOLATION_DEPTH {
            return Err(InterpolationError::DepthExceeded {
                name: root.to_string(),
                limit: MAX_INTERPOLATION_DEPTH,
            });
        }

        let base = self
            .vars
            .get(root)
            .ok_or_else(|| InterpolationError::Undefined {
                name: root.to_string(),
            })?;
        let value = walk(base)?;

        if !contains_template(&value) {
            return Ok(value);
        }

        chain.push(expression.to_string());
        let rendered = self.render_value(&value, chain, depth + 1);
        chain.pop();
        rendered
    }
}

/// Text form of a value when spliced into a larger string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn contains_template(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(OPEN),
        Value::Array(items) => items.iter().any(contains_template),
        Value::Object(map) => map.values().any(contains_template),
        _ => false,
    }
}
