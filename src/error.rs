//! Typed error values for the behavior engine.
//!
//! Only [`StructuralError`] aborts a run. Every other error is
//! scoped to a single behavior and ends up as a `Failed` outcome.

use thiserror::Error;

/// Graph-level problems detected before any request is sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("behavior '{behavior}' requires unknown behavior '{dependency}'")]
    MissingDependency { behavior: String, dependency: String },
    #[error("behavior name '{name}' is declared more than once")]
    DuplicateBehavior { name: String },
}

/// Failure while walking a JSON value along a path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid path syntax in '{path}': {message}")]
    Syntax { path: String, message: String },
    #[error("key '{segment}' not found")]
    NotFound { segment: String },
    #[error("index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("expected an array at '{segment}' but found {found}")]
    NotAnArray { segment: String, found: String },
    #[error("expected an object at '{segment}' but found {found}")]
    NotAnObject { segment: String, found: String },
}

impl PathError {
    /// True when the path simply does not lead anywhere (as opposed to
    /// being malformed).
    pub fn is_missing(&self) -> bool {
        !matches!(self, PathError::Syntax { .. })
    }
}

/// Failure while rendering a `${...}` template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("undefined variable '{name}'")]
    Undefined { name: String },
    #[error("cannot resolve '{expression}': {source}")]
    Path {
        expression: String,
        #[source]
        source: PathError,
    },
    #[error("circular reference: {}", chain.join(" -> "))]
    CircularReference { chain: Vec<String> },
    #[error("interpolation depth limit of {limit} exceeded while resolving '{name}'")]
    DepthExceeded { name: String, limit: usize },
    #[error("unterminated '${{' in template '{template}'")]
    Unterminated { template: String },
    #[error("no response body available for '{expression}'")]
    NoBody { expression: String },
}

/// Failure while rendering or sending a behavior's request.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("invalid url '{url}': {message}")]
    UrlParse { url: String, message: String },
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
    #[error("{method} {url} failed: {message}")]
    HttpRequest {
        method: String,
        url: String,
        message: String,
    },
    #[error("response body is not valid JSON: {message}")]
    ResponseParse { message: String, raw: String },
    #[error("request to '{url}' blocked: {reason}")]
    SsrfBlocked { url: String, reason: String },
}

impl ExecutionError {
    /// Short machine-readable tag used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::UrlParse { .. } => "url_parse",
            ExecutionError::Interpolation(_) => "interpolation",
            ExecutionError::HttpRequest { .. } => "http_request",
            ExecutionError::ResponseParse { .. } => "response_parse",
            ExecutionError::SsrfBlocked { .. } => "ssrf_blocked",
        }
    }
}

/// A rule expression that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid rule '{rule}': {message}")]
pub struct RuleError {
    pub rule: String,
    pub message: String,
}

impl RuleError {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}
