//! Spec data model and run results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A complete behavior spec as handed over by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    /// Spec name, used in reports.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Target API settings shared by every behavior.
    #[serde(default)]
    pub config: SpecConfig,
    /// Named groups of behaviors.
    #[serde(default)]
    pub features: Vec<Feature>,
    /// Behaviors declared outside any feature.
    #[serde(default)]
    pub behaviors: Vec<Behavior>,
}

/// A named group of related behaviors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub behaviors: Vec<Behavior>,
}

/// Target settings from the spec file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecConfig {
    /// Base URL every behavior path is joined onto.
    #[serde(default)]
    pub base_url: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Headers sent with every request unless a behavior overrides them.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for SpecConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: default_timeout_ms(),
            headers: HashMap::new(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

/// One request/response contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Behavior {
    /// Unique name within the spec.
    pub name: String,
    /// What the behavior is meant to demonstrate.
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub request: RequestTemplate,
    #[serde(default)]
    pub response: ResponseTemplate,
    /// Behaviors that must pass before this one runs.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Variable name to response body path.
    #[serde(default)]
    pub captures: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Request to send, with `${...}` placeholders still in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: HttpMethod,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the response must look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTemplate {
    #[serde(default = "default_status_code")]
    pub status: u16,
    /// Field path to the rule it must satisfy.
    #[serde(default)]
    pub checks: BTreeMap<String, Check>,
    /// Header name to expected value; an empty value only asserts presence.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for ResponseTemplate {
    fn default() -> Self {
        Self {
            status: default_status_code(),
            checks: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }
}

fn default_status_code() -> u16 {
    200
}

/// A field rule plus the reason it matters.
///
/// In spec files a check may be written either as a bare rule string
/// or as `{ rule, why }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CheckRepr")]
pub struct Check {
    pub rule: String,
    #[serde(default)]
    pub why: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CheckRepr {
    Rule(String),
    Full {
        rule: String,
        #[serde(default)]
        why: Option<String>,
    },
}

impl From<CheckRepr> for Check {
    fn from(repr: CheckRepr) -> Self {
        match repr {
            CheckRepr::Rule(rule) => Check { rule, why: None },
            CheckRepr::Full { rule, why } => Check { rule, why },
        }
    }
}

impl Check {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            why: None,
        }
    }

    pub fn with_why(mut self, why: impl Into<String>) -> Self {
        self.why = Some(why.into());
        self
    }
}

impl Spec {
    /// Deserialize a spec from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Deserialize a spec from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the spec to a YAML string.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// All behaviors in declaration order: feature behaviors first, then
    /// top-level ones.
    pub fn behaviors(&self) -> Vec<&Behavior> {
        self.features
            .iter()
            .flat_map(|f| f.behaviors.iter())
            .chain(self.behaviors.iter())
            .collect()
    }
}

/// Normalized result of one HTTP round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: u16,
    /// Response headers with lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Parsed body when the response declared a JSON content type.
    pub body: Option<Value>,
    pub raw_body: String,
    pub elapsed_ms: u64,
    pub method: String,
    pub url: String,
    pub path: String,
    /// The rendered request body that was sent.
    pub request_body: Option<Value>,
}

/// Outcome of a single field rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum CheckResult {
    Passed {
        field: String,
        rule: String,
    },
    Failed {
        field: String,
        rule: String,
        expected: String,
        actual: String,
        explanation: String,
    },
}

impl CheckResult {
    pub fn is_passed(&self) -> bool {
        matches!(self, CheckResult::Passed { .. })
    }

    pub fn field(&self) -> &str {
        match self {
            CheckResult::Passed { field, .. } | CheckResult::Failed { field, .. } => field,
        }
    }
}

/// Everything the checker found for one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCheckResult {
    pub status_ok: bool,
    pub expected_status: u16,
    pub actual_status: u16,
    pub checks: Vec<CheckResult>,
}

impl ResponseCheckResult {
    /// Status matched and every check passed.
    pub fn ok(&self) -> bool {
        self.status_ok && self.checks.iter().all(CheckResult::is_passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.is_passed())
    }
}

/// Category of a problem attached to a failed behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    Status,
    Check,
    Interpolation,
    Transport,
    Capture,
}

/// One reason a behavior failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub kind: ProblemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub explanation: String,
}

impl Problem {
    pub fn new(kind: ProblemKind, explanation: impl Into<String>) -> Self {
        Self {
            kind,
            field: None,
            rule: None,
            expected: None,
            actual: None,
            explanation: explanation.into(),
        }
    }
}

/// Terminal state of one behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BehaviorOutcome {
    Passed,
    Failed { problems: Vec<Problem> },
    Blocked { dependency: String },
}

impl BehaviorOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, BehaviorOutcome::Passed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            BehaviorOutcome::Passed => "passed",
            BehaviorOutcome::Failed { .. } => "failed",
            BehaviorOutcome::Blocked { .. } => "blocked",
        }
    }
}

/// Per-behavior entry in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorReport {
    pub name: String,
    pub outcome: BehaviorOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub behavior: String,
    pub problems: Vec<Problem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedDetail {
    pub behavior: String,
    pub dependency: String,
    pub reason: String,
}

/// Aggregate result of running a spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecResult {
    pub name: String,
    pub pass: bool,
    pub passed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub total: usize,
    pub behaviors: Vec<BehaviorReport>,
    pub failures: Vec<FailureDetail>,
    pub blocked_details: Vec<BlockedDetail>,
    pub duration_ms: u64,
}

impl SpecResult {
    /// Aggregate per-behavior reports (in execution order).
    pub fn from_reports(name: &str, behaviors: Vec<BehaviorReport>, duration_ms: u64) -> Self {
        let mut failures = Vec::new();
        let mut blocked_details = Vec::new();
        let mut passed = 0;

        for report in &behaviors {
            match &report.outcome {
                BehaviorOutcome::Passed => passed += 1,
                BehaviorOutcome::Failed { problems } => failures.push(FailureDetail {
                    behavior: report.name.clone(),
                    problems: problems.clone(),
                }),
                BehaviorOutcome::Blocked { dependency } => blocked_details.push(BlockedDetail {
                    behavior: report.name.clone(),
                    dependency: dependency.clone(),
                    reason: format!("requires {dependency}"),
                }),
            }
        }

        let total = behaviors.len();
        Self {
            name: name.to_string(),
            pass: failures.is_empty() && blocked_details.is_empty(),
            passed,
            failed: failures.len(),
            blocked: blocked_details.len(),
            total,
            behaviors,
            failures,
            blocked_details,
            duration_ms,
        }
    }

    /// Process exit code: 0 all passed, 1 some failed, 2 some blocked.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else if self.blocked > 0 {
            2
        } else {
            0
        }
    }

    pub fn outcome_of(&self, name: &str) -> Option<&BehaviorOutcome> {
        self.behaviors
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.outcome)
    }
}
