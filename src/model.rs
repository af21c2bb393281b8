//! Scenario definitions and run results.

use crate::duration::HumanDuration;
use crate::error::ValidationError;
use crate::extractor::ExtractionRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// An ordered, branchable sequence of HTTP steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Static variables seeded into the template engine before the
    /// first step.
    #[serde(default, deserialize_with = "scalar::map")]
    pub variables: HashMap<String, String>,
    pub steps: Vec<Step>,
}

/// One request plus its extraction, assertion, retry and branching
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub request: RequestConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract: Vec<ExtractionRule>,
    #[serde(default, rename = "assert", skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Assertion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    /// Gating expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Pause before the step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Step {
    /// Minimal `GET` step, mostly useful for building scenarios in code.
    pub fn get(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request: RequestConfig {
                method: default_method(),
                url: url.into(),
                headers: HashMap::new(),
                body: None,
                content_type: None,
                timeout: default_request_timeout(),
            },
            extract: Vec::new(),
            assertions: Vec::new(),
            on_success: None,
            on_failure: None,
            condition: None,
            delay: None,
            retry: None,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, deserialize_with = "scalar::map", skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// A string is sent as is; any other YAML value is sent as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub timeout: HumanDuration,
}

impl RequestConfig {
    /// Body text before substitution, and whether it came from a
    /// structured (JSON) value.
    pub fn body_template(&self) -> Option<(String, bool)> {
        match self.body.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) => Some((text.clone(), false)),
            other => Some((other.to_string(), true)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_count")]
    pub count: u32,
    #[serde(default = "default_retry_delay")]
    pub delay: HumanDuration,
    /// Status codes worth retrying. Empty means any failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_status: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            delay: default_retry_delay(),
            on_status: Vec::new(),
        }
    }
}

/// What an assertion compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    Status,
    Contains,
    NotContains,
    Regex,
    #[serde(rename = "jsonpath", alias = "json_path")]
    JsonPath,
    Header,
    Length,
    Time,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Status => "status",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::Regex => "regex",
            Self::JsonPath => "jsonpath",
            Self::Header => "header",
            Self::Length => "length",
            Self::Time => "time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    /// JSON path or header name, for the kinds that need one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, deserialize_with = "scalar::string")]
    pub expected: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Assertion {
    pub fn new(kind: AssertionKind, expected: impl Into<String>) -> Self {
        Self {
            kind,
            target: String::new(),
            expected: expected.into(),
            negate: false,
            message: None,
        }
    }

    pub fn status(code: u16) -> Self {
        Self::new(AssertionKind::Status, code.to_string())
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration(crate::http::DEFAULT_REQUEST_TIMEOUT)
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> HumanDuration {
    HumanDuration(Duration::from_secs(1))
}

/// Top-level document shape. Steps stay untyped here so that a bad
/// step can be reported by name.
#[derive(Deserialize)]
struct ScenarioDocument {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "scalar::option")]
    version: Option<String>,
    #[serde(default, deserialize_with = "scalar::map")]
    variables: HashMap<String, String>,
    #[serde(default)]
    steps: Vec<serde_yaml::Value>,
}

impl Scenario {
    /// Parse, normalise and validate a YAML scenario.
    pub fn from_yaml(yaml: &str) -> Result<Self, ValidationError> {
        let doc: ScenarioDocument = serde_yaml::from_str(yaml)?;

        let mut steps = Vec::with_capacity(doc.steps.len());
        for (index, raw) in doc.steps.into_iter().enumerate() {
            let label = raw
                .get("name")
                .and_then(serde_yaml::Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index + 1));
            let step: Step = serde_yaml::from_value(raw).map_err(|e| ValidationError::InvalidStep {
                step: label,
                reason: e.to_string(),
            })?;
            steps.push(step);
        }

        let mut scenario = Scenario {
            name: doc.name,
            description: doc.description,
            version: doc.version,
            variables: doc.variables,
            steps,
        };
        scenario.normalize();
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Uppercase methods and fill in `GET` where missing.
    pub fn normalize(&mut self) {
        for step in &mut self.steps {
            let method = step.request.method.trim().to_uppercase();
            step.request.method = if method.is_empty() {
                default_method()
            } else {
                method
            };
        }
    }

    /// Check structural invariants: names present and unique, branch
    /// targets exist, extraction rules are well formed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyScenarioName);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps(self.name.clone()));
        }

        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(ValidationError::EmptyStepName(index + 1));
            }
            if !names.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStep(step.name.clone()));
            }
            if step.request.url.trim().is_empty() {
                return Err(ValidationError::InvalidStep {
                    step: step.name.clone(),
                    reason: "request url must not be empty".to_string(),
                });
            }
            for rule in &step.extract {
                rule.validate().map_err(|e| ValidationError::InvalidStep {
                    step: step.name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        for step in &self.steps {
            let targets = [
                ("on_success", &step.on_success),
                ("on_failure", &step.on_failure),
            ];
            for (field, target) in targets {
                if let Some(target) = target {
                    if !names.contains(target.as_str()) {
                        return Err(ValidationError::UnknownBranchTarget {
                            step: step.name.clone(),
                            field,
                            target: target.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Index of the step called `name`.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name == name)
    }
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub scenario_name: String,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub step_results: Vec<StepResult>,
    /// Scenario variables merged with every extracted value.
    pub variables: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Names of the steps that ran, in order.
    pub fn executed_steps(&self) -> Vec<&str> {
        self.step_results
            .iter()
            .map(|step| step.step_name.as_str())
            .collect()
    }
}

/// Outcome of one executed step (the last attempt when retried).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub success: bool,
    /// `0` when no response was received.
    pub status_code: u16,
    pub response_time_ms: u64,
    pub body_length: usize,
    pub extractions: BTreeMap<String, String>,
    pub assertions: Vec<AssertionResult>,
    pub error: Option<String>,
    /// Zero-based attempt index of this result.
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub kind: AssertionKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    pub message: Option<String>,
}

/// Deserializers that accept any YAML scalar where a string is wanted.
pub(crate) mod scalar {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::collections::HashMap;

    fn stringify<E: serde::de::Error>(value: Value) -> Result<String, E> {
        match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null => Ok(String::new()),
            other => Err(E::custom(format!("expected a scalar value, got {other}"))),
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        stringify(Value::deserialize(deserializer)?)
    }

    pub fn option<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            other => stringify(other).map(Some),
        }
    }

    pub fn map<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, String>, D::Error> {
        let raw: Option<HashMap<String, Value>> = Option::deserialize(deserializer)?;
        raw.unwrap_or_default()
            .into_iter()
            .map(|(key, value)| {
                stringify(value)
                    .map(|value| (key.clone(), value))
                    .map_err(|e: D::Error| D::Error::custom(format!("key '{key}': {e}")))
            })
            .collect()
    }
}
