//! Error types shared across the engine.

use thiserror::Error;

/// Raised while loading a scenario, before anything runs.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("failed to parse scenario: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("scenario name must not be empty")]
    EmptyScenarioName,

    #[error("scenario '{0}' has no steps")]
    NoSteps(String),

    #[error("step #{0} has an empty name")]
    EmptyStepName(usize),

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}': {field} references unknown step '{target}'")]
    UnknownBranchTarget {
        step: String,
        field: &'static str,
        target: String,
    },

    #[error("step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },
}

/// Raised when an extraction rule cannot be registered.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("extraction rule name must not be empty")]
    EmptyName,

    #[error("extraction rule '{0}' has an empty pattern")]
    EmptyPattern(String),

    #[error("extraction rule '{name}' has an invalid regex: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Combined failure of every `required` rule that found nothing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .0.join("; "))]
pub struct ExtractionError(pub Vec<String>);

/// Reasons a scenario run stops before reaching its last step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("execution timeout")]
    Timeout,

    #[error("execution cancelled")]
    Cancelled,

    #[error("max steps exceeded (possible infinite loop)")]
    MaxStepsExceeded,

    #[error("step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },
}
