//! Stateful HTTP scenario engine.
//!
//! Scenarios are YAML documents describing ordered, branchable HTTP
//! steps. Values extracted from one response (tokens, ids, cookies) are
//! stored in a TTL-aware [`ValuePool`] and substituted into later
//! requests through the [`TemplateEngine`].

pub mod config;
pub mod duration;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod http;
pub mod json_path;
pub mod model;
pub mod pool;
pub mod state;
pub mod template;
pub mod validator;

pub use config::{EngineConfig, ScenarioLoader};
pub use duration::{format_duration, parse_duration, HumanDuration};
pub use error::{ExecutionError, ExtractionError, RuleError, ValidationError};
pub use executor::{ExecutorOptions, ScenarioExecutor, ScenarioRunner, StepCallback};
pub use extractor::{
    parse_set_cookie, ExtractionInput, ExtractionResult, ExtractionRule, Extractor, ExtractorKind,
};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use model::*;
pub use pool::{EntryInfo, PoolConfig, PoolSnapshot, PoolStats, ValuePool};
pub use state::StateManager;
pub use template::{Condition, TemplateEngine};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
