//! `{{...}}` placeholder substitution.
//!
//! Three passes run in a fixed order over the input text:
//!
//! 1. function calls, `{{name(arg1, arg2)}}`
//! 2. conditionals, `{{?condition:then:else}}`
//! 3. variables, `{{name}}` or `{{name:default}}`
//!
//! Each pass runs once and does not revisit its own output, so a
//! conditional branch may contain the result of a function call but a
//! variable placeholder inside a branch stops the conditional from
//! matching at all.
//!
//! Variables resolve from the caller's scope (if any), then the
//! engine's own table, then the attached [`ValuePool`] (latest value),
//! then the process environment. Anything unresolved is left in place.

use crate::pool::ValuePool;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::format::{Item, StrftimeItems};
use chrono::Utc;
use parking_lot::RwLock;
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::debug;

static FUNC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\(([^(){}]*)\)\s*\}\}")
        .expect("failed to compile function placeholder regex")
});

static COND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\?([^{}]*)\}\}").expect("failed to compile conditional placeholder regex")
});

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*(?::([^{}]*))?\}\}")
        .expect("failed to compile variable placeholder regex")
});

const DEFAULT_RANDOM_LEN: usize = 8;
const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// A template function. Receives the comma-split, trimmed arguments.
pub type TemplateFn = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// Boolean test used by conditionals and step conditions.
///
/// Grammar: `exists:NAME`, `NAME==VALUE`, `NAME!=VALUE` or a bare
/// `NAME` (true when the value is non-empty), each optionally prefixed
/// with `!`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Exists(String),
    Equals(String, String),
    NotEquals(String, String),
    Truthy(String),
    Not(Box<Condition>),
}

impl Condition {
    pub fn parse(expr: &str) -> Self {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix('!') {
            return Self::Not(Box::new(Self::parse(rest)));
        }
        if let Some(name) = expr.strip_prefix("exists:") {
            return Self::Exists(name.trim().to_string());
        }
        // The leftmost operator splits; the rest belongs to the value.
        let operator = ["==", "!="]
            .into_iter()
            .filter_map(|op| expr.find(op).map(|at| (at, op)))
            .min();
        match operator {
            Some((at, op)) => {
                let name = expr[..at].trim().to_string();
                let value = unquote(expr[at + op.len()..].trim()).to_string();
                if op == "==" {
                    Self::Equals(name, value)
                } else {
                    Self::NotEquals(name, value)
                }
            }
            None => Self::Truthy(expr.to_string()),
        }
    }

    /// Evaluate against `lookup`, which returns a variable's value.
    pub fn evaluate<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            Self::Exists(name) => lookup(name).is_some(),
            Self::Equals(name, value) => lookup(name).unwrap_or_default() == *value,
            Self::NotEquals(name, value) => lookup(name).unwrap_or_default() != *value,
            Self::Truthy(name) => lookup(name).is_some_and(|v| !v.is_empty()),
            Self::Not(inner) => !inner.evaluate(lookup),
        }
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Split the inside of `{{?...}}` into condition, then-text and
/// else-text. The colon in `exists:NAME` belongs to the condition.
fn split_conditional(inner: &str) -> Option<(&str, &str, &str)> {
    let negations = inner.len() - inner.trim_start_matches('!').len();
    let search_from = if inner[negations..].starts_with("exists:") {
        negations + "exists:".len()
    } else {
        0
    };
    let cond_end = search_from + inner[search_from..].find(':')?;
    let (condition, branches) = (&inner[..cond_end], &inner[cond_end + 1..]);
    let (then_text, else_text) = branches.split_once(':').unwrap_or((branches, ""));
    Some((condition, then_text, else_text))
}

/// Placeholder substitution engine with its own variable table,
/// function registry and `counter()` state.
pub struct TemplateEngine {
    variables: RwLock<HashMap<String, String>>,
    functions: RwLock<HashMap<String, TemplateFn>>,
    pool: Option<Arc<ValuePool>>,
    counter: Arc<AtomicU64>,
}

impl fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<String> = self.functions.read().keys().cloned().collect();
        functions.sort();
        f.debug_struct("TemplateEngine")
            .field("variables", &*self.variables.read())
            .field("functions", &functions)
            .field("pool", &self.pool.is_some())
            .finish()
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Engine without a pool; variables come from its own table and the
    /// environment.
    pub fn new() -> Self {
        let engine = Self {
            variables: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            pool: None,
            counter: Arc::new(AtomicU64::new(0)),
        };
        engine.register_builtins();
        engine
    }

    /// Engine that falls back to `pool` for variables it does not hold.
    pub fn with_pool(pool: Arc<ValuePool>) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new()
        }
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.write().insert(name.into(), value.into());
    }

    pub fn set_variables<I, K, V>(&self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut table = self.variables.write();
        for (name, value) in vars {
            table.insert(name.into(), value.into());
        }
    }

    pub fn remove_variable(&self, name: &str) -> Option<String> {
        self.variables.write().remove(name)
    }

    /// Copy of the static variable table.
    pub fn variables(&self) -> HashMap<String, String> {
        self.variables.read().clone()
    }

    /// Register a function, replacing any previous one with that name.
    pub fn register_function<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&[String]) -> String + Send + Sync + 'static,
    {
        self.functions.write().insert(name.into(), Arc::new(function));
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// Look a variable up through the resolution chain.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.resolve_in(name, None)
    }

    fn resolve_in(&self, name: &str, scope: Option<&HashMap<String, String>>) -> Option<String> {
        if let Some(value) = scope.and_then(|scope| scope.get(name)) {
            return Some(value.clone());
        }
        if let Some(value) = self.variables.read().get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.pool.as_ref().and_then(|pool| pool.get_latest(name)) {
            return Some(value);
        }
        std::env::var(name).ok()
    }

    /// Evaluate a condition expression against the resolution chain.
    pub fn evaluate_condition(&self, expr: &str) -> bool {
        self.evaluate_in(expr, None)
    }

    /// Like [`Self::evaluate_condition`], with `scope` checked before
    /// the engine's own table.
    pub fn evaluate_condition_scoped(&self, expr: &str, scope: &HashMap<String, String>) -> bool {
        self.evaluate_in(expr, Some(scope))
    }

    fn evaluate_in(&self, expr: &str, scope: Option<&HashMap<String, String>>) -> bool {
        Condition::parse(expr).evaluate(&|name: &str| self.resolve_in(name, scope))
    }

    /// Replace every resolvable placeholder in `text`.
    pub fn substitute(&self, text: &str) -> String {
        self.render(text, None)
    }

    /// Substitute with `scope` layered above the engine's own table.
    /// The scope is only read, so callers can keep per-run variables
    /// out of the shared engine.
    pub fn substitute_scoped(&self, text: &str, scope: &HashMap<String, String>) -> String {
        self.render(text, Some(scope))
    }

    fn render(&self, text: &str, scope: Option<&HashMap<String, String>>) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }
        let text = self.substitute_functions(text);
        let text = self.substitute_conditionals(&text, scope);
        let result = self.substitute_variables(&text, scope);
        debug!(unresolved = Self::has_unresolved(&result), "substituted template");
        result
    }

    /// Byte variant of [`Self::substitute`]; non-UTF-8 input is returned
    /// unchanged.
    pub fn substitute_bytes(&self, data: &[u8]) -> Vec<u8> {
        match std::str::from_utf8(data) {
            Ok(text) => self.substitute(text).into_bytes(),
            Err(_) => data.to_vec(),
        }
    }

    fn substitute_functions(&self, text: &str) -> String {
        FUNC_RE
            .replace_all(text, |caps: &Captures| {
                let name = &caps[1];
                let function = self.functions.read().get(name).cloned();
                match function {
                    Some(function) => function(&split_args(&caps[2])),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn substitute_conditionals(
        &self,
        text: &str,
        scope: Option<&HashMap<String, String>>,
    ) -> String {
        COND_RE
            .replace_all(text, |caps: &Captures| match split_conditional(&caps[1]) {
                Some((condition, then_text, else_text)) => {
                    if self.evaluate_in(condition, scope) {
                        then_text.to_string()
                    } else {
                        else_text.to_string()
                    }
                }
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    fn substitute_variables(
        &self,
        text: &str,
        scope: Option<&HashMap<String, String>>,
    ) -> String {
        VAR_RE
            .replace_all(text, |caps: &Captures| {
                let name = &caps[1];
                self.resolve_in(name, scope)
                    .or_else(|| caps.get(2).map(|default| default.as_str().to_string()))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// True when a variable or function placeholder is still present.
    pub fn has_unresolved(text: &str) -> bool {
        VAR_RE.is_match(text) || FUNC_RE.is_match(text)
    }

    /// Distinct variable names referenced by `text`, in order of first
    /// appearance.
    pub fn extract_variables(text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        VAR_RE
            .captures_iter(text)
            .filter_map(|caps| {
                let name = caps[1].to_string();
                seen.insert(name.clone()).then_some(name)
            })
            .collect()
    }

    fn register_builtins(&self) {
        self.register_function("random_str", |args| {
            let len = arg_usize(args, 0, DEFAULT_RANDOM_LEN);
            rand::rng()
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect()
        });
        self.register_function("random_hex", |args| {
            const HEX: &[u8] = b"0123456789abcdef";
            let len = arg_usize(args, 0, DEFAULT_RANDOM_LEN);
            let mut rng = rand::rng();
            (0..len)
                .map(|_| HEX[rng.random_range(0..HEX.len())] as char)
                .collect()
        });
        self.register_function("random_int", |args| {
            let mut min = arg_i64(args, 0, 0);
            let mut max = arg_i64(args, 1, 100);
            if min > max {
                std::mem::swap(&mut min, &mut max);
            }
            rand::rng().random_range(min..=max).to_string()
        });
        self.register_function("timestamp", |_| Utc::now().timestamp().to_string());
        self.register_function("timestamp_ms", |_| Utc::now().timestamp_millis().to_string());
        self.register_function("datetime", |args| {
            let format = args
                .first()
                .filter(|f| !f.is_empty())
                .map(String::as_str)
                .unwrap_or(DEFAULT_DATETIME_FORMAT);
            format_now(format)
        });
        self.register_function("date", |_| Utc::now().format("%Y-%m-%d").to_string());
        self.register_function("uuid", |_| uuid::Uuid::new_v4().to_string());
        self.register_function("env", |args| {
            let name = args.first().map(String::as_str).unwrap_or_default();
            std::env::var(name)
                .ok()
                .or_else(|| args.get(1).cloned())
                .unwrap_or_default()
        });
        self.register_function("upper", |args| args.join(",").to_uppercase());
        self.register_function("lower", |args| args.join(",").to_lowercase());
        self.register_function("base64", |args| STANDARD.encode(args.join(",")));
        self.register_function("urlencode", |args| {
            urlencoding::encode(&args.join(",")).into_owned()
        });
        let counter = Arc::clone(&self.counter);
        self.register_function("counter", move |_| {
            (counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
        });
        self.register_function("seq", |args| {
            if args.is_empty() {
                return String::new();
            }
            args[rand::rng().random_range(0..args.len())].clone()
        });
    }
}

fn split_args(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',').map(|arg| arg.trim().to_string()).collect()
}

fn arg_usize(args: &[String], index: usize, default: usize) -> usize {
    args.get(index)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(default)
}

fn arg_i64(args: &[String], index: usize, default: i64) -> i64 {
    args.get(index)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(default)
}

/// Format the current UTC time, falling back to RFC 3339 when the
/// strftime string is invalid.
fn format_now(format: &str) -> String {
    let now = Utc::now();
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return now.to_rfc3339();
    }
    now.format(format).to_string()
}
