//! Shared state for scenario runs: one pool, one extractor and one
//! template engine that resolves through that pool.

use crate::error::RuleError;
use crate::extractor::{ExtractionInput, ExtractionResult, ExtractionRule, Extractor};
use crate::pool::{PoolConfig, ValuePool};
use crate::template::TemplateEngine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct StateManager {
    pool: Arc<ValuePool>,
    extractor: RwLock<Extractor>,
    engine: TemplateEngine,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl StateManager {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_pool(Arc::new(ValuePool::new(config)))
    }

    /// Build around an existing pool, e.g. one shared by several
    /// managers.
    pub fn with_pool(pool: Arc<ValuePool>) -> Self {
        Self {
            engine: TemplateEngine::with_pool(Arc::clone(&pool)),
            extractor: RwLock::new(Extractor::new()),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ValuePool> {
        &self.pool
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    /// Register a rule with the manager-wide extractor.
    pub fn add_rule(&self, rule: ExtractionRule) -> Result<(), RuleError> {
        self.extractor.write().add_rule(rule)
    }

    pub fn register_transform<F>(&self, name: impl Into<String>, transform: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.extractor.write().register_transform(name, transform);
    }

    /// Run the registered rules and store every found value in the
    /// pool, tagged with its source. All results are returned,
    /// including misses and errors.
    pub fn extract_and_store(&self, input: &ExtractionInput) -> Vec<ExtractionResult> {
        let results = self.extractor.read().extract(input);
        self.store(&results);
        results
    }

    /// Like [`Self::extract_and_store`] but with `rules` in place of the
    /// registered ones. Registered transforms still apply.
    pub fn extract_with_rules(
        &self,
        rules: &[ExtractionRule],
        input: &ExtractionInput,
    ) -> Result<Vec<ExtractionResult>, RuleError> {
        let results = self.extractor_for(rules)?.extract(input);
        self.store(&results);
        Ok(results)
    }

    /// Extractor holding `rules` plus the registered transforms.
    pub fn extractor_for(&self, rules: &[ExtractionRule]) -> Result<Extractor, RuleError> {
        self.extractor.read().scoped(rules)
    }

    /// Put one found value into the pool. Misses and empty values are
    /// ignored.
    pub fn store_result(&self, result: &ExtractionResult) -> bool {
        if !result.found || result.value.is_empty() {
            return false;
        }
        let stored = self
            .pool
            .add_with_source(&result.name, &result.value, &result.source);
        if !stored {
            debug!(name = %result.name, "pool full, extracted value not stored");
        }
        stored
    }

    fn store(&self, results: &[ExtractionResult]) {
        for result in results {
            self.store_result(result);
        }
    }

    pub fn substitute(&self, text: &str) -> String {
        self.engine.substitute(text)
    }

    /// Substitute with per-run variables layered above the engine.
    pub fn substitute_scoped(&self, text: &str, scope: &HashMap<String, String>) -> String {
        self.engine.substitute_scoped(text, scope)
    }

    pub fn substitute_bytes(&self, data: &[u8]) -> Vec<u8> {
        self.engine.substitute_bytes(data)
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<String>) {
        self.engine.set_variable(name, value);
    }

    pub fn set_variables<I, K, V>(&self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.engine.set_variables(vars);
    }

    pub fn evaluate_condition(&self, expr: &str) -> bool {
        self.engine.evaluate_condition(expr)
    }

    pub fn evaluate_condition_scoped(&self, expr: &str, scope: &HashMap<String, String>) -> bool {
        self.engine.evaluate_condition_scoped(expr, scope)
    }

    /// Stop the pool's background cleanup.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
