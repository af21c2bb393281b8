//! Scenario execution: conditions, delays, retries, branching and the
//! loop guard.

use crate::duration::HumanDuration;
use crate::error::{ExecutionError, ExtractionError};
use crate::extractor::ExtractionInput;
use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
use crate::model::{Assertion, ExecutionResult, RetryConfig, Scenario, Step, StepResult};
use crate::state::StateManager;
use crate::validator;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Runs whole scenarios.
#[async_trait]
pub trait ScenarioRunner: Send + Sync {
    /// Run `scenario` to completion. Failures are reported through the
    /// returned result, never as an error.
    async fn execute(&self, scenario: &Scenario) -> ExecutionResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Ceiling on loop iterations, skipped steps included.
    pub max_steps: usize,
    /// Deadline for the whole run.
    pub timeout: HumanDuration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_steps: 100,
            timeout: HumanDuration::from_secs(5 * 60),
        }
    }
}

/// Invoked after every executed step.
pub type StepCallback = Arc<dyn Fn(&StepResult) + Send + Sync>;

pub struct ScenarioExecutor<C: HttpClient> {
    client: Arc<C>,
    state: Arc<StateManager>,
    options: ExecutorOptions,
    on_step: Option<StepCallback>,
}

impl<C: HttpClient> fmt::Debug for ScenarioExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioExecutor")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("on_step", &self.on_step.is_some())
            .finish()
    }
}

impl Default for ScenarioExecutor<ReqwestClient> {
    fn default() -> Self {
        Self::new(ReqwestClient::new())
    }
}

impl<C: HttpClient> ScenarioExecutor<C> {
    /// Executor with its own state manager and default options.
    pub fn new(client: C) -> Self {
        Self::with_state(Arc::new(client), Arc::new(StateManager::default()))
    }

    /// Executor sharing `client` and `state` with other runs.
    pub fn with_state(client: Arc<C>, state: Arc<StateManager>) -> Self {
        Self {
            client,
            state,
            options: ExecutorOptions::default(),
            on_step: None,
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.options.max_steps = max_steps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout.into();
        self
    }

    /// Register a callback fired after each executed step.
    pub fn on_step<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StepResult) + Send + Sync + 'static,
    {
        self.on_step = Some(Arc::new(callback));
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Run `scenario` with no external cancellation.
    pub async fn execute(&self, scenario: &Scenario) -> ExecutionResult {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.execute_with_shutdown(scenario, shutdown_rx).await
    }

    /// Run `scenario`, aborting as soon as `shutdown` turns `true`.
    #[instrument(skip_all, fields(name = %scenario.name))]
    pub async fn execute_with_shutdown(
        &self,
        scenario: &Scenario,
        shutdown: watch::Receiver<bool>,
    ) -> ExecutionResult {
        let start_time = Utc::now();
        let started = Instant::now();
        info!("Starting scenario: {}", scenario.name);

        let mut run = Run {
            guard: RunGuard::new(self.options.timeout.as_duration(), shutdown),
            scope: scenario.variables.clone(),
            step_results: Vec::new(),
            variables: scenario
                .variables
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        };

        let error = self.run_steps(scenario, &mut run).await.err();
        let success = error.is_none();
        match &error {
            None => info!(
                "Scenario '{}' passed ({} steps)",
                scenario.name,
                run.step_results.len()
            ),
            Some(e) => info!("Scenario '{}' failed: {}", scenario.name, e),
        }

        ExecutionResult {
            scenario_name: scenario.name.clone(),
            success,
            start_time,
            end_time: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            step_results: run.step_results,
            variables: run.variables,
            error: error.map(|e| e.to_string()),
        }
    }

    async fn run_steps(&self, scenario: &Scenario, run: &mut Run) -> Result<(), ExecutionError> {
        let mut index = 0;
        let mut step_count = 0;

        while index < scenario.steps.len() {
            if step_count >= self.options.max_steps {
                warn!(max_steps = self.options.max_steps, "loop guard tripped");
                return Err(ExecutionError::MaxStepsExceeded);
            }
            step_count += 1;
            run.guard.check()?;

            let step = &scenario.steps[index];
            if let Some(condition) = &step.condition {
                let condition = self.state.substitute_scoped(condition, &run.scope);
                if !self.state.evaluate_condition_scoped(&condition, &run.scope) {
                    info!(
                        "Skipping step '{}': condition '{}' is false",
                        step.name, condition
                    );
                    index += 1;
                    continue;
                }
            }

            if let Some(delay) = step.delay {
                debug!("Delaying step '{}' by {}", step.name, delay);
                run.guard.sleep(delay.as_duration()).await?;
            }

            info!(
                "Running step {}/{}: {}",
                index + 1,
                scenario.steps.len(),
                step.name
            );
            let result = self.execute_with_retry(step, run).await?;

            run.variables.extend(
                result
                    .extractions
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
            if let Some(callback) = &self.on_step {
                callback(&result);
            }

            let success = result.success;
            let reason = result.error.clone();
            run.step_results.push(result);

            index = if success {
                match step.on_success.as_deref().and_then(|t| scenario.step_index(t)) {
                    Some(target) => {
                        debug!(
                            "Step '{}' succeeded, jumping to '{}'",
                            step.name, scenario.steps[target].name
                        );
                        target
                    }
                    None => index + 1,
                }
            } else {
                match step.on_failure.as_deref().and_then(|t| scenario.step_index(t)) {
                    Some(target) => {
                        info!(
                            "Step '{}' failed, jumping to '{}'",
                            step.name, scenario.steps[target].name
                        );
                        target
                    }
                    None => {
                        return Err(ExecutionError::StepFailed {
                            step: step.name.clone(),
                            reason: reason.unwrap_or_else(|| "step failed".to_string()),
                        })
                    }
                }
            };
        }

        Ok(())
    }

    /// Attempt a step up to `1 + retry.count` times. The last attempt's
    /// result is kept.
    async fn execute_with_retry(
        &self,
        step: &Step,
        run: &mut Run,
    ) -> Result<StepResult, ExecutionError> {
        let retry = step.retry.as_ref();
        let max_retries = retry.map_or(0, |r| r.count);
        let mut attempt = 0;

        loop {
            let mut result = self.execute_step(step, run).await?;
            result.retry_count = attempt;

            let Some(retry) = retry else {
                return Ok(result);
            };
            if result.success || attempt >= max_retries || !should_retry(retry, &result) {
                return Ok(result);
            }

            attempt += 1;
            warn!(
                "Retrying step '{}' ({}/{}) after {}: {}",
                step.name,
                attempt,
                max_retries,
                retry.delay,
                result.error.as_deref().unwrap_or("failed")
            );
            run.guard.sleep(retry.delay.as_duration()).await?;
        }
    }

    /// One attempt: send, extract, assert. Only run-level aborts are
    /// returned as errors.
    async fn execute_step(&self, step: &Step, run: &mut Run) -> Result<StepResult, ExecutionError> {
        let mut result = StepResult {
            step_name: step.name.clone(),
            ..StepResult::default()
        };

        let request = self.build_request(step, &run.scope);
        debug!("{} {}", request.method, request.url);
        let response = match run.guard.run(self.client.send(request)).await? {
            Ok(response) => response,
            Err(e) => {
                error!("Request for step '{}' failed: {:#}", step.name, e);
                result.error = Some(format!("request failed: {e:#}"));
                return Ok(result);
            }
        };

        result.status_code = response.status;
        result.response_time_ms = response.duration.as_millis() as u64;
        result.body_length = response.body.len();

        if let Err(e) = self.extract(step, &response, &mut result, &mut run.scope) {
            result.error = Some(e);
            return Ok(result);
        }

        let assertions: Vec<Assertion> = step
            .assertions
            .iter()
            .map(|assertion| Assertion {
                target: self.state.substitute_scoped(&assertion.target, &run.scope),
                expected: self.state.substitute_scoped(&assertion.expected, &run.scope),
                ..assertion.clone()
            })
            .collect();
        result.assertions = validator::evaluate_all(&assertions, &response);

        let failures: Vec<&str> = result
            .assertions
            .iter()
            .filter(|a| !a.passed)
            .filter_map(|a| a.message.as_deref())
            .collect();
        result.success = failures.is_empty();
        if !result.success {
            result.error = Some(format!("assertion failed: {}", failures.join("; ")));
        }
        debug!(
            step = %step.name,
            status = result.status_code,
            success = result.success,
            "step finished"
        );

        Ok(result)
    }

    /// Register found values in the result and the pool. Stops at the
    /// first missing required value.
    fn extract(
        &self,
        step: &Step,
        response: &HttpResponse,
        result: &mut StepResult,
        scope: &mut HashMap<String, String>,
    ) -> Result<(), String> {
        if step.extract.is_empty() {
            return Ok(());
        }
        let extractor = self
            .state
            .extractor_for(&step.extract)
            .map_err(|e| e.to_string())?;
        let input = ExtractionInput::from_response(response);

        for extraction in extractor.extract(&input) {
            if let Some(error) = extraction.error {
                return Err(ExtractionError(vec![error]).to_string());
            }
            if !extraction.found {
                continue;
            }
            debug!(name = %extraction.name, source = %extraction.source, "stored extraction");
            // Later steps read the value from the pool, so a scenario
            // variable of the same name must not shadow it.
            scope.remove(&extraction.name);
            self.state.store_result(&extraction);
            result.extractions.insert(extraction.name, extraction.value);
        }
        Ok(())
    }

    fn build_request(&self, step: &Step, scope: &HashMap<String, String>) -> HttpRequest {
        let config = &step.request;
        let url = self.state.substitute_scoped(&config.url, scope);
        let mut request = HttpRequest::new(config.method.clone(), url);
        request.timeout = config.timeout.as_duration();

        let mut headers: Vec<(&String, &String)> = config.headers.iter().collect();
        headers.sort();
        request.headers = headers
            .into_iter()
            .map(|(name, value)| (name.clone(), self.state.substitute_scoped(value, scope)))
            .collect();

        let mut is_json = false;
        if let Some((body, structured)) = config.body_template() {
            request.body = Some(self.state.substitute_scoped(&body, scope));
            is_json = structured;
        }

        let content_type = config.content_type.clone().or_else(|| {
            (is_json && request.header("content-type").is_none())
                .then(|| "application/json".to_string())
        });
        if let Some(content_type) = content_type {
            request
                .headers
                .retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
            request.headers.push(("Content-Type".to_string(), content_type));
        }

        request
    }
}

#[async_trait]
impl<C: HttpClient> ScenarioRunner for ScenarioExecutor<C> {
    async fn execute(&self, scenario: &Scenario) -> ExecutionResult {
        ScenarioExecutor::execute(self, scenario).await
    }
}

/// A step with no response (status `0`) failed in transport and is
/// always retried. Otherwise `on_status`, when set, limits retries to
/// those codes.
fn should_retry(retry: &RetryConfig, result: &StepResult) -> bool {
    result.status_code == 0
        || retry.on_status.is_empty()
        || retry.on_status.contains(&result.status_code)
}

/// Mutable state of one run.
struct Run {
    guard: RunGuard,
    /// Scenario variables, visible to this run only.
    scope: HashMap<String, String>,
    step_results: Vec<StepResult>,
    variables: BTreeMap<String, String>,
}

/// Deadline and cancellation shared by every suspension point of a run.
struct RunGuard {
    deadline: tokio::time::Instant,
    shutdown: watch::Receiver<bool>,
}

impl RunGuard {
    fn new(timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        let now = tokio::time::Instant::now();
        // Far enough out to never fire when the timeout overflows.
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));
        Self { deadline, shutdown }
    }

    fn check(&self) -> Result<(), ExecutionError> {
        if *self.shutdown.borrow() {
            return Err(ExecutionError::Cancelled);
        }
        if tokio::time::Instant::now() >= self.deadline {
            return Err(ExecutionError::Timeout);
        }
        Ok(())
    }

    async fn run<F: Future>(&mut self, future: F) -> Result<F::Output, ExecutionError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = cancelled(&mut self.shutdown) => Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(ExecutionError::Timeout),
            output = future => Ok(output),
        }
    }

    async fn sleep(&mut self, duration: Duration) -> Result<(), ExecutionError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

/// Resolves once the shutdown flag is set. A dropped sender means no
/// cancellation can arrive, so it never resolves then.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned responses in order; `Err` entries become transport errors.
    /// Once the script runs out every request gets `200 {}`.
    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<HttpResponse, String>>>,
        requests: Mutex<Vec<HttpRequest>>,
        latency: Duration,
    }

    impl ScriptedClient {
        fn new<I>(script: I) -> Self
        where
            I: IntoIterator<Item = Result<HttpResponse, String>>,
        {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Self::default()
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
            self.requests.lock().push(request);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Ok(HttpResponse::new(200, "{}")),
            }
        }
    }

    fn ok(status: u16, body: &str) -> Result<HttpResponse, String> {
        Ok(HttpResponse::new(status, body))
    }

    fn scenario(yaml: &str) -> Scenario {
        Scenario::from_yaml(yaml).unwrap()
    }

    fn executor(client: ScriptedClient) -> (Arc<ScriptedClient>, ScenarioExecutor<ScriptedClient>) {
        let client = Arc::new(client);
        let executor =
            ScenarioExecutor::with_state(Arc::clone(&client), Arc::new(StateManager::default()));
        (client, executor)
    }

    #[tokio::test]
    async fn test_on_success_skips_dead_step() {
        let (client, executor) = executor(ScriptedClient::default());
        let result = executor
            .execute(&scenario(
                r#"
name: branching
steps:
  - name: A
    on_success: C
    request: { url: "http://api.test/a" }
    assert: [{ type: status, expected: 200 }]
  - name: B
    request: { url: "http://api.test/b" }
  - name: C
    request: { url: "http://api.test/c" }
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.executed_steps(), vec!["A", "C"]);
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let (client, executor) = executor(ScriptedClient::new([
            ok(500, "oops"),
            ok(500, "oops"),
            ok(200, "fine"),
        ]));
        let result = executor
            .execute(&scenario(
                r#"
name: retry
steps:
  - name: flaky
    request: { url: "http://api.test/flaky" }
    assert: [{ type: status, expected: 200 }]
    retry: { count: 3, delay: 5ms, on_status: [500] }
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.step_results.len(), 1);
        assert_eq!(result.step_results[0].retry_count, 2);
        assert_eq!(result.step_results[0].status_code, 200);
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_respects_status_filter() {
        let (client, executor) = executor(ScriptedClient::new([ok(404, ""), ok(200, "")]));
        let result = executor
            .execute(&scenario(
                r#"
name: no retry
steps:
  - name: missing
    request: { url: "http://api.test/missing" }
    assert: [{ type: status, expected: 200 }]
    retry: { count: 2, delay: 1ms, on_status: [503] }
"#,
            ))
            .await;

        assert!(!result.success);
        assert_eq!(client.requests().len(), 1);
        assert_eq!(result.step_results[0].retry_count, 0);
        assert_eq!(
            result.error.as_deref(),
            Some("step 'missing' failed: assertion failed: expected status to be 200, got 404")
        );
    }

    #[tokio::test]
    async fn test_transport_errors_are_always_retried() {
        let (client, executor) = executor(ScriptedClient::new([
            Err("connection refused".to_string()),
            ok(200, ""),
        ]));
        let result = executor
            .execute(&scenario(
                r#"
name: transport
steps:
  - name: connect
    request: { url: "http://api.test/" }
    retry: { count: 1, delay: 1ms, on_status: [503] }
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(client.requests().len(), 2);
        assert_eq!(result.step_results[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_transport_error_fails_step() {
        let (_, executor) = executor(ScriptedClient::new([Err("connection reset".to_string())]));
        let result = executor
            .execute(&scenario(
                "name: down\nsteps:\n  - name: ping\n    request: { url: \"http://api.test/\" }\n    assert: [{ type: status, expected: 200 }]\n",
            ))
            .await;

        assert!(!result.success);
        let step = &result.step_results[0];
        assert_eq!(step.status_code, 0);
        assert!(step.assertions.is_empty());
        assert_eq!(step.error.as_deref(), Some("request failed: connection reset"));
    }

    #[tokio::test]
    async fn test_loop_guard() {
        let (client, executor) = executor(ScriptedClient::default());
        let executor = executor.with_max_steps(5);
        let result = executor
            .execute(&scenario(
                r#"
name: forever
steps:
  - name: again
    on_success: again
    request: { url: "http://api.test/poll" }
"#,
            ))
            .await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("max steps exceeded (possible infinite loop)")
        );
        assert_eq!(result.step_results.len(), 5);
        assert_eq!(client.requests().len(), 5);
    }

    #[tokio::test]
    async fn test_token_flows_into_next_request() {
        let (client, executor) = executor(ScriptedClient::new([
            ok(200, r#"{"token":"abc123"}"#),
            ok(200, r#"{"items":[1,2]}"#),
        ]));
        let result = executor
            .execute(&scenario(
                r#"
name: login flow
variables:
  base: http://api.test
  user: alice
steps:
  - name: login
    request:
      method: post
      url: "{{base}}/login"
      body: { user: "{{user}}" }
    extract:
      - { name: token, type: jsonpath, pattern: token, required: true }
  - name: data
    request:
      url: "{{base}}/data?token={{token}}"
      headers:
        Authorization: "Bearer {{token}}"
    assert:
      - { type: jsonpath, target: items.1, expected: 2 }
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        let requests = client.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].body.as_deref(), Some(r#"{"user":"alice"}"#));
        assert_eq!(requests[0].header("content-type"), Some("application/json"));
        assert_eq!(requests[1].url, "http://api.test/data?token=abc123");
        assert_eq!(requests[1].header("authorization"), Some("Bearer abc123"));
        assert_eq!(result.step_results[0].extractions["token"], "abc123");
        assert_eq!(result.variables["token"], "abc123");
        assert_eq!(result.variables["user"], "alice");
        assert_eq!(
            executor.state().pool().get_latest("token").as_deref(),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn test_missing_required_extraction_aborts_step() {
        let (_, executor) = executor(ScriptedClient::new([ok(200, r#"{"other":1}"#)]));
        let result = executor
            .execute(&scenario(
                r#"
name: extraction
steps:
  - name: login
    request: { url: "http://api.test/login" }
    extract:
      - { name: token, type: jsonpath, pattern: token, required: true }
    assert: [{ type: status, expected: 200 }]
  - name: never
    request: { url: "http://api.test/never" }
"#,
            ))
            .await;

        assert!(!result.success);
        assert_eq!(result.executed_steps(), vec!["login"]);
        let step = &result.step_results[0];
        assert!(step.assertions.is_empty());
        assert!(step.error.as_deref().unwrap().contains("required value 'token' not found"));
    }

    #[tokio::test]
    async fn test_failure_branch_keeps_run_alive() {
        let (_, executor) = executor(ScriptedClient::new([ok(401, ""), ok(200, "")]));
        let result = executor
            .execute(&scenario(
                r#"
name: recover
steps:
  - name: login
    on_failure: recover
    request: { url: "http://api.test/login" }
    assert:
      - { type: status, expected: 200 }
      - { type: contains, expected: welcome }
  - name: skipped
    request: { url: "http://api.test/skipped" }
  - name: recover
    request: { url: "http://api.test/recover" }
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.executed_steps(), vec!["login", "recover"]);
        let login = &result.step_results[0];
        assert!(!login.success);
        assert_eq!(login.assertions.len(), 2);
        assert!(login.assertions.iter().all(|a| !a.passed));
    }

    #[tokio::test]
    async fn test_conditions_and_callback() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let (client, executor) = executor(ScriptedClient::default());
        let executor = executor.on_step(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let result = executor
            .execute(&scenario(
                r#"
name: conditional
variables:
  mode: fast
steps:
  - name: slow_path
    condition: mode==slow
    request: { url: "http://api.test/slow" }
  - name: fast_path
    condition: "{{?exists:mode:mode==fast:false}}"
    request: { url: "http://api.test/fast" }
  - name: expected_from_vars
    request: { url: "http://api.test/status" }
    assert: [{ type: status, expected: "{{code:200}}" }]
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.executed_steps(), vec!["fast_path", "expected_from_vars"]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(client.requests()[0].url, "http://api.test/fast");
    }

    #[tokio::test]
    async fn test_deadline_during_request() {
        let client = ScriptedClient::default().with_latency(Duration::from_millis(500));
        let (_, executor) = executor(client);
        let executor = executor.with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let result = executor
            .execute(&scenario(
                "name: slow\nsteps:\n  - name: wait\n    request: { url: \"http://api.test/\" }\n",
            ))
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("execution timeout"));
        assert!(result.step_results.is_empty());
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_delay() {
        let (_, executor) = executor(ScriptedClient::default());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let started = Instant::now();
        let result = executor
            .execute_with_shutdown(
                &scenario(
                    "name: sleepy\nsteps:\n  - name: first\n    request: { url: \"http://api.test/1\" }\n  - name: later\n    delay: 10s\n    request: { url: \"http://api.test/2\" }\n",
                ),
                rx,
            )
            .await;

        assert_eq!(result.error.as_deref(), Some("execution cancelled"));
        assert_eq!(result.executed_steps(), vec!["first"]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_extracted_values_expire_with_pool() {
        let state = Arc::new(StateManager::new(PoolConfig {
            default_ttl: HumanDuration(Duration::from_millis(50)),
            cleanup_interval: HumanDuration(Duration::ZERO),
            ..PoolConfig::default()
        }));
        let client = Arc::new(ScriptedClient::new([ok(200, r#"{"token":"abc"}"#)]));
        let executor = ScenarioExecutor::with_state(client, Arc::clone(&state));
        let result = executor
            .execute(&scenario(
                r#"
name: short lived
steps:
  - name: login
    request: { url: "http://api.test/login" }
    extract:
      - { name: token, type: jsonpath, pattern: token }
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.variables["token"], "abc");
        assert_eq!(state.substitute("{{token}}"), "abc");
        assert!(state.engine().variables().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!state.pool().has("token"));
        assert_eq!(state.substitute("{{token}}"), "{{token}}");
    }

    #[tokio::test]
    async fn test_extraction_overrides_scenario_variable() {
        let (client, executor) = executor(ScriptedClient::new([ok(200, r#"{"token":"fresh"}"#)]));
        let result = executor
            .execute(&scenario(
                r#"
name: override
variables:
  token: seed
steps:
  - name: login
    request: { url: "http://api.test/login?t={{token}}" }
    extract:
      - { name: token, type: jsonpath, pattern: token }
  - name: use
    request: { url: "http://api.test/use?t={{token}}" }
"#,
            ))
            .await;

        assert!(result.success, "{:?}", result.error);
        let requests = client.requests();
        assert_eq!(requests[0].url, "http://api.test/login?t=seed");
        assert_eq!(requests[1].url, "http://api.test/use?t=fresh");
        assert_eq!(result.variables["token"], "fresh");
    }

    #[tokio::test]
    async fn test_scenario_variables_stay_in_their_run() {
        let (client, executor) = executor(ScriptedClient::default());
        let first = executor
            .execute(&scenario(
                r#"
name: a
variables:
  env: staging
steps:
  - name: s
    request: { url: "http://api.test/{{env}}" }
"#,
            ))
            .await;
        let second = executor
            .execute(&scenario(
                r#"
name: b
steps:
  - name: s
    condition: "!exists:env"
    request: { url: "http://api.test/{{env:prod}}" }
"#,
            ))
            .await;

        assert!(first.success && second.success);
        assert_eq!(second.executed_steps(), vec!["s"]);
        assert!(!second.variables.contains_key("env"));
        let urls: Vec<String> = client.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["http://api.test/staging", "http://api.test/prod"]);
        assert!(executor.state().engine().variables().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_steps_count_toward_loop_guard() {
        let yaml = r#"
name: mostly skipped
steps:
  - name: off1
    condition: "exists:never_set_anywhere"
    request: { url: "http://api.test/1" }
  - name: off2
    condition: "exists:never_set_anywhere"
    request: { url: "http://api.test/2" }
  - name: on
    request: { url: "http://api.test/3" }
"#;
        let (client, guarded) = executor(ScriptedClient::default());
        let result = guarded.with_max_steps(2).execute(&scenario(yaml)).await;
        assert_eq!(
            result.error.as_deref(),
            Some("max steps exceeded (possible infinite loop)")
        );
        assert!(result.step_results.is_empty());
        assert!(client.requests().is_empty());

        let (client, guarded) = executor(ScriptedClient::default());
        let result = guarded.with_max_steps(3).execute(&scenario(yaml)).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.executed_steps(), vec!["on"]);
        assert_eq!(client.requests().len(), 1);
    }

    const RETRY_FOREVER: &str = r#"
name: stuck
steps:
  - name: flaky
    request: { url: "http://api.test/flaky" }
    assert: [{ type: status, expected: 200 }]
    retry: { count: 5, delay: 10s }
"#;

    #[tokio::test]
    async fn test_shutdown_interrupts_retry_wait() {
        let (client, executor) = executor(ScriptedClient::new([ok(503, "")]));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let started = Instant::now();
        let result = executor
            .execute_with_shutdown(&scenario(RETRY_FOREVER), rx)
            .await;

        assert_eq!(result.error.as_deref(), Some("execution cancelled"));
        assert!(result.step_results.is_empty());
        assert_eq!(client.requests().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_retry_wait() {
        let (client, executor) = executor(ScriptedClient::new([ok(503, "")]));
        let executor = executor.with_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let result = executor.execute(&scenario(RETRY_FOREVER)).await;

        assert_eq!(result.error.as_deref(), Some("execution timeout"));
        assert!(result.step_results.is_empty());
        assert_eq!(client.requests().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unknown_branch_targets_in_code_built_scenario() {
        let mut built = scenario(
            r#"
name: built
steps:
  - name: first
    request: { url: "http://api.test/1" }
    assert: [{ type: status, expected: 200 }]
  - name: second
    request: { url: "http://api.test/2" }
    assert: [{ type: status, expected: 200 }]
  - name: third
    request: { url: "http://api.test/3" }
"#,
        );
        built.steps[0].on_success = Some("ghost".to_string());
        built.steps[1].on_failure = Some("ghost".to_string());

        let (client, executor) = executor(ScriptedClient::new([ok(200, ""), ok(500, "")]));
        let result = executor.execute(&built).await;

        assert!(!result.success);
        assert_eq!(result.executed_steps(), vec!["first", "second"]);
        assert_eq!(
            result.error.as_deref(),
            Some("step 'second' failed: assertion failed: expected status to be 200, got 500")
        );
        assert_eq!(client.requests().len(), 2);
    }

    #[test]
    fn test_options_from_yaml() {
        let options: ExecutorOptions =
            serde_yaml::from_str("max_steps: 7\ntimeout: 1m30s\n").unwrap();
        assert_eq!(options.max_steps, 7);
        assert_eq!(options.timeout.as_duration(), Duration::from_secs(90));

        let defaults: ExecutorOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(defaults.max_steps, 100);
        assert_eq!(defaults.timeout.as_duration(), Duration::from_secs(300));
    }
}
