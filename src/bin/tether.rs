//! Tether CLI - runs YAML HTTP scenarios and reports the results.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use tether::{
    EngineConfig, ExecutionResult, HumanDuration, ReqwestClient, Scenario, ScenarioExecutor,
    ScenarioLoader, StateManager, ValuePool,
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Tether - stateful HTTP scenario runner.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Scenario file or directory.
    #[arg(short = 'p', long = "path", env = "TETHER_PATH")]
    path: Option<PathBuf>,

    /// Only run scenarios whose name contains this text.
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Deadline per scenario, e.g. `90s` or `5m`.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<HumanDuration>,

    /// Loop guard: maximum step iterations per scenario.
    #[arg(long = "max-steps")]
    max_steps: Option<usize>,

    /// Engine configuration file (YAML).
    #[arg(short = 'c', long = "config", env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Override a scenario variable, `KEY=VALUE`. Repeatable.
    #[arg(short = 'e', long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Seed the value pool from a JSON snapshot.
    #[arg(long = "pool-in")]
    pool_in: Option<PathBuf>,

    /// Write the value pool to a JSON snapshot when done.
    #[arg(long = "pool-out")]
    pool_out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_result(result: &ExecutionResult, verbose: bool) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} scenario: {} ({} ms)",
        status, result.scenario_name, result.duration_ms
    );

    for (i, step) in result.step_results.iter().enumerate() {
        let mark = if step.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        let retries = if step.retry_count > 0 {
            format!(", {} retries", step.retry_count)
        } else {
            String::new()
        };
        info!(
            "  {}. {} {} [{}] ({} ms{})",
            i + 1,
            mark,
            step.step_name,
            step.status_code,
            step.response_time_ms,
            retries
        );

        if let Some(error) = &step.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }

        if verbose {
            for (name, value) in &step.extractions {
                debug!("     Extracted {} = {}", name, value);
            }
            for assertion in &step.assertions {
                debug!(
                    "     {} {} {} -> {}",
                    if assertion.passed { "ok" } else { "FAILED" },
                    assertion.kind,
                    assertion.expected,
                    assertion.actual
                );
            }
        }
    }

    if let Some(error) = &result.error {
        error!("  \x1b[31m{}\x1b[0m", error);
    }
}

fn render_text_report(result: &ExecutionResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Scenario: {}", result.scenario_name);
    let _ = writeln!(out, "Status: {}", if result.success { "PASS" } else { "FAIL" });
    if let Some(error) = &result.error {
        let _ = writeln!(out, "Error: {error}");
    }
    let _ = writeln!(out, "Started: {}", result.start_time.to_rfc3339());
    let _ = writeln!(out, "Duration: {} ms\n", result.duration_ms);
    let _ = writeln!(out, "Steps:");
    for (i, step) in result.step_results.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {}. {} ({}) status={} time={}ms retries={}",
            i + 1,
            step.step_name,
            if step.success { "PASS" } else { "FAIL" },
            step.status_code,
            step.response_time_ms,
            step.retry_count
        );
        if let Some(error) = &step.error {
            let _ = writeln!(out, "     Error: {error}");
        }
    }
    if !result.variables.is_empty() {
        let _ = writeln!(out, "\nVariables:");
        for (name, value) in &result.variables {
            let _ = writeln!(out, "  {name} = {value}");
        }
    }
    out
}

fn save_report(
    result: &ExecutionResult,
    report_dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    fs::create_dir_all(report_dir).context(format!(
        "Failed to create report directory: {}",
        report_dir.display()
    ))?;

    let timestamp = Utc::now().timestamp();
    let name = result.scenario_name.replace([' ', '/'], "_");
    let (extension, content) = match format {
        ReportFormat::Json => ("json", serde_json::to_string_pretty(result)?),
        ReportFormat::Yaml => ("yaml", serde_yaml::to_string(result)?),
        ReportFormat::Text => ("txt", render_text_report(result)),
    };

    let path = report_dir.join(format!("{name}-{timestamp}.{extension}"));
    fs::write(&path, content).context(format!("Failed to write report: {}", path.display()))?;
    Ok(path)
}

fn load_scenarios(path: Option<&Path>) -> Result<Vec<Scenario>> {
    let mut loader = ScenarioLoader::new();
    for default in ["tests/scenarios", "test/scenarios"] {
        if Path::new(default).is_dir() {
            loader.add_path(default);
        }
    }

    let scenarios = match path {
        Some(path) => {
            if !path.exists() {
                bail!("Path does not exist: {}", path.display());
            }
            loader.load_path(path)?
        }
        None => loader.load_all_scenarios()?,
    };

    if scenarios.is_empty() {
        return Err(anyhow!("No scenarios found"));
    }
    Ok(scenarios)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(timeout) = args.timeout {
        config.executor.timeout = timeout;
    }
    if let Some(max_steps) = args.max_steps {
        config.executor.max_steps = max_steps;
    }

    let mut scenarios = load_scenarios(args.path.as_deref())?;
    if let Some(filter) = &args.filter {
        let filter = filter.to_lowercase();
        scenarios.retain(|s| s.name.to_lowercase().contains(&filter));
        if scenarios.is_empty() {
            bail!("No scenarios matching the filter were found");
        }
    }

    let pool = Arc::new(ValuePool::new(config.pool.clone()));
    if let Some(path) = &args.pool_in {
        let json = fs::read_to_string(path)
            .context(format!("Failed to read pool snapshot: {}", path.display()))?;
        let imported = pool.import_json(&json)?;
        info!("Imported {} pool values from {}", imported, path.display());
    }

    let client = Arc::new(ReqwestClient::new());
    let total = scenarios.len();
    let started = Instant::now();
    let mut passed = 0;

    info!("Running {} scenario(s)...", total);
    for (idx, mut scenario) in scenarios.into_iter().enumerate() {
        scenario.variables.extend(args.vars.iter().cloned());

        info!("Scenario {}/{}: {}", idx + 1, total, scenario.name);
        let state = Arc::new(StateManager::with_pool(Arc::clone(&pool)));
        let executor = ScenarioExecutor::with_state(Arc::clone(&client), state)
            .with_options(config.executor.clone());
        let result = executor.execute(&scenario).await;
        print_result(&result, args.verbose);

        if let Some(dir) = &args.report_dir {
            match save_report(&result, dir, args.report_format) {
                Ok(path) => info!("Report saved: {}", path.display()),
                Err(e) => error!("Failed to save report: {:#}", e),
            }
        }
        if result.success {
            passed += 1;
        }
    }

    let failed = total - passed;
    info!("Summary:");
    info!("  Total: {}", total);
    info!("  \x1b[32mPassed: {}\x1b[0m", passed);
    info!("  \x1b[31mFailed: {}\x1b[0m", failed);
    info!("  Duration: {} ms", started.elapsed().as_millis());

    if let Some(path) = &args.pool_out {
        fs::write(path, pool.to_json()?)
            .context(format!("Failed to write pool snapshot: {}", path.display()))?;
        info!("Pool snapshot written to {}", path.display());
    }
    pool.close().await;

    if failed > 0 {
        exit(1);
    }
    Ok(())
}
