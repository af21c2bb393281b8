//! Scenario discovery and engine configuration files.

use crate::executor::ExecutorOptions;
use crate::model::Scenario;
use crate::pool::PoolConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Engine settings loaded from YAML. Every section and field is
/// optional.
///
/// ```yaml
/// pool:
///   default_ttl: 10m
///   max_entries_per_key: 20
/// executor:
///   max_steps: 50
///   timeout: 2m
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub executor: ExecutorOptions,
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse engine configuration")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content).context(format!("Invalid config file: {}", path.display()))
    }
}

/// Finds and loads scenario files.
#[derive(Debug)]
pub struct ScenarioLoader {
    pub search_paths: Vec<PathBuf>,
}

impl ScenarioLoader {
    /// Loader searching `scenarios/` by default.
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("scenarios")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load and validate one YAML scenario file.
    pub fn load_scenario<P: AsRef<Path>>(&self, path: P) -> Result<Scenario> {
        let path = path.as_ref();
        info!("Loading scenario from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read scenario file: {}", path.display()))?;
        let scenario = Scenario::from_yaml(&content)
            .context(format!("Failed to load scenario from {}", path.display()))?;

        debug!("Loaded scenario: {}", scenario.name);
        Ok(scenario)
    }

    /// Load every `.yaml`/`.yml` file directly inside `dir`, sorted by
    /// file name. Files that fail to load are logged and skipped.
    pub fn load_scenarios_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<Scenario>> {
        let dir = dir.as_ref();
        info!("Loading scenarios from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_scenario_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut scenarios = Vec::new();
        for path in paths {
            match self.load_scenario(&path) {
                Ok(scenario) => scenarios.push(scenario),
                Err(err) => warn!("Skipping {}: {:#}", path.display(), err),
            }
        }

        info!("Loaded {} scenarios from {}", scenarios.len(), dir.display());
        Ok(scenarios)
    }

    /// Load a single file or a whole directory.
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Scenario>> {
        let path = path.as_ref();
        if path.is_dir() {
            self.load_scenarios_from_dir(path)
        } else {
            Ok(vec![self.load_scenario(path)?])
        }
    }

    /// Load from every search path that exists.
    pub fn load_all_scenarios(&self) -> Result<Vec<Scenario>> {
        let mut all = Vec::new();
        for path in &self.search_paths {
            if !path.is_dir() {
                debug!("Search path {} does not exist", path.display());
                continue;
            }
            match self.load_scenarios_from_dir(path) {
                Ok(mut scenarios) => all.append(&mut scenarios),
                Err(err) => warn!("Failed to load scenarios from {}: {:#}", path.display(), err),
            }
        }

        info!("Loaded {} scenarios in total", all.len());
        Ok(all)
    }
}

impl Default for ScenarioLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_scenario_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
