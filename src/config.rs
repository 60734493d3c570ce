//! Engine Configuration
//!
//! Tunables for the orchestrator: default timeouts, retry backoff, the
//! per-wave concurrency bound, and the shell used by `script` steps.
//!
//! # Resolution Priority
//!
//! The configuration file is resolved in the following order:
//! 1. `FLOWRUNNER_CONFIG` environment variable
//! 2. `flowrunner.yaml` next to the executable
//! 3. `flowrunner.yaml` in the current working directory
//!
//! Individual fields can then be overridden with `FLOWRUNNER_*` variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "flowrunner.yaml";

/// Lazily-resolved location of the configuration file.
pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    // Priority 1: Explicit override
    if let Ok(path) = env::var("FLOWRUNNER_CONFIG") {
        if !path.trim().is_empty() {
            info!("Using configuration from FLOWRUNNER_CONFIG: {}", path);
            return PathBuf::from(path);
        }
    }

    // Priority 2: Next to the executable
    if let Ok(exe_path) = env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let prod_path = exe_dir.join(CONFIG_FILE_NAME);
            if prod_path.exists() {
                info!("Using configuration next to executable: {}", prod_path.display());
                return prod_path;
            }
        }
    }

    // Priority 3: Current working directory
    let cwd_path = PathBuf::from(CONFIG_FILE_NAME);
    debug!("Using CWD configuration path: {}", cwd_path.display());
    cwd_path
});

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Per-attempt timeout for steps that declare none
    pub default_step_timeout_secs: Option<u64>,
    /// Whole-run deadline for definitions that declare none
    pub default_workflow_timeout_secs: Option<u64>,
    /// First retry delay; doubles on each further retry
    pub retry_base_delay_ms: u64,
    /// Ceiling for the retry delay
    pub retry_max_delay_ms: u64,
    /// Concurrently running steps within one wave
    pub max_parallel_steps: usize,
    /// Upper bound on `loop` iterations
    pub max_loop_iterations: usize,
    /// Interpreter used for `script` commands (`<shell> -c <command>`)
    pub script_shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: Some(300),
            default_workflow_timeout_secs: None,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            max_parallel_steps: num_cpus::get().max(4),
            max_loop_iterations: 1000,
            script_shell: "bash".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file; YAML unless the extension is `.json`.
    ///
    /// Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: Self = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content).map_err(|e| {
                StoreError::Backend(format!(
                    "Failed to parse configuration '{}': {}",
                    path.display(),
                    e
                ))
            })?
        };

        info!("Loaded configuration from {}", path.display());
        Ok(config.normalized())
    }

    /// Defaults with `FLOWRUNNER_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Loads [`CONFIG_PATH`] when it exists, then applies environment overrides.
    pub fn resolve() -> Self {
        let path: &Path = &CONFIG_PATH;
        let mut config = if path.exists() {
            Self::load(path).unwrap_or_else(|e| {
                warn!("Ignoring configuration {}: {}", path.display(), e);
                Self::default()
            })
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config
    }

    /// Applies `FLOWRUNNER_*` environment variables on top of the current values.
    ///
    /// A timeout of `0` clears the corresponding default.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!("Ignoring {}: invalid value '{}'", key, value);
                    None
                }
            }
        }

        let key = "FLOWRUNNER_STEP_TIMEOUT_SECS";
        if let Some(secs) = parsed::<u64>(key, lookup(key)) {
            self.default_step_timeout_secs = (secs > 0).then_some(secs);
        }
        let key = "FLOWRUNNER_WORKFLOW_TIMEOUT_SECS";
        if let Some(secs) = parsed::<u64>(key, lookup(key)) {
            self.default_workflow_timeout_secs = (secs > 0).then_some(secs);
        }
        let key = "FLOWRUNNER_RETRY_BASE_DELAY_MS";
        if let Some(ms) = parsed(key, lookup(key)) {
            self.retry_base_delay_ms = ms;
        }
        let key = "FLOWRUNNER_RETRY_MAX_DELAY_MS";
        if let Some(ms) = parsed(key, lookup(key)) {
            self.retry_max_delay_ms = ms;
        }
        let key = "FLOWRUNNER_MAX_PARALLEL_STEPS";
        if let Some(n) = parsed(key, lookup(key)) {
            self.max_parallel_steps = n;
        }
        let key = "FLOWRUNNER_MAX_LOOP_ITERATIONS";
        if let Some(n) = parsed(key, lookup(key)) {
            self.max_loop_iterations = n;
        }
        if let Some(shell) = lookup("FLOWRUNNER_SCRIPT_SHELL") {
            if !shell.trim().is_empty() {
                self.script_shell = shell.trim().to_string();
            }
        }

        *self = std::mem::take(self).normalized();
    }

    fn normalized(mut self) -> Self {
        if self.max_parallel_steps == 0 {
            warn!("max_parallel_steps must be at least 1; using 1");
            self.max_parallel_steps = 1;
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            self.retry_max_delay_ms = self.retry_base_delay_ms;
        }
        self
    }

    /// Step timeout as a duration.
    pub fn step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_secs.map(Duration::from_secs)
    }

    /// Workflow timeout as a duration.
    pub fn workflow_timeout(&self) -> Option<Duration> {
        self.default_workflow_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_timeout_secs, Some(300));
        assert_eq!(config.default_workflow_timeout_secs, None);
        assert_eq!(config.retry_base_delay_ms, 100);
        assert_eq!(config.retry_max_delay_ms, 10_000);
        assert!(config.max_parallel_steps >= 4);
        assert_eq!(config.script_shell, "bash");
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_load_yaml_partial() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("flowrunner.yaml");
        std::fs::write(&path, "retryBaseDelayMs: 5\nmaxParallelSteps: 2\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.retry_base_delay_ms, 5);
        assert_eq!(config.max_parallel_steps, 2);
        assert_eq!(config.max_loop_iterations, 1000);
    }

    #[test]
    fn test_load_json() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"defaultWorkflowTimeoutSecs": 30, "scriptShell": "sh"}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.workflow_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.script_shell, "sh");
    }

    #[test]
    fn test_load_invalid() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        std::fs::write(&path, "maxParallelSteps: [[[").unwrap();

        assert!(EngineConfig::load(&path).is_err());
        assert!(matches!(
            EngineConfig::load(temp_dir.path().join("missing.yaml")),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FLOWRUNNER_STEP_TIMEOUT_SECS", "0"),
            ("FLOWRUNNER_WORKFLOW_TIMEOUT_SECS", "90"),
            ("FLOWRUNNER_MAX_PARALLEL_STEPS", "nope"),
            ("FLOWRUNNER_RETRY_BASE_DELAY_MS", "50"),
            ("FLOWRUNNER_SCRIPT_SHELL", " sh "),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        let parallel = config.max_parallel_steps;
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.default_step_timeout_secs, None);
        assert_eq!(config.default_workflow_timeout_secs, Some(90));
        assert_eq!(config.max_parallel_steps, parallel);
        assert_eq!(config.retry_base_delay_ms, 50);
        assert_eq!(config.script_shell, "sh");
    }

    #[test]
    fn test_normalized() {
        let config = EngineConfig {
            max_parallel_steps: 0,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10,
            ..EngineConfig::default()
        }
        .normalized();

        assert_eq!(config.max_parallel_steps, 1);
        assert_eq!(config.retry_max_delay_ms, 500);
    }
}
