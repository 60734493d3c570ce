//! FlowRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner workflow.yaml
//!
//! # Seed the context
//! flowrunner workflow.yaml --input region=eu --input retries=3
//!
//! # Persist workflows and executions under a directory
//! flowrunner workflow.yaml --state-dir ./.flowrunner
//!
//! # Print the step timeline after the run
//! flowrunner workflow.yaml --timeline
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use flowrunner::execution::{EchoAgent, ExecutorRegistry, Orchestrator};
use flowrunner::store::{FileStore, MemoryStore};
use flowrunner::workflow::{load_definition, Context, ExecutionStatus, StepStatus, WorkflowExecution};
use flowrunner::{EngineConfig, APP_NAME, VERSION};

/// Default definition file used when none is specified.
const DEFAULT_DEFINITION: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    definition_path: String,
    inputs: Vec<(String, Value)>,
    input_file: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
    timeline: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definition_path: DEFAULT_DEFINITION.to_string(),
            inputs: Vec::new(),
            input_file: None,
            state_dir: None,
            config_path: None,
            timeline: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Asynchronous Workflow Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <DEFINITION_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>     Path to workflow definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --input KEY=VALUE     Add an input value (JSON, or plain text)");
    println!("  --input-file PATH     Read input values from a JSON object file");
    println!("  --state-dir PATH      Persist workflows and executions under PATH");
    println!("  --config PATH         Engine configuration file");
    println!("  --timeline            Print the step timeline after the run");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner pipeline.yaml");
    println!("  flowrunner pipeline.yaml --input region=eu --timeline");
    println!("  flowrunner pipeline.json --state-dir ./.flowrunner");
}

/// Parses `KEY=VALUE`; values that are valid JSON keep their type.
fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid input '{}', expected KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid input '{}', key is empty", raw));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--timeline" => {
                config.timeline = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--input" | "-i" => {
                i += 1;
                if i >= args.len() {
                    return Err("--input requires a KEY=VALUE argument".to_string());
                }
                config.inputs.push(parse_input(&args[i])?);
            }
            "--input-file" => {
                i += 1;
                if i >= args.len() {
                    return Err("--input-file requires a path argument".to_string());
                }
                config.input_file = Some(PathBuf::from(&args[i]));
            }
            "--state-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--state-dir requires a path argument".to_string());
                }
                config.state_dir = Some(PathBuf::from(&args[i]));
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                config.config_path = Some(PathBuf::from(&args[i]));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.definition_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Builds the execution input from `--input-file` and `--input` values.
///
/// Command-line values override file values.
fn build_input(config: &Config) -> Result<Context, Box<dyn std::error::Error>> {
    let mut input = match &config.input_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read input file {}: {}", path.display(), e))?;
            match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => map,
                _ => return Err(format!("Input file {} must hold a JSON object", path.display()).into()),
            }
        }
        None => Context::new(),
    };

    for (key, value) in &config.inputs {
        input.insert(key.clone(), value.clone());
    }
    Ok(input)
}

/// Loads engine configuration from `--config` or the default location.
fn load_engine_config(path: Option<&PathBuf>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(EngineConfig::resolve());
    };

    let mut config = EngineConfig::load(path)
        .map_err(|e| format!("Could not load configuration from '{}': {}", path.display(), e))?;
    config.apply_env_overrides();
    Ok(config)
}

/// Creates the orchestrator over the selected storage backend.
async fn build_orchestrator(
    config: &Config,
    engine_config: EngineConfig,
) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let registry = ExecutorRegistry::with_builtins(Arc::new(EchoAgent));

    match &config.state_dir {
        Some(dir) => {
            info!("State directory: {}", dir.display());
            let store = Arc::new(FileStore::open(dir).await?);
            Ok(Orchestrator::new(store.clone(), store, registry, engine_config))
        }
        None => Ok(Orchestrator::in_memory(registry, engine_config)),
    }
}

/// Prints the outcome of an execution.
fn print_summary(execution: &WorkflowExecution) {
    let status = execution.status.to_string();
    let status = match execution.status {
        ExecutionStatus::Completed => status.green().bold(),
        ExecutionStatus::Cancelled => status.yellow().bold(),
        _ => status.red().bold(),
    };

    println!();
    println!("Execution {}: {}", execution.id, status);
    println!(
        "  Steps:    {}/{} settled",
        execution.completed_steps, execution.total_steps
    );
    println!("  Duration: {} ms", execution.duration_ms.unwrap_or(0));

    for (name, record) in &execution.steps {
        let label = format!("{:?}", record.status);
        let label = match record.status {
            StepStatus::Completed => label.green(),
            StepStatus::Skipped | StepStatus::Pending => label.dimmed(),
            StepStatus::Cancelled => label.yellow(),
            StepStatus::Failed | StepStatus::Running => label.red(),
        };
        match &record.error {
            Some(err) => println!("  {:<24} {} ({})", name, label, err),
            None => println!("  {:<24} {}", name, label),
        }
    }

    if let Some(message) = &execution.error_message {
        println!();
        println!("  {}", message.red());
    }

    if let Some(output) = &execution.output {
        match serde_json::to_string_pretty(output) {
            Ok(text) => {
                println!();
                println!("Output:");
                println!("{}", text);
            }
            Err(e) => warn!("Could not render output: {}", e),
        }
    }
}

/// Main application entry point.
async fn run() -> Result<ExecutionStatus, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let engine_config = load_engine_config(config.config_path.as_ref())?;
    let input = build_input(&config)?;

    // Load definition
    info!("Loading workflow: {}", config.definition_path);
    let definition = load_definition(&config.definition_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.definition_path, e
        )
    })?;

    let orchestrator = build_orchestrator(&config, engine_config).await?;

    // Reuse the catalog entry when the state directory already knows this workflow
    let name = definition.name.clone();
    let workflow = match orchestrator.get_workflow_by_name(&name).await {
        Ok(existing) => orchestrator.update_workflow_definition(&existing.id, definition).await?,
        Err(_) => {
            let description = definition.description.clone();
            orchestrator.create_workflow(&name, &description, definition).await?
        }
    };
    let workflow = orchestrator.activate_workflow(&workflow.id).await?;

    // Execute workflow
    let running = orchestrator.execute_workflow(&workflow.id, input).await?;
    info!("Execution started: {}", running.id());

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling running executions");
                orchestrator.cancel_all().await;
            }
        })
    };

    let execution = running.wait().await?;
    interrupt.abort();

    print_summary(&execution);
    if config.timeline {
        println!("{}", execution.timeline.gantt_chart());
    }

    Ok(execution.status)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(ExecutionStatus::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("flowrunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_arguments_defaults() {
        let config = parse_arguments(&args(&[])).unwrap();
        assert_eq!(config.definition_path, DEFAULT_DEFINITION);
        assert!(config.inputs.is_empty());
        assert!(!config.timeline);
    }

    #[test]
    fn test_parse_arguments_full() {
        let config = parse_arguments(&args(&[
            "flow.json",
            "--input",
            "count=3",
            "-i",
            "name=world",
            "--state-dir",
            "/tmp/state",
            "--timeline",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.definition_path, "flow.json");
        assert_eq!(config.inputs[0], ("count".to_string(), json!(3)));
        assert_eq!(config.inputs[1], ("name".to_string(), json!("world")));
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/state")));
        assert!(config.timeline && config.verbose);
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["--input"])).is_err());
        assert!(parse_arguments(&args(&["--input", "novalue"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }

    #[test]
    fn test_build_input_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, r#"{"a": 1, "b": 2}"#).unwrap();

        let config = Config {
            input_file: Some(path),
            inputs: vec![("b".to_string(), json!(5))],
            ..Config::default()
        };
        let input = build_input(&config).unwrap();

        assert_eq!(input["a"], 1);
        assert_eq!(input["b"], 5);
    }
}
