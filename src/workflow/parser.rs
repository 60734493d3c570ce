//! Workflow Parser
//!
//! Handles loading and saving workflow definition documents. Definitions
//! are accepted as YAML or JSON; the format is chosen from the file
//! extension when loading from disk.

use std::fmt;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::EngineError;

/// Serialization format of a definition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    /// Picks the format from a file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

impl fmt::Display for DefinitionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("JSON"),
            Self::Yaml => f.write_str("YAML"),
        }
    }
}

/// Parses a definition document without validating it.
pub fn parse_definition(text: &str, format: DefinitionFormat) -> Result<WorkflowDefinition, EngineError> {
    let parsed = match format {
        DefinitionFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
        DefinitionFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
    };

    let definition: WorkflowDefinition = parsed.map_err(|e| {
        EngineError::DefinitionInvalid(format!(
            "Failed to parse workflow {}: {}. Check the document format.",
            format, e
        ))
    })?;

    debug!(
        "Parsed definition '{}' with {} steps",
        definition.name,
        definition.steps.len()
    );
    Ok(definition)
}

/// Loads a definition from a file and validates it.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("pipeline.yaml")?;
///     println!("Loaded {} steps", definition.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition, EngineError> {
    let path = path.as_ref();
    info!("Loading workflow definition from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::DefinitionInvalid(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("Definition content loaded ({} bytes)", content.len());

    let definition = parse_definition(&content, DefinitionFormat::from_path(path))?;
    validate_definition(&definition)?;

    Ok(definition)
}

/// Saves a definition to a file, in the format implied by its extension.
pub fn save_definition(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<(), EngineError> {
    let path = path.as_ref();
    let content = match DefinitionFormat::from_path(path) {
        DefinitionFormat::Json => serde_json::to_string_pretty(definition)
            .map_err(|e| EngineError::DefinitionInvalid(e.to_string()))?,
        DefinitionFormat::Yaml => serde_yaml::to_string(definition)
            .map_err(|e| EngineError::DefinitionInvalid(e.to_string()))?,
    };

    fs::write(path, content).map_err(|e| EngineError::Store(e.into()))?;
    info!("Workflow definition saved to: {}", path.display());
    Ok(())
}
