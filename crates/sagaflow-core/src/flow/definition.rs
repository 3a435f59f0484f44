//! Flow definition parsing, validation, and filesystem operations.
//!
//! Converts YAML/JSON documents into `FlowDefinition`s, validates structural
//! constraints (unique IDs, known references, sane limits), and discovers
//! flow files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use sagaflow_types::flow::{FlowDefinition, StepKind};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or registering flow definitions.
#[derive(Debug, Error)]
pub enum FlowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A step references an undeclared step.
    #[error("unknown step reference: {0}")]
    UnknownReference(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML flow definition.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDefinition, FlowError> {
    let def: FlowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| FlowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse and validate a JSON flow definition.
pub fn parse_flow_json(json: &str) -> Result<FlowDefinition, FlowError> {
    let def: FlowDefinition =
        serde_json::from_str(json).map_err(|e| FlowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a definition to YAML.
pub fn serialize_flow_yaml(def: &FlowDefinition) -> Result<String, FlowError> {
    serde_yaml_ng::to_string(def).map_err(|e| FlowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `FlowDefinition`.
///
/// Checks:
/// - Flow ID is non-empty and at least one step exists
/// - Step IDs are non-empty and unique
/// - `depends_on`, branch, parallel and loop-body references name declared steps
/// - No step owns itself, directly or through other composite steps
/// - Timeouts are > 0 and retry `max_attempts` >= 1
/// - Loop `items_key`, subflow `flow_id` and condition `handler` are non-empty
///
/// Dependency cycles are not rejected: the scheduler omits
/// cyclic steps and `dag::find_cycles` reports them.
pub fn validate_definition(def: &FlowDefinition) -> Result<(), FlowError> {
    if def.id.trim().is_empty() {
        return Err(FlowError::ValidationError(
            "flow id must not be empty".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(FlowError::ValidationError(format!(
            "flow '{}' must have at least one step",
            def.id
        )));
    }
    if def.timeout_ms == Some(0) {
        return Err(FlowError::ValidationError(
            "flow timeout_ms must be > 0".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(FlowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(FlowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(FlowError::UnknownReference(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
        for owned in step.owned_step_ids() {
            if !seen_ids.contains(owned) {
                return Err(FlowError::UnknownReference(format!(
                    "{} step '{}' references unknown step '{}'",
                    step.kind.label(),
                    step.id,
                    owned
                )));
            }
        }

        match &step.kind {
            StepKind::Task(task) => {
                if task.timeout_ms == Some(0) {
                    return Err(FlowError::ValidationError(format!(
                        "step '{}' timeout_ms must be > 0",
                        step.id
                    )));
                }
                if let Some(retry) = &task.retry {
                    if retry.max_attempts < 1 {
                        return Err(FlowError::ValidationError(format!(
                            "step '{}' retry max_attempts must be >= 1",
                            step.id
                        )));
                    }
                    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 0.0 {
                        return Err(FlowError::ValidationError(format!(
                            "step '{}' retry backoff_multiplier must be a non-negative number",
                            step.id
                        )));
                    }
                }
            }
            StepKind::Condition { handler, .. } if handler.trim().is_empty() => {
                return Err(FlowError::ValidationError(format!(
                    "condition step '{}' requires a handler",
                    step.id
                )));
            }
            StepKind::Loop(lp) if lp.items_key.trim().is_empty() => {
                return Err(FlowError::ValidationError(format!(
                    "loop step '{}' requires items_key",
                    step.id
                )));
            }
            StepKind::Subflow { flow_id } if flow_id.trim().is_empty() => {
                return Err(FlowError::ValidationError(format!(
                    "subflow step '{}' requires flow_id",
                    step.id
                )));
            }
            _ => {}
        }
    }

    // Composite steps executing themselves would recurse forever.
    let mut ownership = DiGraphMap::<&str, ()>::new();
    for step in &def.steps {
        ownership.add_node(step.id.as_str());
        for owned in step.owned_step_ids() {
            ownership.add_edge(step.id.as_str(), owned, ());
        }
    }
    if is_cyclic_directed(&ownership) {
        return Err(FlowError::ValidationError(format!(
            "flow '{}' has a step that (transitively) contains itself",
            def.id
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a flow definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_flow_file(path: &Path) -> Result<FlowDefinition, FlowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_flow_json(&content),
        _ => parse_flow_yaml(&content),
    }
}

/// Save a flow definition as YAML, creating parent directories.
pub fn save_flow_file(path: &Path, def: &FlowDefinition) -> Result<(), FlowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_flow_yaml(def)?)?;
    Ok(())
}

/// Discover flow files (`.yaml`, `.yml`, `.json`) under `base_dir`, recursively.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_flows(base_dir: &Path) -> Result<Vec<(PathBuf, FlowDefinition)>, FlowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, FlowDefinition)>,
) -> Result<(), FlowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_flow_file = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_flow_file {
            continue;
        }
        match load_flow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid flow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
