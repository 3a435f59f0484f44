//! Flow file subcommands: validate, plan, run and inspect.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value};

use sagaflow_core::flow::dag::{build_execution_plan, find_cycles};
use sagaflow_core::flow::definition::load_flow_file;
use sagaflow_core::flow::{FlowEngine, FlowError};
use sagaflow_core::repository::SnapshotStore;
use sagaflow_infra::snapshot::{FileSnapshotStore, read_snapshot_file};
use sagaflow_types::config::EngineConfig;
use sagaflow_types::flow::FlowDefinition;
use sagaflow_types::run::{FlowRun, FlowStatus, StepStatus, TraceLevel};

use crate::handlers;

/// Longest result preview shown in the step table.
const PREVIEW_CHARS: usize = 60;

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    let cycles = find_cycles(&def.steps);

    if json {
        let out = serde_json::json!({
            "flow_id": def.id,
            "valid": true,
            "steps": def.steps.len(),
            "cycles": cycles,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Flow '{}' is valid ({} steps)",
        style("*").green().bold(),
        style(&def.id).cyan(),
        def.steps.len()
    );
    for cycle in &cycles {
        println!(
            "  {} dependency cycle, these steps never run: {}",
            style("!").yellow().bold(),
            cycle.join(" -> ")
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn plan(file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    let plan = build_execution_plan(&def.steps);

    if json {
        let out = serde_json::json!({
            "flow_id": def.id,
            "plan": plan,
            "cycles": find_cycles(&def.steps),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Type"),
            Cell::new("Depends on"),
            Cell::new("Owns"),
        ]);

    for (position, step_id) in plan.order.iter().enumerate() {
        let Some(step) = def.step(step_id) else {
            continue;
        };
        table.add_row(vec![
            Cell::new(position + 1),
            Cell::new(&step.id),
            Cell::new(step.kind.label()),
            Cell::new(step.depends_on.join(", ")),
            Cell::new(step.owned_step_ids().join(", ")),
        ]);
    }

    println!();
    println!("  Execution plan for '{}'", style(&def.id).cyan());
    println!("{table}");
    if !plan.owned.is_empty() {
        let owned: Vec<&str> = plan.owned.iter().map(String::as_str).collect();
        println!("  Run by their parent step: {}", owned.join(", "));
    }
    if !plan.unscheduled.is_empty() {
        println!(
            "  {} Never run (dependency cycle): {}",
            style("!").yellow().bold(),
            plan.unscheduled.join(", ")
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(
    file: &Path,
    includes: &[PathBuf],
    data: Option<&str>,
    snapshot_dir: Option<&Path>,
    config: EngineConfig,
    json: bool,
) -> Result<()> {
    let data = parse_data(data)?;
    let (engine, run) = execute_file(file, includes, data, config).await?;

    let saved = match snapshot_dir {
        Some(dir) => {
            let snapshot = engine
                .snapshot(run.run_id)
                .context("Finished run is no longer held by the engine")?;
            let store = FileSnapshotStore::new(dir);
            store
                .save(&snapshot)
                .await
                .map_err(|e| anyhow!("Failed to save snapshot: {e}"))?;
            Some(store.path_for(&run.run_id))
        }
        None => None,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
        if let Some(path) = &saved {
            println!("  Snapshot saved to {}", style(path.display()).dim());
            println!();
        }
    }

    if run.status == FlowStatus::Failed {
        bail!(
            "Flow '{}' failed: {}",
            run.flow_id,
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Register the built-in handlers, every included flow and `file`, then run
/// the flow defined in `file` to completion.
pub async fn execute_file(
    file: &Path,
    includes: &[PathBuf],
    data: Map<String, Value>,
    config: EngineConfig,
) -> Result<(FlowEngine, FlowRun)> {
    let engine = FlowEngine::new(config);
    handlers::register_builtin(&engine);

    for include in includes {
        register(&engine, load(include)?, include)?;
    }
    let def = load(file)?;
    let flow_id = def.id.clone();
    register(&engine, def, file)?;

    tracing::info!(flow_id = %flow_id, includes = includes.len(), "running flow");
    let run = engine
        .execute(&flow_id, data)
        .await
        .with_context(|| format!("Failed to run flow '{flow_id}'"))?;
    Ok((engine, run))
}

fn register(engine: &FlowEngine, def: FlowDefinition, file: &Path) -> Result<()> {
    engine
        .register_flow(def)
        .with_context(|| format!("Failed to register {}", file.display()))
}

// ---------------------------------------------------------------------------
// Inspect
// ---------------------------------------------------------------------------

pub async fn inspect(file: &Path, json: bool) -> Result<()> {
    let snapshot = read_snapshot_file(file)
        .await
        .map_err(|e| anyhow!("Failed to read snapshot: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!();
    println!(
        "  Snapshot of '{}' taken {}",
        style(&snapshot.flow_definition.id).cyan(),
        snapshot.snapshot_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    print_run(&snapshot.run);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load(file: &Path) -> Result<FlowDefinition> {
    load_flow_file(file).map_err(|e| match e {
        FlowError::ParseError(msg) => anyhow!("Failed to parse {}: {msg}", file.display()),
        FlowError::ValidationError(msg) | FlowError::UnknownReference(msg) => {
            anyhow!("Flow validation failed for {}: {msg}", file.display())
        }
        other => anyhow!("Failed to load {}: {other}", file.display()),
    })
}

/// Parse `--data`; absent means an empty object.
pub fn parse_data(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("Invalid JSON in --data")? {
        Value::Object(map) => Ok(map),
        other => bail!("--data must be a JSON object, got {}", json_type(&other)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Compact single-line rendering of a step result.
pub fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= PREVIEW_CHARS {
        return text;
    }
    let cut: String = text.chars().take(PREVIEW_CHARS - 3).collect();
    format!("{cut}...")
}

fn print_run(run: &FlowRun) {
    let status = match run.status {
        FlowStatus::Completed => style(run.status.to_string()).green(),
        FlowStatus::Failed => style(run.status.to_string()).red(),
        FlowStatus::Cancelled => style(run.status.to_string()).yellow(),
        FlowStatus::Running | FlowStatus::Paused => style(run.status.to_string()).dim(),
    };

    println!();
    println!("  Flow '{}' {}", style(&run.flow_id).cyan(), status.bold());
    println!("  Run ID: {}", run.run_id);
    if let Some(parent) = run.parent_run_id {
        println!("  Parent run: {parent}");
    }
    if let Some(ms) = run.duration_ms() {
        println!("  Duration: {ms}ms");
    }
    if let Some(error) = &run.error {
        println!("  Error: {}", style(error).red());
    }

    if !run.step_records.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Duration"),
                Cell::new("Result / Error"),
            ]);

        let mut records: Vec<_> = run.step_records.values().collect();
        records.sort_by_key(|rec| rec.started_at);
        for rec in records {
            let status_color = match rec.status {
                StepStatus::Completed => Color::Green,
                StepStatus::Failed => Color::Red,
                StepStatus::Skipped => Color::DarkGrey,
                StepStatus::Running => Color::Yellow,
            };
            let detail = match (&rec.error, &rec.result) {
                (Some(error), _) => error.clone(),
                (None, Some(result)) => preview(result),
                (None, None) => String::new(),
            };
            table.add_row(vec![
                Cell::new(&rec.step_id),
                Cell::new(rec.status).fg(status_color),
                Cell::new(rec.attempts),
                Cell::new(rec.duration_ms.map(|ms| format!("{ms}ms")).unwrap_or_default()),
                Cell::new(detail),
            ]);
        }
        println!("{table}");
    }

    if !run.trace.is_empty() {
        println!("  Trace:");
        for entry in &run.trace {
            let level = match entry.level {
                TraceLevel::Info => style("info ").dim(),
                TraceLevel::Warn => style("warn ").yellow(),
                TraceLevel::Error => style("error").red(),
            };
            match &entry.step_id {
                Some(step_id) => println!("    {level} [{step_id}] {}", entry.message),
                None => println!("    {level} {}", entry.message),
            }
        }
    }
    println!();
}
