//! Run-time state for flow executions.
//!
//! `FlowRun` is the record of one execution of a `FlowDefinition`: its status,
//! shared data map, per-step records and trace. Everything here is plain data
//! so a run can be snapshotted to JSON and restored into another engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::flow::FlowDefinition;

// ---------------------------------------------------------------------------
// Status machines
// ---------------------------------------------------------------------------

/// Overall status of a flow run.
///
/// `running -> {paused, completed, failed, cancelled}`, `paused -> {running, cancelled}`.
/// `completed`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }

    /// Whether the run still counts as active (running or paused).
    pub fn is_active(self) -> bool {
        matches!(self, FlowStatus::Running | FlowStatus::Paused)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid run status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: FlowStatus,
    pub to: FlowStatus,
}

/// Status of one step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Flow Run
// ---------------------------------------------------------------------------

/// One execution instance of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    /// ID of the definition being executed.
    pub flow_id: String,
    /// Run that started this one through a subflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    pub status: FlowStatus,
    /// Shared mutable data, seeded from initial data merged with caller data.
    pub data: Map<String, Value>,
    /// Latest record per step ID.
    #[serde(default)]
    pub step_records: BTreeMap<String, StepRecord>,
    /// Chronological diagnostics log.
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Top-level failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlowRun {
    /// Start a new run in `running` status.
    pub fn new(flow_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            flow_id: flow_id.into(),
            parent_run_id: None,
            status: FlowStatus::Running,
            data,
            step_records: BTreeMap::new(),
            trace: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: FlowStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Wall-clock duration in milliseconds, once the run has finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at.map(|end| {
            end.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64
        })
    }

    /// Append a trace entry.
    pub fn push_trace(
        &mut self,
        step_id: Option<&str>,
        level: TraceLevel,
        message: impl Into<String>,
    ) {
        self.trace.push(TraceEntry {
            timestamp: Utc::now(),
            step_id: step_id.map(str::to_string),
            level,
            message: message.into(),
        });
    }

    /// Results recorded so far, keyed by step ID.
    pub fn results(&self) -> BTreeMap<String, Value> {
        self.step_records
            .iter()
            .filter_map(|(id, rec)| rec.result.as_ref().map(|r| (id.clone(), r.clone())))
            .collect()
    }

    /// IDs of steps whose latest record is `completed`, most recently completed first.
    pub fn completed_steps_newest_first(&self) -> Vec<String> {
        let mut completed: Vec<&StepRecord> = self
            .step_records
            .values()
            .filter(|rec| rec.status == StepStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        completed.into_iter().map(|rec| rec.step_id.clone()).collect()
    }
}

/// Execution record for one step within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    /// Attempts made (task retries increment this).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    /// Record for a step that has just begun.
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            attempts: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
        }
    }

    /// Record for a step whose dependencies were not met.
    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
        }
    }

    /// Close the record as completed.
    pub fn complete(&mut self, result: Option<Value>) {
        self.status = StepStatus::Completed;
        self.result = result;
        self.close();
    }

    /// Close the record as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.close();
    }

    fn close(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| now.signed_duration_since(start).num_milliseconds().max(0) as u64);
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// Severity of a trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    Info,
    Warn,
    Error,
}

/// One line of a run's diagnostics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub level: TraceLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Snapshot & stats
// ---------------------------------------------------------------------------

/// Point-in-time capture of a run and its definition, for external persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub run: FlowRun,
    pub flow_definition: FlowDefinition,
    pub snapshot_at: DateTime<Utc>,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Registered flow definitions.
    pub total_flows: usize,
    /// Runs currently running or paused.
    pub active_runs: usize,
    pub completed_runs: u64,
    pub failed_runs: u64,
    /// Mean duration over the recent completed/failed history window.
    pub avg_duration_ms: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
