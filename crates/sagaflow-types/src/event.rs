//! Lifecycle events broadcast by the flow engine.
//!
//! `FlowEvent` is the single event type published on the engine's event bus.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels,
//! and serialize with a `type` tag for logging and metrics collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Events emitted during flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    // -- Run lifecycle --
    FlowStarted {
        run_id: Uuid,
        flow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<Uuid>,
    },
    FlowCompleted {
        run_id: Uuid,
        flow_id: String,
        duration_ms: u64,
    },
    FlowFailed {
        run_id: Uuid,
        flow_id: String,
        error: String,
    },
    FlowPaused {
        run_id: Uuid,
    },
    FlowResumed {
        run_id: Uuid,
    },
    FlowCancelled {
        run_id: Uuid,
    },

    // -- Step lifecycle --
    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_type: String,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
    },

    // -- Saga compensation --
    CompensationStarted {
        run_id: Uuid,
    },
    CompensationCompleted {
        run_id: Uuid,
        compensated: u32,
        failed: u32,
    },
}

impl FlowEvent {
    /// Colon-separated event name (`flow:started`, `step:failed`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::FlowStarted { .. } => "flow:started",
            FlowEvent::FlowCompleted { .. } => "flow:completed",
            FlowEvent::FlowFailed { .. } => "flow:failed",
            FlowEvent::FlowPaused { .. } => "flow:paused",
            FlowEvent::FlowResumed { .. } => "flow:resumed",
            FlowEvent::FlowCancelled { .. } => "flow:cancelled",
            FlowEvent::StepStarted { .. } => "step:started",
            FlowEvent::StepCompleted { .. } => "step:completed",
            FlowEvent::StepFailed { .. } => "step:failed",
            FlowEvent::StepSkipped { .. } => "step:skipped",
            FlowEvent::CompensationStarted { .. } => "compensation:started",
            FlowEvent::CompensationCompleted { .. } => "compensation:completed",
        }
    }

    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            FlowEvent::FlowStarted { run_id, .. }
            | FlowEvent::FlowCompleted { run_id, .. }
            | FlowEvent::FlowFailed { run_id, .. }
            | FlowEvent::FlowPaused { run_id }
            | FlowEvent::FlowResumed { run_id }
            | FlowEvent::FlowCancelled { run_id }
            | FlowEvent::StepStarted { run_id, .. }
            | FlowEvent::StepCompleted { run_id, .. }
            | FlowEvent::StepFailed { run_id, .. }
            | FlowEvent::StepSkipped { run_id, .. }
            | FlowEvent::CompensationStarted { run_id }
            | FlowEvent::CompensationCompleted { run_id, .. } => *run_id,
        }
    }
}
