//! Flow definition types for Sagaflow.
//!
//! A `FlowDefinition` is an immutable, fully serializable template. Step logic
//! is never embedded in the definition: task, condition, wait and compensation
//! steps reference handlers by name, and the engine resolves those names
//! against its handler registry at run time. This keeps definitions loadable
//! from YAML/JSON and restorable from snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Branch key used when a condition resolves to a key with no explicit branch.
pub const DEFAULT_BRANCH: &str = "default";

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// A registered, reusable workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Unique flow ID used by `execute` and subflow steps.
    pub id: String,
    /// Human-readable flow name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of steps forming the flow graph.
    pub steps: Vec<FlowStep>,
    /// Data seeded into every run before caller-supplied data is merged.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub initial_data: Map<String, Value>,
    /// Global timeout for the whole run, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Run saga compensation over completed steps when the run fails.
    #[serde(default)]
    pub enable_compensation: bool,
}

impl FlowDefinition {
    /// Create an empty definition with the given ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            steps: Vec::new(),
            initial_data: Map::new(),
            timeout_ms: None,
            enable_compensation: false,
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Set the initial data map.
    pub fn with_initial_data(mut self, data: Map<String, Value>) -> Self {
        self.initial_data = data;
        self
    }

    /// Set the global run timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Opt into saga compensation.
    pub fn with_compensation(mut self) -> Self {
        self.enable_compensation = true;
        self
    }

    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single node in the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    /// Step ID, unique within a flow.
    pub id: String,
    /// Human-readable step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Steps that must be `completed` before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Kind-specific configuration, tagged by `type`.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl FlowStep {
    /// Build a step of the given kind with no dependencies.
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            depends_on: Vec::new(),
            kind,
        }
    }

    /// Task step backed by the named handler.
    pub fn task(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Task(TaskStep {
                handler: Some(handler.into()),
                ..TaskStep::default()
            }),
        )
    }

    /// Condition step resolved by the named handler.
    pub fn condition(
        id: impl Into<String>,
        handler: impl Into<String>,
        branches: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Condition {
                handler: handler.into(),
                branches,
            },
        )
    }

    /// Parallel step over the given children.
    pub fn parallel(id: impl Into<String>, steps: Vec<String>) -> Self {
        Self::new(id, StepKind::Parallel { steps })
    }

    /// Loop step over `run.data[items_key]`.
    pub fn looping(
        id: impl Into<String>,
        items_key: impl Into<String>,
        body: Vec<String>,
        max_iterations: Option<u32>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Loop(LoopStep {
                items_key: items_key.into(),
                body,
                max_iterations,
            }),
        )
    }

    /// Subflow step executing another registered flow.
    pub fn subflow(id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Subflow {
                flow_id: flow_id.into(),
            },
        )
    }

    /// Wait step with a literal delay.
    pub fn wait(id: impl Into<String>, wait_ms: u64) -> Self {
        Self::new(
            id,
            StepKind::Wait(WaitStep {
                wait_ms: Some(wait_ms),
                wait_handler: None,
            }),
        )
    }

    /// Add dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Attach a retry policy (task steps only; ignored otherwise).
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        if let StepKind::Task(task) = &mut self.kind {
            task.retry = Some(policy);
        }
        self
    }

    /// Attach a per-attempt timeout (task steps only; ignored otherwise).
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let StepKind::Task(task) = &mut self.kind {
            task.timeout_ms = Some(timeout_ms);
        }
        self
    }

    /// Name the handler that compensates this step (task steps only).
    pub fn with_compensation(mut self, handler: impl Into<String>) -> Self {
        if let StepKind::Task(task) = &mut self.kind {
            task.compensate = Some(handler.into());
        }
        self
    }

    /// The compensation handler name, if this step declares one.
    pub fn compensation_handler(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Task(task) => task.compensate.as_deref(),
            _ => None,
        }
    }

    /// Step IDs executed by this step rather than at the top level.
    pub fn owned_step_ids(&self) -> Vec<&str> {
        match &self.kind {
            StepKind::Condition { branches, .. } => branches
                .values()
                .flat_map(|ids| ids.iter().map(String::as_str))
                .collect(),
            StepKind::Parallel { steps } => steps.iter().map(String::as_str).collect(),
            StepKind::Loop(lp) => lp.body.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// Kind-specific step configuration.
///
/// Internally tagged by `type` so a flow file reads naturally:
/// ```yaml
/// - id: charge
///   type: task
///   handler: charge-card
///   compensate: refund-card
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a handler's `execute`.
    Task(TaskStep),
    /// Pick a branch by the key returned from a handler's `condition`.
    Condition {
        handler: String,
        branches: BTreeMap<String, Vec<String>>,
    },
    /// Run children concurrently and wait for all of them.
    Parallel { steps: Vec<String> },
    /// Run a body once per item of a run-data array.
    Loop(LoopStep),
    /// Execute another registered flow with a copy of the run data.
    Subflow { flow_id: String },
    /// Sleep for a literal or computed duration.
    Wait(WaitStep),
}

impl StepKind {
    /// Short lowercase label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Task(_) => "task",
            StepKind::Condition { .. } => "condition",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Loop(_) => "loop",
            StepKind::Subflow { .. } => "subflow",
            StepKind::Wait(_) => "wait",
        }
    }
}

/// Configuration for a task step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// Handler whose `execute` runs this step. Absent means a no-op with a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Handler whose `compensate` undoes this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<String>,
}

/// Configuration for a loop step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStep {
    /// Key of the run-data array to iterate.
    pub items_key: String,
    /// Step IDs executed sequentially for every item.
    pub body: Vec<String>,
    /// Iteration cap (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// Configuration for a wait step. `wait_handler` wins over `wait_ms`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_handler: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry policy for a task step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Base delay before the second attempt.
    #[serde(default)]
    pub delay_ms: u64,
    /// Multiplier applied per retry (`delay_ms * multiplier^(attempt-1)`).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Fixed-delay policy.
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: None,
        }
    }

    /// Exponential backoff.
    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Cap individual delays.
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
