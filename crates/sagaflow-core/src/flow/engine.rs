//! Flow engine: registry, run controller, snapshots and statistics.
//!
//! `FlowEngine` registers flow definitions and step handlers, drives runs
//! through their top-level steps in dependency order, and finalizes each run
//! as completed, failed (with optional saga compensation) or cancelled.
//!
//! # Run lifecycle
//!
//! 1. `execute`/`launch` merge the definition's initial data with caller data
//!    (caller wins) and register a `running` run.
//! 2. Top-level steps run one at a time. Before each one the controller waits
//!    while the run is paused and stops if it was cancelled.
//! 3. A step whose dependencies did not all complete is recorded `skipped`.
//! 4. The end of the step list is also a pause boundary.
//! 5. The run is finalized; failures trigger compensation when the flow
//!    opted into it.
//!
//! Pause and cancel are cooperative: a step already in flight always runs to
//! completion. Only the global timeout drops in-flight work, and any subflow
//! runs it cuts off are failed along with the parent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::event::FlowEvent;
use sagaflow_types::flow::{FlowDefinition, FlowStep};
use sagaflow_types::run::{EngineStats, FlowRun, FlowSnapshot, FlowStatus, StepStatus, TraceLevel};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;

use super::compensation::Compensator;
use super::context::{LoopScope, RunState};
use super::dag::{build_execution_plan, find_cycles};
use super::definition::{FlowError, validate_definition};
use super::handler::{HandlerRegistry, StepError, StepHandler};
use super::stats::StatsTracker;
use super::step_runner::StepRunner;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by the engine API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `execute`, `launch` or a subflow named an unregistered flow.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// No run with this ID is known to the engine.
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Definition rejected at registration or restore.
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// A launched run's task panicked or was aborted.
    #[error("run task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Handle to a run started with [`FlowEngine::launch`].
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    join: JoinHandle<FlowRun>,
}

impl RunHandle {
    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<FlowRun, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Join(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// In-memory workflow orchestrator.
///
/// All methods take `&self`; registries are concurrent maps, so one engine
/// can drive many independent runs at once (wrap it in `Arc` for `launch`).
pub struct FlowEngine {
    pub(crate) config: EngineConfig,
    flows: DashMap<String, Arc<FlowDefinition>>,
    pub(crate) handlers: HandlerRegistry,
    runs: DashMap<Uuid, Arc<RunState>>,
    stats: StatsTracker,
    pub(crate) events: EventBus,
}

impl FlowEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            stats: StatsTracker::new(config.duration_history_limit),
            events: EventBus::new(config.event_channel_capacity),
            flows: DashMap::new(),
            handlers: HandlerRegistry::new(),
            runs: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Registry ------------------------------------------------------------

    /// Validate and register a flow definition, replacing any flow with the
    /// same ID. Dependency cycles are accepted but logged.
    pub fn register_flow(&self, definition: FlowDefinition) -> Result<(), FlowError> {
        validate_definition(&definition)?;
        for cycle in find_cycles(&definition.steps) {
            tracing::warn!(
                flow_id = %definition.id,
                steps = ?cycle,
                "dependency cycle: these steps will never run"
            );
        }
        tracing::debug!(
            flow_id = %definition.id,
            steps = definition.steps.len(),
            "registered flow"
        );
        self.flows
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get_flow(&self, flow_id: &str) -> Option<FlowDefinition> {
        self.flows.get(flow_id).map(|entry| entry.value().as_ref().clone())
    }

    fn get_definition(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.get(flow_id).map(|entry| Arc::clone(entry.value()))
    }

    /// All registered flows, sorted by ID.
    pub fn list_flows(&self) -> Vec<FlowDefinition> {
        let mut flows: Vec<FlowDefinition> = self
            .flows
            .iter()
            .map(|entry| entry.value().as_ref().clone())
            .collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        flows
    }

    /// Register step logic under `name`.
    pub fn register_handler<H: StepHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        self.handlers.register(name, handler);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    // -- Execution -----------------------------------------------------------

    /// Run a flow to a terminal status and return the final run.
    pub async fn execute(
        &self,
        flow_id: &str,
        data: Map<String, Value>,
    ) -> Result<FlowRun, EngineError> {
        self.execute_nested(flow_id, data, None, CancellationToken::new(), 0)
            .await
    }

    /// Start a flow on the tokio runtime and return immediately, so the
    /// caller can pause, resume or cancel it while it runs.
    pub fn launch(
        self: &Arc<Self>,
        flow_id: &str,
        data: Map<String, Value>,
    ) -> Result<RunHandle, EngineError> {
        let (definition, state) = self.start_run(flow_id, data, None, CancellationToken::new())?;
        let run_id = state.run_id();
        let engine = Arc::clone(self);
        let join = tokio::spawn(async move { engine.drive(definition, state, 0).await });
        Ok(RunHandle { run_id, join })
    }

    /// Boxed so subflow steps can recurse back into the engine.
    pub(crate) fn execute_nested<'a>(
        &'a self,
        flow_id: &'a str,
        data: Map<String, Value>,
        parent_run_id: Option<Uuid>,
        cancel: CancellationToken,
        depth: u32,
    ) -> BoxFuture<'a, Result<FlowRun, EngineError>> {
        Box::pin(async move {
            let (definition, state) = self.start_run(flow_id, data, parent_run_id, cancel)?;
            Ok(self.drive(definition, state, depth).await)
        })
    }

    fn start_run(
        &self,
        flow_id: &str,
        data: Map<String, Value>,
        parent_run_id: Option<Uuid>,
        cancel: CancellationToken,
    ) -> Result<(Arc<FlowDefinition>, Arc<RunState>), EngineError> {
        let definition = self
            .get_definition(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;

        let mut seeded = definition.initial_data.clone();
        seeded.extend(data);
        let mut run = FlowRun::new(definition.id.clone(), seeded);
        run.parent_run_id = parent_run_id;
        let run_id = run.run_id;

        let state = Arc::new(RunState::new(run, cancel));
        self.runs.insert(run_id, Arc::clone(&state));

        self.events.publish(FlowEvent::FlowStarted {
            run_id,
            flow_id: definition.id.clone(),
            parent_run_id,
        });
        tracing::info!(
            run_id = %run_id,
            flow_id = %definition.id,
            parent_run_id = ?parent_run_id,
            "flow started"
        );
        Ok((definition, state))
    }

    async fn drive(
        &self,
        definition: Arc<FlowDefinition>,
        state: Arc<RunState>,
        depth: u32,
    ) -> FlowRun {
        let steps: HashMap<String, FlowStep> = definition
            .steps
            .iter()
            .map(|step| (step.id.clone(), step.clone()))
            .collect();
        let plan = build_execution_plan(&definition.steps);
        if !plan.is_complete() {
            tracing::warn!(
                run_id = %state.run_id(),
                flow_id = %definition.id,
                unscheduled = ?plan.unscheduled,
                "steps in dependency cycles will not run"
            );
        }

        let runner = StepRunner::new(self, &state, &steps, depth);
        let driven = self.drive_steps(&runner, &state, &steps, &plan.order);
        let outcome = match definition.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), driven).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let err = StepError::FlowTimeout(ms);
                    self.abandon_descendants(state.run_id(), &err.to_string()).await;
                    Err(err)
                }
            },
            None => driven.await,
        };

        self.finalize(&definition, &state, &steps, outcome).await
    }

    async fn drive_steps(
        &self,
        runner: &StepRunner<'_>,
        state: &RunState,
        steps: &HashMap<String, FlowStep>,
        order: &[String],
    ) -> Result<(), StepError> {
        for step_id in order {
            if !self.wait_while_paused(state).await {
                return Ok(());
            }
            let Some(step) = steps.get(step_id) else {
                continue;
            };
            if !runner.dependencies_met(step) {
                runner.skip(step);
                continue;
            }
            runner.run_step(step, LoopScope::default()).await?;
        }
        self.wait_while_paused(state).await;
        Ok(())
    }

    /// Block while the run is paused. Returns `false` once it is cancelled.
    async fn wait_while_paused(&self, state: &RunState) -> bool {
        loop {
            if state.is_cancelled() {
                return false;
            }
            if state.status() != FlowStatus::Paused {
                return true;
            }
            tokio::select! {
                _ = state.cancel.cancelled() => return false,
                _ = state.resumed.notified() => {}
                _ = tokio::time::sleep(self.config.pause_poll_interval()) => {}
            }
        }
    }

    async fn finalize(
        &self,
        definition: &FlowDefinition,
        state: &Arc<RunState>,
        steps: &HashMap<String, FlowStep>,
        outcome: Result<(), StepError>,
    ) -> FlowRun {
        let run_id = state.run_id();

        if state.is_cancelled() {
            let cascaded = state.with_run(|run| {
                if let Err(e) = &outcome {
                    run.push_trace(
                        None,
                        TraceLevel::Warn,
                        format!("step failed after cancellation: {e}"),
                    );
                }
                // A parent's cancellation reaches a subflow only through its token.
                !run.status.is_terminal() && run.transition(FlowStatus::Cancelled).is_ok()
            });
            if cascaded {
                self.events.publish(FlowEvent::FlowCancelled { run_id });
            }
            tracing::info!(run_id = %run_id, flow_id = %definition.id, "flow cancelled");
            return state.snapshot();
        }

        match outcome {
            Ok(()) => {
                let duration_ms = state.with_run(|run| {
                    if let Err(e) = run.transition(FlowStatus::Completed) {
                        tracing::warn!(run_id = %run_id, error = %e, "could not complete run");
                    }
                    run.duration_ms()
                });
                self.stats.record_completed(duration_ms);
                self.events.publish(FlowEvent::FlowCompleted {
                    run_id,
                    flow_id: definition.id.clone(),
                    duration_ms: duration_ms.unwrap_or(0),
                });
                tracing::info!(
                    run_id = %run_id,
                    flow_id = %definition.id,
                    duration_ms = duration_ms.unwrap_or(0),
                    "flow completed"
                );
            }
            Err(err) => self.fail_run(definition, state, steps, err.to_string()).await,
        }

        state.snapshot()
    }

    /// Mark a run failed, compensate it when the flow opted in, and announce it.
    async fn fail_run(
        &self,
        definition: &FlowDefinition,
        state: &Arc<RunState>,
        steps: &HashMap<String, FlowStep>,
        message: String,
    ) {
        let run_id = state.run_id();
        let duration_ms = state.with_run(|run| {
            // Records cut off by the global timeout.
            for record in run.step_records.values_mut() {
                if record.status == StepStatus::Running {
                    record.fail(message.as_str());
                }
            }
            // A step can fail after the run was paused mid-flight.
            if run.status == FlowStatus::Paused {
                let _ = run.transition(FlowStatus::Running);
            }
            if let Err(e) = run.transition(FlowStatus::Failed) {
                tracing::warn!(run_id = %run_id, error = %e, "could not fail run");
            }
            run.error = Some(message.clone());
            run.push_trace(None, TraceLevel::Error, format!("flow failed: {message}"));
            run.duration_ms()
        });
        self.stats.record_failed(duration_ms);
        tracing::warn!(
            run_id = %run_id,
            flow_id = %definition.id,
            error = %message,
            "flow failed"
        );

        if definition.enable_compensation {
            Compensator::new(&self.handlers, &self.events)
                .compensate(state, steps)
                .await;
        }

        self.events.publish(FlowEvent::FlowFailed {
            run_id,
            flow_id: definition.id.clone(),
            error: message,
        });
    }

    /// Fail every non-terminal run nested under `run_id`, deepest first.
    ///
    /// Their drives were dropped together with the timed-out parent's, so
    /// nothing else would ever finalize them.
    async fn abandon_descendants(&self, run_id: Uuid, message: &str) {
        let mut lineage = vec![run_id];
        let mut orphans: Vec<Arc<RunState>> = Vec::new();
        let mut cursor = 0;
        while cursor < lineage.len() {
            let parent = lineage[cursor];
            cursor += 1;
            for entry in self.runs.iter() {
                if entry.value().with_run(|run| run.parent_run_id) == Some(parent) {
                    lineage.push(*entry.key());
                    orphans.push(Arc::clone(entry.value()));
                }
            }
        }

        for state in orphans.into_iter().rev() {
            if state.status().is_terminal() {
                continue;
            }
            let flow_id = state.with_run(|run| run.flow_id.clone());
            let Some(definition) = self.get_definition(&flow_id) else {
                tracing::warn!(
                    run_id = %state.run_id(),
                    flow_id = %flow_id,
                    "nested run has no definition"
                );
                continue;
            };
            let steps: HashMap<String, FlowStep> = definition
                .steps
                .iter()
                .map(|step| (step.id.clone(), step.clone()))
                .collect();
            state.trace(None, TraceLevel::Warn, "abandoned by parent flow timeout");
            self.fail_run(&definition, &state, &steps, message.to_string()).await;
            state.cancel.cancel();
        }
    }

    // -- Run control ---------------------------------------------------------

    /// Pause a `running` run at its next step boundary.
    pub fn pause(&self, run_id: Uuid) -> bool {
        let Some(state) = self.run_state(run_id) else {
            return false;
        };
        let paused = state.with_run(|run| {
            run.status == FlowStatus::Running && run.transition(FlowStatus::Paused).is_ok()
        });
        if paused {
            self.events.publish(FlowEvent::FlowPaused { run_id });
            tracing::info!(run_id = %run_id, "flow paused");
        }
        paused
    }

    /// Resume a `paused` run.
    pub fn resume(&self, run_id: Uuid) -> bool {
        let Some(state) = self.run_state(run_id) else {
            return false;
        };
        let resumed = state.with_run(|run| {
            run.status == FlowStatus::Paused && run.transition(FlowStatus::Running).is_ok()
        });
        if resumed {
            state.resumed.notify_one();
            self.events.publish(FlowEvent::FlowResumed { run_id });
            tracing::info!(run_id = %run_id, "flow resumed");
        }
        resumed
    }

    /// Cancel a `running` or `paused` run, including its nested subflow runs.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let Some(state) = self.run_state(run_id) else {
            return false;
        };
        let cancelled = state.with_run(|run| {
            run.status.is_active() && run.transition(FlowStatus::Cancelled).is_ok()
        });
        if cancelled {
            state.cancel.cancel();
            self.events.publish(FlowEvent::FlowCancelled { run_id });
            tracing::info!(run_id = %run_id, "flow cancel requested");
        }
        cancelled
    }

    pub fn get_run(&self, run_id: Uuid) -> Option<FlowRun> {
        self.run_state(run_id).map(|state| state.snapshot())
    }

    /// IDs of every run held by the engine.
    pub fn run_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.runs.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Evict a terminal run from memory. Active runs are left alone.
    pub fn remove_run(&self, run_id: Uuid) -> Option<FlowRun> {
        self.runs
            .remove_if(&run_id, |_, state| state.status().is_terminal())
            .map(|(_, state)| state.snapshot())
    }

    fn run_state(&self, run_id: Uuid) -> Option<Arc<RunState>> {
        self.runs.get(&run_id).map(|entry| Arc::clone(entry.value()))
    }

    // -- Persistence handoff -------------------------------------------------

    /// Deep copy of a run together with its definition.
    pub fn snapshot(&self, run_id: Uuid) -> Option<FlowSnapshot> {
        let run = self.get_run(run_id)?;
        let flow_definition = self.get_flow(&run.flow_id)?;
        Some(FlowSnapshot {
            run,
            flow_definition,
            snapshot_at: Utc::now(),
        })
    }

    /// Re-register a snapshot's definition and rehydrate its run.
    ///
    /// The restored run is held for inspection and control; it is not
    /// re-driven. Handlers must be registered separately.
    pub fn restore(&self, snapshot: FlowSnapshot) -> Result<FlowRun, EngineError> {
        let FlowSnapshot {
            run,
            flow_definition,
            ..
        } = snapshot;
        self.register_flow(flow_definition)?;

        let run_id = run.run_id;
        let state = Arc::new(RunState::new(run, CancellationToken::new()));
        if state.status() == FlowStatus::Cancelled {
            state.cancel.cancel();
        }
        self.runs.insert(run_id, Arc::clone(&state));
        tracing::info!(run_id = %run_id, "run restored from snapshot");
        Ok(state.snapshot())
    }

    // -- Stats & events ------------------------------------------------------

    pub fn stats(&self) -> EngineStats {
        let active_runs = self
            .runs
            .iter()
            .filter(|entry| entry.value().status().is_active())
            .count();
        EngineStats {
            total_flows: self.flows.len(),
            active_runs,
            completed_runs: self.stats.completed(),
            failed_runs: self.stats.failed(),
            avg_duration_ms: self.stats.avg_duration_ms(),
        }
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl Default for FlowEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("flows", &self.flows.len())
            .field("runs", &self.runs.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
