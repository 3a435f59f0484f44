//! Saga compensation over the completed steps of a failed run.
//!
//! Steps whose latest record is `completed` are undone newest-first. Each
//! compensation is attempted once, with no timeout, and a failure is traced
//! without stopping the remaining ones.

use std::collections::HashMap;
use std::sync::Arc;

use sagaflow_types::event::FlowEvent;
use sagaflow_types::flow::FlowStep;
use sagaflow_types::run::TraceLevel;
use serde::Serialize;

use crate::event::EventBus;

use super::context::{LoopScope, RunState, StepContext};
use super::handler::HandlerRegistry;

/// Outcome of one compensation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompensationReport {
    /// Steps compensated successfully, in the order they were undone.
    pub compensated: Vec<String>,
    /// Steps whose compensation failed.
    pub failed: Vec<String>,
}

pub(crate) struct Compensator<'a> {
    handlers: &'a HandlerRegistry,
    events: &'a EventBus,
}

impl<'a> Compensator<'a> {
    pub(crate) fn new(handlers: &'a HandlerRegistry, events: &'a EventBus) -> Self {
        Self { handlers, events }
    }

    pub(crate) async fn compensate(
        &self,
        state: &Arc<RunState>,
        steps: &HashMap<String, FlowStep>,
    ) -> CompensationReport {
        let run_id = state.run_id();
        self.events.publish(FlowEvent::CompensationStarted { run_id });
        state.trace(None, TraceLevel::Info, "starting saga compensation");
        tracing::info!(run_id = %run_id, "starting saga compensation");

        let mut report = CompensationReport::default();
        let completed = state.with_run(|run| run.completed_steps_newest_first());

        for step_id in completed {
            let Some(handler_name) = steps.get(&step_id).and_then(FlowStep::compensation_handler)
            else {
                continue;
            };

            let outcome = match self.handlers.get(handler_name) {
                Ok(handler) => {
                    let ctx =
                        StepContext::new(Arc::clone(state), step_id.as_str(), LoopScope::default());
                    handler.compensate_boxed(ctx).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    state.trace(Some(&step_id), TraceLevel::Info, "compensated successfully");
                    tracing::debug!(run_id = %run_id, step_id = %step_id, "step compensated");
                    report.compensated.push(step_id);
                }
                Err(e) => {
                    state.trace(
                        Some(&step_id),
                        TraceLevel::Error,
                        format!("compensation failed: {e}"),
                    );
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = %step_id,
                        error = %e,
                        "compensation failed"
                    );
                    report.failed.push(step_id);
                }
            }
        }

        self.events.publish(FlowEvent::CompensationCompleted {
            run_id,
            compensated: report.compensated.len() as u32,
            failed: report.failed.len() as u32,
        });
        report
    }
}
