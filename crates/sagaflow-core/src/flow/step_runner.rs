//! Step dispatch for all six step kinds.
//!
//! `StepRunner` executes one step of one run and keeps its `StepRecord` and
//! lifecycle events in sync with the outcome. Composite steps (condition,
//! parallel, loop) recurse into `run_step` for their owned children, so the
//! recursion goes through a boxed future.
//!
//! | Kind      | Result recorded                         |
//! |-----------|-----------------------------------------|
//! | task      | handler return value (`null` = none)    |
//! | condition | resolved branch key                     |
//! | parallel  | children's results, in declared order   |
//! | loop      | items processed                         |
//! | subflow   | sub-run's final data                    |
//! | wait      | `{"waited": ms}`                        |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use sagaflow_types::event::FlowEvent;
use sagaflow_types::flow::{DEFAULT_BRANCH, FlowStep, LoopStep, StepKind, TaskStep, WaitStep};
use sagaflow_types::run::{FlowStatus, StepRecord, StepStatus, TraceLevel};
use serde_json::{Value, json};

use super::context::{LoopFrame, LoopScope, RunState, StepContext};
use super::engine::{EngineError, FlowEngine};
use super::handler::StepError;
use super::retry::RetryHandler;

pub(crate) struct StepRunner<'a> {
    engine: &'a FlowEngine,
    state: &'a Arc<RunState>,
    steps: &'a HashMap<String, FlowStep>,
    /// Subflow nesting depth of this run (0 for a top-level run).
    depth: u32,
}

impl<'a> StepRunner<'a> {
    pub(crate) fn new(
        engine: &'a FlowEngine,
        state: &'a Arc<RunState>,
        steps: &'a HashMap<String, FlowStep>,
        depth: u32,
    ) -> Self {
        Self {
            engine,
            state,
            steps,
            depth,
        }
    }

    /// Execute `step` and record its outcome. Errors propagate to the caller.
    pub(crate) fn run_step<'s>(
        &'s self,
        step: &'s FlowStep,
        scope: LoopScope,
    ) -> BoxFuture<'s, Result<(), StepError>> {
        Box::pin(async move {
            let run_id = self.state.run_id();
            let mut record = StepRecord::started(&step.id);
            if !matches!(step.kind, StepKind::Task(_)) {
                record.attempts = 1;
            }
            self.state.with_run(|run| {
                run.step_records.insert(step.id.clone(), record);
            });
            self.engine.events.publish(FlowEvent::StepStarted {
                run_id,
                step_id: step.id.clone(),
                step_type: step.kind.label().to_string(),
            });
            tracing::debug!(
                run_id = %run_id,
                step_id = %step.id,
                step_type = step.kind.label(),
                "step started"
            );

            let ctx = StepContext::new(Arc::clone(self.state), step.id.as_str(), scope.clone());
            let outcome = match &step.kind {
                StepKind::Task(task) => self.run_task(step, task, ctx).await,
                StepKind::Condition { handler, branches } => {
                    self.run_condition(step, handler, branches, ctx, &scope).await
                }
                StepKind::Parallel { steps } => self.run_parallel(steps, &scope).await,
                StepKind::Loop(lp) => self.run_loop(step, lp, &scope).await,
                StepKind::Subflow { flow_id } => self.run_subflow(step, flow_id).await,
                StepKind::Wait(wait) => self.run_wait(wait, ctx).await,
            };

            match outcome {
                Ok(result) => {
                    let duration_ms = self.state.with_run(|run| {
                        let record = run.step_records.get_mut(&step.id)?;
                        record.complete(result.clone());
                        record.duration_ms
                    });
                    self.engine.events.publish(FlowEvent::StepCompleted {
                        run_id,
                        step_id: step.id.clone(),
                        result,
                        duration_ms: duration_ms.unwrap_or(0),
                    });
                    tracing::debug!(run_id = %run_id, step_id = %step.id, "step completed");
                    Ok(())
                }
                Err(err) => {
                    let message = err.to_string();
                    self.state.with_run(|run| {
                        if let Some(record) = run.step_records.get_mut(&step.id) {
                            record.fail(message.as_str());
                        }
                        run.push_trace(
                            Some(&step.id),
                            TraceLevel::Error,
                            format!("step failed: {message}"),
                        );
                    });
                    self.engine.events.publish(FlowEvent::StepFailed {
                        run_id,
                        step_id: step.id.clone(),
                        error: message.clone(),
                    });
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = %step.id,
                        error = %message,
                        "step failed"
                    );
                    Err(err)
                }
            }
        })
    }

    /// Record `step` as skipped because its dependencies did not complete.
    pub(crate) fn skip(&self, step: &FlowStep) {
        let run_id = self.state.run_id();
        self.state.with_run(|run| {
            run.step_records
                .insert(step.id.clone(), StepRecord::skipped(&step.id));
        });
        self.engine.events.publish(FlowEvent::StepSkipped {
            run_id,
            step_id: step.id.clone(),
        });
        tracing::debug!(run_id = %run_id, step_id = %step.id, "step skipped: dependencies not met");
    }

    /// Whether every dependency of `step` has a `completed` record.
    pub(crate) fn dependencies_met(&self, step: &FlowStep) -> bool {
        self.state.with_run(|run| {
            step.depends_on.iter().all(|dep| {
                run.step_records
                    .get(dep)
                    .is_some_and(|rec| rec.status == StepStatus::Completed)
            })
        })
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    async fn run_task(
        &self,
        step: &FlowStep,
        task: &TaskStep,
        ctx: StepContext,
    ) -> Result<Option<Value>, StepError> {
        let Some(handler_name) = &task.handler else {
            self.state
                .trace(Some(&step.id), TraceLevel::Warn, "task step has no handler");
            return Ok(None);
        };
        let handler = self.engine.handlers.get(handler_name)?;
        let policy = task.retry.as_ref();

        let mut attempt = 1;
        loop {
            self.state.with_run(|run| {
                if let Some(record) = run.step_records.get_mut(&step.id) {
                    record.attempts = attempt;
                }
            });

            let call = handler.execute_boxed(ctx.clone());
            let outcome = match task.timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                    .await
                    .unwrap_or(Err(StepError::Timeout(ms))),
                None => call.await,
            };

            match outcome {
                Ok(value) => return Ok(Some(value).filter(|v| !v.is_null())),
                Err(err) if RetryHandler::should_retry(policy, attempt) => {
                    let delay = policy
                        .map(|p| RetryHandler::backoff_delay(p, attempt))
                        .unwrap_or_default();
                    self.state.trace(
                        Some(&step.id),
                        TraceLevel::Warn,
                        format!(
                            "attempt {attempt} failed, retrying in {}ms: {err}",
                            delay.as_millis()
                        ),
                    );
                    tracing::debug!(
                        run_id = %self.state.run_id(),
                        step_id = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying task step"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Condition
    // -----------------------------------------------------------------------

    async fn run_condition(
        &self,
        step: &FlowStep,
        handler_name: &str,
        branches: &BTreeMap<String, Vec<String>>,
        ctx: StepContext,
        scope: &LoopScope,
    ) -> Result<Option<Value>, StepError> {
        let handler = self.engine.handlers.get(handler_name)?;
        let key = handler.condition_boxed(ctx).await?;
        self.state.trace(
            Some(&step.id),
            TraceLevel::Info,
            format!("condition evaluated to: {key}"),
        );

        match branches.get(&key).or_else(|| branches.get(DEFAULT_BRANCH)) {
            Some(branch) => {
                for child in self.resolve(branch) {
                    self.run_step(child, scope.clone()).await?;
                }
            }
            None => {
                self.state.trace(
                    Some(&step.id),
                    TraceLevel::Warn,
                    format!("no branch for key: {key}"),
                );
            }
        }
        Ok(Some(Value::String(key)))
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    /// Children run concurrently and all of them settle before the step
    /// resolves; a failing child never cancels its siblings.
    async fn run_parallel(
        &self,
        ids: &[String],
        scope: &LoopScope,
    ) -> Result<Option<Value>, StepError> {
        let children = self.resolve(ids);
        if children.is_empty() {
            return Ok(None);
        }

        let outcomes = join_all(
            children
                .iter()
                .map(|child| self.run_step(child, scope.clone())),
        )
        .await;
        if let Some(err) = outcomes.into_iter().find_map(Result::err) {
            return Err(StepError::Parallel(err.to_string()));
        }

        let results = self.state.with_run(|run| {
            children
                .iter()
                .map(|child| {
                    run.step_records
                        .get(&child.id)
                        .and_then(|rec| rec.result.clone())
                        .unwrap_or(Value::Null)
                })
                .collect()
        });
        Ok(Some(Value::Array(results)))
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Body records are overwritten on every iteration; only the last
    /// iteration's record remains under each body step ID.
    async fn run_loop(
        &self,
        step: &FlowStep,
        lp: &LoopStep,
        scope: &LoopScope,
    ) -> Result<Option<Value>, StepError> {
        let items = self.state.with_run(|run| run.data.get(&lp.items_key).cloned());
        let Some(Value::Array(items)) = items else {
            self.state.trace(
                Some(&step.id),
                TraceLevel::Warn,
                format!("loop items key \"{}\" is not an array", lp.items_key),
            );
            return Ok(None);
        };

        let max_iterations = lp
            .max_iterations
            .unwrap_or(self.engine.config.default_max_iterations) as usize;
        let body = self.resolve(&lp.body);
        let mut processed = Vec::new();

        for (index, item) in items.into_iter().take(max_iterations).enumerate() {
            let iteration = scope.enter(LoopFrame {
                step_id: step.id.clone(),
                item: item.clone(),
                index,
            });
            for child in &body {
                self.run_step(child, iteration.clone()).await?;
            }
            processed.push(item);
        }
        Ok(Some(Value::Array(processed)))
    }

    // -----------------------------------------------------------------------
    // Subflow
    // -----------------------------------------------------------------------

    async fn run_subflow(
        &self,
        step: &FlowStep,
        flow_id: &str,
    ) -> Result<Option<Value>, StepError> {
        let max = self.engine.config.max_subflow_depth;
        let depth = self.depth + 1;
        if depth > max {
            return Err(StepError::SubflowDepthExceeded { depth, max });
        }

        let (parent_run_id, data) = self
            .state
            .with_run(|run| (run.run_id, run.data.clone()));
        let sub_run = self
            .engine
            .execute_nested(
                flow_id,
                data,
                Some(parent_run_id),
                self.state.cancel.child_token(),
                depth,
            )
            .await
            .map_err(|e| match e {
                EngineError::FlowNotFound(id) => StepError::FlowNotFound(id),
                other => StepError::Failed(other.to_string()),
            })?;

        let result = Value::Object(sub_run.data);
        if sub_run.status == FlowStatus::Failed {
            // The sub-run's data is kept on the failed record.
            self.state.with_run(|run| {
                if let Some(record) = run.step_records.get_mut(&step.id) {
                    record.result = Some(result);
                }
            });
            return Err(StepError::Subflow {
                flow_id: flow_id.to_string(),
                error: sub_run.error.unwrap_or_default(),
            });
        }
        Ok(Some(result))
    }

    // -----------------------------------------------------------------------
    // Wait
    // -----------------------------------------------------------------------

    async fn run_wait(
        &self,
        wait: &WaitStep,
        ctx: StepContext,
    ) -> Result<Option<Value>, StepError> {
        let ms = match &wait.wait_handler {
            Some(name) => self.engine.handlers.get(name)?.wait_ms_boxed(ctx).await?,
            None => wait.wait_ms.unwrap_or(0),
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Some(json!({ "waited": ms })))
    }

    /// Look up owned step IDs; undeclared IDs are ignored.
    fn resolve<'s>(&'s self, ids: &[String]) -> Vec<&'s FlowStep> {
        ids.iter().filter_map(|id| self.steps.get(id)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use sagaflow_types::config::EngineConfig;
    use sagaflow_types::flow::{FlowDefinition, RetryPolicy};
    use sagaflow_types::run::{FlowStatus, StepStatus, TraceLevel};
    use serde_json::{Map, Value, json};

    use crate::flow::engine::FlowEngine;
    use crate::flow::handler::{FnHandler, StepError};
    use sagaflow_types::flow::FlowStep;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn returning(value: Value) -> FnHandler {
        FnHandler::new().on_execute(move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    fn failing(message: &'static str) -> FnHandler {
        FnHandler::new().on_execute(move |_| async move { Err(StepError::from(message)) })
    }

    /// Handler that fails `failures` times, then returns `{"ok": attempt}`.
    fn flaky(failures: u32) -> (FnHandler, std::sync::Arc<AtomicU32>) {
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let counter = std::sync::Arc::clone(&calls);
        let handler = FnHandler::new().on_execute(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= failures {
                    Err(StepError::Failed(format!("attempt {n} failed")))
                } else {
                    Ok(json!({ "ok": n }))
                }
            }
        });
        (handler, calls)
    }

    fn branches(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, ids)| (k.to_string(), ids.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn results_flow_from_one_step_to_the_next() {
        let engine = FlowEngine::default();
        engine.register_handler("a", returning(json!({"x": 1})));
        engine.register_handler(
            "b",
            FnHandler::new().on_execute(|ctx| async move {
                let x = ctx.result("A").and_then(|r| r["x"].as_i64()).unwrap_or(0);
                Ok(json!({ "y": x + 1 }))
            }),
        );
        engine
            .register_flow(
                FlowDefinition::new("F")
                    .with_step(FlowStep::task("A", "a"))
                    .with_step(FlowStep::task("B", "b").depends_on(["A"])),
            )
            .unwrap();

        let run = engine.execute("F", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.step_records["A"].result, Some(json!({"x": 1})));
        assert_eq!(run.step_records["B"].result, Some(json!({"y": 2})));
        assert_eq!(run.step_records["A"].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_records_every_attempt_before_failing() {
        let engine = FlowEngine::default();
        let (handler, calls) = flaky(u32::MAX);
        engine.register_handler("flaky", handler);
        engine
            .register_flow(FlowDefinition::new("f").with_step(
                FlowStep::task("t", "flaky").with_retry(RetryPolicy::new(4, 100).with_backoff(2.0)),
            ))
            .unwrap();

        let run = engine.execute("f", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.step_records["t"].attempts, 4);
        assert_eq!(run.step_records["t"].status, StepStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(run.error.as_deref(), Some("attempt 4 failed"));

        let retries: Vec<&str> = run
            .trace
            .iter()
            .filter(|t| t.level == TraceLevel::Warn)
            .map(|t| t.message.as_str())
            .collect();
        assert_eq!(retries.len(), 3);
        assert!(retries[0].starts_with("attempt 1 failed, retrying in 100ms"));
        assert!(retries[2].starts_with("attempt 3 failed, retrying in 400ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_third_attempt() {
        let engine = FlowEngine::default();
        let (handler, _) = flaky(2);
        engine.register_handler("flaky", handler);
        engine
            .register_flow(
                FlowDefinition::new("f")
                    .with_step(FlowStep::task("t", "flaky").with_retry(RetryPolicy::new(3, 10))),
            )
            .unwrap();

        let run = engine.execute("f", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.step_records["t"].attempts, 3);
        assert_eq!(run.step_records["t"].status, StepStatus::Completed);
        assert_eq!(run.step_records["t"].result, Some(json!({"ok": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_is_an_attempt_failure() {
        let engine = FlowEngine::default();
        engine.register_handler(
            "slow",
            FnHandler::new().on_execute(|_| async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(json!("late"))
            }),
        );
        engine
            .register_flow(
                FlowDefinition::new("f").with_step(
                    FlowStep::task("t", "slow")
                        .with_timeout_ms(50)
                        .with_retry(RetryPolicy::new(2, 0)),
                ),
            )
            .unwrap();

        let run = engine.execute("f", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.step_records["t"].attempts, 2);
        assert_eq!(run.error.as_deref(), Some("step timeout after 50ms"));
    }

    #[tokio::test]
    async fn task_without_handler_completes_with_warning() {
        let engine = FlowEngine::default();
        let mut step = FlowStep::task("t", "unused");
        if let sagaflow_types::flow::StepKind::Task(task) = &mut step.kind {
            task.handler = None;
        }
        engine
            .register_flow(FlowDefinition::new("f").with_step(step))
            .unwrap();

        let run = engine.execute("f", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.step_records["t"].attempts, 0);
        assert!(run.trace.iter().any(|t| t.message == "task step has no handler"));
    }

    #[tokio::test]
    async fn unregistered_handler_fails_the_run() {
        let engine = FlowEngine::default();
        engine
            .register_flow(FlowDefinition::new("f").with_step(FlowStep::task("t", "ghost")))
            .unwrap();

        let run = engine.execute("f", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("handler not registered: ghost"));
    }

    // -----------------------------------------------------------------------
    // Condition
    // -----------------------------------------------------------------------

    fn condition_engine(key: &'static str, map: BTreeMap<String, Vec<String>>) -> FlowEngine {
        let engine = FlowEngine::default();
        engine.register_handler(
            "route",
            FnHandler::new().on_condition(move |_| async move { Ok(key.to_string()) }),
        );
        engine.register_handler("work", returning(json!("done")));
        engine
            .register_flow(
                FlowDefinition::new("c")
                    .with_step(FlowStep::condition("pick", "route", map))
                    .with_step(FlowStep::task("left", "work"))
                    .with_step(FlowStep::task("right", "work"))
                    .with_step(FlowStep::task("fallback", "work")),
            )
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn condition_runs_only_the_chosen_branch() {
        let engine = condition_engine(
            "left",
            branches(&[("left", &["left"]), ("right", &["right"])]),
        );
        let run = engine.execute("c", Map::new()).await.unwrap();

        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.step_records["pick"].result, Some(json!("left")));
        assert!(run.step_records.contains_key("left"));
        assert!(!run.step_records.contains_key("right"));
        assert!(run
            .trace
            .iter()
            .any(|t| t.message == "condition evaluated to: left"));
    }

    #[tokio::test]
    async fn condition_falls_back_to_default_branch() {
        let engine = condition_engine(
            "unknown",
            branches(&[("left", &["left"]), ("default", &["fallback", "right"])]),
        );
        let run = engine.execute("c", Map::new()).await.unwrap();

        assert!(run.step_records.contains_key("fallback"));
        assert!(run.step_records.contains_key("right"));
        assert!(!run.step_records.contains_key("left"));
    }

    #[tokio::test]
    async fn condition_without_match_warns_and_completes() {
        let engine = condition_engine("nowhere", branches(&[("left", &["left"])]));
        let run = engine.execute("c", Map::new()).await.unwrap();

        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.step_records["pick"].status, StepStatus::Completed);
        assert!(!run.step_records.contains_key("left"));
        assert!(run
            .trace
            .iter()
            .any(|t| t.level == TraceLevel::Warn && t.message == "no branch for key: nowhere"));
    }

    #[tokio::test]
    async fn steps_depending_on_an_unchosen_branch_are_skipped() {
        let engine = condition_engine(
            "left",
            branches(&[("left", &["left"]), ("right", &["right"])]),
        );
        let def = engine.get_flow("c").unwrap();
        engine
            .register_flow(
                def.with_step(FlowStep::task("after-right", "work").depends_on(["right"]))
                    .with_step(FlowStep::task("after-left", "work").depends_on(["left"])),
            )
            .unwrap();

        let run = engine.execute("c", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.step_records["after-right"].status, StepStatus::Skipped);
        assert_eq!(run.step_records["after-right"].attempts, 0);
        assert_eq!(run.step_records["after-left"].status, StepStatus::Completed);
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn parallel_collects_results_in_declared_order() {
        let engine = FlowEngine::default();
        engine.register_handler("one", returning(json!(1)));
        engine.register_handler("two", returning(json!(2)));
        engine
            .register_flow(
                FlowDefinition::new("p")
                    .with_step(FlowStep::parallel("fan", vec!["b".into(), "a".into()]))
                    .with_step(FlowStep::task("a", "one"))
                    .with_step(FlowStep::task("b", "two")),
            )
            .unwrap();

        let run = engine.execute("p", Map::new()).await.unwrap();
        assert_eq!(run.step_records["fan"].result, Some(json!([2, 1])));
    }

    #[tokio::test]
    async fn parallel_failure_still_lets_siblings_complete() {
        let engine = FlowEngine::default();
        engine.register_handler("ok", returning(json!("fine")));
        engine.register_handler("bad", failing("disk full"));
        engine
            .register_flow(
                FlowDefinition::new("p")
                    .with_step(FlowStep::parallel(
                        "fan",
                        vec!["one".into(), "two".into(), "three".into()],
                    ))
                    .with_step(FlowStep::task("one", "ok"))
                    .with_step(FlowStep::task("two", "bad"))
                    .with_step(FlowStep::task("three", "ok")),
            )
            .unwrap();

        let run = engine.execute("p", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.step_records["fan"].status, StepStatus::Failed);
        assert_eq!(run.step_records["one"].status, StepStatus::Completed);
        assert_eq!(run.step_records["three"].status, StepStatus::Completed);
        assert_eq!(run.step_records["two"].status, StepStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("parallel step failed: disk full"));
    }

    #[tokio::test]
    async fn parallel_children_share_run_data() {
        let engine = FlowEngine::default();
        engine.register_handler(
            "mark",
            FnHandler::new().on_execute(|ctx| async move {
                ctx.set(ctx.step_id().to_string(), true);
                Ok(Value::Null)
            }),
        );
        engine
            .register_flow(
                FlowDefinition::new("p")
                    .with_step(FlowStep::parallel("fan", vec!["x".into(), "y".into()]))
                    .with_step(FlowStep::task("x", "mark"))
                    .with_step(FlowStep::task("y", "mark")),
            )
            .unwrap();

        let run = engine.execute("p", Map::new()).await.unwrap();
        assert_eq!(run.data.get("x"), Some(&json!(true)));
        assert_eq!(run.data.get("y"), Some(&json!(true)));
        assert_eq!(run.step_records["x"].result, None);
        assert_eq!(run.step_records["fan"].result, Some(json!([null, null])));
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    fn loop_engine(seen: std::sync::Arc<Mutex<Vec<(Value, usize)>>>) -> FlowEngine {
        let engine = FlowEngine::default();
        engine.register_handler(
            "visit",
            FnHandler::new().on_execute(move |ctx| {
                let seen = std::sync::Arc::clone(&seen);
                async move {
                    let item = ctx.loop_item().cloned().unwrap_or(Value::Null);
                    let index = ctx.loop_index().unwrap_or(usize::MAX);
                    seen.lock().unwrap().push((item.clone(), index));
                    Ok(json!({ "item": item }))
                }
            }),
        );
        engine
    }

    #[tokio::test]
    async fn loop_respects_max_iterations() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let engine = loop_engine(std::sync::Arc::clone(&seen));
        engine
            .register_flow(
                FlowDefinition::new("l")
                    .with_step(FlowStep::looping("each", "items", vec!["body".into()], Some(2)))
                    .with_step(FlowStep::task("body", "visit")),
            )
            .unwrap();

        let run = engine
            .execute("l", obj(json!({"items": [1, 2, 3]})))
            .await
            .unwrap();

        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(*seen.lock().unwrap(), vec![(json!(1), 0), (json!(2), 1)]);
        assert_eq!(run.step_records["each"].result, Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn loop_body_record_holds_only_the_last_iteration() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let engine = loop_engine(seen);
        engine
            .register_flow(
                FlowDefinition::new("l")
                    .with_step(FlowStep::looping("each", "items", vec!["body".into()], None))
                    .with_step(FlowStep::task("body", "visit")),
            )
            .unwrap();

        let run = engine
            .execute("l", obj(json!({"items": ["a", "b", "c"]})))
            .await
            .unwrap();

        assert_eq!(run.step_records["body"].result, Some(json!({"item": "c"})));
        assert_eq!(run.step_records["body"].attempts, 1);
        assert_eq!(run.data.len(), 1, "loop bookkeeping must not leak into run data");
    }

    #[tokio::test]
    async fn loop_body_failure_fails_loop_and_run() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let log = std::sync::Arc::clone(&seen);
        let engine = FlowEngine::default();
        engine.register_handler(
            "picky",
            FnHandler::new().on_execute(move |ctx| {
                let log = std::sync::Arc::clone(&log);
                async move {
                    let item = ctx.loop_item().cloned().unwrap_or(Value::Null);
                    log.lock().unwrap().push(item.clone());
                    if item == json!(2) {
                        return Err(StepError::from("item 2 rejected"));
                    }
                    Ok(item)
                }
            }),
        );
        engine.register_handler("after", returning(json!("done")));
        engine
            .register_flow(
                FlowDefinition::new("l")
                    .with_step(FlowStep::looping("each", "items", vec!["body".into()], None))
                    .with_step(FlowStep::task("body", "picky"))
                    .with_step(FlowStep::task("tail", "after").depends_on(["each"])),
            )
            .unwrap();

        let run = engine
            .execute("l", obj(json!({"items": [1, 2, 3]})))
            .await
            .unwrap();

        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("item 2 rejected"));
        assert_eq!(run.step_records["each"].status, StepStatus::Failed);
        assert_eq!(run.step_records["each"].error.as_deref(), Some("item 2 rejected"));
        assert_eq!(run.step_records["body"].status, StepStatus::Failed);
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
        assert!(!run.step_records.contains_key("tail"));
    }

    #[tokio::test]
    async fn nested_loops_keep_separate_frames() {
        let engine = FlowEngine::default();
        let cells = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&cells);
        engine.register_handler(
            "cell",
            FnHandler::new().on_execute(move |ctx| {
                let sink = std::sync::Arc::clone(&sink);
                async move {
                    let frames = ctx.loop_frames();
                    sink.lock()
                        .unwrap()
                        .push(format!("{}{}", frames[0].item, frames[1].item));
                    Ok(Value::Null)
                }
            }),
        );
        engine
            .register_flow(
                FlowDefinition::new("grid")
                    .with_step(FlowStep::looping("rows", "rows", vec!["cols".into()], None))
                    .with_step(FlowStep::looping("cols", "cols", vec!["cell".into()], None))
                    .with_step(FlowStep::task("cell", "cell")),
            )
            .unwrap();

        engine
            .execute("grid", obj(json!({"rows": [1, 2], "cols": [3, 4]})))
            .await
            .unwrap();

        assert_eq!(*cells.lock().unwrap(), vec!["13", "14", "23", "24"]);
    }

    #[tokio::test]
    async fn loop_over_non_array_warns_and_completes() {
        let engine = loop_engine(std::sync::Arc::new(Mutex::new(Vec::new())));
        engine
            .register_flow(
                FlowDefinition::new("l")
                    .with_step(FlowStep::looping("each", "items", vec!["body".into()], None))
                    .with_step(FlowStep::task("body", "visit")),
            )
            .unwrap();

        let run = engine
            .execute("l", obj(json!({"items": "nope"})))
            .await
            .unwrap();
        assert_eq!(run.status, FlowStatus::Completed);
        assert!(!run.step_records.contains_key("body"));
        assert!(run
            .trace
            .iter()
            .any(|t| t.message == "loop items key \"items\" is not an array"));
    }

    #[tokio::test]
    async fn loop_uses_configured_default_iteration_cap() {
        let engine = FlowEngine::new(EngineConfig {
            default_max_iterations: 1,
            ..EngineConfig::default()
        });
        engine.register_handler("noop", returning(Value::Null));
        engine
            .register_flow(
                FlowDefinition::new("l")
                    .with_step(FlowStep::looping("each", "items", vec!["body".into()], None))
                    .with_step(FlowStep::task("body", "noop")),
            )
            .unwrap();

        let run = engine
            .execute("l", obj(json!({"items": [7, 8, 9]})))
            .await
            .unwrap();
        assert_eq!(run.step_records["each"].result, Some(json!([7])));
    }

    // -----------------------------------------------------------------------
    // Subflow
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn subflow_works_on_a_copy_of_parent_data() {
        let engine = FlowEngine::default();
        engine.register_handler(
            "enrich",
            FnHandler::new().on_execute(|ctx| async move {
                ctx.set("enriched", true);
                Ok(Value::Null)
            }),
        );
        engine
            .register_flow(FlowDefinition::new("child").with_step(FlowStep::task("e", "enrich")))
            .unwrap();
        engine
            .register_flow(
                FlowDefinition::new("parent").with_step(FlowStep::subflow("sub", "child")),
            )
            .unwrap();

        let run = engine
            .execute("parent", obj(json!({"order": 7})))
            .await
            .unwrap();

        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(
            run.step_records["sub"].result,
            Some(json!({"order": 7, "enriched": true}))
        );
        assert!(!run.data.contains_key("enriched"));
    }

    #[tokio::test]
    async fn failed_subflow_fails_the_parent_step() {
        let engine = FlowEngine::default();
        engine.register_handler("bad", failing("no stock"));
        engine
            .register_flow(FlowDefinition::new("child").with_step(FlowStep::task("x", "bad")))
            .unwrap();
        engine
            .register_flow(
                FlowDefinition::new("parent").with_step(FlowStep::subflow("sub", "child")),
            )
            .unwrap();

        let run = engine.execute("parent", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("subflow 'child' failed: no stock"));
        assert!(run.step_records["sub"].result.is_some());
    }

    #[tokio::test]
    async fn unknown_subflow_fails_with_not_found() {
        let engine = FlowEngine::default();
        engine
            .register_flow(
                FlowDefinition::new("parent").with_step(FlowStep::subflow("sub", "ghost")),
            )
            .unwrap();

        let run = engine.execute("parent", Map::new()).await.unwrap();
        assert_eq!(run.error.as_deref(), Some("flow not found: ghost"));
    }

    #[tokio::test]
    async fn recursive_subflow_stops_at_max_depth() {
        let engine = FlowEngine::new(EngineConfig {
            max_subflow_depth: 2,
            ..EngineConfig::default()
        });
        engine
            .register_flow(
                FlowDefinition::new("again").with_step(FlowStep::subflow("self", "again")),
            )
            .unwrap();

        let run = engine.execute("again", Map::new()).await.unwrap();
        assert_eq!(run.status, FlowStatus::Failed);
        let error = run.error.unwrap();
        assert!(error.contains("subflow depth 3 exceeds maximum 2"), "{error}");
    }

    // -----------------------------------------------------------------------
    // Wait
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn wait_uses_literal_or_handler_delay() {
        let engine = FlowEngine::default();
        engine.register_handler("delay", FnHandler::new().on_wait(|_| async { Ok(250) }));
        let mut computed = FlowStep::wait("computed", 0);
        if let sagaflow_types::flow::StepKind::Wait(wait) = &mut computed.kind {
            wait.wait_handler = Some("delay".into());
        }
        engine
            .register_flow(
                FlowDefinition::new("w")
                    .with_step(FlowStep::wait("literal", 40))
                    .with_step(computed.depends_on(["literal"])),
            )
            .unwrap();

        let started = tokio::time::Instant::now();
        let run = engine.execute("w", Map::new()).await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(290));
        assert_eq!(run.step_records["literal"].result, Some(json!({"waited": 40})));
        assert_eq!(run.step_records["computed"].result, Some(json!({"waited": 250})));
    }
}
