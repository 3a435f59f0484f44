//! Per-run shared state and the `StepContext` view handed to handlers.
//!
//! `RunState` owns the live `FlowRun` behind a `std::sync::Mutex`. The lock is
//! only taken inside short closures (`with_run`) and never held across an
//! await, so handlers running concurrently in a parallel step each see a
//! consistent map without blocking each other's async work.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use sagaflow_types::run::{FlowRun, FlowStatus, TraceLevel};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Live state of one run, shared between the driver, step handlers and the
/// engine's control methods.
pub(crate) struct RunState {
    run_id: Uuid,
    run: Mutex<FlowRun>,
    /// Cancelled by `FlowEngine::cancel` or by a parent run's token.
    pub(crate) cancel: CancellationToken,
    /// Signalled by `FlowEngine::resume`.
    pub(crate) resumed: Notify,
}

impl RunState {
    pub(crate) fn new(run: FlowRun, cancel: CancellationToken) -> Self {
        Self {
            run_id: run.run_id,
            run: Mutex::new(run),
            cancel,
            resumed: Notify::new(),
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run `f` with exclusive access to the run record.
    pub(crate) fn with_run<R>(&self, f: impl FnOnce(&mut FlowRun) -> R) -> R {
        let mut run = self.run.lock().expect("run state lock poisoned");
        f(&mut run)
    }

    /// Deep copy of the current run record.
    pub(crate) fn snapshot(&self) -> FlowRun {
        self.with_run(|run| run.clone())
    }

    pub(crate) fn status(&self) -> FlowStatus {
        self.with_run(|run| run.status)
    }

    /// Cancelled directly, or through a cancelled parent token.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.status() == FlowStatus::Cancelled
    }

    pub(crate) fn trace(
        &self,
        step_id: Option<&str>,
        level: TraceLevel,
        message: impl Into<String>,
    ) {
        self.with_run(|run| run.push_trace(step_id, level, message));
    }
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loop scope
// ---------------------------------------------------------------------------

/// One active loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopFrame {
    /// ID of the loop step that owns this iteration.
    pub step_id: String,
    pub item: Value,
    pub index: usize,
}

/// Stack of active loop iterations, innermost last.
///
/// Loop item and index live here rather than in `run.data`, so nested loops
/// never overwrite each other's values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopScope {
    frames: Vec<LoopFrame>,
}

impl LoopScope {
    /// A new scope with `frame` pushed on top.
    pub fn enter(&self, frame: LoopFrame) -> LoopScope {
        let mut frames = self.frames.clone();
        frames.push(frame);
        LoopScope { frames }
    }

    /// Innermost iteration, if any.
    pub fn current(&self) -> Option<&LoopFrame> {
        self.frames.last()
    }

    pub fn frames(&self) -> &[LoopFrame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Read/write view of a run handed to every handler call.
///
/// `data` is shared by every step of the run, including concurrent parallel
/// children: writers racing on the same key is the caller's concern.
#[derive(Clone)]
pub struct StepContext {
    state: Arc<RunState>,
    step_id: String,
    scope: LoopScope,
}

impl StepContext {
    pub(crate) fn new(state: Arc<RunState>, step_id: impl Into<String>, scope: LoopScope) -> Self {
        Self {
            state,
            step_id: step_id.into(),
            scope,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.state.run_id()
    }

    pub fn flow_id(&self) -> String {
        self.state.with_run(|run| run.flow_id.clone())
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Item of the innermost loop iteration.
    pub fn loop_item(&self) -> Option<&Value> {
        self.scope.current().map(|frame| &frame.item)
    }

    /// Zero-based index of the innermost loop iteration.
    pub fn loop_index(&self) -> Option<usize> {
        self.scope.current().map(|frame| frame.index)
    }

    /// All enclosing loop iterations, outermost first.
    pub fn loop_frames(&self) -> &[LoopFrame] {
        self.scope.frames()
    }

    /// Results recorded so far, keyed by step ID.
    pub fn results(&self) -> BTreeMap<String, Value> {
        self.state.with_run(|run| run.results())
    }

    /// Result of one step, if it has recorded one.
    pub fn result(&self, step_id: &str) -> Option<Value> {
        self.state.with_run(|run| {
            run.step_records
                .get(step_id)
                .and_then(|record| record.result.clone())
        })
    }

    /// Copy of the whole run data map.
    pub fn data(&self) -> Map<String, Value> {
        self.state.with_run(|run| run.data.clone())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.with_run(|run| run.data.get(key).cloned())
    }

    /// Write a run data key, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let (key, value) = (key.into(), value.into());
        self.state.with_run(|run| run.data.insert(key, value))
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.state.with_run(|run| run.data.remove(key))
    }

    /// Mutate the run data in place under a single lock.
    pub fn update_data<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        self.state.with_run(|run| f(&mut run.data))
    }

    /// Append an info entry to the run's trace, attributed to this step.
    pub fn log(&self, message: impl Into<String>) {
        self.state
            .trace(Some(&self.step_id), TraceLevel::Info, message);
    }

    /// Whether the run has been cancelled. Long-running handlers may poll this.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Token cancelled when the run (or a parent run) is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.state.run_id())
            .field("step_id", &self.step_id)
            .field("loop_depth", &self.scope.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_types::run::StepRecord;
    use serde_json::json;

    fn state_with(data: Value) -> Arc<RunState> {
        let data = data.as_object().cloned().unwrap_or_default();
        Arc::new(RunState::new(
            FlowRun::new("flow", data),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn data_writes_are_visible_to_other_contexts() {
        let state = state_with(json!({"a": 1}));
        let first = StepContext::new(Arc::clone(&state), "first", LoopScope::default());
        let second = StepContext::new(Arc::clone(&state), "second", LoopScope::default());

        assert_eq!(first.set("b", "two"), None);
        assert_eq!(second.get("b"), Some(json!("two")));
        assert_eq!(second.remove("a"), Some(json!(1)));
        assert!(!first.data().contains_key("a"));

        let len = first.update_data(|data| {
            data.insert("c".into(), json!(true));
            data.len()
        });
        assert_eq!(len, 2);
    }

    #[test]
    fn results_reflect_step_records() {
        let state = state_with(json!({}));
        state.with_run(|run| {
            let mut rec = StepRecord::started("a");
            rec.complete(Some(json!({"x": 1})));
            run.step_records.insert("a".into(), rec);
        });
        let ctx = StepContext::new(state, "b", LoopScope::default());
        assert_eq!(ctx.result("a"), Some(json!({"x": 1})));
        assert_eq!(ctx.results().len(), 1);
        assert_eq!(ctx.result("missing"), None);
    }

    #[test]
    fn nested_loop_frames_do_not_collide() {
        let outer = LoopScope::default().enter(LoopFrame {
            step_id: "rows".into(),
            item: json!("r0"),
            index: 0,
        });
        let inner = outer.enter(LoopFrame {
            step_id: "cols".into(),
            item: json!("c3"),
            index: 3,
        });

        let ctx = StepContext::new(state_with(json!({})), "cell", inner);
        assert_eq!(ctx.loop_item(), Some(&json!("c3")));
        assert_eq!(ctx.loop_index(), Some(3));
        assert_eq!(ctx.loop_frames()[0].item, json!("r0"));
        assert_eq!(outer.depth(), 1);
        assert!(!ctx.data().contains_key("__loopItem"));
    }

    #[test]
    fn log_appends_info_trace_for_step() {
        let state = state_with(json!({}));
        let ctx = StepContext::new(Arc::clone(&state), "writer", LoopScope::default());
        ctx.log("hello");

        let run = state.snapshot();
        assert_eq!(run.trace.len(), 1);
        assert_eq!(run.trace[0].step_id.as_deref(), Some("writer"));
        assert_eq!(run.trace[0].level, TraceLevel::Info);
        assert_eq!(ctx.loop_item(), None);
    }

    #[test]
    fn cancellation_is_seen_through_token_or_status() {
        let parent = CancellationToken::new();
        let state = Arc::new(RunState::new(
            FlowRun::new("flow", Map::new()),
            parent.child_token(),
        ));
        let ctx = StepContext::new(Arc::clone(&state), "s", LoopScope::default());
        assert!(!ctx.is_cancelled());

        parent.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.cancellation_token().is_cancelled());
    }
}
