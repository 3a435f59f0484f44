//! Step handler trait, its object-safe wrapper, and the name-keyed registry.
//!
//! Flow definitions reference step logic by handler name. At run time the
//! engine resolves the name in its `HandlerRegistry` and calls the method that
//! matches the step kind:
//!
//! | Step kind        | Handler method |
//! |------------------|----------------|
//! | task             | `execute`      |
//! | condition        | `condition`    |
//! | task (saga undo) | `compensate`   |
//! | wait             | `wait_ms`      |
//!
//! Follows the blanket-impl pattern used for other RPITIT traits:
//! 1. `StepHandler` uses native async fn in traits (Rust 2024 edition, no async_trait macro)
//! 2. `StepHandlerDyn` is object-safe with boxed futures
//! 3. Every `T: StepHandler` gets `StepHandlerDyn` for free

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use super::context::StepContext;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors produced while executing a step.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// Handler-reported failure. Displays the raw message.
    #[error("{0}")]
    Failed(String),

    /// A task attempt exceeded its per-step timeout.
    #[error("step timeout after {0}ms")]
    Timeout(u64),

    /// The whole run exceeded its global timeout.
    #[error("flow timeout after {0}ms")]
    FlowTimeout(u64),

    /// The definition names a handler the engine does not know.
    #[error("handler not registered: {0}")]
    HandlerNotFound(String),

    /// The handler does not implement the method this step kind needs.
    #[error("handler does not implement {0}")]
    Unsupported(&'static str),

    /// At least one child of a parallel step failed.
    #[error("parallel step failed: {0}")]
    Parallel(String),

    /// A subflow run finished as failed.
    #[error("subflow '{flow_id}' failed: {error}")]
    Subflow { flow_id: String, error: String },

    /// A subflow step references an unregistered flow.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// Subflow nesting went past `max_subflow_depth`.
    #[error("subflow depth {depth} exceeds maximum {max}")]
    SubflowDepthExceeded { depth: u32, max: u32 },
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        StepError::Failed(message)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        StepError::Failed(message.to_string())
    }
}

// ---------------------------------------------------------------------------
// StepHandler trait
// ---------------------------------------------------------------------------

/// Step logic registered with the engine under a name.
///
/// Every method has a default that returns `StepError::Unsupported`, so a
/// handler only implements what the steps referencing it need.
pub trait StepHandler: Send + Sync {
    /// Run a task step. The returned value becomes the step's result
    /// (`Value::Null` records no result).
    fn execute(
        &self,
        _ctx: StepContext,
    ) -> impl Future<Output = Result<Value, StepError>> + Send {
        async { Err(StepError::Unsupported("execute")) }
    }

    /// Pick the branch key for a condition step.
    fn condition(
        &self,
        _ctx: StepContext,
    ) -> impl Future<Output = Result<String, StepError>> + Send {
        async { Err(StepError::Unsupported("condition")) }
    }

    /// Undo a completed task step during saga compensation.
    fn compensate(&self, _ctx: StepContext) -> impl Future<Output = Result<(), StepError>> + Send {
        async { Err(StepError::Unsupported("compensate")) }
    }

    /// Compute the delay for a wait step, in milliseconds.
    fn wait_ms(&self, _ctx: StepContext) -> impl Future<Output = Result<u64, StepError>> + Send {
        async { Err(StepError::Unsupported("wait_ms")) }
    }
}

/// Object-safe version of [`StepHandler`] with boxed futures.
///
/// Exists solely to allow `Arc<dyn StepHandlerDyn>` in the registry.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<Value, StepError>>;

    fn condition_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<String, StepError>>;

    fn compensate_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<(), StepError>>;

    fn wait_ms_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<u64, StepError>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<Value, StepError>> {
        Box::pin(self.execute(ctx))
    }

    fn condition_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<String, StepError>> {
        Box::pin(self.condition(ctx))
    }

    fn compensate_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<(), StepError>> {
        Box::pin(self.compensate(ctx))
    }

    fn wait_ms_boxed(&self, ctx: StepContext) -> BoxFuture<'_, Result<u64, StepError>> {
        Box::pin(self.wait_ms(ctx))
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Concurrent name -> handler map. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn StepHandlerDyn>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a handler under `name`.
    pub fn register<H: StepHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        self.register_arc(name, Arc::new(handler));
    }

    /// Register an already type-erased handler.
    pub fn register_arc(&self, name: impl Into<String>, handler: Arc<dyn StepHandlerDyn>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(handler = %name, "replaced step handler");
        }
    }

    /// Resolve a handler by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StepHandlerDyn>, StepError> {
        self.handlers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StepError::HandlerNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FnHandler
// ---------------------------------------------------------------------------

type ExecuteFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;
type ConditionFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<String, StepError>> + Send + Sync>;
type CompensateFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;
type WaitFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<u64, StepError>> + Send + Sync>;

/// Handler assembled from async closures.
///
/// ```ignore
/// engine.register_handler(
///     "charge",
///     FnHandler::new()
///         .on_execute(|ctx| async move { Ok(json!({"charged": ctx.get("amount")})) })
///         .on_compensate(|_ctx| async { Ok(()) }),
/// );
/// ```
#[derive(Clone, Default)]
pub struct FnHandler {
    execute: Option<ExecuteFn>,
    condition: Option<ConditionFn>,
    compensate: Option<CompensateFn>,
    wait: Option<WaitFn>,
}

impl FnHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_execute<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.execute = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn on_condition<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, StepError>> + Send + 'static,
    {
        self.condition = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn on_compensate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn on_wait<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u64, StepError>> + Send + 'static,
    {
        self.wait = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }
}

impl StepHandler for FnHandler {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        match &self.execute {
            Some(f) => f(ctx).await,
            None => Err(StepError::Unsupported("execute")),
        }
    }

    async fn condition(&self, ctx: StepContext) -> Result<String, StepError> {
        match &self.condition {
            Some(f) => f(ctx).await,
            None => Err(StepError::Unsupported("condition")),
        }
    }

    async fn compensate(&self, ctx: StepContext) -> Result<(), StepError> {
        match &self.compensate {
            Some(f) => f(ctx).await,
            None => Err(StepError::Unsupported("compensate")),
        }
    }

    async fn wait_ms(&self, ctx: StepContext) -> Result<u64, StepError> {
        match &self.wait {
            Some(f) => f(ctx).await,
            None => Err(StepError::Unsupported("wait_ms")),
        }
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("execute", &self.execute.is_some())
            .field("condition", &self.condition.is_some())
            .field("compensate", &self.compensate.is_some())
            .field("wait", &self.wait.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::{LoopScope, RunState};
    use sagaflow_types::run::FlowRun;
    use serde_json::{Map, json};
    use tokio_util::sync::CancellationToken;

    fn test_context() -> StepContext {
        let state = Arc::new(RunState::new(
            FlowRun::new("f", Map::new()),
            CancellationToken::new(),
        ));
        StepContext::new(state, "s", LoopScope::default())
    }

    struct Doubler;

    impl StepHandler for Doubler {
        async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
            let n = ctx.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn trait_defaults_report_unsupported() {
        let handler = Doubler;
        let err = handler.condition(test_context()).await.unwrap_err();
        assert_eq!(err, StepError::Unsupported("condition"));
        assert_eq!(err.to_string(), "handler does not implement condition");
    }

    #[tokio::test]
    async fn registry_dispatches_through_dyn_wrapper() {
        let registry = HandlerRegistry::new();
        registry.register("double", Doubler);

        let ctx = test_context();
        ctx.set("n", 21);
        let handler = registry.get("double").unwrap();
        assert_eq!(handler.execute_boxed(ctx).await.unwrap(), json!(42));
    }

    #[test]
    fn registry_reports_missing_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.get("ghost").err().unwrap();
        assert_eq!(err.to_string(), "handler not registered: ghost");
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_names_are_sorted_and_clone_shares_map() {
        let registry = HandlerRegistry::new();
        let shared = registry.clone();
        shared.register("b", FnHandler::new());
        shared.register("a", FnHandler::new());
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.remove("a"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn fn_handler_routes_each_method() {
        let handler = FnHandler::new()
            .on_execute(|_| async { Ok(json!("done")) })
            .on_condition(|_| async { Ok("left".to_string()) })
            .on_wait(|_| async { Ok(25) });

        assert_eq!(handler.execute(test_context()).await.unwrap(), json!("done"));
        assert_eq!(handler.condition(test_context()).await.unwrap(), "left");
        assert_eq!(handler.wait_ms(test_context()).await.unwrap(), 25);
        assert_eq!(
            handler.compensate(test_context()).await.unwrap_err(),
            StepError::Unsupported("compensate")
        );
        assert!(format!("{handler:?}").contains("execute: true"));
    }

    #[test]
    fn step_error_messages() {
        assert_eq!(StepError::from("boom").to_string(), "boom");
        assert_eq!(StepError::Timeout(50).to_string(), "step timeout after 50ms");
        assert_eq!(StepError::FlowTimeout(10).to_string(), "flow timeout after 10ms");
        let err = StepError::Subflow {
            flow_id: "child".into(),
            error: "bad".into(),
        };
        assert_eq!(err.to_string(), "subflow 'child' failed: bad");
    }
}
