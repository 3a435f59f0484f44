//! Flow engine core: definitions, scheduling, step dispatch and saga rollback.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load/save
//! - `dag` -- dependency ordering and cycle diagnostics
//! - `handler` -- step handler traits and the name-keyed registry
//! - `context` -- per-run shared state and the view handed to handlers
//! - `retry` -- attempt limits and backoff delays
//! - `step_runner` -- dispatchers for all 6 step kinds
//! - `compensation` -- reverse-order saga compensation
//! - `stats` -- completed/failed counters and duration history
//! - `engine` -- the `FlowEngine` run controller

pub mod compensation;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod handler;
pub mod retry;
pub mod stats;
pub(crate) mod step_runner;

pub use compensation::CompensationReport;
pub use context::{LoopFrame, LoopScope, StepContext};
pub use dag::ExecutionPlan;
pub use definition::FlowError;
pub use engine::{EngineError, FlowEngine, RunHandle};
pub use handler::{FnHandler, HandlerRegistry, StepError, StepHandler, StepHandlerDyn};
