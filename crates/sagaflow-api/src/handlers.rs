//! Built-in step handlers registered for every `sagaflow run`.
//!
//! | Name    | Implements             | Behaviour                                   |
//! |---------|------------------------|---------------------------------------------|
//! | `noop`  | execute, compensate    | does nothing, records no result             |
//! | `echo`  | execute                | returns the loop item, else the run data    |
//! | `fail`  | execute                | always fails                                |
//! | `count` | execute, compensate    | increments / decrements `data.count`        |
//! | `route` | condition              | branch key from `data.route`, else default  |

use sagaflow_core::flow::{FlowEngine, StepContext, StepError, StepHandler};
use sagaflow_types::flow::DEFAULT_BRANCH;
use serde_json::Value;

/// Data key read and written by `count`.
pub const COUNT_KEY: &str = "count";

/// Data key read by `route`.
pub const ROUTE_KEY: &str = "route";

pub struct Noop;

impl StepHandler for Noop {
    async fn execute(&self, _ctx: StepContext) -> Result<Value, StepError> {
        Ok(Value::Null)
    }

    async fn compensate(&self, _ctx: StepContext) -> Result<(), StepError> {
        Ok(())
    }
}

pub struct Echo;

impl StepHandler for Echo {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        Ok(match ctx.loop_item() {
            Some(item) => item.clone(),
            None => Value::Object(ctx.data()),
        })
    }
}

pub struct Fail;

impl StepHandler for Fail {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        Err(StepError::Failed(format!(
            "step '{}' failed on request",
            ctx.step_id()
        )))
    }
}

pub struct Count;

impl Count {
    fn bump(ctx: &StepContext, delta: i64) -> i64 {
        ctx.update_data(|data| {
            let next = data.get(COUNT_KEY).and_then(Value::as_i64).unwrap_or(0) + delta;
            data.insert(COUNT_KEY.to_string(), next.into());
            next
        })
    }
}

impl StepHandler for Count {
    async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        Ok(Self::bump(&ctx, 1).into())
    }

    async fn compensate(&self, ctx: StepContext) -> Result<(), StepError> {
        Self::bump(&ctx, -1);
        Ok(())
    }
}

pub struct Route;

impl StepHandler for Route {
    async fn condition(&self, ctx: StepContext) -> Result<String, StepError> {
        Ok(ctx
            .get(ROUTE_KEY)
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()))
    }
}

/// Register every built-in handler under its table name.
pub fn register_builtin(engine: &FlowEngine) {
    engine.register_handler("noop", Noop);
    engine.register_handler("echo", Echo);
    engine.register_handler("fail", Fail);
    engine.register_handler("count", Count);
    engine.register_handler("route", Route);
}
