//! `eval` action: run script text in the host and normalize its outcome.
//!
//! Errors are reported inside `result` as a string; peers already parse
//! that shape, so it is kept even though `fetch` uses `error`.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, instrument};

use super::Reply;
use crate::host::{Callable, Evaluated, Evaluator};
use crate::transport::protocol::{EvalParams, Response};

/// An outcome with every deferred layer awaited.
enum Settled {
    Value(Value),
    Callable(Callable),
}

#[instrument(skip_all, fields(event_id = %event_id))]
pub async fn handle(evaluator: &dyn Evaluator, event_id: Value, params: EvalParams) -> Reply {
    let result = match evaluate(evaluator, &params.string, params.arg).await {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %format!("{e:#}"), "Evaluation failed");
            Value::String(format!("{e:#}"))
        }
    };
    Reply::control(Response::Evaluated { event_id, result })
}

async fn evaluate(evaluator: &dyn Evaluator, script: &str, arg: Option<Value>) -> Result<Value> {
    let evaluated = evaluator.evaluate(script).await?;
    normalize(evaluated, arg).await
}

/// Reduce an evaluation outcome to a plain value.
///
/// Deferred values are awaited; a callable is invoked once with `arg` and its
/// outcome awaited in turn. Anything still callable after that becomes
/// `null`, as a function would in JSON.
pub async fn normalize(evaluated: Evaluated, arg: Option<Value>) -> Result<Value> {
    match settle(evaluated).await? {
        Settled::Value(value) => Ok(value),
        Settled::Callable(callable) => match settle(callable(arg)?).await? {
            Settled::Value(value) => Ok(value),
            Settled::Callable(_) => Ok(Value::Null),
        },
    }
}

async fn settle(mut evaluated: Evaluated) -> Result<Settled> {
    loop {
        evaluated = match evaluated {
            Evaluated::Value(value) => return Ok(Settled::Value(value)),
            Evaluated::Callable(callable) => return Ok(Settled::Callable(callable)),
            Evaluated::Deferred(deferred) => deferred.await?,
        };
    }
}
