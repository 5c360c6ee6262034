//! A shared counter. Clients connect with an optional `{"name": ...}`
//! parameter, which becomes their connection state.

use actor_runtime::{ActorBuilder, ActorDefinition, ActorError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

pub fn definition() -> ActorDefinition {
    ActorBuilder::new("counter")
        .on_initialize(|| async { Ok(Counter::default()) })
        .on_start(|ctx| async move {
            let counter: Counter = ctx.state().get_as()?;
            info!(count = counter.count, "counter started");
            Ok(())
        })
        .on_before_connect(|_, req| async move {
            let name = match &req.parameters {
                Value::Null => "anonymous".to_string(),
                params => params["name"]
                    .as_str()
                    .ok_or_else(|| ActorError::user("invalid_params", "`name` must be a string"))?
                    .to_string(),
            };
            Ok(json!({ "name": name }))
        })
        .rpc("increment", |ctx, args| async move {
            let by: i64 = args.optional(0)?.unwrap_or(1);
            let state = ctx.state();
            let mut counter: Counter = state.get_as()?;
            counter.count = counter
                .count
                .checked_add(by)
                .ok_or_else(|| ActorError::user("overflow", "counter overflow"))?;
            state.set(&counter)?;
            ctx.actor().broadcast("changed", vec![json!(counter.count)])?;
            Ok(counter.count)
        })
        .rpc_sync("getCount", |ctx, _| {
            let counter: Counter = ctx.state().get_as()?;
            Ok(counter.count)
        })
        .rpc_sync("whoami", |ctx, _| Ok(ctx.connection().state()?))
        .build()
}
