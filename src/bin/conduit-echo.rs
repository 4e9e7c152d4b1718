//! conduit-echo: a small driver used for smoke tests and as a template.
//!
//! RPC methods:
//! - `echo`: returns its parameters
//! - `fail`: always fails with the given message
//! - `whoami`: service, args, options, pid and start count
//! - `options`: the last options delivered by the daemon
//! - `call`: relays `{feature, method, params}` through the daemon
//! - `cold`: asks the daemon for a cold restart
//! - `exit`: exits the process with the given code
//!
//! Commands:
//! - `flaky`: fails until it has been attempted `succeed_on` times
//!   (label, default 1), counting across the whole process

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use conduit::driver::{Driver, DriverContext};
use conduit::{FeatureConfig, HandlerError, Message};

#[derive(Debug, Deserialize)]
struct RelayParams {
    feature: String,
    method: String,
    #[serde(default)]
    params: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let attempts = Arc::new(AtomicU64::new(0));

    Driver::new("echo")
        .on_start(|_ctx, options: FeatureConfig| async move {
            if options.data.get("fail_start").and_then(Value::as_bool) == Some(true) {
                return Err(HandlerError::from("fail_start is set"));
            }
            Ok(())
        })
        .rpc("echo", |_ctx, params: Value| async move { Ok(params) })
        .rpc("fail", |_ctx, reason: String| async move {
            Err::<Value, _>(HandlerError(reason))
        })
        .rpc("whoami", |ctx: DriverContext, _: Value| async move {
            Ok(json!({
                "service": ctx.service(),
                "args": ctx.args(),
                "options": ctx.options(),
                "pid": std::process::id(),
                "starts": ctx.starts(),
            }))
        })
        .rpc("options", |ctx: DriverContext, _: Value| async move { Ok(ctx.options()) })
        .rpc("call", |ctx: DriverContext, relay: RelayParams| async move {
            let out: Value = ctx.call(&relay.feature, &relay.method, &relay.params).await?;
            Ok(out)
        })
        .rpc("cold", |ctx: DriverContext, _: Value| async move {
            ctx.request_cold().await.map_err(HandlerError::new)?;
            Ok(Value::Null)
        })
        .rpc("exit", |_ctx, code: i32| async move {
            if code >= 0 {
                tracing::info!(code, "exiting on request");
                std::process::exit(code)
            }
            Err::<Value, _>(HandlerError::from("exit code must not be negative"))
        })
        .command("flaky", move |_ctx, message: Message| {
            let attempts = attempts.clone();
            async move {
                let succeed_on = message
                    .label("succeed_on")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < succeed_on {
                    return Err(HandlerError(format!(
                        "attempt {} of {} failed",
                        attempt, succeed_on
                    )));
                }
                Ok(())
            }
        })
        .run()
        .await?;

    Ok(())
}
