//! Handlers shipped with the binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tasks_core::RunnerBuilder;
use tasks_core::typed::{Handler, HandlerError, RegistryError, handler_fn};

#[derive(Debug, Deserialize)]
pub struct HelloPayload {
    name: String,
}

pub struct HelloHandler;

#[async_trait]
impl Handler<HelloPayload> for HelloHandler {
    async fn handle(&self, sched: DateTime<Utc>, config: HelloPayload) -> Result<(), HandlerError> {
        if config.name.is_empty() {
            return Err(HandlerError::msg("name must not be empty"));
        }
        tracing::info!(%sched, "Hello, {}!", config.name);
        Ok(())
    }
}

/// Registers `public.hello`, `public.log_event` and `public.noop`.
pub fn register_builtin(builder: RunnerBuilder) -> Result<RunnerBuilder, RegistryError> {
    builder
        .register("public.hello", HelloHandler)?
        .register(
            "public.log_event",
            handler_fn(|sched, config| async move {
                tracing::info!(%sched, %config, "event");
                Ok(())
            }),
        )?
        .register("public.noop", handler_fn(|_, _| async { Ok(()) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasks_core::typed::{Arg, Callable, TypedCallable};

    #[tokio::test]
    async fn hello_rejects_empty_name() {
        let callable = TypedCallable::new(HelloHandler);
        let err = callable
            .invoke(vec![Arg::TimestampTz(Utc::now()), Arg::Jsonb(json!({ "name": "" }))])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "name must not be empty");

        callable
            .invoke(vec![Arg::TimestampTz(Utc::now()), Arg::Jsonb(json!({ "name": "tasks" }))])
            .await
            .unwrap();
    }
}
