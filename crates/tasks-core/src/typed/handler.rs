//! Handler trait - task handlers and their type-erased form.
//!
//! # 二層構造
//! - `Handler<T>`: what applications implement. `T` is the decoded task
//!   config; use `serde_json::Value` to take it raw.
//! - `Callable`: object-safe, stored in the registry and invoked with
//!   positional arguments. `TypedCallable<T, H>` bridges the two.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("config decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("argument mismatch: expected {expected}, got {got}")]
    Arguments { expected: Signature, got: String },
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArgKind {
    TimestampTz,
    Jsonb,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::TimestampTz => f.write_str("timestamptz"),
            ArgKind::Jsonb => f.write_str("jsonb"),
        }
    }
}

/// Positional argument types of a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(&'static [ArgKind]);

impl Signature {
    /// `(scheduled_time, config)`, the only shape the task runner calls.
    pub const TASK: Signature = Signature(&[ArgKind::TimestampTz, ArgKind::Jsonb]);

    pub const fn new(args: &'static [ArgKind]) -> Self {
        Self(args)
    }

    pub fn args(&self) -> &'static [ArgKind] {
        self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    TimestampTz(DateTime<Utc>),
    Jsonb(serde_json::Value),
}

impl Arg {
    fn kind(&self) -> ArgKind {
        match self {
            Arg::TimestampTz(_) => ArgKind::TimestampTz,
            Arg::Jsonb(_) => ArgKind::Jsonb,
        }
    }
}

/// A handler for tasks whose config decodes into `T`.
///
/// # 使用例
/// ```ignore
/// #[derive(Deserialize)]
/// struct Purge { older_than_days: u32 }
///
/// struct PurgeHandler;
///
/// #[async_trait]
/// impl Handler<Purge> for PurgeHandler {
///     async fn handle(&self, sched: DateTime<Utc>, config: Purge) -> Result<(), HandlerError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T>: Send + Sync
where
    T: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, sched: DateTime<Utc>, config: T) -> Result<(), HandlerError>;
}

/// Object-safe callable as resolved from the registry.
#[async_trait]
pub trait Callable: Send + Sync {
    fn signature(&self) -> Signature;

    /// Return values are not part of the contract; only failure matters.
    async fn invoke(&self, args: Vec<Arg>) -> Result<(), HandlerError>;
}

pub struct TypedCallable<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> TypedCallable<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> Callable for TypedCallable<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    fn signature(&self) -> Signature {
        Signature::TASK
    }

    async fn invoke(&self, args: Vec<Arg>) -> Result<(), HandlerError> {
        let mut args = args.into_iter();
        match (args.next(), args.next(), args.next()) {
            (Some(Arg::TimestampTz(sched)), Some(Arg::Jsonb(config)), None) => {
                let config: T = serde_json::from_value(config)?;
                self.handler.handle(sched, config).await
            }
            (first, second, rest) => {
                let got = [first, second, rest]
                    .iter()
                    .flatten()
                    .map(|arg| arg.kind().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(HandlerError::Arguments {
                    expected: Signature::TASK,
                    got: format!("({got})"),
                })
            }
        }
    }
}

/// Closure adapter, mostly for small handlers and tests.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(DateTime<Utc>, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler<serde_json::Value> for FnHandler<F>
where
    F: Fn(DateTime<Utc>, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        sched: DateTime<Utc>,
        config: serde_json::Value,
    ) -> Result<(), HandlerError> {
        (self.0)(sched, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Purge {
        older_than_days: u32,
    }

    #[derive(Default)]
    struct PurgeHandler {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Handler<Purge> for PurgeHandler {
        async fn handle(&self, _sched: DateTime<Utc>, config: Purge) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(config.older_than_days);
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_callable_decodes_config() {
        let callable = TypedCallable::<Purge, _>::new(PurgeHandler::default());
        callable
            .invoke(vec![
                Arg::TimestampTz(Utc::now()),
                Arg::Jsonb(json!({ "older_than_days": 30 })),
            ])
            .await
            .unwrap();
        assert_eq!(*callable.handler.seen.lock().unwrap(), vec![30]);
    }

    #[tokio::test]
    async fn decode_failure_is_a_handler_error() {
        let callable = TypedCallable::<Purge, _>::new(PurgeHandler::default());
        let err = callable
            .invoke(vec![Arg::TimestampTz(Utc::now()), Arg::Jsonb(json!({ "days": "x" }))])
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[tokio::test]
    async fn wrong_arguments_are_rejected() {
        let callable = TypedCallable::new(handler_fn(|_, _| async { Ok(()) }));
        let err = callable
            .invoke(vec![Arg::Jsonb(json!({}))])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument mismatch: expected (timestamptz, jsonb), got (jsonb)"
        );
    }
}
