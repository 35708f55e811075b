//! tasks-core
//!
//! A durable task runner: workers claim due tasks from a shared queue,
//! invoke the named handler with `(sched, config)` and schedule their own
//! next wakeup.
//!
//! # モジュール構成
//! - **domain**: Task, Identity, QualifiedName, WorkerArgs/WorkerState/WorkerExit
//! - **ports**: 抽象化レイヤー（TaskStore/QueueSession, Clock）
//! - **typed**: Handler trait, Callable, CallableRegistry
//! - **app**: TaskExecutor, WorkerLoop, Supervisor, RunnerBuilder
//! - **impls**: InMemoryTaskStore
//! - **config**, **error**, **observability**

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use crate::app::{RunnerBuilder, Supervisor};
pub use crate::config::{ConfigSource, FileConfig, Settings, SharedSettings};
pub use crate::error::{RunnerError, Severity};
