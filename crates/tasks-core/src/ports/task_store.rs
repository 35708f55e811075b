//! TaskStore port - the durable queue.
//!
//! A store hands each worker its own `QueueSession` (one connection, one
//! prepared-query cache). Every queue operation runs inside the session's
//! current transaction; calling one with no transaction open is an error.
//!
//! # Contract
//! - `claim_next` locks at most one due row (`sched <= now`), highest
//!   `sched` first, and silently skips rows locked by other sessions.
//! - `delete` is only made durable by `commit`; `rollback` (or dropping the
//!   session mid-transaction) brings the row back.
//! - `earliest_pending` does not lock and sees every committed row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::{Identity, Task, TaskId, WorkerArgs};
use crate::error::RunnerError;

/// Opens worker sessions against a target database.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn connect(&self, args: &WorkerArgs) -> Result<Box<dyn QueueSession>, RunnerError>;
}

/// One worker's view of the queue.
#[async_trait]
pub trait QueueSession: Send {
    async fn begin(&mut self) -> Result<(), RunnerError>;

    async fn commit(&mut self) -> Result<(), RunnerError>;

    async fn rollback(&mut self) -> Result<(), RunnerError>;

    /// Earliest `sched` among pending tasks, or `now + fallback` when there
    /// are none. `None` only if the store produced a null timestamp.
    async fn earliest_pending(
        &mut self,
        fallback: Duration,
    ) -> Result<Option<DateTime<Utc>>, RunnerError>;

    async fn claim_next(&mut self) -> Result<Option<Task>, RunnerError>;

    async fn delete(&mut self, id: TaskId) -> Result<(), RunnerError>;

    /// Whether `member` holds the privileges of `role`.
    async fn has_privs_of(&mut self, member: &Identity, role: &Identity)
    -> Result<bool, RunnerError>;
}
