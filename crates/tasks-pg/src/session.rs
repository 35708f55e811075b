use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tasks_core::domain::{Identity, Task, TaskId};
use tasks_core::ports::QueueSession;
use tasks_core::RunnerError;

use crate::query::{
    map_error, NamedQuery, QueryArg, QueryExecutor, CLAIM_NEXT, DELETE_TASK, EARLIEST_PENDING,
    HAS_PRIVS_OF_ROLE,
};

/// One worker's connection to `tasks.task`.
///
/// The pool is capped at a single connection, so every transaction runs on
/// the same server session and prepared statements stay valid.
pub struct PgQueueSession {
    pool: PgPool,
    database: String,
    tx: Option<Transaction<'static, Postgres>>,
    queries: QueryExecutor,
}

impl PgQueueSession {
    pub(crate) fn new(pool: PgPool, database: impl Into<String>) -> Self {
        let database = database.into();
        Self {
            pool,
            queries: QueryExecutor::new(database.clone()),
            database,
            tx: None,
        }
    }

    /// Whether `query` has already been prepared on this connection.
    pub fn is_prepared(&self, query: &NamedQuery) -> bool {
        self.queries.is_prepared(query.name)
    }

    async fn run(
        &mut self,
        query: &NamedQuery,
        args: Vec<QueryArg>,
        read_only: bool,
        row_limit: usize,
    ) -> Result<Vec<PgRow>, RunnerError> {
        let Some(tx) = self.tx.as_mut() else {
            return Err(RunnerError::protocol(query.name, "no transaction in progress"));
        };
        self.queries
            .execute(&mut **tx, query, args, read_only, row_limit)
            .await
    }

    fn decode<'r, T>(&self, query: &str, row: &'r PgRow, column: &str) -> Result<T, RunnerError>
    where
        T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    {
        row.try_get(column)
            .map_err(|err| map_error(query, &self.database, err))
    }
}

#[async_trait]
impl QueueSession for PgQueueSession {
    async fn begin(&mut self) -> Result<(), RunnerError> {
        if self.tx.is_some() {
            return Err(RunnerError::protocol("begin", "transaction already in progress"));
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| map_error("begin", &self.database, err))?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), RunnerError> {
        let Some(tx) = self.tx.take() else {
            return Err(RunnerError::protocol("commit", "no transaction in progress"));
        };
        tx.commit()
            .await
            .map_err(|err| map_error("commit", &self.database, err))
    }

    async fn rollback(&mut self) -> Result<(), RunnerError> {
        let Some(tx) = self.tx.take() else {
            return Err(RunnerError::protocol("rollback", "no transaction in progress"));
        };
        tx.rollback()
            .await
            .map_err(|err| map_error("rollback", &self.database, err))
    }

    async fn earliest_pending(
        &mut self,
        fallback: Duration,
    ) -> Result<Option<DateTime<Utc>>, RunnerError> {
        let rows = self
            .run(
                &EARLIEST_PENDING,
                vec![QueryArg::Float8(Some(fallback.as_secs_f64()))],
                true,
                1,
            )
            .await?;
        let Some(row) = rows.first() else {
            return Err(RunnerError::protocol(EARLIEST_PENDING.name, "returned no rows"));
        };
        self.decode(EARLIEST_PENDING.name, row, "next_wakeup")
    }

    async fn claim_next(&mut self) -> Result<Option<Task>, RunnerError> {
        let rows = self.run(&CLAIM_NEXT, Vec::new(), false, 1).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let name = CLAIM_NEXT.name;
        let config: Option<serde_json::Value> = self.decode(name, row, "task_config")?;
        Ok(Some(Task {
            id: TaskId::new(self.decode(name, row, "task_id")?),
            owner: Identity::new(self.decode::<String>(name, row, "task_owner")?),
            exec: self.decode(name, row, "task_exec")?,
            sched: self.decode(name, row, "task_sched")?,
            config: config.unwrap_or(serde_json::Value::Null),
        }))
    }

    async fn delete(&mut self, id: TaskId) -> Result<(), RunnerError> {
        self.run(&DELETE_TASK, vec![QueryArg::Int4(Some(id.get()))], false, 0)
            .await?;
        Ok(())
    }

    async fn has_privs_of(
        &mut self,
        member: &Identity,
        role: &Identity,
    ) -> Result<bool, RunnerError> {
        let rows = self
            .run(
                &HAS_PRIVS_OF_ROLE,
                vec![
                    QueryArg::Text(Some(member.to_string())),
                    QueryArg::Text(Some(role.to_string())),
                ],
                true,
                1,
            )
            .await?;
        let Some(row) = rows.first() else {
            return Err(RunnerError::protocol(HAS_PRIVS_OF_ROLE.name, "returned no rows"));
        };
        self.decode(HAS_PRIVS_OF_ROLE.name, row, "has_privs")
    }
}
