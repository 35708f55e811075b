//! `tasks.task` DDL and producer-side helpers.

use sqlx::postgres::PgPool;
use tasks_core::domain::{NewTask, TaskId};
use tasks_core::RunnerError;

use crate::query::map_error;

const SCHEMA: &[&str] = &[
    "create schema if not exists tasks",
    "create table if not exists tasks.task (
        task_id serial primary key,
        task_owner regrole not null default current_user::regrole,
        task_exec text,
        task_sched timestamptz not null default now(),
        task_config jsonb
    )",
    "create index if not exists task_sched_idx on tasks.task (task_sched)",
];

/// Creates the schema; safe to run more than once.
pub async fn install(pool: &PgPool) -> Result<(), RunnerError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| map_error("install", "", err))?;
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|err| map_error("install", "", err))?;
    }
    tx.commit()
        .await
        .map_err(|err| map_error("install", "", err))?;
    Ok(())
}

pub async fn enqueue(pool: &PgPool, task: &NewTask) -> Result<TaskId, RunnerError> {
    let id: i32 = sqlx::query_scalar(
        "insert into tasks.task (task_owner, task_exec, task_sched, task_config)
         values (quote_ident($1)::regrole, $2, $3, $4)
         returning task_id",
    )
    .bind(task.owner.as_str())
    .bind(task.exec.as_deref())
    .bind(task.sched)
    .bind(&task.config)
    .fetch_one(pool)
    .await
    .map_err(|err| map_error("enqueue", "", err))?;
    Ok(TaskId::new(id))
}

/// Number of tasks in the queue, locked or not.
pub async fn pending(pool: &PgPool) -> Result<i64, RunnerError> {
    sqlx::query_scalar("select count(*) from tasks.task")
        .fetch_one(pool)
        .await
        .map_err(|err| map_error("pending", "", err))
}
