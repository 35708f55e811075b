//! QueryExecutor - 名前付きクエリの準備とキャッシュ
//!
//! Each worker session owns one executor. A query is prepared the first time
//! it is used and the statement is reused for the life of the connection.
//! Anything that does not match what a query declares (argument types,
//! result shape, read-only use of a modifying query) is a protocol error.

use std::collections::HashMap;

use sqlx::postgres::{PgConnection, PgRow, PgStatement, PgTypeInfo};
use sqlx::{Executor, Postgres, Statement, Type};
use tasks_core::RunnerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Int4,
    Float8,
    Text,
}

impl ArgType {
    fn type_info(self) -> PgTypeInfo {
        match self {
            ArgType::Int4 => <i32 as Type<Postgres>>::type_info(),
            ArgType::Float8 => <f64 as Type<Postgres>>::type_info(),
            ArgType::Text => <String as Type<Postgres>>::type_info(),
        }
    }
}

/// A positional argument; `None` binds SQL NULL of the declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArg {
    Int4(Option<i32>),
    Float8(Option<f64>),
    Text(Option<String>),
}

impl QueryArg {
    fn arg_type(&self) -> ArgType {
        match self {
            QueryArg::Int4(_) => ArgType::Int4,
            QueryArg::Float8(_) => ArgType::Float8,
            QueryArg::Text(_) => ArgType::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Returns rows (SELECT).
    Rows,
    /// Returns no columns (DELETE).
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedQuery {
    pub name: &'static str,
    pub sql: &'static str,
    pub result: ResultKind,
    pub args: &'static [ArgType],
    /// Takes row locks or changes data.
    pub modifies: bool,
}

pub const EARLIEST_PENDING: NamedQuery = NamedQuery {
    name: "earliest_pending",
    sql: "select coalesce(min(task_sched), clock_timestamp() + $1 * '1 second'::interval) \
          as next_wakeup from tasks.task",
    result: ResultKind::Rows,
    args: &[ArgType::Float8],
    modifies: false,
};

pub const CLAIM_NEXT: NamedQuery = NamedQuery {
    name: "claim_next",
    sql: "select task_id, pg_get_userbyid(task_owner::oid)::text as task_owner, task_exec, \
          task_sched, task_config \
          from tasks.task \
          where task_sched <= now() \
          order by task_sched desc \
          limit 1 \
          for no key update skip locked",
    result: ResultKind::Rows,
    args: &[],
    modifies: true,
};

pub const DELETE_TASK: NamedQuery = NamedQuery {
    name: "delete_task",
    sql: "delete from tasks.task where task_id = $1",
    result: ResultKind::Command,
    args: &[ArgType::Int4],
    modifies: true,
};

pub const HAS_PRIVS_OF_ROLE: NamedQuery = NamedQuery {
    name: "has_privs_of_role",
    sql: "select pg_has_role($1::name, $2::name, 'USAGE') as has_privs",
    result: ResultKind::Rows,
    args: &[ArgType::Text, ArgType::Text],
    modifies: false,
};

/// Checks a call against the query's declaration before touching the server.
pub fn check_call(query: &NamedQuery, args: &[QueryArg], read_only: bool) -> Result<(), RunnerError> {
    if read_only && query.modifies {
        return Err(RunnerError::protocol(
            query.name,
            "modifying query executed as read-only",
        ));
    }
    if args.len() != query.args.len() {
        return Err(RunnerError::protocol(
            query.name,
            format!("expected {} arguments, got {}", query.args.len(), args.len()),
        ));
    }
    for (i, (arg, expected)) in args.iter().zip(query.args).enumerate() {
        if arg.arg_type() != *expected {
            return Err(RunnerError::protocol(
                query.name,
                format!(
                    "argument ${} is {:?}, declared {:?}",
                    i + 1,
                    arg.arg_type(),
                    expected
                ),
            ));
        }
    }
    Ok(())
}

/// Checks the prepared statement's shape against the declared result kind.
pub fn check_shape(query: &NamedQuery, columns: usize) -> Result<(), RunnerError> {
    match (query.result, columns) {
        (ResultKind::Rows, 0) => Err(RunnerError::protocol(
            query.name,
            "expected a row-returning statement",
        )),
        (ResultKind::Command, n) if n > 0 => Err(RunnerError::protocol(
            query.name,
            format!("expected no result columns, statement returns {n}"),
        )),
        _ => Ok(()),
    }
}

/// Maps driver errors: lost connections end the worker with a restart,
/// ordinary database errors roll back one iteration, decoding problems mean
/// the schema is not what the queries expect.
pub fn map_error(query: &str, database: &str, err: sqlx::Error) -> RunnerError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RunnerError::Connection {
            database: database.to_string(),
            detail: err.to_string(),
        },
        sqlx::Error::Database(db) => {
            let connection_lost = db
                .code()
                .is_some_and(|code| code.starts_with("08") || code == "57P01");
            if connection_lost {
                RunnerError::Connection {
                    database: database.to_string(),
                    detail: db.to_string(),
                }
            } else {
                RunnerError::Store(format!("{query}: {db}"))
            }
        }
        sqlx::Error::Configuration(e) => RunnerError::Configuration(e.to_string()),
        other => RunnerError::protocol(query, other.to_string()),
    }
}

#[derive(Default)]
pub struct QueryExecutor {
    database: String,
    prepared: HashMap<&'static str, PgStatement<'static>>,
}

impl QueryExecutor {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            prepared: HashMap::new(),
        }
    }

    pub fn is_prepared(&self, name: &str) -> bool {
        self.prepared.contains_key(name)
    }

    /// Runs `query`; `row_limit == 0` returns every row.
    pub async fn execute(
        &mut self,
        conn: &mut PgConnection,
        query: &NamedQuery,
        args: Vec<QueryArg>,
        read_only: bool,
        row_limit: usize,
    ) -> Result<Vec<PgRow>, RunnerError> {
        check_call(query, &args, read_only)?;

        if !self.prepared.contains_key(query.name) {
            let types: Vec<PgTypeInfo> = query.args.iter().map(|t| t.type_info()).collect();
            let statement = (&mut *conn)
                .prepare_with(query.sql, &types)
                .await
                .map_err(|err| match map_error(query.name, &self.database, err) {
                    RunnerError::Store(detail) => RunnerError::protocol(query.name, detail),
                    other => other,
                })?;
            check_shape(query, statement.columns().len())?;
            tracing::debug!(query = query.name, "prepared");
            self.prepared.insert(query.name, statement);
        }
        let Some(statement) = self.prepared.get(query.name) else {
            return Err(RunnerError::protocol(query.name, "statement missing from cache"));
        };

        let mut bound = statement.query();
        for arg in args {
            bound = match arg {
                QueryArg::Int4(v) => bound.bind(v),
                QueryArg::Float8(v) => bound.bind(v),
                QueryArg::Text(v) => bound.bind(v),
            };
        }

        match query.result {
            ResultKind::Command => {
                bound
                    .execute(&mut *conn)
                    .await
                    .map_err(|err| map_error(query.name, &self.database, err))?;
                Ok(Vec::new())
            }
            ResultKind::Rows => {
                let mut rows = bound
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|err| map_error(query.name, &self.database, err))?;
                if row_limit > 0 {
                    rows.truncate(row_limit);
                }
                Ok(rows)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&CLAIM_NEXT, vec![], true)]
    #[case(&DELETE_TASK, vec![QueryArg::Int4(Some(1))], true)]
    #[case(&DELETE_TASK, vec![QueryArg::Text(Some("1".into()))], false)]
    #[case(&DELETE_TASK, vec![], false)]
    #[case(&EARLIEST_PENDING, vec![QueryArg::Int4(Some(1))], true)]
    fn mismatched_calls_are_protocol_errors(
        #[case] query: &NamedQuery,
        #[case] args: Vec<QueryArg>,
        #[case] read_only: bool,
    ) {
        let err = check_call(query, &args, read_only).unwrap_err();
        assert!(matches!(err, RunnerError::StoreProtocol { .. }), "{err}");
        assert!(err.is_fatal());
    }

    #[rstest]
    #[case(&EARLIEST_PENDING, vec![QueryArg::Float8(Some(1.0))], true)]
    #[case(&EARLIEST_PENDING, vec![QueryArg::Float8(None)], true)]
    #[case(&CLAIM_NEXT, vec![], false)]
    #[case(&HAS_PRIVS_OF_ROLE, vec![QueryArg::Text(Some("a".into())), QueryArg::Text(None)], true)]
    fn matching_calls_pass(
        #[case] query: &NamedQuery,
        #[case] args: Vec<QueryArg>,
        #[case] read_only: bool,
    ) {
        assert!(check_call(query, &args, read_only).is_ok());
    }

    #[rstest]
    #[case(&CLAIM_NEXT, 0, false)]
    #[case(&CLAIM_NEXT, 5, true)]
    #[case(&DELETE_TASK, 0, true)]
    #[case(&DELETE_TASK, 1, false)]
    fn result_shape_follows_kind(#[case] query: &NamedQuery, #[case] columns: usize, #[case] ok: bool) {
        assert_eq!(check_shape(query, columns).is_ok(), ok);
    }

    #[rstest]
    #[case(sqlx::Error::PoolTimedOut, true)]
    #[case(sqlx::Error::PoolClosed, true)]
    #[case(sqlx::Error::RowNotFound, false)]
    fn lost_connections_are_connection_errors(#[case] err: sqlx::Error, #[case] connection: bool) {
        let mapped = map_error("claim_next", "app", err);
        assert_eq!(matches!(mapped, RunnerError::Connection { .. }), connection);
        assert!(mapped.is_fatal());
    }
}
