use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tasks_core::domain::WorkerArgs;
use tasks_core::ports::{QueueSession, TaskStore};
use tasks_core::RunnerError;

use crate::session::PgQueueSession;

pub const APPLICATION_NAME: &str = "tasks-runner";

/// Opens a dedicated connection per worker. The server comes from the
/// connection URL; the database comes from each worker's args.
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    options: PgConnectOptions,
}

impl PgTaskStore {
    pub fn new(url: &str) -> Result<Self, RunnerError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|err| RunnerError::Configuration(format!("invalid connection URL: {err}")))?
            .application_name(APPLICATION_NAME);
        Ok(Self { options })
    }

    /// A small pool for administrative work (schema install, enqueue).
    pub async fn pool(&self, database: &str) -> Result<PgPool, RunnerError> {
        PgPoolOptions::new()
            .max_connections(2)
            .connect_with(self.options.clone().database(database))
            .await
            .map_err(|err| connection_error(database, err))
    }
}

fn connection_error(database: &str, err: sqlx::Error) -> RunnerError {
    RunnerError::Connection {
        database: database.to_string(),
        detail: err.to_string(),
    }
}

impl PgTaskStore {
    /// Opens a worker session on one pinned connection.
    pub async fn session(&self, args: &WorkerArgs) -> Result<PgQueueSession, RunnerError> {
        let database = args.database();
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(self.options.clone().database(database))
            .await
            .map_err(|err| connection_error(database, err))?;
        tracing::debug!(database, "worker connected");
        Ok(PgQueueSession::new(pool, database))
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn connect(&self, args: &WorkerArgs) -> Result<Box<dyn QueueSession>, RunnerError> {
        Ok(Box::new(self.session(args).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        let err = PgTaskStore::new("not a url").unwrap_err();
        assert!(matches!(err, RunnerError::Configuration(_)));
    }

    #[test]
    fn accepts_server_url() {
        assert!(PgTaskStore::new("postgres://tasks@localhost:5432").is_ok());
    }
}
