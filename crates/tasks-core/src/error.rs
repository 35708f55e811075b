use thiserror::Error;

use crate::domain::{Identity, TaskId, WorkerExit};
use crate::typed::HandlerError;

/// Errors raised by the runner.
///
/// Only `Configuration`, `StoreProtocol` and `Connection` end a worker; the
/// rest are handled inside one loop iteration (transaction rolled back,
/// error logged, loop continues).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unexpected result from query \"{query}\": {detail}")]
    StoreProtocol { query: String, detail: String },

    #[error("connection to database \"{database}\" failed: {detail}")]
    Connection { database: String, detail: String },

    #[error("permission denied to execute {task_id} as {identity}: {detail}")]
    PermissionDenied {
        task_id: TaskId,
        identity: Identity,
        detail: String,
    },

    #[error("function {name}(timestamptz, jsonb) does not exist ({task_id})")]
    UndefinedCallable { task_id: TaskId, name: String },

    #[error("{task_id}: handler {exec} failed: {source}")]
    Handler {
        task_id: TaskId,
        exec: String,
        #[source]
        source: HandlerError,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("{message}")]
    ResourceExhausted { message: String, hint: String },
}

/// What a worker should do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal(WorkerExit),
    Recoverable,
}

impl RunnerError {
    pub fn protocol(query: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StoreProtocol {
            query: query.into(),
            detail: detail.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RunnerError::Configuration(_) => Severity::Fatal(WorkerExit::Stop),
            RunnerError::StoreProtocol { .. } | RunnerError::Connection { .. } => {
                Severity::Fatal(WorkerExit::RestartRequested)
            }
            RunnerError::PermissionDenied { .. }
            | RunnerError::UndefinedCallable { .. }
            | RunnerError::Handler { .. }
            | RunnerError::Store(_)
            | RunnerError::ResourceExhausted { .. } => Severity::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), Severity::Fatal(_))
    }

    /// The task being processed when the error happened, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            RunnerError::PermissionDenied { task_id, .. }
            | RunnerError::UndefinedCallable { task_id, .. }
            | RunnerError::Handler { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            RunnerError::ResourceExhausted { hint, .. } => Some(hint),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RunnerError::Configuration("no database".into()), Severity::Fatal(WorkerExit::Stop))]
    #[case(RunnerError::protocol("claim_next", "no columns"), Severity::Fatal(WorkerExit::RestartRequested))]
    #[case(
        RunnerError::Connection { database: "app".into(), detail: "refused".into() },
        Severity::Fatal(WorkerExit::RestartRequested)
    )]
    #[case(
        RunnerError::UndefinedCallable { task_id: TaskId::new(3), name: "public.gone".into() },
        Severity::Recoverable
    )]
    #[case(RunnerError::Store("deadlock detected".into()), Severity::Recoverable)]
    fn severity_follows_taxonomy(#[case] err: RunnerError, #[case] expected: Severity) {
        assert_eq!(err.severity(), expected);
    }

    #[test]
    fn permission_denied_is_recoverable() {
        let err = RunnerError::PermissionDenied {
            task_id: TaskId::new(7),
            identity: Identity::new("bob"),
            detail: "not a member of alice".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.task_id(), Some(TaskId::new(7)));
        assert!(err.to_string().contains("task-7"));
    }
}
