//! TaskExecutor - claim one due task and run it
//!
//! # フロー
//! 1. `claim_next` で期限切れタスクを 1 件ロック
//! 2. owner に対する権限チェック
//! 3. 同一トランザクション内で delete
//! 4. exec を解決 → EXECUTE 権限チェック → 呼び出し
//!
//! Any error leaves the transaction for the caller to roll back, which
//! brings the task back.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::{Identity, Task, TaskId};
use crate::error::RunnerError;
use crate::observability::WorkerActivity;
use crate::ports::QueueSession;
use crate::typed::{Arg, CallableRegistry, ExecuteAcl, RegisteredCallable, Signature};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Nothing due, or everything due is locked by someone else.
    Idle,
    /// Claimed a task without `exec`; it was deleted and nothing ran.
    Discarded { id: TaskId },
    Executed { id: TaskId, exec: String },
}

pub struct TaskExecutor {
    registry: Arc<CallableRegistry>,
    activity: Arc<watch::Sender<WorkerActivity>>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<CallableRegistry>) -> Self {
        let (activity, _) = watch::channel(WorkerActivity::Starting);
        Self::with_activity(registry, Arc::new(activity))
    }

    pub fn with_activity(
        registry: Arc<CallableRegistry>,
        activity: Arc<watch::Sender<WorkerActivity>>,
    ) -> Self {
        Self { registry, activity }
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerActivity> {
        self.activity.subscribe()
    }

    pub(crate) fn report(&self, activity: WorkerActivity) {
        self.activity.send_replace(activity);
    }

    pub async fn claim_and_run_one(
        &self,
        session: &mut dyn QueueSession,
        identity: &Identity,
    ) -> Result<ClaimOutcome, RunnerError> {
        self.report(WorkerActivity::Running {
            query: "claim_next".into(),
        });
        let Some(task) = session.claim_next().await? else {
            return Ok(ClaimOutcome::Idle);
        };

        if !session.has_privs_of(identity, &task.owner).await? {
            return Err(RunnerError::PermissionDenied {
                task_id: task.id,
                identity: identity.clone(),
                detail: format!("must be able to act as role \"{}\"", task.owner),
            });
        }

        self.report(WorkerActivity::Running {
            query: "delete_task".into(),
        });
        session.delete(task.id).await?;

        let Some(exec) = task.exec.clone() else {
            debug!(task_id = %task.id, "task has no exec, discarded");
            return Ok(ClaimOutcome::Discarded { id: task.id });
        };

        let entry = self
            .registry
            .resolve_str(&exec, Signature::TASK)
            .map_err(|_| RunnerError::UndefinedCallable {
                task_id: task.id,
                name: exec.clone(),
            })?;
        self.check_execute(session, identity, &task, entry).await?;

        self.report(WorkerActivity::Executing {
            handler: entry.name().to_string(),
        });
        debug!(task_id = %task.id, exec = %entry.name(), sched = %task.sched, "invoking handler");
        entry
            .callable()
            .invoke(vec![Arg::TimestampTz(task.sched), Arg::Jsonb(task.config)])
            .await
            .map_err(|source| RunnerError::Handler {
                task_id: task.id,
                exec: exec.clone(),
                source,
            })?;

        info!(task_id = %task.id, exec = %exec, "task executed");
        Ok(ClaimOutcome::Executed { id: task.id, exec })
    }

    async fn check_execute(
        &self,
        session: &mut dyn QueueSession,
        identity: &Identity,
        task: &Task,
        entry: &RegisteredCallable,
    ) -> Result<(), RunnerError> {
        let ExecuteAcl::Granted(grantees) = entry.acl() else {
            return Ok(());
        };
        for role in grantees {
            if session.has_privs_of(identity, role).await? {
                return Ok(());
            }
        }
        Err(RunnerError::PermissionDenied {
            task_id: task.id,
            identity: identity.clone(),
            detail: format!("permission denied for function {}", entry.name()),
        })
    }
}
