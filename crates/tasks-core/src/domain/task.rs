use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a row in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i32);

impl TaskId {
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A role name. Tasks are owned by an identity and workers act as one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A schedulable unit as stored in the queue.
///
/// `exec` is the (unparsed) qualified name of the handler. A task without
/// `exec` is still claimed and removed, it just runs nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner: Identity,
    pub exec: Option<String>,
    pub sched: DateTime<Utc>,
    pub config: serde_json::Value,
}

/// Producer-side shape of a task; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub owner: Identity,
    pub exec: Option<String>,
    pub sched: DateTime<Utc>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NewTask {
    pub fn new(owner: Identity, exec: impl Into<String>, sched: DateTime<Utc>) -> Self {
        Self {
            owner,
            exec: Some(exec.into()),
            sched,
            config: serde_json::Value::Null,
        }
    }

    /// A task with no handler. It is claimed and dropped without running anything.
    pub fn without_exec(owner: Identity, sched: DateTime<Utc>) -> Self {
        Self {
            owner,
            exec: None,
            sched,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            owner: self.owner,
            exec: self.exec,
            sched: self.sched,
            config: self.config,
        }
    }
}
