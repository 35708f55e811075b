//! What each worker is doing right now.
//!
//! Workers publish a `WorkerActivity` through a `watch` channel; the
//! supervisor turns those into `WorkerInfo` rows on request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerActivity {
    Starting,
    Idle,
    /// Inside a named store query.
    Running { query: String },
    /// Inside a handler.
    Executing { handler: String },
    Sleeping { until: DateTime<Utc> },
    Stopped,
}

impl fmt::Display for WorkerActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerActivity::Starting => f.write_str("starting"),
            WorkerActivity::Idle => f.write_str("idle"),
            WorkerActivity::Running { query } => write!(f, "running {query}"),
            WorkerActivity::Executing { handler } => write!(f, "executing {handler}"),
            WorkerActivity::Sleeping { until } => write!(f, "sleeping until {until}"),
            WorkerActivity::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub database: String,
    /// Times this worker has been (re)launched.
    pub launches: u32,
    pub activity: WorkerActivity,
}
