//! Per-worker values: launch arguments, loop state and exit outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Identity;

/// Identity/config blob handed to a worker once at spawn.
///
/// Never mutated after launch; a relaunch gets a clone of the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerArgs {
    database: String,
    identity: Identity,
}

impl WorkerArgs {
    pub fn new(database: impl Into<String>, identity: Identity) -> Self {
        Self {
            database: database.into(),
            identity,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Scheduling state owned by exactly one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerState {
    pub next_wakeup: DateTime<Utc>,
}

impl WorkerState {
    /// A fresh worker is due immediately.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { next_wakeup: now }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_wakeup
    }
}

/// How a worker loop ended, interpreted by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerExit {
    /// Do not relaunch (shutdown request, bad configuration).
    Stop,

    /// Relaunch after the configured restart interval.
    RestartRequested,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn fresh_state_is_due() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let state = WorkerState::new(now);
        assert!(state.is_due(now));
        assert!(!state.is_due(now - Duration::seconds(1)));
    }
}
