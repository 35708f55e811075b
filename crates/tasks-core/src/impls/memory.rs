//! InMemoryTaskStore - テスト・組み込み用のキュー
//!
//! A transactional table behind one mutex. Row locks are tagged with the
//! owning transaction; deletes stay pending until that transaction commits.
//! A session dropped with an open transaction rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::roles::RoleGraph;
use crate::domain::{Identity, NewTask, Task, TaskId, WorkerArgs};
use crate::error::RunnerError;
use crate::ports::{Clock, QueueSession, SystemClock, TaskStore};

type TxId = u64;

#[derive(Debug, Default)]
struct QueueTable {
    next_task: i32,
    next_tx: TxId,
    rows: BTreeMap<TaskId, Task>,
    locks: HashMap<TaskId, TxId>,
    deleted: HashMap<TxId, BTreeSet<TaskId>>,
    roles: RoleGraph,
    databases: BTreeSet<String>,
}

impl QueueTable {
    fn release(&mut self, tx: TxId, apply_deletes: bool) {
        if let Some(ids) = self.deleted.remove(&tx) {
            if apply_deletes {
                for id in ids {
                    self.rows.remove(&id);
                }
            }
        }
        self.locks.retain(|_, owner| *owner != tx);
    }

    fn deleted_by(&self, tx: TxId, id: TaskId) -> bool {
        self.deleted.get(&tx).is_some_and(|ids| ids.contains(&id))
    }
}

#[derive(Clone)]
pub struct InMemoryTaskStore {
    table: Arc<Mutex<QueueTable>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryTaskStore {
    /// A store with a single database named `postgres`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let table = QueueTable {
            next_task: 1,
            next_tx: 1,
            databases: BTreeSet::from(["postgres".to_string()]),
            ..QueueTable::default()
        };
        Self {
            table: Arc::new(Mutex::new(table)),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `name` connectable. Connecting to an unknown database fails.
    pub fn with_database(self, name: impl Into<String>) -> Self {
        self.create_database(name);
        self
    }

    pub fn create_database(&self, name: impl Into<String>) {
        self.lock().databases.insert(name.into());
    }

    pub fn superuser(&self, role: Identity) {
        self.lock().roles.superuser(role);
    }

    /// Makes `member` a member of `role`.
    pub fn grant(&self, role: Identity, member: Identity) {
        self.lock().roles.grant(role, member);
    }

    /// Inserts and commits a task.
    pub fn insert(&self, task: NewTask) -> TaskId {
        let mut table = self.lock();
        let id = TaskId::new(table.next_task);
        table.next_task += 1;
        table.rows.insert(id, task.into_task(id));
        id
    }

    /// Committed rows, ordered by id.
    pub fn tasks(&self) -> Vec<Task> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().rows.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }

    pub fn session(&self) -> InMemorySession {
        InMemorySession {
            table: Arc::clone(&self.table),
            clock: Arc::clone(&self.clock),
            tx: None,
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn connect(&self, args: &WorkerArgs) -> Result<Box<dyn QueueSession>, RunnerError> {
        if !self.lock().databases.contains(args.database()) {
            return Err(RunnerError::Connection {
                database: args.database().to_string(),
                detail: format!("database \"{}\" does not exist", args.database()),
            });
        }
        Ok(Box::new(self.session()))
    }
}

pub struct InMemorySession {
    table: Arc<Mutex<QueueTable>>,
    clock: Arc<dyn Clock>,
    tx: Option<TxId>,
}

impl InMemorySession {
    fn lock(&self) -> MutexGuard<'_, QueueTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_tx(&self, op: &str) -> Result<TxId, RunnerError> {
        self.tx
            .ok_or_else(|| RunnerError::protocol(op, "no transaction in progress"))
    }

    fn finish(&mut self, op: &str, apply_deletes: bool) -> Result<(), RunnerError> {
        let tx = self.current_tx(op)?;
        self.lock().release(tx, apply_deletes);
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl QueueSession for InMemorySession {
    async fn begin(&mut self) -> Result<(), RunnerError> {
        if self.tx.is_some() {
            return Err(RunnerError::protocol("begin", "transaction already in progress"));
        }
        let mut table = self.lock();
        let tx = table.next_tx;
        table.next_tx += 1;
        drop(table);
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), RunnerError> {
        self.finish("commit", true)
    }

    async fn rollback(&mut self) -> Result<(), RunnerError> {
        self.finish("rollback", false)
    }

    async fn earliest_pending(
        &mut self,
        fallback: Duration,
    ) -> Result<Option<DateTime<Utc>>, RunnerError> {
        let tx = self.current_tx("earliest_pending")?;
        let now = self.clock.now();
        let table = self.lock();
        let earliest = table
            .rows
            .values()
            .filter(|task| !table.deleted_by(tx, task.id))
            .map(|task| task.sched)
            .min();
        match earliest {
            Some(sched) => Ok(Some(sched)),
            None => {
                let fallback = chrono::Duration::from_std(fallback)
                    .map_err(|e| RunnerError::protocol("earliest_pending", e.to_string()))?;
                Ok(Some(now + fallback))
            }
        }
    }

    async fn claim_next(&mut self) -> Result<Option<Task>, RunnerError> {
        let tx = self.current_tx("claim_next")?;
        let now = self.clock.now();
        let mut table = self.lock();
        let claimed = table
            .rows
            .values()
            .filter(|task| task.sched <= now)
            .filter(|task| !table.deleted_by(tx, task.id))
            .filter(|task| table.locks.get(&task.id).is_none_or(|owner| *owner == tx))
            .max_by(|a, b| a.sched.cmp(&b.sched).then(b.id.cmp(&a.id)))
            .cloned();
        if let Some(task) = &claimed {
            table.locks.insert(task.id, tx);
        }
        Ok(claimed)
    }

    async fn delete(&mut self, id: TaskId) -> Result<(), RunnerError> {
        let tx = self.current_tx("delete_task")?;
        let mut table = self.lock();
        if !table.rows.contains_key(&id) {
            return Ok(());
        }
        match table.locks.get(&id) {
            Some(owner) if *owner != tx => {
                return Err(RunnerError::Store(format!(
                    "could not obtain lock on {id}"
                )));
            }
            _ => {}
        }
        table.locks.insert(id, tx);
        table.deleted.entry(tx).or_default().insert(id);
        Ok(())
    }

    async fn has_privs_of(
        &mut self,
        member: &Identity,
        role: &Identity,
    ) -> Result<bool, RunnerError> {
        Ok(self.lock().roles.has_privs_of(member, role))
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.lock().release(tx, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn store() -> (InMemoryTaskStore, FixedClock) {
        let clock = FixedClock::new(at(30));
        (InMemoryTaskStore::new(Arc::new(clock.clone())), clock)
    }

    fn owner() -> Identity {
        Identity::new("app")
    }

    #[tokio::test]
    async fn claim_prefers_latest_due_and_skips_future() {
        let (store, _clock) = store();
        store.insert(NewTask::new(owner(), "noop", at(10)));
        let latest = store.insert(NewTask::new(owner(), "noop", at(20)));
        store.insert(NewTask::new(owner(), "noop", at(40)));

        let mut session = store.session();
        session.begin().await.unwrap();
        assert_eq!(session.claim_next().await.unwrap().unwrap().id, latest);
    }

    #[tokio::test]
    async fn locked_rows_are_skipped_by_other_sessions() {
        let (store, _clock) = store();
        let first = store.insert(NewTask::new(owner(), "noop", at(10)));
        let second = store.insert(NewTask::new(owner(), "noop", at(20)));

        let mut a = store.session();
        let mut b = store.session();
        let mut c = store.session();
        a.begin().await.unwrap();
        b.begin().await.unwrap();
        c.begin().await.unwrap();

        assert_eq!(a.claim_next().await.unwrap().unwrap().id, second);
        assert_eq!(b.claim_next().await.unwrap().unwrap().id, first);
        assert!(c.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_durable_only_on_commit() {
        let (store, _clock) = store();
        let id = store.insert(NewTask::new(owner(), "noop", at(10)));

        let mut session = store.session();
        session.begin().await.unwrap();
        session.claim_next().await.unwrap();
        session.delete(id).await.unwrap();
        assert!(store.contains(id));
        session.rollback().await.unwrap();
        assert!(store.contains(id));

        session.begin().await.unwrap();
        session.claim_next().await.unwrap();
        session.delete(id).await.unwrap();
        session.commit().await.unwrap();
        assert!(!store.contains(id));
    }

    #[tokio::test]
    async fn dropping_a_session_releases_its_locks() {
        let (store, _clock) = store();
        let id = store.insert(NewTask::new(owner(), "noop", at(10)));

        {
            let mut session = store.session();
            session.begin().await.unwrap();
            session.claim_next().await.unwrap();
            session.delete(id).await.unwrap();
        }

        let mut other = store.session();
        other.begin().await.unwrap();
        assert_eq!(other.claim_next().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn earliest_pending_falls_back_to_now_plus_interval() {
        let (store, clock) = store();
        let mut session = store.session();
        session.begin().await.unwrap();
        assert_eq!(
            session
                .earliest_pending(Duration::from_secs(5))
                .await
                .unwrap(),
            Some(clock.now() + chrono::Duration::seconds(5))
        );

        store.insert(NewTask::new(owner(), "noop", at(45)));
        store.insert(NewTask::new(owner(), "noop", at(40)));
        assert_eq!(
            session
                .earliest_pending(Duration::from_secs(5))
                .await
                .unwrap(),
            Some(at(40))
        );
    }

    #[tokio::test]
    async fn operations_need_a_transaction() {
        let (store, _clock) = store();
        let mut session = store.session();
        let err = session.claim_next().await.unwrap_err();
        assert!(matches!(err, RunnerError::StoreProtocol { .. }));
    }

    #[tokio::test]
    async fn unknown_database_fails_to_connect() {
        let (store, _clock) = store();
        let store = store.with_database("app");
        assert!(
            store
                .connect(&WorkerArgs::new("app", owner()))
                .await
                .is_ok()
        );
        let err = store
            .connect(&WorkerArgs::new("missing", owner()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::Connection { .. }));
    }
}
