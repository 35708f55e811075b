//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. Init: WorkerArgs 検証 → 設定読み込み → 接続 → 起動通知
//! 2. 毎回: shutdown/reload 確認 → begin → (期限なら) claim_and_run_one
//!    → next_wakeup 再計算 → commit → sleep
//!
//! Fatal errors end `run` with a `WorkerExit`; everything else rolls the
//! transaction back and the loop waits one nap before trying again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::control::{ControlReceiver, PendingSignals};
use super::executor::{ClaimOutcome, TaskExecutor};
use crate::config::{ConfigSource, Settings};
use crate::domain::{WorkerArgs, WorkerExit, WorkerState};
use crate::error::{RunnerError, Severity};
use crate::observability::WorkerActivity;
use crate::ports::{Clock, QueueSession, SystemClock, TaskStore};
use crate::typed::CallableRegistry;

/// Everything a worker needs that is shared across workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<CallableRegistry>,
    pub config: Arc<dyn ConfigSource>,
    pub clock: Arc<dyn Clock>,
}

impl WorkerContext {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<CallableRegistry>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct WorkerLoop {
    name: String,
    args: WorkerArgs,
    ctx: WorkerContext,
    executor: TaskExecutor,
    settings: Settings,
    state: WorkerState,
    pending: PendingSignals,
    started: Option<oneshot::Sender<()>>,
}

impl WorkerLoop {
    pub fn new(name: impl Into<String>, args: WorkerArgs, ctx: WorkerContext) -> Self {
        let (activity, _) = watch::channel(WorkerActivity::Starting);
        let executor = TaskExecutor::with_activity(Arc::clone(&ctx.registry), Arc::new(activity));
        let now = ctx.clock.now();
        Self {
            name: name.into(),
            args,
            executor,
            settings: Settings::default(),
            state: WorkerState::new(now),
            pending: PendingSignals::default(),
            started: None,
            ctx,
        }
    }

    /// Publish activity on a channel owned by the caller.
    pub fn with_activity(mut self, activity: Arc<watch::Sender<WorkerActivity>>) -> Self {
        self.executor = TaskExecutor::with_activity(Arc::clone(&self.ctx.registry), activity);
        self
    }

    /// Fired once the worker is connected and about to enter its loop.
    pub fn on_started(mut self, started: oneshot::Sender<()>) -> Self {
        self.started = Some(started);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn run(&mut self, control: &mut ControlReceiver) -> WorkerExit {
        self.executor.report(WorkerActivity::Starting);
        let mut session = match self.init().await {
            Ok(session) => session,
            Err(err) => return self.exit_on(err),
        };
        info!(database = %self.args.database(), identity = %self.args.identity(), "task runner started");
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }

        loop {
            self.pending.drain(control);
            let signals = self.pending.take();
            if signals.shutdown {
                info!("task runner terminating due to a shutdown request");
                self.executor.report(WorkerActivity::Stopped);
                return WorkerExit::Stop;
            }
            if signals.reload {
                self.reload();
            }
            if signals.wake {
                self.state.next_wakeup = self.ctx.clock.now();
            }

            if let Err(err) = self.run_iteration(session.as_mut()).await {
                match err.severity() {
                    Severity::Fatal(_) => return self.exit_on(err),
                    Severity::Recoverable => {
                        warn!(task_id = ?err.task_id().map(|id| id.get()), error = %err, "task failed, will retry");
                        self.state.next_wakeup = self.ctx.clock.now() + self.nap();
                    }
                }
            }

            self.sleep(control).await;
        }
    }

    /// Validates args, loads settings and opens the session.
    pub(crate) async fn init(&mut self) -> Result<Box<dyn QueueSession>, RunnerError> {
        if self.args.database().is_empty() {
            return Err(RunnerError::Configuration(
                "no target database given to worker".into(),
            ));
        }
        self.settings = self.ctx.config.load()?;
        let session = self.ctx.store.connect(&self.args).await?;
        self.state = WorkerState::new(self.ctx.clock.now());
        Ok(session)
    }

    /// One transaction: maybe claim a task, then recompute the wakeup.
    pub(crate) async fn run_iteration(
        &mut self,
        session: &mut dyn QueueSession,
    ) -> Result<(), RunnerError> {
        session.begin().await?;
        match self.in_transaction(session).await {
            Ok(next_wakeup) => {
                session.commit().await?;
                self.state.next_wakeup = next_wakeup;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = session.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn in_transaction(
        &mut self,
        session: &mut dyn QueueSession,
    ) -> Result<DateTime<Utc>, RunnerError> {
        let mut idle = false;
        if self.state.is_due(self.ctx.clock.now()) {
            let outcome = self
                .executor
                .claim_and_run_one(session, self.args.identity())
                .await?;
            match &outcome {
                ClaimOutcome::Idle => idle = true,
                ClaimOutcome::Discarded { id } => debug!(task_id = %id, "discarded task without exec"),
                ClaimOutcome::Executed { .. } => {}
            }
        }

        self.executor.report(WorkerActivity::Running {
            query: "earliest_pending".into(),
        });
        let nap = self.nap();
        let now = self.ctx.clock.now();
        let fallback = now + nap;
        let next = session
            .earliest_pending(self.settings.nap())
            .await?
            .unwrap_or(fallback);

        // due but unclaimable: locked by another worker
        if idle && next <= now {
            return Ok(fallback);
        }
        Ok(next)
    }

    /// Waits until `next_wakeup`, at most one nap, or until a control event.
    pub(crate) async fn sleep(&mut self, control: &mut ControlReceiver) {
        let now = self.ctx.clock.now();
        let wait = (self.state.next_wakeup - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.settings.nap());
        if wait.is_zero() {
            return;
        }

        self.executor.report(WorkerActivity::Sleeping {
            until: now + chrono::Duration::from_std(wait).unwrap_or_else(|_| self.nap()),
        });
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            event = control.recv() => self.pending.record(event),
        }
        self.executor.report(WorkerActivity::Idle);
    }

    fn reload(&mut self) {
        match self.ctx.config.load() {
            Ok(settings) => {
                info!(
                    nap_time = settings.nap_time,
                    restart_time = settings.restart_time,
                    "configuration reloaded"
                );
                self.settings = settings;
            }
            Err(err) => warn!(error = %err, "reload failed, keeping previous settings"),
        }
    }

    fn nap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings.nap_time as i64)
    }

    fn exit_on(&self, err: RunnerError) -> WorkerExit {
        let exit = match err.severity() {
            Severity::Fatal(exit) => exit,
            // recoverable errors never end the loop; seen here only from init
            Severity::Recoverable => WorkerExit::RestartRequested,
        };
        error!(error = %err, ?exit, "task runner exiting");
        self.executor.report(WorkerActivity::Stopped);
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::control::{control_channel, ControlEvent};
    use crate::config::SharedSettings;
    use crate::domain::{Identity, NewTask};
    use crate::impls::InMemoryTaskStore;
    use crate::domain::{Task, TaskId};
    use crate::ports::FixedClock;
    use async_trait::async_trait;
    use crate::typed::{handler_fn, HandlerError};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    struct Fixture {
        store: InMemoryTaskStore,
        clock: FixedClock,
        settings: SharedSettings,
        registry: CallableRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = FixedClock::new(start());
            let store = InMemoryTaskStore::new(Arc::new(clock.clone()));
            store.superuser(Identity::new("postgres"));
            let mut registry = CallableRegistry::new();
            registry
                .register("noop", handler_fn(|_, _| async { Ok(()) }))
                .unwrap();
            registry
                .register(
                    "explode",
                    handler_fn(|_, _| async { Err(HandlerError::msg("boom")) }),
                )
                .unwrap();
            Self {
                store,
                clock,
                settings: SharedSettings::default(),
                registry,
            }
        }

        fn worker(self, database: &str) -> (WorkerLoop, InMemoryTaskStore, FixedClock, SharedSettings) {
            let ctx = WorkerContext::new(
                Arc::new(self.store.clone()),
                Arc::new(self.registry),
                Arc::new(self.settings.clone()),
            )
            .with_clock(Arc::new(self.clock.clone()));
            let args = WorkerArgs::new(database, Identity::new("postgres"));
            (
                WorkerLoop::new("Task Runner 1", args, ctx),
                self.store,
                self.clock,
                self.settings,
            )
        }
    }

    #[tokio::test]
    async fn empty_queue_wakes_after_one_nap() {
        let (mut worker, _store, clock, _settings) = Fixture::new().worker("postgres");
        let mut session = worker.init().await.unwrap();

        worker.run_iteration(session.as_mut()).await.unwrap();
        assert_eq!(
            worker.state().next_wakeup,
            clock.now() + chrono::Duration::seconds(1)
        );
    }

    #[tokio::test]
    async fn runs_due_task_and_schedules_next_pending() {
        let (mut worker, store, clock, _settings) = Fixture::new().worker("postgres");
        let owner = Identity::new("app");
        let due = store.insert(NewTask::new(owner.clone(), "noop", start()));
        let later = start() + chrono::Duration::minutes(5);
        store.insert(NewTask::new(owner, "noop", later));
        let mut session = worker.init().await.unwrap();

        worker.run_iteration(session.as_mut()).await.unwrap();
        assert!(!store.contains(due));
        assert_eq!(store.len(), 1);
        assert_eq!(worker.state().next_wakeup, later);

        // not due yet: nothing claimed
        clock.advance(chrono::Duration::minutes(1));
        worker.run_iteration(session.as_mut()).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failing_handler_leaves_task_in_queue() {
        let (mut worker, store, _clock, _settings) = Fixture::new().worker("postgres");
        let id = store.insert(NewTask::new(Identity::new("app"), "explode", start()));
        let mut session = worker.init().await.unwrap();

        let err = worker.run_iteration(session.as_mut()).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(store.contains(id));

        // the session is usable again after the rollback
        worker.run_iteration(session.as_mut()).await.unwrap_err();
        assert!(store.contains(id));
    }

    #[tokio::test]
    async fn reload_applies_after_in_flight_cycle() {
        let mut fixture = Fixture::new();
        let (control_tx, mut control) = control_channel();
        let settings = fixture.settings.clone();
        fixture
            .registry
            .register(
                "retune",
                handler_fn(move |_, _| {
                    let settings = settings.clone();
                    let control_tx = control_tx.clone();
                    async move {
                        settings.update(|s| s.nap_time = 10);
                        let _ = control_tx.send(ControlEvent::Reload);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let (mut worker, store, clock, _settings) = fixture.worker("postgres");
        let id = store.insert(NewTask::new(Identity::new("app"), "retune", start()));
        let mut session = worker.init().await.unwrap();

        worker.run_iteration(session.as_mut()).await.unwrap();
        assert!(!store.contains(id));
        assert_eq!(worker.settings().nap_time, 1);
        assert_eq!(
            worker.state().next_wakeup,
            clock.now() + chrono::Duration::seconds(1)
        );

        worker.pending.drain(&mut control);
        assert!(worker.pending.take().reload);
        worker.reload();
        clock.advance(chrono::Duration::seconds(1));
        worker.run_iteration(session.as_mut()).await.unwrap();
        assert_eq!(worker.settings().nap_time, 10);
        assert_eq!(
            worker.state().next_wakeup,
            clock.now() + chrono::Duration::seconds(10)
        );
    }

    #[tokio::test]
    async fn locked_due_task_does_not_cause_spinning() {
        let (mut worker, store, clock, _settings) = Fixture::new().worker("postgres");
        store.insert(NewTask::new(Identity::new("app"), "noop", start()));
        let mut other = store.session();
        other.begin().await.unwrap();
        other.claim_next().await.unwrap().unwrap();

        let mut session = worker.init().await.unwrap();
        worker.run_iteration(session.as_mut()).await.unwrap();
        assert_eq!(
            worker.state().next_wakeup,
            clock.now() + chrono::Duration::seconds(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_capped_by_nap() {
        let (mut worker, _store, clock, _settings) = Fixture::new().worker("postgres");
        let (_control_tx, mut control) = control_channel();
        worker.init().await.unwrap();
        worker.state.next_wakeup = clock.now() + chrono::Duration::hours(1);

        let before = tokio::time::Instant::now();
        worker.sleep(&mut control).await;
        assert_eq!(before.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn control_event_cuts_sleep_short() {
        let (mut worker, _store, clock, _settings) = Fixture::new().worker("postgres");
        let (control_tx, mut control) = control_channel();
        worker.init().await.unwrap();
        worker.state.next_wakeup = clock.now() + chrono::Duration::hours(1);
        control_tx.send(ControlEvent::Shutdown).unwrap();

        let before = tokio::time::Instant::now();
        worker.sleep(&mut control).await;
        assert!(before.elapsed() < Duration::from_secs(1));
        assert!(worker.pending.shutdown);
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_worker() {
        let (mut worker, _store, _clock, _settings) = Fixture::new().worker("postgres");
        let (control_tx, mut control) = control_channel();
        let (started_tx, started_rx) = oneshot::channel();
        worker = worker.on_started(started_tx);
        control_tx.send(ControlEvent::Shutdown).unwrap();

        assert_eq!(worker.run(&mut control).await, WorkerExit::Stop);
        assert!(started_rx.await.is_ok());
    }

    #[tokio::test]
    async fn missing_database_name_stops() {
        let (mut worker, _store, _clock, _settings) = Fixture::new().worker("");
        let (_control_tx, mut control) = control_channel();
        assert_eq!(worker.run(&mut control).await, WorkerExit::Stop);
    }

    #[tokio::test]
    async fn connection_failure_requests_restart() {
        let (mut worker, _store, _clock, _settings) = Fixture::new().worker("elsewhere");
        let (_control_tx, mut control) = control_channel();
        assert_eq!(worker.run(&mut control).await, WorkerExit::RestartRequested);
    }

    /// A queue whose `earliest_pending` returns a column it cannot decode.
    struct MismatchedStore(InMemoryTaskStore);

    struct MismatchedSession(Box<dyn QueueSession>);

    #[async_trait]
    impl TaskStore for MismatchedStore {
        async fn connect(&self, args: &WorkerArgs) -> Result<Box<dyn QueueSession>, RunnerError> {
            Ok(Box::new(MismatchedSession(self.0.connect(args).await?)))
        }
    }

    #[async_trait]
    impl QueueSession for MismatchedSession {
        async fn begin(&mut self) -> Result<(), RunnerError> {
            self.0.begin().await
        }

        async fn commit(&mut self) -> Result<(), RunnerError> {
            self.0.commit().await
        }

        async fn rollback(&mut self) -> Result<(), RunnerError> {
            self.0.rollback().await
        }

        async fn earliest_pending(
            &mut self,
            _fallback: Duration,
        ) -> Result<Option<DateTime<Utc>>, RunnerError> {
            Err(RunnerError::protocol(
                "earliest_pending",
                "column next_wakeup is text, expected timestamptz",
            ))
        }

        async fn claim_next(&mut self) -> Result<Option<Task>, RunnerError> {
            self.0.claim_next().await
        }

        async fn delete(&mut self, id: TaskId) -> Result<(), RunnerError> {
            self.0.delete(id).await
        }

        async fn has_privs_of(
            &mut self,
            member: &Identity,
            role: &Identity,
        ) -> Result<bool, RunnerError> {
            self.0.has_privs_of(member, role).await
        }
    }

    #[tokio::test]
    async fn protocol_error_mid_iteration_requests_restart() {
        let fixture = Fixture::new();
        let clock = fixture.clock.clone();
        let store = fixture.store.clone();
        let id = store.insert(NewTask::new(Identity::new("postgres"), "noop", start()));
        let ctx = WorkerContext::new(
            Arc::new(MismatchedStore(store.clone())),
            Arc::new(fixture.registry),
            Arc::new(fixture.settings),
        )
        .with_clock(Arc::new(clock));
        let args = WorkerArgs::new("postgres", Identity::new("postgres"));
        let mut worker = WorkerLoop::new("Task Runner 1", args, ctx);
        let (_control_tx, mut control) = control_channel();

        assert_eq!(worker.run(&mut control).await, WorkerExit::RestartRequested);
        // the claim and delete were rolled back with the failed iteration
        assert!(store.contains(id));
    }

    #[tokio::test]
    async fn invalid_settings_stop() {
        let fixture = Fixture::new();
        fixture.settings.update(|s| s.nap_time = 0);
        let (mut worker, _store, _clock, _settings) = fixture.worker("postgres");
        let (_control_tx, mut control) = control_channel();
        assert_eq!(worker.run(&mut control).await, WorkerExit::Stop);
    }
}
