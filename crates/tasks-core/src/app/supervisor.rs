//! Supervisor - worker の起動と監視
//!
//! Each launched worker gets a monitor task holding one worker slot. The
//! monitor relaunches the worker after `restart_time` when it exits with
//! `RestartRequested`, and releases the slot when it exits with `Stop`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use super::control::{control_channel, ControlEvent, ControlReceiver, ControlSender};
use super::worker_loop::{WorkerContext, WorkerLoop};
use crate::config::Settings;
use crate::domain::{Identity, WorkerArgs, WorkerExit};
use crate::error::RunnerError;
use crate::observability::{WorkerActivity, WorkerInfo};

const WORKER_TYPE: &str = "Task Runner";

struct WorkerHandle {
    name: String,
    database: String,
    control: ControlSender,
    activity: watch::Receiver<WorkerActivity>,
    launches: Arc<AtomicU32>,
    join: JoinHandle<()>,
}

pub struct Supervisor {
    ctx: WorkerContext,
    settings: Arc<RwLock<Settings>>,
    slots: Arc<Semaphore>,
    max_workers: usize,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Supervisor {
    pub fn new(ctx: WorkerContext) -> Result<Self, RunnerError> {
        let settings = ctx.config.load()?;
        let max_workers = settings.max_workers as usize;
        Ok(Self {
            ctx,
            settings: Arc::new(RwLock::new(settings)),
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            workers: Mutex::new(Vec::new()),
        })
    }

    fn workers_guard(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts `workers` workers for every configured database.
    ///
    /// Unlike `start` this does not wait for the workers to connect: a
    /// database that is unreachable (or not created yet) is retried every
    /// `restart_time` by its monitor.
    pub async fn launch_configured(&self) -> Result<Vec<String>, RunnerError> {
        let settings = self.settings();
        if settings.databases.is_empty() {
            return Err(RunnerError::Configuration(
                "no target database configured".into(),
            ));
        }
        let identity = Identity::new(settings.role.clone());
        let mut spawned = Vec::new();
        for database in &settings.databases {
            for i in 1..=settings.workers {
                let Some(permit) = self.acquire_slot() else {
                    self.abort(spawned);
                    return Err(slots_exhausted());
                };
                let args = WorkerArgs::new(database, identity.clone());
                spawned.push(self.spawn_monitor(worker_name(i), args, permit, None));
            }
            info!(database, count = settings.workers, "task runners registered");
        }

        let names = spawned.iter().map(|w| w.name.clone()).collect();
        self.workers_guard().extend(spawned);
        Ok(names)
    }

    /// Starts `workers` workers acting as `identity` on `database` and waits
    /// until all of them are connected. On any failure the workers started
    /// by this call are stopped again.
    pub async fn start(
        &self,
        identity: Identity,
        database: &str,
    ) -> Result<Vec<String>, RunnerError> {
        let count = self.settings().workers;
        let mut spawned = Vec::with_capacity(count as usize);
        let mut confirmations = Vec::with_capacity(count as usize);

        for i in 1..=count {
            let Some(permit) = self.acquire_slot() else {
                self.abort(spawned);
                return Err(slots_exhausted());
            };
            let args = WorkerArgs::new(database, identity.clone());
            let (started_tx, started_rx) = oneshot::channel();
            spawned.push(self.spawn_monitor(worker_name(i), args, permit, Some(started_tx)));
            confirmations.push(started_rx);
        }

        for started in confirmations {
            if started.await.is_err() {
                self.abort(spawned);
                return Err(RunnerError::ResourceExhausted {
                    message: "could not start background process".into(),
                    hint: "More details may be available in the server log.".into(),
                });
            }
        }

        let names = spawned.iter().map(|w| w.name.clone()).collect();
        self.workers_guard().extend(spawned);
        info!(database, count, "task runners started");
        Ok(names)
    }

    fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    fn spawn_monitor(
        &self,
        name: String,
        args: WorkerArgs,
        permit: OwnedSemaphorePermit,
        started: Option<oneshot::Sender<()>>,
    ) -> WorkerHandle {
        let (control, control_rx) = control_channel();
        let (activity_tx, activity) = watch::channel(WorkerActivity::Starting);
        let launches = Arc::new(AtomicU32::new(0));
        let span = info_span!("worker", worker.name = %name, database = %args.database());

        let monitor = Monitor {
            name: name.clone(),
            args: args.clone(),
            ctx: self.ctx.clone(),
            settings: Arc::clone(&self.settings),
            activity: Arc::new(activity_tx),
            launches: Arc::clone(&launches),
        };
        let join = tokio::spawn(
            async move {
                let _permit = permit;
                monitor.run(control_rx, started).await;
            }
            .instrument(span),
        );

        WorkerHandle {
            name,
            database: args.database().to_string(),
            control,
            activity,
            launches,
            join,
        }
    }

    fn abort(&self, spawned: Vec<WorkerHandle>) {
        for worker in spawned {
            let _ = worker.control.send(ControlEvent::Shutdown);
            worker.join.abort();
        }
    }

    fn broadcast(&self, event: ControlEvent) {
        for worker in self.workers_guard().iter() {
            // a stopped worker has dropped its receiver
            let _ = worker.control.send(event);
        }
    }

    /// Re-reads configuration and asks every worker to do the same.
    pub fn reload(&self) -> Result<(), RunnerError> {
        let settings = self.ctx.config.load()?;
        info!(
            workers = settings.workers,
            restart_time = settings.restart_time,
            "supervisor configuration reloaded"
        );
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        self.broadcast(ControlEvent::Reload);
        Ok(())
    }

    pub fn wake_all(&self) {
        self.broadcast(ControlEvent::Wake);
    }

    /// Asks every worker to stop and waits for all of them.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers_guard());
        for worker in &workers {
            let _ = worker.control.send(ControlEvent::Shutdown);
        }
        for worker in workers {
            if let Err(err) = worker.join.await {
                warn!(worker = %worker.name, error = %err, "worker task ended abnormally");
            }
        }
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers_guard()
            .iter()
            .map(|w| WorkerInfo {
                name: w.name.clone(),
                database: w.database.clone(),
                launches: w.launches.load(Ordering::Relaxed),
                activity: w.activity.borrow().clone(),
            })
            .collect()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

fn worker_name(i: u32) -> String {
    format!("{WORKER_TYPE} {i}")
}

fn slots_exhausted() -> RunnerError {
    RunnerError::ResourceExhausted {
        message: "could not register background process".into(),
        hint: "You may need to increase tasks.max_workers.".into(),
    }
}

struct Monitor {
    name: String,
    args: WorkerArgs,
    ctx: WorkerContext,
    settings: Arc<RwLock<Settings>>,
    activity: Arc<watch::Sender<WorkerActivity>>,
    launches: Arc<AtomicU32>,
}

impl Monitor {
    async fn run(self, mut control: ControlReceiver, mut started: Option<oneshot::Sender<()>>) {
        loop {
            self.launches.fetch_add(1, Ordering::Relaxed);
            let mut worker = WorkerLoop::new(self.name.clone(), self.args.clone(), self.ctx.clone())
                .with_activity(Arc::clone(&self.activity));
            if let Some(started) = started.take() {
                worker = worker.on_started(started);
            }

            let exit = worker.run(&mut control).await;
            // releases the start confirmation if it was never sent
            drop(worker);
            match exit {
                WorkerExit::Stop => {
                    info!("task runner stopped");
                    return;
                }
                WorkerExit::RestartRequested => {
                    let delay = self
                        .settings
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .restart();
                    warn!(?delay, "task runner exited, restarting");
                    if !self.wait_for_restart(&mut control, delay).await {
                        self.activity.send_replace(WorkerActivity::Stopped);
                        return;
                    }
                }
            }
        }
    }

    /// False if a shutdown arrived while waiting.
    async fn wait_for_restart(&self, control: &mut ControlReceiver, delay: std::time::Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                event = control.recv() => match event {
                    Some(ControlEvent::Shutdown) | None => return false,
                    Some(ControlEvent::Reload | ControlEvent::Wake) => {}
                },
            }
        }
    }
}
