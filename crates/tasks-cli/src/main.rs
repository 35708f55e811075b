use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tasks_core::config::{ConfigSource, FileConfig};
use tasks_core::domain::{Identity, NewTask};
use tasks_core::{RunnerBuilder, Settings, Supervisor};
use tasks_pg::PgTaskStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod handlers;

#[derive(Parser, Debug)]
#[command(name = "tasks-runner")]
#[command(about = "Durable task runner", long_about = None)]
struct Cli {
    /// TOML file with a [tasks] section; TASKS__* variables override it
    #[arg(long, global = true, env = "TASKS_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the configured workers for every configured database
    Run,
    /// Start workers for one database acting as one role
    Start {
        #[arg(long)]
        database: String,
        #[arg(long)]
        role: String,
    },
    /// Create the tasks schema
    Install {
        #[arg(long)]
        database: Option<String>,
    },
    /// Add a task to the queue
    Enqueue {
        #[arg(long)]
        database: Option<String>,
        /// Qualified handler name; omit for a task that only gets dropped
        #[arg(long)]
        exec: Option<String>,
        /// RFC 3339 timestamp, defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long)]
        owner: Option<String>,
        /// JSON payload passed to the handler as its config
        #[arg(long)]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let source = FileConfig::new(cli.config.clone());
    let settings = source.load().context("failed to load configuration")?;
    let store = PgTaskStore::new(&settings.connection)?;

    match cli.command {
        Command::Run => {
            let supervisor = build(store, source)?;
            supervisor.launch_configured().await?;
            serve(&supervisor).await
        }
        Command::Start { database, role } => {
            let supervisor = build(store, source)?;
            let names = supervisor
                .start(Identity::new(role), &database)
                .await
                .with_context(|| format!("could not start workers for {database}"))?;
            tracing::info!(?names, "workers started");
            serve(&supervisor).await
        }
        Command::Install { database } => {
            let database = target_database(&settings, database)?;
            let pool = store.pool(&database).await?;
            tasks_pg::install(&pool).await?;
            tracing::info!(%database, "schema installed");
            Ok(())
        }
        Command::Enqueue {
            database,
            exec,
            at,
            owner,
            payload,
        } => {
            let database = target_database(&settings, database)?;
            let owner = Identity::new(owner.unwrap_or_else(|| settings.role.clone()));
            let sched = at.unwrap_or_else(Utc::now);
            let mut task = match exec {
                Some(exec) => NewTask::new(owner, exec, sched),
                None => NewTask::without_exec(owner, sched),
            };
            if let Some(payload) = payload {
                task = task.with_config(
                    serde_json::from_str(&payload).context("--payload is not valid JSON")?,
                );
            }
            let pool = store.pool(&database).await?;
            let id = tasks_pg::enqueue(&pool, &task).await?;
            println!("{id}");
            Ok(())
        }
    }
}

fn build(store: PgTaskStore, source: FileConfig) -> Result<Supervisor> {
    let builder = RunnerBuilder::new()
        .store(Arc::new(store))
        .config(Arc::new(source));
    let supervisor = handlers::register_builtin(builder)?.build()?;
    Ok(supervisor)
}

fn target_database(settings: &Settings, database: Option<String>) -> Result<String> {
    database
        .or_else(|| settings.databases.first().cloned())
        .context("no database given and tasks.databases is empty")
}

/// SIGHUP reloads, SIGUSR1 wakes every worker, SIGTERM or Ctrl-C shuts down.
#[cfg(unix)]
async fn serve(supervisor: &Supervisor) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut wake = signal(SignalKind::user_defined1())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                if let Err(err) = supervisor.reload() {
                    tracing::warn!(error = %err, "reload rejected");
                }
            }
            _ = wake.recv() => supervisor.wake_all(),
            _ = terminate.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    tracing::info!("shutting down");
    supervisor.shutdown().await;
    Ok(())
}

#[cfg(not(unix))]
async fn serve(supervisor: &Supervisor) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    supervisor.shutdown().await;
    Ok(())
}
