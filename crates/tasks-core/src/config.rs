//! Runner configuration.
//!
//! Settings live under a `[tasks]` section of an optional TOML file and can
//! be overridden from the environment (`TASKS__NAP_TIME=5`,
//! `TASKS__DATABASES=app,reporting`). Values are re-read on reload through a
//! `ConfigSource`.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::error::RunnerError;

pub const ENV_PREFIX: &str = "TASKS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Workers started per database.
    pub workers: u32,
    /// Seconds before a worker that asked for a restart is relaunched.
    pub restart_time: u64,
    /// Upper bound on a single sleep, and the wakeup used for an empty queue.
    pub nap_time: u64,
    #[serde(deserialize_with = "list_or_csv")]
    pub databases: Vec<String>,
    /// Identity the configured workers act as.
    pub role: String,
    /// Worker slots available to the whole process.
    pub max_workers: u32,
    /// Server URL; the database name is taken from each worker's args.
    pub connection: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            restart_time: 30,
            nap_time: 1,
            databases: vec!["postgres".to_string()],
            role: "postgres".to_string(),
            max_workers: 8,
            connection: "postgres://localhost".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    tasks: Settings,
}

impl Settings {
    pub fn nap(&self) -> Duration {
        Duration::from_secs(self.nap_time)
    }

    pub fn restart(&self) -> Duration {
        Duration::from_secs(self.restart_time)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if !(1..=100).contains(&self.workers) {
            return Err(RunnerError::Configuration(format!(
                "tasks.workers must be between 1 and 100, got {}",
                self.workers
            )));
        }
        if !(1..=3600).contains(&self.nap_time) {
            return Err(RunnerError::Configuration(format!(
                "tasks.nap_time must be between 1 and 3600, got {}",
                self.nap_time
            )));
        }
        if self.restart_time < 1 {
            return Err(RunnerError::Configuration(
                "tasks.restart_time must be at least 1".into(),
            ));
        }
        if self.max_workers < 1 {
            return Err(RunnerError::Configuration(
                "tasks.max_workers must be at least 1".into(),
            ));
        }
        if self.databases.iter().any(|db| db.is_empty()) {
            return Err(RunnerError::Configuration(
                "tasks.databases contains an empty name".into(),
            ));
        }
        if self.role.is_empty() {
            return Err(RunnerError::Configuration("tasks.role is empty".into()));
        }
        Ok(())
    }

    /// Parses a TOML document; environment overrides are not applied.
    pub fn from_toml(source: &str) -> Result<Self, RunnerError> {
        let config = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .map_err(config_error)?;
        finish(config)
    }
}

fn finish(config: Config) -> Result<Settings, RunnerError> {
    let document: Document = config.try_deserialize().map_err(config_error)?;
    document.tasks.validate()?;
    Ok(document.tasks)
}

fn config_error(err: config::ConfigError) -> RunnerError {
    RunnerError::Configuration(err.to_string())
}

fn list_or_csv<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }

    let names = match Raw::deserialize(deserializer)? {
        Raw::List(list) => list,
        Raw::Csv(csv) => csv.split(',').map(str::to_string).collect(),
    };
    Ok(names.into_iter().map(|db| db.trim().to_string()).collect())
}

/// Where settings come from. Called at launch and on every reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Settings, RunnerError>;
}

/// Optional TOML file plus `TASKS__*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    path: Option<PathBuf>,
}

impl FileConfig {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl ConfigSource for FileConfig {
    fn load(&self) -> Result<Settings, RunnerError> {
        let mut builder = Config::builder();
        if let Some(path) = &self.path {
            builder = builder.add_source(File::from(path.as_path()).required(false));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .keep_prefix(true),
            )
            .build()
            .map_err(config_error)?;
        finish(config)
    }
}

/// Settings held in memory; `set` takes effect on the next reload.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn set(&self, settings: Settings) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl ConfigSource for SharedSettings {
    fn load(&self) -> Result<Settings, RunnerError> {
        let settings = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        settings.validate()?;
        Ok(settings)
    }
}
