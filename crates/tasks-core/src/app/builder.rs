//! RunnerBuilder - ランナーの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_handlers()` で必須の関数名を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - store 未設定・設定不正もここで弾く

use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::supervisor::Supervisor;
use super::worker_loop::WorkerContext;
use crate::config::{ConfigSource, SharedSettings};
use crate::error::RunnerError;
use crate::ports::{Clock, SystemClock, TaskStore};
use crate::typed::{CallableRegistry, ExecuteAcl, Handler, RegistryError, Signature};

/// # 使用例
/// ```ignore
/// let supervisor = RunnerBuilder::new()
///     .register("public.purge", PurgeHandler)?
///     .store(Arc::new(store))
///     .config(Arc::new(FileConfig::new(Some("tasks.toml".into()))))
///     .expect_handlers(&["public.purge"])
///     .build()?;
/// supervisor.launch_configured().await?;
/// ```
pub struct RunnerBuilder {
    registry: CallableRegistry,
    expected: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    config: Option<Arc<dyn ConfigSource>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers: {0:?}. These were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error("no task store configured")]
    MissingStore,

    #[error(transparent)]
    Settings(#[from] RunnerError),
}

impl Default for RunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerBuilder {
    pub fn new() -> Self {
        Self {
            registry: CallableRegistry::new(),
            expected: None,
            store: None,
            config: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the registry, e.g. to change its search path.
    pub fn registry(mut self, registry: CallableRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn register<T, H>(mut self, name: &str, handler: H) -> Result<Self, RegistryError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.registry.register::<T, H>(name, handler)?;
        Ok(self)
    }

    pub fn register_with_acl<T, H>(
        mut self,
        name: &str,
        handler: H,
        acl: ExecuteAcl,
    ) -> Result<Self, RegistryError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.registry.register_with_acl::<T, H>(name, handler, acl)?;
        Ok(self)
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to built-in settings when not given.
    pub fn config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn expect_handlers(mut self, names: &[&str]) -> Self {
        self.expected = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Supervisor, BuildError> {
        if let Some(expected) = &self.expected {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| self.registry.resolve_str(name, Signature::TASK).is_err())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(SharedSettings::default()));
        let ctx = WorkerContext::new(store, Arc::new(self.registry), config).with_clock(self.clock);
        Ok(Supervisor::new(ctx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::impls::InMemoryTaskStore;
    use crate::typed::handler_fn;

    #[test]
    fn missing_handlers_fail_the_build() {
        let result = RunnerBuilder::new()
            .register("public.noop", handler_fn(|_, _| async { Ok(()) }))
            .unwrap()
            .store(Arc::new(InMemoryTaskStore::default()))
            .expect_handlers(&["noop", "public.purge"])
            .build();
        match result {
            Err(BuildError::MissingHandlers(missing)) => {
                assert_eq!(missing, vec!["public.purge".to_string()])
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("build should fail"),
        }
    }

    #[test]
    fn store_is_required() {
        assert!(matches!(
            RunnerBuilder::new().build(),
            Err(BuildError::MissingStore)
        ));
    }

    #[test]
    fn invalid_settings_fail_the_build() {
        let settings = SharedSettings::new(Settings {
            workers: 0,
            ..Settings::default()
        });
        let result = RunnerBuilder::new()
            .store(Arc::new(InMemoryTaskStore::default()))
            .config(Arc::new(settings))
            .build();
        assert!(matches!(result, Err(BuildError::Settings(_))));
    }

    #[test]
    fn builds_with_defaults() {
        let supervisor = RunnerBuilder::new()
            .store(Arc::new(InMemoryTaskStore::default()))
            .build()
            .unwrap();
        assert_eq!(supervisor.max_workers(), 8);
        assert_eq!(supervisor.settings(), Settings::default());
    }
}
