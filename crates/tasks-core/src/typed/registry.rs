//! CallableRegistry - 実行可能な関数の登録と解決
//!
//! Callables are keyed by `(qualified name, signature)`. Unqualified names
//! resolve through the search path, first match wins.

use super::handler::{Callable, Handler, Signature, TypedCallable};
use crate::domain::{Identity, NameError, QualifiedName};
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const DEFAULT_SCHEMA: &str = "public";

/// Who may execute a callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteAcl {
    Public,
    Granted(BTreeSet<Identity>),
}

impl ExecuteAcl {
    pub fn granted<I>(roles: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::Granted(roles.into_iter().map(Identity::new).collect())
    }
}

/// A resolved entry: the callable plus what is needed to authorize it.
#[derive(Clone)]
pub struct RegisteredCallable {
    name: QualifiedName,
    callable: Arc<dyn Callable>,
    acl: ExecuteAcl,
}

impl RegisteredCallable {
    pub fn name(&self) -> &QualifiedName {
        &self.name
    }

    pub fn callable(&self) -> &Arc<dyn Callable> {
        &self.callable
    }

    pub fn acl(&self) -> &ExecuteAcl {
        &self.acl
    }
}

impl std::fmt::Debug for RegisteredCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCallable")
            .field("name", &self.name)
            .field("signature", &self.callable.signature())
            .field("acl", &self.acl)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("function {0} is already registered")]
    AlreadyRegistered(String),

    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error("function {name}{signature} does not exist")]
    NotFound { name: String, signature: Signature },
}

pub struct CallableRegistry {
    entries: HashMap<(QualifiedName, Signature), RegisteredCallable>,
    search_path: Vec<String>,
}

impl Default for CallableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            search_path: vec![DEFAULT_SCHEMA.to_string()],
        }
    }

    pub fn with_search_path<I>(mut self, schemas: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.search_path = schemas.into_iter().map(Into::into).collect();
        self
    }

    /// Registers a handler executable by everyone.
    pub fn register<T, H>(&mut self, name: &str, handler: H) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.register_with_acl(name, handler, ExecuteAcl::Public)
    }

    pub fn register_with_acl<T, H>(
        &mut self,
        name: &str,
        handler: H,
        acl: ExecuteAcl,
    ) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.register_callable(name, Arc::new(TypedCallable::new(handler)), acl)
    }

    /// Unqualified names land in the first schema of the search path.
    pub fn register_callable(
        &mut self,
        name: &str,
        callable: Arc<dyn Callable>,
        acl: ExecuteAcl,
    ) -> Result<(), RegistryError> {
        let parsed = QualifiedName::parse(name)?;
        let qualified = match parsed.schema() {
            Some(_) => parsed,
            None => {
                let schema = self
                    .search_path
                    .first()
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_SCHEMA);
                parsed.in_schema(schema)
            }
        };
        let key = (qualified.clone(), callable.signature());
        if self.entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(format!(
                "{}{}",
                qualified, key.1
            )));
        }
        self.entries.insert(
            key,
            RegisteredCallable {
                name: qualified,
                callable,
                acl,
            },
        );
        Ok(())
    }

    pub fn resolve(
        &self,
        name: &QualifiedName,
        signature: Signature,
    ) -> Result<&RegisteredCallable, RegistryError> {
        let found = match name.schema() {
            Some(_) => self.entries.get(&(name.clone(), signature)),
            None => self
                .search_path
                .iter()
                .find_map(|schema| self.entries.get(&(name.in_schema(schema), signature))),
        };
        found.ok_or_else(|| RegistryError::NotFound {
            name: name.to_string(),
            signature,
        })
    }

    /// Parses `exec` as stored in a task row, then resolves it.
    pub fn resolve_str(
        &self,
        exec: &str,
        signature: Signature,
    ) -> Result<&RegisteredCallable, RegistryError> {
        let name = QualifiedName::parse(exec)?;
        self.resolve(&name, signature)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .values()
            .map(|entry| format!("{}{}", entry.name, entry.callable.signature()))
            .collect();
        names.sort();
        names
    }
}
