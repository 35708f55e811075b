//! tasks-pg
//!
//! PostgreSQL implementation of the task queue: `tasks.task`, claimed with
//! `for no key update skip locked`.

pub mod query;
pub mod schema;
pub mod session;
pub mod store;

pub use self::query::{ArgType, NamedQuery, QueryArg, QueryExecutor, ResultKind};
pub use self::schema::{enqueue, install, pending};
pub use self::session::PgQueueSession;
pub use self::store::PgTaskStore;
