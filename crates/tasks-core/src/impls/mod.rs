//! Impls - 実装（組み込み用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: transactional in-process queue
//! - **RoleGraph**: role membership used by the in-memory store
//!
//! # 本番用実装
//! The PostgreSQL queue lives in its own crate, `tasks-pg`.

pub mod memory;
pub mod roles;

pub use self::memory::{InMemorySession, InMemoryTaskStore};
pub use self::roles::RoleGraph;
