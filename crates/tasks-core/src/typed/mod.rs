//! Typed - handler API
//!
//! # 二層構造
//! - **表層（Typed）**: `Handler<T>` - config decoded into a serde type
//! - **内部（Dyn）**: `Callable` - object-safe, resolved by qualified name

pub mod handler;
pub mod registry;

pub use self::handler::{
    handler_fn, Arg, ArgKind, Callable, FnHandler, Handler, HandlerError, Signature,
    TypedCallable,
};
pub use self::registry::{CallableRegistry, ExecuteAcl, RegisteredCallable, RegistryError};
