//! Domain model: tasks, identities, handler names, worker values.

pub mod name;
pub mod task;
pub mod worker;

pub use self::name::{NameError, QualifiedName};
pub use self::task::{Identity, NewTask, Task, TaskId};
pub use self::worker::{WorkerArgs, WorkerExit, WorkerState};
