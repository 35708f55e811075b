//! Ports - 抽象化レイヤー
//!
//! Seams between the runner and the outside world: the durable queue and
//! the clock.

pub mod clock;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::task_store::{QueueSession, TaskStore};
