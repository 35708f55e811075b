//! App - アプリケーション層
//!
//! ports を組み合わせてランナーを組み立てます。
//!
//! # 主要コンポーネント
//! - **RunnerBuilder**: 構築とワイヤリング
//! - **Supervisor**: worker の起動・再起動・制御
//! - **WorkerLoop**: begin → claim → recompute → commit → sleep
//! - **TaskExecutor**: 1 件の claim と handler 呼び出し

pub mod builder;
pub mod control;
pub mod executor;
pub mod supervisor;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, RunnerBuilder};
pub use self::control::{control_channel, ControlEvent, ControlReceiver, ControlSender, PendingSignals};
pub use self::executor::{ClaimOutcome, TaskExecutor};
pub use self::supervisor::Supervisor;
pub use self::worker_loop::{WorkerContext, WorkerLoop};
