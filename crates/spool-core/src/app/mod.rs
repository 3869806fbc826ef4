//! App - プロセス層
//!
//! ports を組み合わせて長寿命のプロセスを実装します。
//!
//! # 主要コンポーネント
//! - **Lifecycle**: created → starting → running → stopping → stopped
//! - **Registration**: process 行の登録・heartbeat・削除
//! - **ExecutionPool**: 固定数の slot でジョブ本体を実行
//! - **Process**: `Poll` 実装を駆動する適応ポーリングループ
//! - **Worker / Dispatcher**: `Poll` の実装
//! - **Engine**: 設定とモードからプロセス群を起動・停止

pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod pool;
pub mod process;
pub mod registration;
pub mod worker;

pub use self::dispatcher::{Dispatcher, MaintenanceReport};
pub use self::engine::{Engine, RunningEngine};
pub use self::lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use self::pool::ExecutionPool;
pub use self::process::{Poll, PollOutcome, Process, ProcessHandle};
pub use self::registration::Registration;
pub use self::worker::Worker;
