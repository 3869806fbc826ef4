//! spool-core
//!
//! データベースを唯一の正本とするバックグラウンドジョブエンジン。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, execution, process, queue）
//! - **concurrency**: concurrency key ごとの同時実行数制限（gate）
//! - **ports**: 抽象化レイヤー（JobStore, JobExecutor, Clock, IdGenerator）
//! - **store**: JobStore 実装（InMemoryJobStore, PgJobStore）
//! - **handler**: 型付きジョブ API（JobClass, Handler, HandlerRegistry）
//! - **app**: プロセス層（lifecycle, registration, pool, worker, dispatcher, engine）
//! - **config**: 設定（serde, JSON）
//! - **observability**: process / queue の状態スナップショット
//! - **error**: エラー型
//!
//! # 状態遷移
//! ```text
//! scheduled ──▶ ready ──▶ claimed ──▶ finished
//!     │           ▲ │        │
//!     ▼           │ ▼        ▼
//!   blocked ──────┘ blocked failed ──(retry)──▶ scheduled / ready / blocked
//! ```

pub mod app;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod error;
pub mod handler;
pub mod observability;
pub mod ports;
pub mod store;

pub use app::{Engine, RunningEngine};
pub use config::{EngineConfig, Mode};
pub use error::{SpoolError, StoreError};
pub use handler::{Handler, HandlerRegistry, JobClass};
pub use ports::{JobExecutor, JobStore};
pub use store::{InMemoryJobStore, PgJobStore};
