//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（PostgreSQL, ホストアプリのジョブ本体, 時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - データベースが唯一の正本（プロセス間の直接通信はしない）
//! - 時刻と ID 生成は差し替え可能（テストで決定的にするため）

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod job_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::JobExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::JobStore;
