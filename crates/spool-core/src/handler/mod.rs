//! Handler - 型付きジョブ API
//!
//! class_name の typo を型で排除し、ジョブ本体との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `JobClass` trait, `Handler<J>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! `HandlerRegistry` は `JobExecutor` を実装するので、そのまま worker に渡せます。

pub mod class;
pub mod registry;
pub mod typed;

pub use self::class::JobClass;
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::typed::{DynHandler, Handler, TypedHandler};
