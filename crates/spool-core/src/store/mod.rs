//! `JobStore` implementations.

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryJobStore;
pub use self::postgres::PgJobStore;
