// db/mod.rs
// Storage layer: connection pooling, schema migrations, and shared helpers.

pub mod migration_helpers;
pub mod migrations;
pub mod pool;

pub use pool::{PoolStatus, StorageBackend, TxMode};
