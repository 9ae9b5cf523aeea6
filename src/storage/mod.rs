//! Storage backends for agent-memory

mod async_store;
pub mod migration;
mod sqlite;

pub use async_store::AsyncSqliteStorage;
pub use migration::{MigrationManager, SCHEMA_VERSION};
pub use sqlite::{SqliteStorage, StorageStats};
