//! Infrastructure layer - Storage adapters
//!
//! - `memory`: single-process adapter behind one mutex
//! - `sqlite`: sqlx SQLite pool, shared by any number of worker processes

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
