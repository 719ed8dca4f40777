//! Storage backends
//!
//! Three interchangeable implementations of [`TiddlerStore`](crate::store::TiddlerStore):
//!
//! - **redb**: embedded transactional key-value store ([`KvStore`])
//! - **SQLite**: relational tables with a history table ([`SqliteStore`])
//! - **Flat files**: one file per part under a directory ([`FlatFileStore`])
//!
//! Every backend keeps an append-only revision history per title and marks
//! deletes with a tombstone entry.

pub mod error;
pub mod flat_file;
pub mod kv;
pub mod schema;
pub mod sqlite;

pub use error::{ErrorKind, StoreError, StoreResult};
pub use flat_file::FlatFileStore;
pub use kv::KvStore;
pub use sqlite::SqliteStore;
