//! Tidbit Core Library
//!
//! Persistence for a personal wiki made of *tiddlers*: titled units of
//! content with JSON metadata and a text body.
//!
//! # Architecture
//!
//! - [`TiddlerStore`]: the storage contract every backend implements
//! - [`storage`]: redb, SQLite, and flat-file backends
//! - [`BackendRegistry`]: selects a backend by name at startup
//!
//! Every write assigns the next per-title revision and records it in an
//! append-only history, atomically with the live record.
//!
//! # Quick Start
//!
//! ```text
//! let registry = BackendRegistry::builtin();
//! let store = registry.open("redb", Path::new("tidbit.redb"))?;
//!
//! let cancel = CancellationToken::new();
//! let tiddler = Tiddler::from_json_body("HelloThere", br#"{"text":"hi"}"#)?;
//! let revision = store.put(&cancel, &tiddler)?;
//! ```
//!
//! # Modules
//!
//! - `tiddler`: the tiddler record and its JSON projections
//! - `store`: the storage trait and revision helpers
//! - `storage`: backend implementations and errors
//! - `registry`: backend lookup by name
//! - `config`: application configuration

pub mod config;
pub mod registry;
pub mod storage;
pub mod store;
pub mod tiddler;

pub use config::Config;
pub use registry::{BackendRegistry, RegistryError};
pub use storage::{ErrorKind, FlatFileStore, KvStore, SqliteStore, StoreError, StoreResult};
pub use store::{Revision, TiddlerStore};
pub use tiddler::{HistoryEntry, Tiddler, BAG, MACRO_TAG};
