//! Backend selection
//!
//! A [`BackendRegistry`] maps backend names to opener functions. The binary
//! builds one at startup, picks a backend from configuration, and opens it
//! exactly once.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::{FlatFileStore, KvStore, SqliteStore};
use crate::store::TiddlerStore;

/// Opens a backend on the given data source
pub type Opener = fn(&Path) -> StoreResult<Arc<dyn TiddlerStore>>;

/// Errors from registering or opening a backend
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("backend {0:?} is already registered")]
    Duplicate(String),

    #[error("unknown backend {name:?} (available: {available})")]
    Unknown { name: String, available: String },

    #[error("failed to open {name} backend at {path}")]
    Open {
        name: String,
        path: String,
        #[source]
        source: StoreError,
    },
}

/// Name-to-opener table for storage backends
#[derive(Default)]
pub struct BackendRegistry {
    openers: BTreeMap<String, Opener>,
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `redb`, `sqlite`, and `flatfile` backends
    pub fn builtin() -> Self {
        let openers = [
            ("redb", open_kv as Opener),
            ("sqlite", open_sqlite),
            ("flatfile", open_flat_file),
        ];
        Self {
            openers: openers
                .into_iter()
                .map(|(name, opener)| (name.to_string(), opener))
                .collect(),
        }
    }

    /// Add a backend. Fails if `name` is already taken.
    pub fn register(&mut self, name: &str, opener: Opener) -> Result<(), RegistryError> {
        if self.openers.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.openers.insert(name.to_string(), opener);
        Ok(())
    }

    /// Registered backend names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.openers.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.openers.contains_key(name)
    }

    /// Open the backend called `name` on `data_source`
    pub fn open(
        &self,
        name: &str,
        data_source: &Path,
    ) -> Result<Arc<dyn TiddlerStore>, RegistryError> {
        let opener = self.openers.get(name).ok_or_else(|| RegistryError::Unknown {
            name: name.to_string(),
            available: self.names().join(", "),
        })?;

        let store = opener(data_source).map_err(|source| RegistryError::Open {
            name: name.to_string(),
            path: data_source.display().to_string(),
            source,
        })?;

        info!(backend = name, path = %data_source.display(), "opened tiddler store");
        Ok(store)
    }
}

fn open_kv(path: &Path) -> StoreResult<Arc<dyn TiddlerStore>> {
    Ok(Arc::new(KvStore::persistent(path)?))
}

fn open_sqlite(path: &Path) -> StoreResult<Arc<dyn TiddlerStore>> {
    Ok(Arc::new(SqliteStore::open(path)?))
}

fn open_flat_file(path: &Path) -> StoreResult<Arc<dyn TiddlerStore>> {
    Ok(Arc::new(FlatFileStore::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_in_memory(_: &Path) -> StoreResult<Arc<dyn TiddlerStore>> {
        Ok(Arc::new(KvStore::in_memory()?))
    }

    #[test]
    fn test_builtin_names() {
        let registry = BackendRegistry::builtin();
        assert_eq!(registry.names(), vec!["flatfile", "redb", "sqlite"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = BackendRegistry::builtin();
        let err = registry.register("redb", open_in_memory).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "redb"));
    }

    #[test]
    fn test_unknown_backend_lists_available() {
        let registry = BackendRegistry::builtin();
        let err = match registry.open("bolt", Path::new("x")) {
            Err(err) => err,
            Ok(_) => panic!("expected unknown backend error"),
        };
        let message = err.to_string();
        assert!(message.contains("bolt"));
        assert!(message.contains("flatfile, redb, sqlite"));
    }

    #[test]
    fn test_custom_backend() {
        let mut registry = BackendRegistry::new();
        registry.register("memory", open_in_memory).unwrap();
        let store = registry.open("memory", Path::new("")).unwrap();
        assert_eq!(store.name(), "redb");
    }

    #[test]
    fn test_open_each_builtin() {
        let temp_dir = TempDir::new().unwrap();
        let registry = BackendRegistry::builtin();

        for (name, source) in [
            ("redb", "tidbit.redb"),
            ("sqlite", "tidbit.db"),
            ("flatfile", "store"),
        ] {
            let store = registry.open(name, &temp_dir.path().join(source)).unwrap();
            assert_eq!(store.name(), name);
        }
    }
}
