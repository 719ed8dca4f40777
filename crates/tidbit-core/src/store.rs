//! The store contract shared by every backend
//!
//! ## Revisions
//!
//! Each key carries its own revision counter. The first write gets revision
//! 1 and every later `put` or `delete` gets the previous revision plus one.
//! A delete consumes a revision too, so a key that is deleted and written
//! again keeps counting upwards.
//!
//! ## Cancellation
//!
//! Every operation takes a [`CancellationToken`]. Backends check it before
//! each step of a write and give up with [`StoreError::Cancelled`] as long
//! as nothing has been committed. Once a write has committed it runs to the
//! end regardless of the token.

use tokio_util::sync::CancellationToken;

use crate::storage::error::{StoreError, StoreResult};
use crate::tiddler::{HistoryEntry, Tiddler};

/// Per-key version counter
pub type Revision = u64;

/// Persistent storage for tiddlers.
///
/// Implementations must be safe to call from many threads at once. Writes to
/// the same key are linearizable: once `put` returns revision N, every later
/// `get` or `all` sees that write in full.
pub trait TiddlerStore: Send + Sync {
    /// Short backend name, used in logs
    fn name(&self) -> &'static str;

    /// Retrieve a fat tiddler by key.
    ///
    /// Fails with [`StoreError::NotFound`] when no live record exists.
    fn get(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Tiddler>;

    /// Retrieve every live tiddler.
    ///
    /// Tiddlers are skinny except those tagged with the macro tag, which
    /// come back fat. No ordering is guaranteed.
    fn all(&self, cancel: &CancellationToken) -> StoreResult<Vec<Tiddler>>;

    /// Save a tiddler and return the revision assigned to it.
    ///
    /// The live record, the revision counter, and a history snapshot are
    /// updated together.
    fn put(&self, cancel: &CancellationToken, tiddler: &Tiddler) -> StoreResult<Revision>;

    /// Delete the live record for `key` and append a tombstone to its history.
    ///
    /// Fails with [`StoreError::NotFound`] when there is nothing to delete.
    fn delete(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()>;

    /// The full revision history of `key`, oldest first
    fn history(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Vec<HistoryEntry>>;
}

/// The revision that follows `last`; `last` is 0 for keys never written
pub fn next_revision(last: Revision) -> Revision {
    last + 1
}

/// Bail out with [`StoreError::Cancelled`] if the caller has given up
pub fn check_cancelled(cancel: &CancellationToken) -> StoreResult<()> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}

/// Keys must be non-empty
pub fn check_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}
