//! Embedded transactional key-value backend (redb)
//!
//! ## Tables
//!
//! - `tiddler`: two entries per title, `(title, 1)` holding the metadata
//!   with the current revision embedded and `(title, 2)` holding the text.
//!   A deleted tiddler keeps both entries with empty values.
//! - `tiddler_history`: one merged snapshot per `(title, revision)`; an
//!   empty value is a delete tombstone.
//!
//! Every write runs in a single redb write transaction, so the live record,
//! the revision, and the history entry always change together. redb allows
//! one writer at a time, which serializes the read-modify-write of the
//! revision counter.

use std::path::Path;

use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::error::{StoreError, StoreResult};
use crate::store::{check_cancelled, check_key, next_revision, Revision, TiddlerStore};
use crate::tiddler::{embedded_revision, is_macro, merge_snapshot, stamp_revision, HistoryEntry, Tiddler};

const META_PART: u8 = 1;
const TEXT_PART: u8 = 2;
const EMPTY: &[u8] = &[];

const TIDDLER_TABLE: TableDefinition<(&str, u8), &[u8]> = TableDefinition::new("tiddler");
const HISTORY_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("tiddler_history");

/// Tiddler store backed by a redb database file
#[derive(Debug)]
pub struct KvStore {
    db: Database,
}

impl KvStore {
    /// Open or create the database file at `path`
    pub fn persistent(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!("opening tiddler database at {}", path.display());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::from_io(e, parent))?;
            }
        }
        let db = Database::create(path)?;
        Self::open(db)
    }

    /// A throwaway in-memory database
    pub fn in_memory() -> StoreResult<Self> {
        debug!("using in-memory tiddler database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> StoreResult<Self> {
        let write_tx = db.begin_write()?;
        {
            let _tiddlers = write_tx.open_table(TIDDLER_TABLE)?;
            let _history = write_tx.open_table(HISTORY_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db })
    }
}

impl TiddlerStore for KvStore {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn get(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Tiddler> {
        check_cancelled(cancel)?;
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TIDDLER_TABLE)?;

        let meta = match table.get((key, META_PART))? {
            Some(meta) if !meta.value().is_empty() => meta.value().to_vec(),
            _ => return Err(StoreError::not_found(key)),
        };
        let text = table
            .get((key, TEXT_PART))?
            .map(|text| String::from_utf8_lossy(text.value()).into_owned())
            .unwrap_or_default();

        Ok(Tiddler::fat(key, meta, text))
    }

    fn all(&self, cancel: &CancellationToken) -> StoreResult<Vec<Tiddler>> {
        check_cancelled(cancel)?;
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TIDDLER_TABLE)?;

        // Entries for one title are adjacent: metadata first, then text.
        let mut tiddlers = Vec::new();
        let mut pending: Option<Tiddler> = None;
        for entry in table.iter()? {
            let (key, value) = entry?;
            let (title, part) = key.value();
            match part {
                META_PART => {
                    tiddlers.extend(pending.take());
                    let meta = value.value();
                    if meta.is_empty() {
                        continue;
                    }
                    let mut tiddler = Tiddler::skinny(title, meta.to_vec());
                    tiddler.with_text = is_macro(meta);
                    pending = Some(tiddler);
                }
                TEXT_PART => {
                    if let Some(mut tiddler) = pending.take() {
                        if tiddler.with_text && tiddler.key == title {
                            tiddler.text = String::from_utf8_lossy(value.value()).into_owned();
                        }
                        tiddlers.push(tiddler);
                    }
                }
                other => warn!(title, part = other, "skipping unknown tiddler entry"),
            }
        }
        tiddlers.extend(pending);

        Ok(tiddlers)
    }

    fn put(&self, cancel: &CancellationToken, tiddler: &Tiddler) -> StoreResult<Revision> {
        check_key(&tiddler.key)?;
        check_cancelled(cancel)?;
        let key = tiddler.key.as_str();

        let tx = self.db.begin_write()?;
        let revision = {
            let mut live = tx.open_table(TIDDLER_TABLE)?;
            let mut history = tx.open_table(HISTORY_TABLE)?;

            let revision = next_revision(last_revision(&live, &history, key)?);
            let meta = stamp_revision(&tiddler.meta, revision)?;
            let snapshot = merge_snapshot(&meta, &tiddler.text)?;

            live.insert((key, META_PART), meta.as_slice())?;
            live.insert((key, TEXT_PART), tiddler.text.as_bytes())?;
            history.insert((key, revision), snapshot.as_slice())?;
            revision
        };
        // Dropping an uncommitted transaction aborts it.
        check_cancelled(cancel)?;
        tx.commit()?;

        debug!(key, revision, "stored tiddler");
        Ok(revision)
    }

    fn delete(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()> {
        check_cancelled(cancel)?;

        let tx = self.db.begin_write()?;
        let revision = {
            let mut live = tx.open_table(TIDDLER_TABLE)?;
            let mut history = tx.open_table(HISTORY_TABLE)?;

            let exists = live
                .get((key, META_PART))?
                .is_some_and(|meta| !meta.value().is_empty());
            if !exists {
                return Err(StoreError::not_found(key));
            }

            let revision = next_revision(last_revision(&live, &history, key)?);
            live.insert((key, META_PART), EMPTY)?;
            live.insert((key, TEXT_PART), EMPTY)?;
            history.insert((key, revision), EMPTY)?;
            revision
        };
        check_cancelled(cancel)?;
        tx.commit()?;

        debug!(key, revision, "deleted tiddler");
        Ok(())
    }

    fn history(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Vec<HistoryEntry>> {
        check_cancelled(cancel)?;
        let tx = self.db.begin_read()?;
        let table = tx.open_table(HISTORY_TABLE)?;

        let mut entries = Vec::new();
        for entry in table.range((key, 0)..=(key, Revision::MAX))? {
            let (entry_key, value) = entry?;
            let (_, revision) = entry_key.value();
            let snapshot = value.value();
            entries.push(HistoryEntry {
                key: key.to_string(),
                revision,
                snapshot: (!snapshot.is_empty()).then(|| snapshot.to_vec()),
            });
        }
        Ok(entries)
    }
}

/// The last revision assigned to `key`.
///
/// Live metadata carries it directly; deleted tiddlers fall back to the
/// newest history entry, which is the tombstone.
fn last_revision(
    live: &impl ReadableTable<(&'static str, u8), &'static [u8]>,
    history: &impl ReadableTable<(&'static str, u64), &'static [u8]>,
    key: &str,
) -> StoreResult<Revision> {
    if let Some(meta) = live.get((key, META_PART))? {
        if let Some(revision) = embedded_revision(meta.value()) {
            return Ok(revision);
        }
    }
    let newest = history
        .range((key, 0)..=(key, Revision::MAX))?
        .next_back()
        .transpose()?;
    Ok(newest.map(|(entry_key, _)| entry_key.value().1).unwrap_or(0))
}
