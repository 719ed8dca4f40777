//! SQLite backend
//!
//! ## Tables
//!
//! - `tiddler` - the live record of every title (indexed, unique)
//! - `tiddler_history` - append-only snapshots keyed by `(title, revision)`
//!
//! A single connection is shared behind a mutex. Each `put`/`delete` runs in
//! one immediate transaction, so the revision lookup, the live row, and the
//! history row commit together.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::schema::{init_schema, needs_init};
use crate::store::{check_cancelled, check_key, next_revision, Revision, TiddlerStore};
use crate::tiddler::{is_macro, merge_snapshot, stamp_revision, HistoryEntry, Tiddler};

/// Tiddler store backed by a SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!("opening SQLite tiddler database at {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::from_io(e, parent))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TiddlerStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Tiddler> {
        check_cancelled(cancel)?;
        let conn = self.conn();

        let row = conn
            .query_row(
                "SELECT meta, content FROM tiddler WHERE title = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((meta, content)) => Ok(Tiddler::fat(key, meta.into_bytes(), content)),
            None => Err(StoreError::not_found(key)),
        }
    }

    fn all(&self, cancel: &CancellationToken) -> StoreResult<Vec<Tiddler>> {
        check_cancelled(cancel)?;
        let conn = self.conn();

        let mut stmt = conn.prepare("SELECT title, meta, content FROM tiddler ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut tiddlers = Vec::new();
        for row in rows {
            let (title, meta, content) = row?;
            let tiddler = if is_macro(meta.as_bytes()) {
                Tiddler::fat(title, meta.into_bytes(), content)
            } else {
                Tiddler::skinny(title, meta.into_bytes())
            };
            tiddlers.push(tiddler);
        }
        Ok(tiddlers)
    }

    fn put(&self, cancel: &CancellationToken, tiddler: &Tiddler) -> StoreResult<Revision> {
        check_key(&tiddler.key)?;
        check_cancelled(cancel)?;
        let key = tiddler.key.as_str();

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let revision = next_revision(last_revision(&tx, key)?);
        let meta = stamp_revision(&tiddler.meta, revision)?;
        let snapshot = merge_snapshot(&meta, &tiddler.text)?;
        let meta = String::from_utf8(meta).map_err(StoreError::malformed)?;
        let snapshot = String::from_utf8(snapshot).map_err(StoreError::malformed)?;

        tx.execute(
            r#"
            INSERT INTO tiddler (title, meta, content, revision)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(title) DO UPDATE SET
                meta = excluded.meta,
                content = excluded.content,
                revision = excluded.revision
            "#,
            params![key, meta, tiddler.text, revision as i64],
        )?;
        tx.execute(
            "INSERT INTO tiddler_history (title, revision, snapshot) VALUES (?1, ?2, ?3)",
            params![key, revision as i64, snapshot],
        )?;

        // Dropping the transaction rolls it back.
        check_cancelled(cancel)?;
        tx.commit()?;

        debug!(key, revision, "stored tiddler");
        Ok(revision)
    }

    fn delete(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()> {
        check_cancelled(cancel)?;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute("DELETE FROM tiddler WHERE title = ?1", params![key])?;
        if removed == 0 {
            return Err(StoreError::not_found(key));
        }

        let revision = next_revision(last_revision(&tx, key)?);
        tx.execute(
            "INSERT INTO tiddler_history (title, revision, snapshot) VALUES (?1, ?2, NULL)",
            params![key, revision as i64],
        )?;

        check_cancelled(cancel)?;
        tx.commit()?;

        debug!(key, revision, "deleted tiddler");
        Ok(())
    }

    fn history(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Vec<HistoryEntry>> {
        check_cancelled(cancel)?;
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT revision, snapshot FROM tiddler_history WHERE title = ?1 ORDER BY revision",
        )?;
        let entries = stmt
            .query_map(params![key], |row| {
                Ok(HistoryEntry {
                    key: key.to_string(),
                    revision: row.get::<_, i64>(0)? as Revision,
                    snapshot: row.get::<_, Option<String>>(1)?.map(String::into_bytes),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn last_revision(conn: &Connection, key: &str) -> StoreResult<Revision> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(revision) FROM tiddler_history WHERE title = ?1",
        params![key],
        |row| row.get(0),
    )?;
    Ok(last.unwrap_or(0) as Revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiddler(key: &str, meta: &str, text: &str) -> Tiddler {
        Tiddler::fat(key, meta.as_bytes().to_vec(), text)
    }

    #[test]
    fn test_put_keeps_one_live_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();

        for text in ["one", "two", "three"] {
            store.put(&cancel, &tiddler("A", "{}", text)).unwrap();
        }

        let conn = store.conn();
        let live: i64 = conn
            .query_row("SELECT COUNT(*) FROM tiddler", [], |row| row.get(0))
            .unwrap();
        let history: i64 = conn
            .query_row("SELECT COUNT(*) FROM tiddler_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(live, 1);
        assert_eq!(history, 3);
    }

    #[test]
    fn test_lookup_is_exact_not_substring() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();

        store.put(&cancel, &tiddler("Journal 2024", r#"{"title":"Journal 2024"}"#, "long")).unwrap();

        assert!(store.get(&cancel, "Journal").unwrap_err().is_not_found());
        assert!(store.get(&cancel, "%").unwrap_err().is_not_found());
        assert_eq!(store.put(&cancel, &tiddler("Journal", "{}", "short")).unwrap(), 1);
        assert_eq!(store.get(&cancel, "Journal 2024").unwrap().text, "long");
    }

    #[test]
    fn test_delete_appends_null_snapshot() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();

        store.put(&cancel, &tiddler("A", "{}", "x")).unwrap();
        store.delete(&cancel, "A").unwrap();

        let history = store.history(&cancel, "A").unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_tombstone());
        assert!(history[1].is_tombstone());
        assert_eq!(store.put(&cancel, &tiddler("A", "{}", "y")).unwrap(), 3);
    }

    #[test]
    fn test_cancelled_put_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            store.put(&cancel, &tiddler("A", "{}", "x")),
            Err(StoreError::Cancelled)
        ));

        let live = CancellationToken::new();
        assert!(store.history(&live, "A").unwrap().is_empty());
        assert!(store.all(&live).unwrap().is_empty());
    }

    #[test]
    fn test_open_file_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join("tidbit.db");
        let cancel = CancellationToken::new();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&cancel, &tiddler("A", "{}", "kept")).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let got = store.get(&cancel, "A").unwrap();
        assert_eq!(got.text, "kept");
        assert_eq!(got.revision(), Some(1));
    }
}
