//! Flat-file backend
//!
//! Layout under the store root:
//!
//! - `tiddlers/<name>.tid` - the text of a live tiddler
//! - `tiddlers/<name>.meta` - its metadata, with the revision embedded
//! - `tiddlerHistory/<name>#<revision>` - merged snapshot; empty for a delete
//!
//! `<name>` is the form-urlencoded title, so every title maps to exactly one
//! file name and `#` never appears inside it.
//!
//! Every file is written atomically (temp file, fsync, rename). A write
//! lands in the history directory first; that file is the commit point.
//! The live files follow, `.tid` before `.meta`. If the process dies in
//! between, [`FlatFileStore::open`] replays the newest history entry onto
//! the live files. If a live file fails to land while the process is still
//! running, the history entry is removed again and the previous revision is
//! put back, so a failed write leaves no trace.
//!
//! File names are limited to 255 bytes on most file systems. Encoding
//! spends three bytes on every non-ASCII byte of a title, so titles whose
//! encoded form passes [`MAX_NAME_LEN`] are rejected with
//! [`StoreError::KeyTooLong`] instead of failing half way through a write.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::storage::error::{StoreError, StoreResult};
use crate::store::{check_cancelled, check_key, next_revision, Revision, TiddlerStore};
use crate::tiddler::{
    embedded_revision, is_macro, merge_snapshot, split_snapshot, stamp_revision, HistoryEntry,
    Tiddler,
};

const TIDDLERS_DIR: &str = "tiddlers";
const HISTORY_DIR: &str = "tiddlerHistory";
const TEXT_EXT: &str = ".tid";
const META_EXT: &str = ".meta";
const STAGING_EXT: &str = ".tmp";

/// Longest encoded title accepted, leaving room for `#<revision>` and the
/// staging suffix within a 255-byte file name
pub const MAX_NAME_LEN: usize = 220;

/// Tiddler store kept as plain files in a directory tree
#[derive(Debug)]
pub struct FlatFileStore {
    tiddlers_dir: PathBuf,
    history_dir: PathBuf,
    /// Writers hold it exclusively; readers share it so they never see a
    /// half-renamed record.
    lock: RwLock<()>,
}

impl FlatFileStore {
    /// Open the store rooted at `root`, creating it if needed, and repair any
    /// write that was interrupted after its commit point
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        info!("opening flat-file tiddler store at {}", root.display());

        let tiddlers_dir = root.join(TIDDLERS_DIR);
        let history_dir = root.join(HISTORY_DIR);
        for dir in [&tiddlers_dir, &history_dir] {
            fs::create_dir_all(dir).map_err(|e| StoreError::from_io(e, dir))?;
        }

        let store = Self {
            tiddlers_dir,
            history_dir,
            lock: RwLock::new(()),
        };
        store.recover()?;
        Ok(store)
    }

    fn text_path(&self, name: &str) -> PathBuf {
        self.tiddlers_dir.join(format!("{name}{TEXT_EXT}"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.tiddlers_dir.join(format!("{name}{META_EXT}"))
    }

    fn history_path(&self, name: &str, revision: Revision) -> PathBuf {
        self.history_dir.join(format!("{name}#{revision}"))
    }

    /// Newest history revision of every encoded name
    fn newest_revisions(&self) -> StoreResult<BTreeMap<String, Revision>> {
        let mut newest = BTreeMap::new();
        for file_name in list_dir(&self.history_dir)? {
            let Some((name, revision)) = file_name.rsplit_once('#') else {
                continue;
            };
            if let Ok(revision) = revision.parse::<Revision>() {
                let entry = newest.entry(name.to_string()).or_insert(revision);
                *entry = (*entry).max(revision);
            }
        }
        Ok(newest)
    }

    /// History revisions of one encoded name, oldest first
    fn revisions(&self, name: &str) -> StoreResult<Vec<Revision>> {
        let prefix = format!("{name}#");
        let mut revisions: Vec<Revision> = list_dir(&self.history_dir)?
            .iter()
            .filter_map(|file_name| file_name.strip_prefix(&prefix)?.parse().ok())
            .collect();
        revisions.sort_unstable();
        Ok(revisions)
    }

    fn last_revision(&self, name: &str) -> StoreResult<Revision> {
        Ok(self.revisions(name)?.last().copied().unwrap_or(0))
    }

    /// Make the live files of `name` match a history snapshot. An empty
    /// snapshot means the tiddler is absent.
    fn apply_snapshot(&self, name: &str, snapshot: &[u8]) -> StoreResult<()> {
        if snapshot.is_empty() {
            remove_if_exists(&self.meta_path(name))?;
            return remove_if_exists(&self.text_path(name));
        }
        let (meta, text) = split_snapshot(snapshot)?;
        atomic_write(&self.text_path(name), text.as_bytes())?;
        atomic_write(&self.meta_path(name), &meta)
    }

    /// Undo a write whose live files failed after its history entry landed:
    /// drop the entry and restore the revision before it
    fn roll_back(&self, name: &str, revision: Revision) -> StoreResult<()> {
        remove_if_exists(&self.history_path(name, revision))?;
        let previous = match self.revisions(name)?.last() {
            Some(&previous) => read_file(&self.history_path(name, previous))?,
            None => Vec::new(),
        };
        self.apply_snapshot(name, &previous)
    }

    /// Finish a write after its history entry is on disk, rolling it back if
    /// the live files cannot be updated
    fn settle(
        &self,
        key: &str,
        name: &str,
        revision: Revision,
        written: StoreResult<()>,
    ) -> StoreResult<()> {
        let Err(err) = written else {
            return Ok(());
        };
        warn!(key, revision, "rolling back failed write: {err}");
        if let Err(rollback) = self.roll_back(name, revision) {
            error!(key, revision, "rollback incomplete: {rollback}");
        }
        Err(err)
    }

    /// Bring the live files in line with the newest history entry of every
    /// title, and drop staging files left by an interrupted write
    fn recover(&self) -> StoreResult<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        for dir in [&self.tiddlers_dir, &self.history_dir] {
            for file_name in list_dir(dir)? {
                if file_name.ends_with(STAGING_EXT) {
                    let path = dir.join(&file_name);
                    warn!("removing stale staging file {}", path.display());
                    remove_if_exists(&path)?;
                }
            }
        }

        for (name, revision) in self.newest_revisions()? {
            let history_path = self.history_path(&name, revision);
            let snapshot = read_file(&history_path)?;
            let meta_path = self.meta_path(&name);
            let text_path = self.text_path(&name);

            if snapshot.is_empty() {
                if meta_path.exists() || text_path.exists() {
                    info!(name = %name, revision, "replaying interrupted delete");
                    self.apply_snapshot(&name, &snapshot)?;
                }
                continue;
            }

            let live_revision = match fs::read(&meta_path) {
                Ok(meta) => embedded_revision(&meta),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(StoreError::from_io(e, meta_path)),
            };
            if live_revision == Some(revision) && text_path.exists() {
                continue;
            }

            info!(name = %name, revision, "replaying interrupted write");
            self.apply_snapshot(&name, &snapshot)?;
        }
        Ok(())
    }
}

impl TiddlerStore for FlatFileStore {
    fn name(&self) -> &'static str {
        "flatfile"
    }

    fn get(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Tiddler> {
        check_cancelled(cancel)?;
        let Ok(name) = encode_key(key) else {
            return Err(StoreError::not_found(key));
        };
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        let text_path = self.text_path(&name);
        if !text_path.exists() {
            return Err(StoreError::not_found(key));
        }
        let meta = match fs::read(self.meta_path(&name)) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(key))
            }
            Err(e) => return Err(StoreError::from_io(e, self.meta_path(&name))),
        };
        let text = read_file(&text_path)?;

        Ok(Tiddler::fat(key, meta, String::from_utf8_lossy(&text).into_owned()))
    }

    fn all(&self, cancel: &CancellationToken) -> StoreResult<Vec<Tiddler>> {
        check_cancelled(cancel)?;
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        let mut tiddlers = Vec::new();
        for file_name in list_dir(&self.tiddlers_dir)? {
            let Some(name) = file_name.strip_suffix(META_EXT) else {
                continue;
            };
            let meta = read_file(&self.tiddlers_dir.join(&file_name))?;
            let mut tiddler = Tiddler::skinny(decode_key(name), meta);
            if is_macro(&tiddler.meta) {
                let text = read_file(&self.text_path(name))?;
                tiddler.text = String::from_utf8_lossy(&text).into_owned();
                tiddler.with_text = true;
            }
            tiddlers.push(tiddler);
        }
        Ok(tiddlers)
    }

    fn put(&self, cancel: &CancellationToken, tiddler: &Tiddler) -> StoreResult<Revision> {
        check_key(&tiddler.key)?;
        check_cancelled(cancel)?;
        let name = encode_key(&tiddler.key)?;
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let revision = next_revision(self.last_revision(&name)?);
        let meta = stamp_revision(&tiddler.meta, revision)?;
        let snapshot = merge_snapshot(&meta, &tiddler.text)?;

        check_cancelled(cancel)?;
        atomic_write(&self.history_path(&name, revision), &snapshot)?;
        let written = atomic_write(&self.text_path(&name), tiddler.text.as_bytes())
            .and_then(|()| atomic_write(&self.meta_path(&name), &meta));
        self.settle(&tiddler.key, &name, revision, written)?;

        debug!(key = %tiddler.key, revision, "stored tiddler");
        Ok(revision)
    }

    fn delete(&self, cancel: &CancellationToken, key: &str) -> StoreResult<()> {
        check_cancelled(cancel)?;
        let Ok(name) = encode_key(key) else {
            return Err(StoreError::not_found(key));
        };
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let meta_path = self.meta_path(&name);
        if !meta_path.exists() {
            return Err(StoreError::not_found(key));
        }
        let revision = next_revision(self.last_revision(&name)?);

        check_cancelled(cancel)?;
        atomic_write(&self.history_path(&name, revision), &[])?;
        let removed = self.apply_snapshot(&name, &[]);
        self.settle(key, &name, revision, removed)?;

        debug!(key, revision, "deleted tiddler");
        Ok(())
    }

    fn history(&self, cancel: &CancellationToken, key: &str) -> StoreResult<Vec<HistoryEntry>> {
        check_cancelled(cancel)?;
        let Ok(name) = encode_key(key) else {
            return Ok(Vec::new());
        };
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        let mut entries = Vec::new();
        for revision in self.revisions(&name)? {
            let snapshot = read_file(&self.history_path(&name, revision))?;
            entries.push(HistoryEntry {
                key: key.to_string(),
                revision,
                snapshot: (!snapshot.is_empty()).then_some(snapshot),
            });
        }
        Ok(entries)
    }
}

/// Map a title to a file name that is safe on any file system
fn encode_key(key: &str) -> StoreResult<String> {
    let name: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::KeyTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(name)
}

fn decode_key(name: &str) -> String {
    form_urlencoded::parse(name.as_bytes())
        .map(|(key, _)| key.into_owned())
        .next()
        .unwrap_or_default()
}

/// File names in `dir`, skipping entries that are not valid UTF-8
fn list_dir(dir: &Path) -> StoreResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::from_io(e, dir))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::from_io(e, dir))?;
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(names)
}

fn read_file(path: &Path) -> StoreResult<Vec<u8>> {
    fs::read(path).map_err(|e| StoreError::from_io(e, path))
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::from_io(e, path)),
    }
}

/// Write data to a file atomically
///
/// 1. Write to a staging file next to the target
/// 2. Sync the file to disk
/// 3. Rename the staging file over the target
fn atomic_write(path: &Path, data: &[u8]) -> StoreResult<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(STAGING_EXT);
    let staging = PathBuf::from(staging);

    let mut file = File::create(&staging).map_err(|e| StoreError::from_io(e, &staging))?;
    file.write_all(data)
        .map_err(|e| StoreError::from_io(e, &staging))?;
    file.sync_all()
        .map_err(|e| StoreError::from_io(e, &staging))?;

    fs::rename(&staging, path).map_err(|e| StoreError::from_io(e, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::error::ErrorKind;
    use tempfile::TempDir;

    fn tiddler(key: &str, meta: &str, text: &str) -> Tiddler {
        Tiddler::fat(key, meta.as_bytes().to_vec(), text)
    }

    #[test]
    fn test_layout_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let cancel = CancellationToken::new();

        store.put(&cancel, &tiddler("Hello", r#"{"author":"x"}"#, "world")).unwrap();

        let root = temp_dir.path();
        assert_eq!(
            fs::read_to_string(root.join("tiddlers").join("Hello.tid")).unwrap(),
            "world"
        );
        assert_eq!(
            fs::read_to_string(root.join("tiddlers").join("Hello.meta")).unwrap(),
            r#"{"author":"x","revision":1}"#
        );
        assert_eq!(
            fs::read_to_string(root.join("tiddlerHistory").join("Hello#1")).unwrap(),
            r#"{"author":"x","revision":1,"text":"world"}"#
        );
    }

    #[test]
    fn test_titles_with_reserved_characters() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let cancel = CancellationToken::new();

        for key in ["$:/StoryList", "a#1", "with space", "a+b", "ü"] {
            store.put(&cancel, &tiddler(key, "{}", key)).unwrap();
            assert_eq!(store.get(&cancel, key).unwrap().text, key);
        }

        let mut keys: Vec<String> = store.all(&cancel).unwrap().into_iter().map(|t| t.key).collect();
        keys.sort();
        assert_eq!(keys, vec!["$:/StoryList", "a#1", "a+b", "with space", "ü"]);
        assert_eq!(store.put(&cancel, &tiddler("a#1", "{}", "x")).unwrap(), 2);
    }

    #[test]
    fn test_encode_decode_key() {
        for key in ["plain", "$:/tags/Macro", "50% off & more", "a#b=c"] {
            let name = encode_key(key).unwrap();
            assert!(!name.contains('/'));
            assert!(!name.contains('#'));
            assert_eq!(decode_key(&name), key);
        }
    }

    #[test]
    fn test_delete_writes_tombstone_and_removes_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let cancel = CancellationToken::new();

        store.put(&cancel, &tiddler("A", "{}", "x")).unwrap();
        store.delete(&cancel, "A").unwrap();

        let tiddlers = temp_dir.path().join("tiddlers");
        assert!(!tiddlers.join("A.tid").exists());
        assert!(!tiddlers.join("A.meta").exists());

        let tombstone = temp_dir.path().join("tiddlerHistory").join("A#2");
        assert_eq!(fs::read(tombstone).unwrap().len(), 0);
        assert!(store.delete(&cancel, "A").unwrap_err().is_not_found());
    }

    #[test]
    fn test_recovery_replays_interrupted_put() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        {
            let store = FlatFileStore::open(temp_dir.path()).unwrap();
            store.put(&cancel, &tiddler("A", "{}", "old")).unwrap();
        }

        // Simulate a crash right after the history snapshot of revision 2.
        let history = temp_dir.path().join("tiddlerHistory");
        fs::write(history.join("A#2"), r#"{"revision":2,"text":"new"}"#).unwrap();
        fs::write(temp_dir.path().join("tiddlers").join("A.tid.tmp"), "partial").unwrap();

        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let got = store.get(&cancel, "A").unwrap();
        assert_eq!(got.text, "new");
        assert_eq!(got.revision(), Some(2));
        assert!(!temp_dir.path().join("tiddlers").join("A.tid.tmp").exists());
    }

    #[test]
    fn test_recovery_replays_interrupted_delete() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        {
            let store = FlatFileStore::open(temp_dir.path()).unwrap();
            store.put(&cancel, &tiddler("A", "{}", "x")).unwrap();
        }

        fs::write(temp_dir.path().join("tiddlerHistory").join("A#2"), "").unwrap();

        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        assert!(store.get(&cancel, "A").unwrap_err().is_not_found());
        assert!(store.all(&cancel).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_delete_keeps_tiddler() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let live = CancellationToken::new();
        store.put(&live, &tiddler("A", "{}", "x")).unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            store.delete(&cancelled, "A"),
            Err(StoreError::Cancelled)
        ));
        assert_eq!(store.get(&live, "A").unwrap().text, "x");
        assert_eq!(store.history(&live, "A").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_put_of_new_key_leaves_no_trace() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let blocker = temp_dir.path().join("tiddlers").join("B.tid");
        {
            let store = FlatFileStore::open(temp_dir.path()).unwrap();
            store.put(&cancel, &tiddler("A", "{}", "a")).unwrap();

            // A directory in place of the text file makes the live write fail.
            fs::create_dir_all(&blocker).unwrap();
            let err = store.put(&cancel, &tiddler("B", "{}", "failed-write")).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Io);

            assert!(store.history(&cancel, "B").unwrap().is_empty());
            assert!(store.get(&cancel, "B").unwrap_err().is_not_found());
            assert!(!temp_dir.path().join("tiddlerHistory").join("B#1").exists());
        }

        fs::remove_dir(&blocker).unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        assert!(store.get(&cancel, "B").unwrap_err().is_not_found());
        assert_eq!(store.put(&cancel, &tiddler("B", "{}", "second")).unwrap(), 1);
        assert_eq!(store.get(&cancel, "B").unwrap().text, "second");
    }

    #[test]
    fn test_failed_put_keeps_previous_revision() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let cancel = CancellationToken::new();
        store.put(&cancel, &tiddler("A", "{}", "one")).unwrap();

        // The staging path of the text file is taken, so no text can land.
        let blocker = temp_dir.path().join("tiddlers").join("A.tid.tmp");
        fs::create_dir_all(&blocker).unwrap();
        assert!(store.put(&cancel, &tiddler("A", "{}", "two")).is_err());

        let got = store.get(&cancel, "A").unwrap();
        assert_eq!(got.text, "one");
        assert_eq!(got.revision(), Some(1));
        assert_eq!(store.history(&cancel, "A").unwrap().len(), 1);

        fs::remove_dir(&blocker).unwrap();
        assert_eq!(store.put(&cancel, &tiddler("A", "{}", "two")).unwrap(), 2);
        assert_eq!(store.get(&cancel, "A").unwrap().text, "two");
    }

    #[test]
    fn test_failed_delete_drops_tombstone() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let cancel = CancellationToken::new();
        store.put(&cancel, &tiddler("A", "{}", "x")).unwrap();

        // A directory cannot be removed as a file.
        let meta_path = temp_dir.path().join("tiddlers").join("A.meta");
        fs::remove_file(&meta_path).unwrap();
        fs::create_dir(&meta_path).unwrap();

        assert!(store.delete(&cancel, "A").is_err());
        let revisions: Vec<u64> = store
            .history(&cancel, "A")
            .unwrap()
            .iter()
            .map(|entry| entry.revision)
            .collect();
        assert_eq!(revisions, vec![1]);
        assert!(!temp_dir.path().join("tiddlerHistory").join("A#2").exists());
    }

    #[test]
    fn test_overlong_key_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::open(temp_dir.path()).unwrap();
        let cancel = CancellationToken::new();

        let key = "日本語".repeat(10);
        let err = store.put(&cancel, &tiddler(&key, "{}", "x")).unwrap_err();
        assert!(matches!(err, StoreError::KeyTooLong { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(store.get(&cancel, &key).unwrap_err().is_not_found());
        assert!(store.all(&cancel).unwrap().is_empty());

        let fits = "日本語".repeat(8);
        assert_eq!(store.put(&cancel, &tiddler(&fits, "{}", "x")).unwrap(), 1);
    }
}
