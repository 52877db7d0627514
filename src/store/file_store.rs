//! Directory-backed package store
//!
//! Layout:
//! ```text
//! <root>/
//!   LOCK              shared-locked by every process with the store open
//!   index.lock        exclusively locked around each commit
//!   index             append-only metadata log (see `index.rs`)
//!   objects/ab/cd...  one file per committed package
//!   tmp/              uploads in flight
//! ```
//!
//! Uploads stream into `tmp/` without holding any lock, so any number of
//! processes can read and upload at once. Only the commit step (catch up
//! with the log, key check, rename, index append) runs under the commit
//! lock, which is what makes the (user, version) constraint atomic across
//! threads and processes. Both locks are OS advisory locks and die with
//! the process that holds them.

use crate::config::StoreConfig;
use crate::model::{
    ObjectId, PackageInfo, PackageKey, PackageMetadata, PendingPackage, StoredPackage,
};
use crate::store::blob::BlobStore;
use crate::store::index::{Index, IndexLog, ObjectMeta};
use crate::store::PackageIndex;
use crate::{Error, Result};
use fs4::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index";
const LOCK_FILE: &str = "LOCK";
const COMMIT_LOCK_FILE: &str = "index.lock";

/// Aggregate numbers about a store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub packages: usize,
    pub users: usize,
    /// Sum of package sizes (uncompressed)
    pub total_bytes: u64,
}

/// Open (or create) a lock file; the file's contents are never used
fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?)
}

/// Exclusive hold on a lock file, released on drop
struct ExclusiveLock<'a> {
    file: &'a File,
}

impl<'a> ExclusiveLock<'a> {
    /// Block until the lock is ours
    fn acquire(file: &'a File) -> Result<Self> {
        FileExt::lock_exclusive(file)?;
        Ok(ExclusiveLock { file })
    }
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            warn!(error = %e, "failed to release commit lock");
        }
    }
}

/// Take `file` exclusively if nobody else holds it; `Ok(false)` otherwise
fn try_lock_exclusive(file: &File) -> Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Add entries read from the log to the in-memory index
fn publish(index: &mut Index, entries: Vec<ObjectMeta>) -> Result<()> {
    for meta in entries {
        if let Err(dup) = index.insert(meta) {
            return Err(Error::Corruption(format!(
                "Index holds two entries for {}",
                dup.key
            )));
        }
    }
    Ok(())
}

/// A package store backed by a directory on the local filesystem
pub struct PackageStore {
    root: PathBuf,
    blobs: BlobStore,
    /// Lock order: `log`, then the commit lock, then `index`
    log: Mutex<IndexLog>,
    index: RwLock<Index>,
    commit_lock: File,
    /// Shared lock on `LOCK` for as long as the store is open
    _presence: File,
}

impl PackageStore {
    /// Open the store described by `config`, creating it if needed
    ///
    /// Never fails because another process has the store open; at worst it
    /// waits for a commit in progress to finish.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = config.root.clone();
        fs::create_dir_all(&root)?;

        let blobs = BlobStore::open(
            &root,
            config.buffer_size,
            config.compression_level,
            config.sync_writes,
        )?;

        // Temp files can only be swept when no other process could be
        // writing them, i.e. when nobody else holds the presence lock
        let presence = open_lock_file(&root.join(LOCK_FILE))?;
        if try_lock_exclusive(&presence)? {
            let swept = blobs.sweep_tmp()?;
            if swept > 0 {
                warn!(count = swept, "removed abandoned uploads");
            }
            FileExt::unlock(&presence)?;
        } else {
            debug!(root = %root.display(), "store is shared with another process");
        }
        FileExt::lock_shared(&presence)?;

        let commit_lock = open_lock_file(&root.join(COMMIT_LOCK_FILE))?;
        let (log, index) = {
            let _commit = ExclusiveLock::acquire(&commit_lock)?;
            let mut log = IndexLog::open_or_create(&root.join(INDEX_FILE), config.sync_writes)?;
            let mut index = Index::default();
            publish(&mut index, log.read_new(true)?)?;
            (log, index)
        };

        info!(root = %root.display(), packages = index.len(), "opened package store");

        Ok(PackageStore {
            root,
            blobs,
            log: Mutex::new(log),
            index: RwLock::new(index),
            commit_lock,
            _presence: presence,
        })
    }

    /// Open a store at `root` with default settings
    pub fn open_dir(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(&StoreConfig::new(root))
    }

    /// Get the store directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.refresh()?;
        let index = self.index.read();
        let mut users = HashSet::new();
        let mut total_bytes = 0;
        for meta in index.entries() {
            users.insert(meta.key.user_id.as_str());
            total_bytes += meta.size;
        }
        Ok(StoreStats {
            packages: index.len(),
            users: users.len(),
            total_bytes,
        })
    }

    /// Pick up entries other processes committed since we last looked
    fn refresh(&self) -> Result<()> {
        let mut log = self.log.lock();
        let entries = log.read_new(false)?;
        if !entries.is_empty() {
            debug!(count = entries.len(), "caught up with index log");
            publish(&mut self.index.write(), entries)?;
        }
        Ok(())
    }

    fn with_content(&self, meta: ObjectMeta) -> Result<StoredPackage> {
        let content = self.blobs.open_content(&meta.id, meta.compressed)?;
        Ok(StoredPackage {
            info: meta.to_info(),
            content_type: meta.content_type,
            content,
        })
    }
}

impl PackageIndex for PackageStore {
    fn write(
        &self,
        pending: PendingPackage<&mut dyn Read>,
        content_type: Option<&str>,
    ) -> Result<PackageInfo> {
        let PendingPackage {
            file_name,
            key,
            content,
        } = pending;

        let staged = self.blobs.stage(content)?;

        let mut log = self.log.lock();
        let _commit = ExclusiveLock::acquire(&self.commit_lock)?;
        let committed_elsewhere = log.read_new(true)?;
        let mut index = self.index.write();
        publish(&mut index, committed_elsewhere)?;

        if index.contains_key(&key) {
            warn!(%key, "duplicate key rejected at commit");
            return Err(Error::VersionConflict {
                user_id: key.user_id,
                version_id: key.version_id,
            });
        }

        let mut id = ObjectId::generate();
        while index.contains_id(&id) {
            id = ObjectId::generate();
        }

        let meta = ObjectMeta {
            id,
            file_name,
            content_type: content_type.map(str::to_string),
            checksum: staged.checksum,
            size: staged.size,
            key,
            compressed: staged.compressed,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };

        self.blobs.commit(staged, &id)?;
        if let Err(e) = log.append(&meta) {
            self.blobs.discard(&id);
            return Err(e);
        }

        let info = meta.to_info();
        if index.insert(meta).is_err() {
            return Err(Error::Corruption(format!(
                "Index rejected {} after commit",
                info.key()
            )));
        }

        info!(id = %info.id, key = %info.key(), size = info.size, "stored package");
        Ok(info)
    }

    fn find_by_unique_key(&self, key: &PackageKey) -> Result<Option<StoredPackage>> {
        self.refresh()?;
        let meta = self.index.read().get_by_key(key).cloned();
        debug!(%key, found = meta.is_some(), "lookup by key");
        meta.map(|meta| self.with_content(meta)).transpose()
    }

    fn find_by_id(&self, id: &ObjectId) -> Result<Option<StoredPackage>> {
        self.refresh()?;
        let meta = self.index.read().get(id).cloned();
        debug!(%id, found = meta.is_some(), "lookup by id");
        meta.map(|meta| self.with_content(meta)).transpose()
    }

    fn find_metadata_by_id(&self, id: &ObjectId) -> Result<Option<PackageMetadata>> {
        self.refresh()?;
        let index = self.index.read();
        Ok(index.get(id).map(ObjectMeta::to_metadata))
    }

    fn list_by_user(&self, user_id: &str) -> Result<Vec<PackageInfo>> {
        self.refresh()?;
        let index = self.index.read();
        Ok(index.user_entries(user_id).map(ObjectMeta::to_info).collect())
    }

    fn contains_key(&self, key: &PackageKey) -> Result<bool> {
        self.refresh()?;
        Ok(self.index.read().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Checksum;
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    fn put(store: &PackageStore, user: &str, version: &str, data: &[u8]) -> Result<PackageInfo> {
        let mut source = data;
        let pending = PendingPackage::new(
            format!("{}.bin", version),
            PackageKey::new(user, version),
            &mut source as &mut dyn Read,
        );
        store.write(pending, Some("application/octet-stream"))
    }

    fn read_all(stored: StoredPackage) -> Vec<u8> {
        let (_, mut content) = stored.into_parts();
        let mut data = Vec::new();
        content.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn test_write_and_find() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open_dir(dir.path()).unwrap();

        let bytes = [0u8, 1, 2, 3, 4, 5];
        let info = put(&store, "alice", "1.0", &bytes).unwrap();
        assert_eq!(info.size, 6);
        assert_eq!(info.checksum, Checksum::digest(&bytes));
        assert_eq!(info.file_name, "1.0.bin");

        let by_id = store.find_by_id(&info.id).unwrap().unwrap();
        assert_eq!(by_id.info, info);
        assert_eq!(by_id.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(read_all(by_id), bytes);

        let by_key = store
            .find_by_unique_key(&PackageKey::new("alice", "1.0"))
            .unwrap()
            .unwrap();
        assert_eq!(by_key.info.id, info.id);
        assert_eq!(read_all(by_key), bytes);

        assert!(store.find_by_id(&ObjectId::generate()).unwrap().is_none());
        assert!(store
            .find_by_unique_key(&PackageKey::new("alice", "2.0"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_each_lookup_gets_a_fresh_stream() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open_dir(dir.path()).unwrap();
        let info = put(&store, "alice", "1.0", b"twice").unwrap();

        let first = store.find_by_id(&info.id).unwrap().unwrap();
        let second = store.find_by_id(&info.id).unwrap().unwrap();
        assert_eq!(read_all(first), b"twice");
        assert_eq!(read_all(second), b"twice");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open_dir(dir.path()).unwrap();

        put(&store, "alice", "1.0", b"first").unwrap();
        let result = put(&store, "alice", "1.0", b"second");
        assert!(matches!(result, Err(Error::VersionConflict { .. })));

        assert_eq!(store.stats().unwrap().packages, 1);
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
        put(&store, "bob", "1.0", b"other user").unwrap();
    }

    #[test]
    fn test_concurrent_writes_same_key() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PackageStore::open_dir(dir.path()).unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let data = vec![i as u8; 4096];
                    barrier.wait();
                    put(&store, "alice", "1.0", &data)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let committed = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::VersionConflict { .. })))
            .count();

        assert_eq!(committed, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(store.list_by_user("alice").unwrap().len(), 1);
    }

    #[test]
    fn test_list_sorted_by_version() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open_dir(dir.path()).unwrap();

        for version in ["C", "A", "B"] {
            put(&store, "alice", version, version.as_bytes()).unwrap();
        }
        put(&store, "bob", "A", b"bob").unwrap();

        let versions: Vec<_> = store
            .list_by_user("alice")
            .unwrap()
            .into_iter()
            .map(|info| info.version_id)
            .collect();
        assert_eq!(versions, ["A", "B", "C"]);
        assert!(store.list_by_user("carol").unwrap().is_empty());
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let info;
        {
            let store = PackageStore::open_dir(dir.path()).unwrap();
            info = put(&store, "alice", "1.0", b"persistent").unwrap();
        }

        let store = PackageStore::open_dir(dir.path()).unwrap();
        let stored = store.find_by_id(&info.id).unwrap().unwrap();
        assert_eq!(stored.info, info);
        assert_eq!(read_all(stored), b"persistent");

        let result = put(&store, "alice", "1.0", b"again");
        assert!(matches!(result, Err(Error::VersionConflict { .. })));
    }

    #[test]
    fn test_compressed_store() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path()).with_compression(3);
        let data = b"abcabcabc".repeat(1000);
        let info;
        {
            let store = PackageStore::open(&config).unwrap();
            info = put(&store, "alice", "1.0", &data).unwrap();
            assert_eq!(info.size, data.len() as u64);
        }

        // Reopening uncompressed still reads the compressed object
        let store = PackageStore::open_dir(dir.path()).unwrap();
        let stored = store.find_by_id(&info.id).unwrap().unwrap();
        assert_eq!(read_all(stored), data);
    }

    #[test]
    fn test_two_handles_share_the_store() {
        let dir = tempdir().unwrap();
        let first = PackageStore::open_dir(dir.path()).unwrap();
        let second = PackageStore::open_dir(dir.path()).unwrap();

        let info = put(&first, "alice", "1.0", b"from first").unwrap();
        let seen = second.find_by_id(&info.id).unwrap().unwrap();
        assert_eq!(read_all(seen), b"from first");
        assert_eq!(second.list_by_user("alice").unwrap(), vec![info]);

        // The second handle must see the first's commit before its own
        let result = put(&second, "alice", "1.0", b"from second");
        assert!(matches!(result, Err(Error::VersionConflict { .. })));
        put(&second, "alice", "2.0", b"from second").unwrap();

        let versions: Vec<_> = first
            .list_by_user("alice")
            .unwrap()
            .into_iter()
            .map(|info| info.version_id)
            .collect();
        assert_eq!(versions, ["1.0", "2.0"]);
    }

    #[test]
    fn test_concurrent_writes_across_handles() {
        let dir = tempdir().unwrap();
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = PackageStore::open_dir(dir.path()).unwrap();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    put(&store, "alice", "1.0", &[i as u8; 1024])
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let store = PackageStore::open_dir(dir.path()).unwrap();
        assert_eq!(store.list_by_user("alice").unwrap().len(), 1);
    }

    #[test]
    fn test_leftover_lock_file_does_not_block() {
        let dir = tempdir().unwrap();
        drop(PackageStore::open_dir(dir.path()).unwrap());

        // What a killed process leaves behind
        fs::write(dir.path().join(LOCK_FILE), b"999999\n").unwrap();
        fs::write(dir.path().join(COMMIT_LOCK_FILE), b"999999\n").unwrap();

        let store = PackageStore::open_dir(dir.path()).unwrap();
        put(&store, "alice", "1.0", b"still writable").unwrap();
    }

    #[test]
    fn test_sweep_spares_uploads_of_open_stores() {
        let dir = tempdir().unwrap();
        let in_flight = dir.path().join("tmp").join("in-flight.part");

        let first = PackageStore::open_dir(dir.path()).unwrap();
        fs::write(&in_flight, b"still streaming").unwrap();

        let second = PackageStore::open_dir(dir.path()).unwrap();
        assert!(in_flight.exists(), "open store's upload was swept");

        drop(first);
        drop(second);
        drop(PackageStore::open_dir(dir.path()).unwrap());
        assert!(!in_flight.exists(), "abandoned upload was kept");
    }

    #[test]
    fn test_metadata_lookup_skips_content() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open_dir(dir.path()).unwrap();
        let info = put(&store, "alice", "1.0", b"content").unwrap();

        let hex = info.id.to_hex();
        fs::remove_file(dir.path().join("objects").join(&hex[..2]).join(&hex[2..])).unwrap();

        let metadata = store.find_metadata_by_id(&info.id).unwrap().unwrap();
        assert_eq!(metadata.info, info);
        assert_eq!(metadata.content_type.as_deref(), Some("application/octet-stream"));
        assert!(matches!(store.find_by_id(&info.id), Err(Error::Corruption(_))));
        assert!(store.find_metadata_by_id(&ObjectId::generate()).unwrap().is_none());
    }

    #[test]
    fn test_storage_failure_is_stream_error() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open_dir(dir.path()).unwrap();

        // Swap tmp/ for a plain file so the upload cannot be written
        fs::remove_dir(dir.path().join("tmp")).unwrap();
        fs::write(dir.path().join("tmp"), b"").unwrap();

        let err = put(&store, "alice", "1.0", b"never lands").unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
        assert!(err.is_client_error());
        assert!(store
            .find_by_unique_key(&PackageKey::new("alice", "1.0"))
            .unwrap()
            .is_none());
        assert_eq!(store.stats().unwrap().packages, 0);
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open_dir(dir.path()).unwrap();
        assert_eq!(store.stats().unwrap(), StoreStats::default());

        put(&store, "alice", "1.0", b"1234").unwrap();
        put(&store, "alice", "2.0", b"12").unwrap();
        put(&store, "bob", "1.0", b"1").unwrap();

        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                packages: 3,
                users: 2,
                total_bytes: 7,
            }
        );
    }
}
