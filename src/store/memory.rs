//! In-memory package index for testing
//!
//! Holds content as [`Bytes`], so it buffers whole uploads. Use
//! [`PackageStore`](super::PackageStore) for anything real.

use super::index::{Index, ObjectMeta};
use super::PackageIndex;
use crate::model::{
    Checksum, ObjectId, PackageContent, PackageInfo, PackageKey, PendingPackage, StoredPackage,
};
use crate::{Error, Result};
use bytes::{Buf, Bytes};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct MemoryState {
    index: Index,
    blobs: HashMap<ObjectId, Bytes>,
}

/// A [`PackageIndex`] that keeps everything in memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    /// When set, key lookups miss even if the key exists
    stale_key_reads: AtomicBool,
    writes_attempted: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make key lookups report nothing, as a lagging replica would
    ///
    /// Lets a caller's existence check pass so the commit-time constraint
    /// is what rejects the duplicate.
    pub fn set_stale_key_reads(&self, stale: bool) {
        self.stale_key_reads.store(stale, Ordering::SeqCst);
    }

    /// Number of calls to [`PackageIndex::write`], committed or not
    pub fn writes_attempted(&self) -> usize {
        self.writes_attempted.load(Ordering::SeqCst)
    }

    /// Number of committed packages
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stored(state: &MemoryState, meta: &ObjectMeta) -> Result<StoredPackage> {
        let data = state.blobs.get(&meta.id).cloned().ok_or_else(|| {
            Error::Corruption(format!("Indexed object {} has no content", meta.id))
        })?;
        Ok(StoredPackage {
            info: meta.to_info(),
            content_type: meta.content_type.clone(),
            content: PackageContent::new(data.reader()),
        })
    }
}

impl PackageIndex for MemoryStore {
    fn write(
        &self,
        pending: PendingPackage<&mut dyn Read>,
        content_type: Option<&str>,
    ) -> Result<PackageInfo> {
        self.writes_attempted.fetch_add(1, Ordering::SeqCst);
        let PendingPackage {
            file_name,
            key,
            content,
        } = pending;

        let mut data = Vec::new();
        content.read_to_end(&mut data).map_err(Error::Stream)?;

        let mut state = self.state.write();
        if state.index.contains_key(&key) {
            return Err(Error::VersionConflict {
                user_id: key.user_id,
                version_id: key.version_id,
            });
        }

        let meta = ObjectMeta {
            id: ObjectId::generate(),
            file_name,
            content_type: content_type.map(str::to_string),
            checksum: Checksum::digest(&data),
            size: data.len() as u64,
            key,
            compressed: false,
            created_at: 0,
        };
        let info = meta.to_info();

        state.blobs.insert(meta.id, Bytes::from(data));
        if let Err(meta) = state.index.insert(meta) {
            state.blobs.remove(&meta.id);
            return Err(Error::Corruption(format!("Object id {} reused", meta.id)));
        }
        Ok(info)
    }

    fn find_by_unique_key(&self, key: &PackageKey) -> Result<Option<StoredPackage>> {
        if self.stale_key_reads.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let state = self.state.read();
        state
            .index
            .get_by_key(key)
            .map(|meta| Self::stored(&state, meta))
            .transpose()
    }

    fn find_by_id(&self, id: &ObjectId) -> Result<Option<StoredPackage>> {
        let state = self.state.read();
        state
            .index
            .get(id)
            .map(|meta| Self::stored(&state, meta))
            .transpose()
    }

    fn list_by_user(&self, user_id: &str) -> Result<Vec<PackageInfo>> {
        let state = self.state.read();
        Ok(state
            .index
            .user_entries(user_id)
            .map(ObjectMeta::to_info)
            .collect())
    }
}
