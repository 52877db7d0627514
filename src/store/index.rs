//! Package metadata index
//!
//! The on-disk half is an append-only log of [`ObjectMeta`] entries:
//!
//! ```text
//! [HEADER: 16 bytes]
//!   - magic: 8 bytes ("PKGINDEX")
//!   - version: 4 bytes (u32 LE)
//!   - reserved: 4 bytes
//!
//! [ENTRIES: variable]
//!   - len: 4 bytes (u32 LE)
//!   - bincode-encoded ObjectMeta: len bytes
//! ```
//!
//! The in-memory half keeps a primary map by object id and a unique,
//! ordered secondary map by (user, version).

use crate::model::{Checksum, ObjectId, PackageInfo, PackageKey, PackageMetadata};
use crate::{Error, Result, INDEX_MAGIC, INDEX_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

const HEADER_SIZE: u64 = 16;

/// Entries larger than this are treated as garbage rather than allocated
const MAX_ENTRY_SIZE: u32 = 1 << 20;

/// Everything the store records about a committed object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ObjectMeta {
    pub id: ObjectId,
    pub file_name: String,
    pub content_type: Option<String>,
    pub checksum: Checksum,
    pub size: u64,
    pub key: PackageKey,
    pub compressed: bool,
    /// Commit timestamp (unix millis)
    pub created_at: u64,
}

impl ObjectMeta {
    /// Summary projection, without content
    pub fn to_info(&self) -> PackageInfo {
        PackageInfo {
            id: self.id,
            file_name: self.file_name.clone(),
            checksum: self.checksum,
            size: self.size,
            user_id: self.key.user_id.clone(),
            version_id: self.key.version_id.clone(),
        }
    }

    pub fn to_metadata(&self) -> PackageMetadata {
        PackageMetadata {
            info: self.to_info(),
            content_type: self.content_type.clone(),
        }
    }
}

/// In-memory lookup tables
#[derive(Default)]
pub(crate) struct Index {
    by_id: HashMap<ObjectId, ObjectMeta>,
    by_key: BTreeMap<PackageKey, ObjectId>,
}

impl Index {
    /// Insert an entry, refusing it if the id or key is already taken
    pub fn insert(&mut self, meta: ObjectMeta) -> std::result::Result<(), ObjectMeta> {
        if self.by_key.contains_key(&meta.key) || self.by_id.contains_key(&meta.id) {
            return Err(meta);
        }
        self.by_key.insert(meta.key.clone(), meta.id);
        self.by_id.insert(meta.id, meta);
        Ok(())
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ObjectMeta> {
        self.by_id.get(id)
    }

    pub fn get_by_key(&self, key: &PackageKey) -> Option<&ObjectMeta> {
        self.by_key.get(key).and_then(|id| self.by_id.get(id))
    }

    pub fn contains_key(&self, key: &PackageKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn contains_id(&self, id: &ObjectId) -> bool {
        self.by_id.contains_key(id)
    }

    /// All entries for a user, in ascending version order
    pub fn user_entries<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a ObjectMeta> {
        self.by_key
            .range(PackageKey::new(user_id, "")..)
            .take_while(move |(key, _)| key.user_id == user_id)
            .filter_map(move |(_, id)| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ObjectMeta> {
        self.by_id.values()
    }
}

/// Append-only index file
///
/// Several processes may share one log. Each keeps its own read position
/// and catches up with [`IndexLog::read_new`]; appends and tail recovery
/// must happen while the caller holds the store's commit lock.
pub(crate) struct IndexLog {
    file: File,
    /// Offset just past the last complete entry this handle has seen
    len: u64,
    sync_writes: bool,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
}

impl IndexLog {
    /// Open the log at `path`, creating it if missing
    ///
    /// Only the header is read; entries come from [`IndexLog::read_new`].
    pub fn open_or_create(path: &Path, sync_writes: bool) -> Result<Self> {
        if !path.exists() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?;

            let mut header = [0u8; HEADER_SIZE as usize];
            header[0..8].copy_from_slice(INDEX_MAGIC);
            header[8..12].copy_from_slice(&INDEX_VERSION.to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;

            return Ok(IndexLog::new(file, sync_writes));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        if read_full(&mut file, &mut header)? < header.len() {
            return Err(Error::InvalidFile("Index header is truncated".into()));
        }
        if &header[0..8] != INDEX_MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&header[8..12]);
        let version = u32::from_le_bytes(version);
        if version != INDEX_VERSION {
            return Err(Error::VersionMismatch {
                expected: INDEX_VERSION,
                found: version,
            });
        }

        Ok(IndexLog::new(file, sync_writes))
    }

    fn new(file: File, sync_writes: bool) -> Self {
        IndexLog {
            file,
            len: HEADER_SIZE,
            sync_writes,
            poisoned: false,
        }
    }

    /// Read the complete entries appended since the last call
    ///
    /// With `recover`, an incomplete entry at the tail is cut off. Without
    /// it the tail is left alone, since another process may still be
    /// writing it.
    pub fn read_new(&mut self, recover: bool) -> Result<Vec<ObjectMeta>> {
        let file_len = self.file.metadata()?.len();
        if file_len == self.len {
            return Ok(Vec::new());
        }
        if file_len < self.len {
            return Err(Error::Corruption(format!(
                "Index shrank to {} bytes below entry offset {}",
                file_len, self.len
            )));
        }

        self.file.seek(SeekFrom::Start(self.len))?;
        let (entries, end) = {
            let mut reader = BufReader::new(&mut self.file);
            replay(&mut reader, self.len)?
        };
        self.len = end;

        if recover && file_len > end {
            warn!(
                offset = end,
                dropped = file_len - end,
                "truncating incomplete index entry"
            );
            self.file.set_len(end)?;
            self.file.sync_all()?;
        }
        Ok(entries)
    }

    /// Durably append one entry at the end of the last complete one
    ///
    /// A failed write is rolled back. If the rollback fails too, the log is
    /// poisoned and refuses further appends until it is reopened.
    pub fn append(&mut self, meta: &ObjectMeta) -> Result<()> {
        if self.poisoned {
            return Err(Error::Corruption(
                "Index has an unrecoverable partial entry; reopen the store".into(),
            ));
        }

        let payload = bincode::serialize(meta)?;
        let mut record = Vec::with_capacity(4 + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);

        let written = self
            .file
            .seek(SeekFrom::Start(self.len))
            .and_then(|_| self.file.write_all(&record))
            .and_then(|_| {
                if self.sync_writes {
                    self.file.sync_data()
                } else {
                    Ok(())
                }
            });

        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(self.len) {
                self.poisoned = true;
                return Err(Error::Corruption(format!(
                    "Index append failed ({}) and the partial entry at offset {} \
                     could not be removed ({})",
                    e, self.len, rollback
                )));
            }
            return Err(e.into());
        }

        self.len += record.len() as u64;
        Ok(())
    }
}

/// Read entries starting at `offset`; returns them with the offset just
/// past the last complete one
fn replay(reader: &mut impl Read, mut offset: u64) -> Result<(Vec<ObjectMeta>, u64)> {
    let mut entries = Vec::new();

    loop {
        let mut len_buf = [0u8; 4];
        if read_full(reader, &mut len_buf)? < len_buf.len() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_ENTRY_SIZE {
            return Err(Error::Corruption(format!(
                "Index entry at offset {} claims {} bytes",
                offset, len
            )));
        }

        let mut payload = vec![0u8; len as usize];
        if read_full(reader, &mut payload)? < payload.len() {
            break;
        }
        let meta: ObjectMeta = bincode::deserialize(&payload).map_err(|e| {
            Error::Corruption(format!("Index entry at offset {}: {}", offset, e))
        })?;

        entries.push(meta);
        offset += 4 + len as u64;
    }

    Ok((entries, offset))
}

/// Fill `buf` as far as the reader allows; returns the number of bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
