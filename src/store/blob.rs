//! Blob files - streamed content on disk
//!
//! Uploads are copied chunk by chunk into `tmp/`, hashed and counted on the
//! way through, and only renamed into `objects/` when the index commits them.
//! A staged blob that is dropped without being persisted deletes its temp
//! file, so aborted uploads never leave content behind.

use crate::model::{Checksum, ObjectId, PackageContent};
use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// Directory-backed blob storage
pub(crate) struct BlobStore {
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    buffer_size: usize,
    compression_level: Option<i32>,
    sync_writes: bool,
}

/// Content that has been fully written to a temp file but not yet committed
pub(crate) struct StagedBlob {
    temp: TempFile,
    pub checksum: Checksum,
    pub size: u64,
    pub compressed: bool,
}

/// Removes its file on drop unless persisted
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn persist(mut self, dest: &Path) -> io::Result<()> {
        fs::rename(&self.path, dest)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove temp upload");
                }
            }
        }
    }
}

enum Sink {
    Plain(File),
    Zstd(zstd::stream::write::Encoder<'static, File>),
}

impl Sink {
    fn as_writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(file) => file,
            Sink::Zstd(encoder) => encoder,
        }
    }

    fn finish(self) -> io::Result<File> {
        match self {
            Sink::Plain(mut file) => {
                file.flush()?;
                Ok(file)
            }
            Sink::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl BlobStore {
    /// Open the blob directories under `root`, creating them if needed
    pub fn open(
        root: &Path,
        buffer_size: usize,
        compression_level: Option<i32>,
        sync_writes: bool,
    ) -> Result<Self> {
        let objects_dir = root.join(OBJECTS_DIR);
        let tmp_dir = root.join(TMP_DIR);
        fs::create_dir_all(&objects_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(BlobStore {
            objects_dir,
            tmp_dir,
            buffer_size,
            compression_level,
            sync_writes,
        })
    }

    /// Remove leftover temp files from uploads that never committed
    ///
    /// Only safe while no other process has the store open; the caller
    /// proves that by holding the store lock exclusively.
    pub fn sweep_tmp(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.tmp_dir)? {
            let path = entry?.path();
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to sweep temp upload"),
            }
        }
        Ok(removed)
    }

    /// Stream `source` into a temp file, computing checksum and length
    ///
    /// Any failure reading the source or creating, writing or syncing the
    /// temp file is reported as [`Error::Stream`]; the temp file is removed
    /// before returning.
    pub fn stage(&self, source: &mut dyn Read) -> Result<StagedBlob> {
        let path = self.tmp_dir.join(format!("{}.part", ObjectId::generate()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(Error::Stream)?;
        let temp = TempFile {
            path,
            persisted: false,
        };

        let mut sink = match self.compression_level {
            Some(level) => Sink::Zstd(
                zstd::stream::write::Encoder::new(file, level).map_err(Error::Stream)?,
            ),
            None => Sink::Plain(file),
        };

        let (checksum, size) =
            copy_hashed(source, sink.as_writer(), self.buffer_size).map_err(Error::Stream)?;

        let file = sink.finish().map_err(Error::Stream)?;
        if self.sync_writes {
            file.sync_all().map_err(Error::Stream)?;
        }

        debug!(size, checksum = %checksum.short(), "staged upload");
        Ok(StagedBlob {
            temp,
            checksum,
            size,
            compressed: self.compression_level.is_some(),
        })
    }

    /// Move a staged blob to its permanent location
    pub fn commit(&self, staged: StagedBlob, id: &ObjectId) -> Result<()> {
        let dest = self.object_path(id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        staged.temp.persist(&dest)?;
        Ok(())
    }

    /// Open a fresh read stream over a committed object
    pub fn open_content(&self, id: &ObjectId, compressed: bool) -> Result<PackageContent> {
        let path = self.object_path(id);
        let file = File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::Corruption(format!("Indexed object {} has no content file", id))
            }
            _ => Error::Io(e),
        })?;

        if compressed {
            let decoder = zstd::stream::read::Decoder::with_buffer(BufReader::with_capacity(
                self.buffer_size,
                file,
            ))?;
            Ok(PackageContent::new(decoder))
        } else {
            Ok(PackageContent::new(BufReader::with_capacity(
                self.buffer_size,
                file,
            )))
        }
    }

    /// Best-effort removal of a committed object whose index entry failed
    pub fn discard(&self, id: &ObjectId) {
        let path = self.object_path(id);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to discard orphaned object");
        }
    }

    /// `objects/ab/cdef...`, sharded on the first byte
    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

/// Copy everything from `source` to `sink`, hashing the bytes in transit
fn copy_hashed(
    source: &mut dyn Read,
    sink: &mut dyn Write,
    buffer_size: usize,
) -> io::Result<(Checksum, u64)> {
    let mut hasher = blake3::Hasher::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        sink.write_all(&buf[..n])?;
        size += n as u64;
    }

    Ok((Checksum::finalize(&hasher), size))
}
