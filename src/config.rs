//! Store configuration
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! defaults below.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default chunk size for streaming copies (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for opening a [`PackageStore`](crate::PackageStore)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding objects, temp uploads and the index
    pub root: PathBuf,
    /// zstd level for stored objects; `None` stores content uncompressed
    pub compression_level: Option<i32>,
    /// Chunk size used when streaming content in and out
    pub buffer_size: usize,
    /// fsync objects and index entries before a save returns
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            root: Self::default_root(),
            compression_level: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `root` with all other fields defaulted
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            ..Default::default()
        }
    }

    /// `<data dir>/pkgstore`, or `.pkgstore` when no data dir is known
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("pkgstore"))
            .unwrap_or_else(|| PathBuf::from(".pkgstore"))
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: StoreConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_compression(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be greater than zero".into()));
        }
        if let Some(level) = self.compression_level {
            if !(1..=22).contains(&level) {
                return Err(Error::Config(format!(
                    "compression_level must be between 1 and 22, got {}",
                    level
                )));
            }
        }
        Ok(())
    }
}
