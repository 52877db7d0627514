//! # pkgstore
//!
//! A package store: binary uploads tagged with an owning user and a version,
//! stored with their checksum, size and file name, and retrievable as
//! metadata or as a byte stream.
//!
//! ## Core Concepts
//!
//! - **Packages**: Uploaded content, identified by an opaque [`ObjectId`]
//! - **Unique key**: At most one package per (user, version) pair
//! - **Streaming**: Content is hashed and stored chunk by chunk, never
//!   buffered whole
//! - **Summaries**: Listings carry only metadata, never content
//!
//! ## Example
//!
//! ```ignore
//! use pkgstore::{PackageManager, PackageStore};
//!
//! let manager = PackageManager::new(PackageStore::open_dir(".pkgstore")?);
//! let file = std::fs::File::open("firmware.bin")?;
//! let info = manager.save("firmware.bin", None, file, "alice", "1.0.0")?;
//! let versions = manager.list_all("alice")?;
//! ```

pub mod config;
pub mod model;
pub mod store;

mod error;
mod manager;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use manager::PackageManager;
pub use model::{
    Checksum, ObjectId, PackageContent, PackageInfo, PackageKey, PackageMetadata, PendingPackage,
    StoredPackage,
};
pub use store::{MemoryStore, PackageIndex, PackageStore, StoreStats};

/// Index file format version
pub const INDEX_VERSION: u32 = 1;

/// Magic bytes at the start of the index file
pub const INDEX_MAGIC: &[u8; 8] = b"PKGINDEX";
