//! Package storage
//!
//! Content is streamed into blob files and checksummed on the way in;
//! metadata lives in an append-only index with a unique (user, version) key.

mod blob;
mod file_store;
mod index;
mod memory;
mod traits;

pub use file_store::{PackageStore, StoreStats};
pub use memory::MemoryStore;
pub use traits::PackageIndex;
