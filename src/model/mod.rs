//! Core data model types for pkgstore

mod checksum;
mod object_id;
mod package;

pub use checksum::Checksum;
pub use object_id::{ObjectId, ParseObjectIdError};
pub use package::{
    PackageContent, PackageInfo, PackageKey, PackageMetadata, PendingPackage, StoredPackage,
};
