//! Package index trait definition

use crate::model::{
    ObjectId, PackageInfo, PackageKey, PackageMetadata, PendingPackage, StoredPackage,
};
use crate::Result;
use std::io::Read;

/// Logical view over stored packages, keyed by object id and by the
/// unique (user, version) pair
///
/// Implementations must enforce key uniqueness atomically in [`write`]:
/// when two writes race for the same key, exactly one commits and the
/// other fails with [`Error::VersionConflict`](crate::Error::VersionConflict).
///
/// [`write`]: PackageIndex::write
pub trait PackageIndex: Send + Sync {
    /// Stream a pending package into storage and commit it
    ///
    /// Checksum and size are computed from the bytes as they pass through.
    /// Nothing becomes visible unless the whole stream was stored.
    fn write(
        &self,
        pending: PendingPackage<&mut dyn Read>,
        content_type: Option<&str>,
    ) -> Result<PackageInfo>;

    /// Look up by (user, version), with a fresh content stream
    fn find_by_unique_key(&self, key: &PackageKey) -> Result<Option<StoredPackage>>;

    /// Look up by object id, with a fresh content stream
    fn find_by_id(&self, id: &ObjectId) -> Result<Option<StoredPackage>>;

    /// Look up by object id without touching the content
    ///
    /// Default implementation opens the content through [`find_by_id`] and
    /// drops it; stores that keep metadata apart should override this.
    ///
    /// [`find_by_id`]: PackageIndex::find_by_id
    fn find_metadata_by_id(&self, id: &ObjectId) -> Result<Option<PackageMetadata>> {
        Ok(self.find_by_id(id)?.map(StoredPackage::into_metadata))
    }

    /// Summaries of a user's packages, ascending by version; reads no content
    fn list_by_user(&self, user_id: &str) -> Result<Vec<PackageInfo>>;

    /// Whether a package exists under `key`
    ///
    /// Default implementation goes through [`find_by_unique_key`] and drops
    /// the stream it opened.
    ///
    /// [`find_by_unique_key`]: PackageIndex::find_by_unique_key
    fn contains_key(&self, key: &PackageKey) -> Result<bool> {
        Ok(self.find_by_unique_key(key)?.is_some())
    }
}
