//! Package manager - validation and orchestration over a [`PackageIndex`]

use crate::model::{
    ObjectId, PackageInfo, PackageKey, PackageMetadata, PendingPackage, StoredPackage,
};
use crate::store::PackageIndex;
use crate::{Error, Result};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for saving, finding and listing packages
///
/// Holds no state of its own; uniqueness is ultimately enforced by the
/// index at commit time. The existence check in [`save`](Self::save) only
/// avoids streaming an upload that is bound to be rejected.
#[derive(Clone)]
pub struct PackageManager {
    index: Arc<dyn PackageIndex>,
}

impl PackageManager {
    pub fn new(index: impl PackageIndex + 'static) -> Self {
        PackageManager {
            index: Arc::new(index),
        }
    }

    pub fn with_index(index: Arc<dyn PackageIndex>) -> Self {
        PackageManager { index }
    }

    /// Store a new package version for a user
    ///
    /// Fails with [`Error::InvalidVersion`] if `version_id` is blank, and with
    /// [`Error::VersionConflict`] if the user already has that version. The
    /// content stream is consumed or dropped on every path.
    pub fn save(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        mut content: impl Read,
        user_id: &str,
        version_id: &str,
    ) -> Result<PackageInfo> {
        validate_version(version_id)?;

        let key = PackageKey::new(user_id, version_id);
        if self.index.contains_key(&key)? {
            warn!(%key, "version already exists");
            return Err(Error::VersionConflict {
                user_id: key.user_id,
                version_id: key.version_id,
            });
        }

        let pending = PendingPackage::new(file_name, key, &mut content as &mut dyn Read);
        self.index.write(pending, content_type)
    }

    /// Find a package by its object id, with its content stream
    ///
    /// A malformed id is reported as absent.
    pub fn find_by_id(&self, id: &str) -> Result<Option<StoredPackage>> {
        match parse_id(id) {
            Some(id) => self.index.find_by_id(&id),
            None => Ok(None),
        }
    }

    /// Find a package's metadata by its object id, without opening content
    pub fn find_metadata_by_id(&self, id: &str) -> Result<Option<PackageMetadata>> {
        match parse_id(id) {
            Some(id) => self.index.find_metadata_by_id(&id),
            None => Ok(None),
        }
    }

    /// All of a user's packages, ordered by version
    pub fn list_all(&self, user_id: &str) -> Result<Vec<PackageInfo>> {
        self.index.list_by_user(user_id)
    }
}

/// An id that does not parse cannot name a package
fn parse_id(id: &str) -> Option<ObjectId> {
    match id.parse::<ObjectId>() {
        Ok(id) => Some(id),
        Err(e) => {
            debug!(error = %e, "malformed package id");
            None
        }
    }
}

fn validate_version(version_id: &str) -> Result<()> {
    if version_id.trim().is_empty() {
        return Err(Error::InvalidVersion("Version id cannot be empty".into()));
    }
    Ok(())
}
