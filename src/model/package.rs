//! Package records: pending uploads, summaries, and records with content

use super::{Checksum, ObjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};

/// The unique key of a package: one version per user
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageKey {
    pub user_id: String,
    pub version_id: String,
}

impl PackageKey {
    pub fn new(user_id: impl Into<String>, version_id: impl Into<String>) -> Self {
        PackageKey {
            user_id: user_id.into(),
            version_id: version_id.into(),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.version_id)
    }
}

/// An upload that has not been written yet
///
/// Owns the source stream; it has no id and no size until the store
/// commits it and returns a [`PackageInfo`].
pub struct PendingPackage<R> {
    pub file_name: String,
    pub key: PackageKey,
    pub content: R,
}

impl<R: Read> PendingPackage<R> {
    pub fn new(file_name: impl Into<String>, key: PackageKey, content: R) -> Self {
        PendingPackage {
            file_name: file_name.into(),
            key,
            content,
        }
    }
}

impl<R> fmt::Debug for PendingPackage<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPackage")
            .field("file_name", &self.file_name)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Summary record of a persisted package
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub id: ObjectId,
    pub file_name: String,
    pub checksum: Checksum,
    /// Length of the stored content in bytes
    pub size: u64,
    pub user_id: String,
    pub version_id: String,
}

impl PackageInfo {
    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.user_id, &self.version_id)
    }
}

/// Summary record plus the content type declared at upload time
///
/// What a metadata-only lookup returns; serializes as the summary fields
/// with an optional `contentType` alongside.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    #[serde(flatten)]
    pub info: PackageInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Single-consumer byte stream over stored content
///
/// Each lookup opens a fresh stream; once read it cannot be rewound.
pub struct PackageContent {
    inner: Box<dyn Read + Send>,
}

impl PackageContent {
    pub fn new(inner: impl Read + Send + 'static) -> Self {
        PackageContent {
            inner: Box::new(inner),
        }
    }
}

impl Read for PackageContent {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl fmt::Debug for PackageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PackageContent(..)")
    }
}

/// A persisted package together with a readable stream of its content
#[derive(Debug)]
pub struct StoredPackage {
    pub info: PackageInfo,
    /// Content type declared at upload time
    pub content_type: Option<String>,
    pub content: PackageContent,
}

impl StoredPackage {
    /// Drop the stream, keeping only the metadata
    pub fn into_metadata(self) -> PackageMetadata {
        PackageMetadata {
            info: self.info,
            content_type: self.content_type,
        }
    }

    pub fn into_parts(self) -> (PackageInfo, PackageContent) {
        (self.info, self.content)
    }
}
