//! Content checksum type using BLAKE3

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte BLAKE3 digest of stored content
///
/// Serialized as a 64-character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Checksum of an in-memory buffer
    pub fn digest(data: &[u8]) -> Self {
        Checksum(*blake3::hash(data).as_bytes())
    }

    /// Finish an incremental hash
    pub fn finalize(hasher: &blake3::Hasher) -> Self {
        Checksum(*hasher.finalize().as_bytes())
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; 32];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Checksum(arr))
    }

    /// Get a short prefix for display (first 7 chars, like git)
    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.short())
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.to_hex()
    }
}

impl TryFrom<String> for Checksum {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Checksum::from_hex(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[0, 1, 2]);
        hasher.update(&[3, 4, 5]);

        assert_eq!(
            Checksum::finalize(&hasher),
            Checksum::digest(&[0, 1, 2, 3, 4, 5])
        );
    }

    #[test]
    fn test_checksum_hex() {
        let checksum = Checksum::digest(b"test data");
        let hex = checksum.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Checksum::from_hex(&hex).unwrap(), checksum);
        assert!(Checksum::from_hex("abcd").is_err());
    }

    #[test]
    fn test_checksum_serializes_as_hex() {
        let checksum = Checksum::digest(b"payload");
        let json = serde_json::to_string(&checksum).unwrap();
        assert_eq!(json, format!("\"{}\"", checksum.to_hex()));
    }
}
