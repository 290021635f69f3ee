//! # Persistence Format
//!
//! Binary serialization for bloom filter sets.
//!
//! Format: Header (5 bytes) + postcard-serialized [`PersistedFilter`].
//! - 4 bytes: Magic ("RVBF")
//! - 1 byte: Version
//!
//! This is a pure transformation; file I/O lives in the persistent index.
//!
//! ## Limits
//!
//! The payload size is checked and the header validated before postcard sees
//! a single payload byte, and a decoded index is structurally validated
//! before it is handed out.

use crate::bloom::BloomIndex;
use crate::{VaultError, primitives};
use serde::{Deserialize, Serialize};

/// Maximum accepted blob size (256 MB).
pub const MAX_PERSISTENCE_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

/// The header preceding every serialized filter set.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl PersistenceHeader {
    /// Create a header with the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(VaultError::SerializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(VaultError::SerializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() < HEADER_LEN {
            return Err(VaultError::SerializationError(
                "Header too short".to_string(),
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

impl Default for PersistenceHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// A filter set together with the key it was built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFilter {
    pub tenant: String,
    pub dataset: String,
    pub index: BloomIndex,
}

/// Serialize a filter set (header + payload).
pub fn filter_to_bytes(filter: &PersistedFilter) -> Result<Vec<u8>, VaultError> {
    let payload = postcard::to_stdvec(filter)
        .map_err(|e| VaultError::SerializationError(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&PersistenceHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Deserialize and validate a filter set.
pub fn filter_from_bytes(bytes: &[u8]) -> Result<PersistedFilter, VaultError> {
    if bytes.len() < HEADER_LEN {
        return Err(VaultError::SerializationError(format!(
            "Data too short: minimum {} bytes required",
            HEADER_LEN
        )));
    }
    if bytes.len() > MAX_PERSISTENCE_PAYLOAD_SIZE {
        return Err(VaultError::SerializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_PERSISTENCE_PAYLOAD_SIZE
        )));
    }

    PersistenceHeader::from_bytes(bytes)?.validate()?;

    let filter: PersistedFilter = postcard::from_bytes(&bytes[HEADER_LEN..]).map_err(|e| {
        VaultError::SerializationError(format!("Failed to deserialize filter data: {}", e))
    })?;
    filter.index.validate()?;
    Ok(filter)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Row;

    fn sample() -> PersistedFilter {
        let rows: Vec<Row> = (0..30)
            .map(|i| Row::new().with("name", format!("edge-{i}")))
            .collect();
        PersistedFilter {
            tenant: "acme".to_string(),
            dataset: "devices".to_string(),
            index: BloomIndex::build(&rows, 10, 0.01, 7).expect("build"),
        }
    }

    #[test]
    fn blob_starts_with_header() {
        let bytes = filter_to_bytes(&sample()).expect("encode");
        assert_eq!(&bytes[0..4], primitives::MAGIC_BYTES);
        assert_eq!(bytes[4], primitives::FORMAT_VERSION);
    }

    #[test]
    fn decoded_filter_still_answers() {
        let original = sample();
        let restored = filter_from_bytes(&filter_to_bytes(&original).expect("encode")).expect("decode");
        assert_eq!(restored, original);
        let outcome = restored
            .index
            .search(&["edge-12".to_string()], None)
            .expect("search");
        assert!(outcome.matched_count >= 1);
    }

    #[test]
    fn rejects_wrong_magic_and_version() {
        let mut bytes = filter_to_bytes(&sample()).expect("encode");
        bytes[4] = 99;
        assert!(filter_from_bytes(&bytes).is_err());
        bytes[0] = b'X';
        assert!(filter_from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_short_and_truncated_input() {
        assert!(filter_from_bytes(b"RVB").is_err());
        let bytes = filter_to_bytes(&sample()).expect("encode");
        assert!(filter_from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
