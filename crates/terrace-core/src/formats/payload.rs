//! # Graph Snapshot Format
//!
//! Binary encoding of a `GraphSnapshot`.
//!
//! Format: Header (5 bytes) + postcard-serialized snapshot.
//! - 4 bytes: Magic ("TRRC")
//! - 1 byte: Version
//!
//! Size and header are checked before the payload is decoded.

use crate::graph::GraphSnapshot;
use crate::{primitives, FlowError};

// =============================================================================
// FILE HEADER
// =============================================================================

/// The header preceding every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl SnapshotHeader {
    /// Header for the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(FlowError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(FlowError::DeserializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; primitives::HEADER_SIZE] {
        let [a, b, c, d] = self.magic;
        [a, b, c, d, self.version]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FlowError> {
        match bytes {
            [a, b, c, d, version, ..] => Ok(Self {
                magic: [*a, *b, *c, *d],
                version: *version,
            }),
            _ => Err(FlowError::DeserializationError(
                "Header too short".to_string(),
            )),
        }
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Encode a snapshot (header + payload).
pub fn snapshot_to_bytes(snapshot: &GraphSnapshot) -> Result<Vec<u8>, FlowError> {
    let payload =
        postcard::to_stdvec(snapshot).map_err(|e| FlowError::SerializationError(e.to_string()))?;

    let mut result = Vec::with_capacity(primitives::HEADER_SIZE + payload.len());
    result.extend_from_slice(&SnapshotHeader::new().to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Decode a snapshot.
///
/// Rejects data larger than `MAX_SNAPSHOT_SIZE` and bad headers before
/// touching the payload.
pub fn snapshot_from_bytes(bytes: &[u8]) -> Result<GraphSnapshot, FlowError> {
    if bytes.len() > primitives::MAX_SNAPSHOT_SIZE {
        return Err(FlowError::DeserializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            primitives::MAX_SNAPSHOT_SIZE
        )));
    }

    let header = SnapshotHeader::from_bytes(bytes)?;
    header.validate()?;

    let payload = bytes.get(primitives::HEADER_SIZE..).unwrap_or_default();
    postcard::from_bytes(payload).map_err(|e| {
        FlowError::DeserializationError(format!("Failed to decode snapshot: {e}"))
    })
}

// =============================================================================
// TESTS
// =============================================================================
