//! Checkpoint and Recovery
//!
//! Models are persisted inside a versioned envelope carrying a checksum
//! of the payload. The host owns the storage; this module only encodes
//! and decodes.

use crate::algo::TrendDecomposition;
use serde::{Deserialize, Serialize};
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

/// Version for checkpoint format migrations
pub const CHECKPOINT_VERSION: u32 = 1;

/// Encoded model state with its format version and checksum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    /// xxh3 of `payload`
    pub checksum: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn seal<T: Serialize>(state: &T) -> Result<Self, CheckpointError> {
        let payload = bincode::serialize(state).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))?;
        Ok(Self { version: CHECKPOINT_VERSION, checksum: xxh3_64(&payload), payload })
    }

    pub fn open<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CheckpointError> {
        if self.version > CHECKPOINT_VERSION {
            warn!(found = self.version, max_supported = CHECKPOINT_VERSION, "unsupported checkpoint version");
            return Err(CheckpointError::UnsupportedVersion { found: self.version, max_supported: CHECKPOINT_VERSION });
        }
        let found = xxh3_64(&self.payload);
        if found != self.checksum {
            return Err(CheckpointError::ChecksumMismatch { expected: self.checksum, found });
        }
        bincode::deserialize(&self.payload).map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::serialize(self).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        bincode::deserialize(bytes).map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))
    }
}

/// Errors that can occur during checkpoint operations
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointError {
    SerializationFailed(String),
    DeserializationFailed(String),
    UnsupportedVersion { found: u32, max_supported: u32 },
    ChecksumMismatch { expected: u64, found: u64 },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationFailed(e) => write!(f, "Serialization failed: {}", e),
            Self::DeserializationFailed(e) => write!(f, "Deserialization failed: {}", e),
            Self::UnsupportedVersion { found, max_supported } => {
                write!(f, "Unsupported checkpoint version: {} (max supported: {})", found, max_supported)
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "Checksum mismatch: expected {:016x}, found {:016x}", expected, found)
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

/// Trait for types that can be checkpointed
pub trait Checkpointable {
    /// Get checkpoint data
    fn to_checkpoint(&self) -> Result<Vec<u8>, CheckpointError>;
    /// Restore from checkpoint data
    fn from_checkpoint(data: &[u8]) -> Result<Self, CheckpointError>
    where
        Self: Sized;
}

impl Checkpointable for TrendDecomposition {
    fn to_checkpoint(&self) -> Result<Vec<u8>, CheckpointError> {
        Envelope::seal(self)?.to_bytes()
    }

    fn from_checkpoint(data: &[u8]) -> Result<Self, CheckpointError> {
        Envelope::from_bytes(data)?.open()
    }
}

/// Human readable rendition of a model's state.
pub fn to_json<T: Serialize>(state: &T) -> Result<serde_json::Value, CheckpointError> {
    serde_json::to_value(state).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))
}
