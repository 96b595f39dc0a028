//! LZ4-compressed update records.

use serde::{Deserialize, Serialize};

use super::rocks::StorageError;

/// One persisted engine update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedDelta {
    /// Host delta version (monotonically increasing)
    pub version: u64,
    /// Uncompressed size in bytes
    pub original_size: u32,
    /// LZ4 block with prepended size
    pub compressed: Vec<u8>,
}

impl CompressedDelta {
    pub fn compress(version: u64, data: &[u8]) -> Self {
        Self {
            version,
            original_size: data.len() as u32,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, StorageError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StorageError::Compression(e.to_string()))
    }

    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(delta)
    }
}
