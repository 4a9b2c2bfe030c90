//! LZ4 and Zstd compression for stored extents.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Compression policy for new extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Store data as-is.
    None,
    /// LZ4 block format with the size prepended.
    #[default]
    Lz4,
    /// Zstandard.
    Zstd {
        /// Compression level (1 = fastest, 19 = best ratio).
        level: i32,
    },
}

impl CompressionAlgorithm {
    /// Type recorded in extents written with this policy.
    pub fn stored_type(self) -> CompressionType {
        match self {
            CompressionAlgorithm::None => CompressionType::None,
            CompressionAlgorithm::Lz4 => CompressionType::Lz4,
            CompressionAlgorithm::Zstd { .. } => CompressionType::Zstd,
        }
    }
}

/// Compression applied to a stored extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CompressionType {
    /// Uncompressed.
    #[default]
    None,
    /// LZ4.
    Lz4,
    /// Zstandard.
    Zstd,
}

/// Compresses `data`, falling back to storing it uncompressed unless the
/// result is at least `min_gain_percent` smaller.
pub fn compress(
    data: &[u8],
    algo: CompressionAlgorithm,
    min_gain_percent: u8,
) -> EngineResult<(CompressionType, Vec<u8>)> {
    let compressed = match algo {
        CompressionAlgorithm::None => return Ok((CompressionType::None, data.to_vec())),
        CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(data),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| EngineError::Compression {
                reason: e.to_string(),
            })?
        }
    };

    let limit = data.len() - data.len() * usize::from(min_gain_percent.min(100)) / 100;
    if compressed.len() >= limit || compressed.len() >= data.len() {
        return Ok((CompressionType::None, data.to_vec()));
    }
    Ok((algo.stored_type(), compressed))
}

/// Decompresses stored bytes, checking the logical length.
pub fn decompress(data: &[u8], ty: CompressionType, expected_len: usize) -> EngineResult<Vec<u8>> {
    let out = match ty {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4 => {
            lz4_flex::decompress_size_prepended(data).map_err(|e| EngineError::Compression {
                reason: e.to_string(),
            })?
        }
        CompressionType::Zstd => zstd::decode_all(data).map_err(|e| EngineError::Compression {
            reason: e.to_string(),
        })?,
    };
    if out.len() != expected_len {
        return Err(EngineError::Compression {
            reason: format!("decompressed {} bytes, expected {}", out.len(), expected_len),
        });
    }
    Ok(out)
}
