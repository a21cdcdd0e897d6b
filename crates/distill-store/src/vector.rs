//! Embedding vector blob packing.
//!
//! Vectors are stored as contiguously packed little-endian 64-bit floats,
//! so `length(blob) == 8 * dimension` always holds.

use crate::error::StoreError;

/// Pack a vector into its blob representation.
pub fn pack(values: &[f64]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 8);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Unpack a blob back into a vector. Fails on blobs whose length is not a
/// multiple of 8.
pub fn unpack(blob: &[u8]) -> Result<Vec<f64>, StoreError> {
    if blob.len() % 8 != 0 {
        return Err(StoreError::InvalidVector { len: blob.len() });
    }
    Ok(blob
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect())
}
