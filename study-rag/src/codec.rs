//! Compact binary encoding for embedding vectors.
//!
//! Vectors are stored as a little-endian `f32` sequence with no header; the
//! dimension is implied by the blob length. Decoding rejects blobs whose
//! length is not a multiple of four and any non-finite value.

use crate::error::{RagError, Result};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Encode an embedding into its storage blob.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a storage blob back into an embedding.
///
/// # Errors
///
/// Returns [`RagError::CodecError`] for truncated blobs or non-finite values.
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % F32_BYTES != 0 {
        return Err(RagError::CodecError(format!(
            "embedding blob length {} is not a multiple of {F32_BYTES}",
            blob.len()
        )));
    }

    let mut out = Vec::with_capacity(blob.len() / F32_BYTES);
    for chunk in blob.chunks_exact(F32_BYTES) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err(RagError::CodecError("embedding contains non-finite values".into()));
        }
        out.push(value);
    }
    Ok(out)
}

/// Decode a blob and check it has the expected dimension.
pub fn decode_embedding_with_dim(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    let vector = decode_embedding(blob)?;
    if vector.len() != dimension {
        return Err(RagError::CodecError(format!(
            "expected {dimension} dimensions, blob holds {}",
            vector.len()
        )));
    }
    Ok(vector)
}
