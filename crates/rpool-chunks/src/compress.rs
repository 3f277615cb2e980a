//! Optional per-chunk zstd compression.
//!
//! Compression is only kept when it actually shrinks the chunk; the caller
//! records the outcome in the chunk descriptor so downloads know whether to
//! decompress.

use bytes::Bytes;
use rpool_core::{PoolError, PoolResult};

const LEVEL: i32 = 3;

/// Compress `data`; returns `(stored_bytes, compressed)`. Incompressible
/// data is passed through unchanged.
pub fn maybe_compress(data: &[u8]) -> (Bytes, bool) {
    match zstd::bulk::compress(data, LEVEL) {
        Ok(compressed) if compressed.len() < data.len() => (Bytes::from(compressed), true),
        Ok(_) => (Bytes::copy_from_slice(data), false),
        Err(e) => {
            tracing::warn!(error = %e, "compression failed, storing uncompressed");
            (Bytes::copy_from_slice(data), false)
        }
    }
}

/// Inverse of [`maybe_compress`] for chunks stored with `compressed = true`.
pub fn decompress(data: &[u8], plain_size: usize) -> PoolResult<Bytes> {
    let out = zstd::bulk::decompress(data, plain_size)
        .map_err(|e| PoolError::Integrity(format!("zstd decompress: {e}")))?;
    if out.len() != plain_size {
        return Err(PoolError::Integrity(format!(
            "decompressed to {} bytes, expected {plain_size}",
            out.len()
        )));
    }
    Ok(Bytes::from(out))
}
