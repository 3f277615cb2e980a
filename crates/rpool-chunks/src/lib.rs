//! Streamed fixed-size chunking, reassembly, per-chunk compression, and
//! Reed-Solomon parity coding.

pub mod chunker;
pub mod compress;
pub mod parity;

pub use chunker::{chunk_count, split_bytes, ChunkPiece, ChunkReader};
pub use compress::{decompress, maybe_compress};
pub use parity::ParityCodec;

/// Whole-file content hash (blake3 hex), streamed from disk.
pub async fn hash_file(path: &std::path::Path) -> rpool_core::PoolResult<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
