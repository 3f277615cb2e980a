//! Fixed-size streaming splitter.
//!
//! A file is read sequentially into `chunk_size` pieces; only one piece is
//! resident per reader at a time, so memory stays bounded at `chunk_size`
//! regardless of file size. The final piece may be shorter.

use bytes::Bytes;
use rpool_core::{PoolError, PoolResult};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One piece of a split file.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub index: u32,
    pub offset: u64,
    pub data: Bytes,
}

impl ChunkPiece {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// `ceil(file_size / chunk_size)`.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// Streams a local file as a lazy sequence of chunk pieces.
pub struct ChunkReader {
    file: tokio::fs::File,
    chunk_size: usize,
    next_index: u32,
    offset: u64,
    done: bool,
}

impl ChunkReader {
    pub async fn open(path: &Path, chunk_size: u64) -> PoolResult<Self> {
        if chunk_size == 0 {
            return Err(PoolError::Policy("chunk_size must be > 0".into()));
        }
        let file = tokio::fs::File::open(path).await?;
        Ok(ChunkReader {
            file,
            chunk_size: chunk_size as usize,
            next_index: 0,
            offset: 0,
            done: false,
        })
    }

    /// Next piece, or `None` at end of file.
    pub async fn next_chunk(&mut self) -> PoolResult<Option<ChunkPiece>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        let piece = ChunkPiece {
            index: self.next_index,
            offset: self.offset,
            data: Bytes::from(buf),
        };
        self.next_index += 1;
        self.offset += filled as u64;
        Ok(Some(piece))
    }
}

/// Split an in-memory buffer; used by tests and the parity group math.
pub fn split_bytes(data: &[u8], chunk_size: u64) -> Vec<ChunkPiece> {
    if chunk_size == 0 || data.is_empty() {
        return Vec::new();
    }
    let data = Bytes::copy_from_slice(data);
    let size = chunk_size as usize;
    (0..data.len())
        .step_by(size)
        .enumerate()
        .map(|(index, start)| {
            let end = (start + size).min(data.len());
            ChunkPiece {
                index: index as u32,
                offset: start as u64,
                data: data.slice(start..end),
            }
        })
        .collect()
}

/// Write pieces to `out_path` in ascending index order.
pub async fn reassemble(mut pieces: Vec<(u32, Bytes)>, out_path: &Path) -> PoolResult<()> {
    pieces.sort_by_key(|(index, _)| *index);
    let mut out = tokio::fs::File::create(out_path).await?;
    for (_, data) in &pieces {
        out.write_all(data).await?;
    }
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn chunk_count_is_ceiling() {
        assert_eq!(chunk_count(0, 100), 0);
        assert_eq!(chunk_count(1, 100), 1);
        assert_eq!(chunk_count(100, 100), 1);
        assert_eq!(chunk_count(101, 100), 2);
        assert_eq!(chunk_count(250, 100), 3);
    }

    #[tokio::test]
    async fn streaming_split_matches_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(250).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let mut reader = ChunkReader::open(&path, 100).await.unwrap();
        let mut pieces = Vec::new();
        while let Some(piece) = reader.next_chunk().await.unwrap() {
            pieces.push(piece);
        }

        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), 100);
        assert_eq!(pieces[1].len(), 100);
        assert_eq!(pieces[2].len(), 50);
        assert_eq!(pieces[1].offset, 100);
        assert_eq!(pieces[2].offset, 200);
        let rebuilt: Vec<u8> = pieces.iter().flat_map(|p| p.data.to_vec()).collect();
        assert_eq!(rebuilt, data);
    }

    #[tokio::test]
    async fn empty_file_yields_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();
        let mut reader = ChunkReader::open(&path, 100).await.unwrap();
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reassemble_orders_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");
        reassemble(
            vec![
                (2, Bytes::from_static(b"cc")),
                (0, Bytes::from_static(b"aa")),
                (1, Bytes::from_static(b"bb")),
            ],
            &out,
        )
        .await
        .unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"aabbcc");
    }

    proptest! {
        /// Split pieces are contiguous, non-overlapping, and cover the input.
        #[test]
        fn split_covers_input(data in proptest::collection::vec(any::<u8>(), 0..4096),
                              chunk_size in 1u64..512) {
            let pieces = split_bytes(&data, chunk_size);
            let mut offset = 0u64;
            for (i, piece) in pieces.iter().enumerate() {
                prop_assert_eq!(piece.index as usize, i);
                prop_assert_eq!(piece.offset, offset);
                if (i as u64) < chunk_count(data.len() as u64, chunk_size) - 1 {
                    prop_assert_eq!(piece.len(), chunk_size);
                } else {
                    prop_assert!(piece.len() <= chunk_size);
                }
                offset += piece.len();
            }
            prop_assert_eq!(offset as usize, data.len());
            prop_assert_eq!(pieces.len() as u64, chunk_count(data.len() as u64, chunk_size));
        }
    }
}
