//! Reed-Solomon parity over GF(2^8).
//!
//! Groups of `d` data chunks produce `p` parity shards; any `d` surviving
//! shards of the `d + p` group reconstruct the rest. Shards inside a group
//! are zero-padded to the longest chunk before coding; callers truncate
//! reconstructed chunks back to their manifest sizes. Groups shorter than
//! `d` (the tail of a file) are completed with virtual all-zero shards.

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use rpool_core::{PoolError, PoolResult};

pub struct ParityCodec {
    data_shards: usize,
    parity_shards: usize,
    rs: ReedSolomon,
}

impl ParityCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> PoolResult<Self> {
        let rs = ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
            PoolError::Policy(format!(
                "invalid parity config ({data_shards} data + {parity_shards} parity): {e}"
            ))
        })?;
        Ok(ParityCodec {
            data_shards,
            parity_shards,
            rs,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Number of parity groups for a file of `chunk_count` data chunks.
    pub fn group_count(&self, chunk_count: usize) -> usize {
        chunk_count.div_ceil(self.data_shards)
    }

    /// Encode one group (up to `data_shards` chunks) into parity shards.
    /// Every returned shard has the length of the longest input chunk.
    pub fn encode(&self, group: &[Bytes]) -> PoolResult<Vec<Bytes>> {
        if group.is_empty() || group.len() > self.data_shards {
            return Err(PoolError::Policy(format!(
                "parity group must hold 1..={} chunks, got {}",
                self.data_shards,
                group.len()
            )));
        }
        let shard_len = group.iter().map(|c| c.len()).max().unwrap_or(0);
        if shard_len == 0 {
            return Ok(vec![Bytes::new(); self.parity_shards]);
        }

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.data_shards + self.parity_shards);
        for i in 0..self.data_shards {
            let mut shard = vec![0u8; shard_len];
            if let Some(chunk) = group.get(i) {
                shard[..chunk.len()].copy_from_slice(chunk);
            }
            shards.push(shard);
        }
        shards.extend(std::iter::repeat_with(|| vec![0u8; shard_len]).take(self.parity_shards));

        self.rs
            .encode(&mut shards)
            .map_err(|e| PoolError::Integrity(format!("parity encode: {e}")))?;

        Ok(shards
            .split_off(self.data_shards)
            .into_iter()
            .map(Bytes::from)
            .collect())
    }

    /// Reconstruct a group from surviving shards.
    ///
    /// `shards` holds `data_shards + parity_shards` slots in group order
    /// (data first). Present shards may be shorter than the group shard
    /// length (the tail data chunk); they are re-padded before decoding.
    /// Virtual shards of a short tail group must be passed as
    /// `Some(Bytes::new())`. Returns the full set of data shards, still
    /// padded to shard length.
    pub fn reconstruct(&self, shards: Vec<Option<Bytes>>) -> PoolResult<Vec<Bytes>> {
        if shards.len() != self.data_shards + self.parity_shards {
            return Err(PoolError::Policy(format!(
                "expected {} shard slots, got {}",
                self.data_shards + self.parity_shards,
                shards.len()
            )));
        }
        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing > self.parity_shards {
            return Err(PoolError::Integrity(format!(
                "cannot reconstruct: {missing} shards missing, tolerance is {}",
                self.parity_shards
            )));
        }
        let shard_len = shards
            .iter()
            .flatten()
            .map(|s| s.len())
            .max()
            .unwrap_or(0);
        if shard_len == 0 {
            return Ok(vec![Bytes::new(); self.data_shards]);
        }

        let mut slots: Vec<Option<Vec<u8>>> = shards
            .into_iter()
            .map(|slot| {
                slot.map(|data| {
                    let mut shard = vec![0u8; shard_len];
                    shard[..data.len()].copy_from_slice(&data);
                    shard
                })
            })
            .collect();

        self.rs
            .reconstruct(&mut slots)
            .map_err(|e| PoolError::Integrity(format!("parity reconstruct: {e}")))?;

        slots
            .into_iter()
            .take(self.data_shards)
            .map(|slot| {
                slot.map(Bytes::from)
                    .ok_or_else(|| PoolError::Integrity("shard not reconstructed".into()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(sizes: &[usize]) -> Vec<Bytes> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| Bytes::from(vec![(i as u8).wrapping_add(1); n]))
            .collect()
    }

    #[test]
    fn rejects_invalid_shard_counts() {
        assert!(ParityCodec::new(0, 1).is_err());
        assert!(ParityCodec::new(3, 1).is_ok());
    }

    #[test]
    fn group_count_is_ceiling() {
        let codec = ParityCodec::new(3, 1).unwrap();
        assert_eq!(codec.group_count(0), 0);
        assert_eq!(codec.group_count(3), 1);
        assert_eq!(codec.group_count(4), 2);
        assert_eq!(codec.group_count(7), 3);
    }

    #[test]
    fn recovers_single_data_loss() {
        let codec = ParityCodec::new(3, 1).unwrap();
        let data = group(&[100, 100, 100]);
        let parity = codec.encode(&data).unwrap();
        assert_eq!(parity.len(), 1);
        assert_eq!(parity[0].len(), 100);

        // lose data shard 1
        let shards = vec![
            Some(data[0].clone()),
            None,
            Some(data[2].clone()),
            Some(parity[0].clone()),
        ];
        let rebuilt = codec.reconstruct(shards).unwrap();
        assert_eq!(rebuilt[1], data[1]);
    }

    #[test]
    fn recovers_up_to_p_losses() {
        let codec = ParityCodec::new(3, 2).unwrap();
        let data = group(&[64, 64, 64]);
        let parity = codec.encode(&data).unwrap();

        let shards = vec![
            None,
            Some(data[1].clone()),
            None,
            Some(parity[0].clone()),
            Some(parity[1].clone()),
        ];
        let rebuilt = codec.reconstruct(shards).unwrap();
        assert_eq!(rebuilt[0], data[0]);
        assert_eq!(rebuilt[2], data[2]);
    }

    #[test]
    fn too_many_losses_fail() {
        let codec = ParityCodec::new(3, 1).unwrap();
        let data = group(&[32, 32, 32]);
        let parity = codec.encode(&data).unwrap();
        let shards = vec![None, None, Some(data[2].clone()), Some(parity[0].clone())];
        assert!(codec.reconstruct(shards).is_err());
    }

    #[test]
    fn short_tail_group_uses_virtual_shards() {
        let codec = ParityCodec::new(3, 1).unwrap();
        // only 2 real chunks, second one short
        let data = group(&[100, 40]);
        let parity = codec.encode(&data).unwrap();
        assert_eq!(parity[0].len(), 100);

        // lose the short chunk; virtual third shard passed as empty
        let shards = vec![
            Some(data[0].clone()),
            None,
            Some(Bytes::new()),
            Some(parity[0].clone()),
        ];
        let rebuilt = codec.reconstruct(shards).unwrap();
        // reconstructed shard is padded; truncate to the original size
        assert_eq!(rebuilt[1].slice(..40), data[1]);
        assert!(rebuilt[1][40..].iter().all(|&b| b == 0));
    }
}
