//! Replication and parity.
//!
//! Replication writes `k - 1` extra copies of each chunk to distinct
//! remotes under the same object path. Parity groups `d` consecutive data
//! chunks into `p` Reed-Solomon shards placed (when possible) on remotes
//! that hold none of the group's data. Rebuild prefers replica restore and
//! falls back to erasure decoding; manifests are never rewritten by a
//! rebuild since object paths do not change.

use bytes::Bytes;
use rpool_chunks::ParityCodec;
use rpool_core::config::RedundancyMode;
use rpool_core::types::{parity_object_key, ChunkKind, ChunkRef, Manifest, ReplicaRef};
use rpool_core::{PoolConfig, PoolError, PoolResult};
use rpool_storage::BlobClient;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::manifest_store::ManifestStore;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub file_path: String,
    pub total_chunks: usize,
    pub healthy_chunks: usize,
    pub degraded_chunks: usize,
    pub missing_chunks: usize,
    pub parity_total: usize,
    pub parity_healthy: usize,
    pub is_recoverable: bool,
    pub warnings: Vec<String>,
}

impl HealthStatus {
    fn absent(file_path: &str) -> Self {
        HealthStatus {
            file_path: file_path.to_string(),
            total_chunks: 0,
            healthy_chunks: 0,
            degraded_chunks: 0,
            missing_chunks: 0,
            parity_total: 0,
            parity_healthy: 0,
            is_recoverable: false,
            warnings: vec!["manifest not found".into()],
        }
    }

    pub fn is_fully_healthy(&self) -> bool {
        self.missing_chunks == 0 && self.degraded_chunks == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildOutcome {
    pub restored_chunks: usize,
    pub health: HealthStatus,
}

impl RebuildOutcome {
    pub fn ok(&self) -> bool {
        self.health.missing_chunks == 0
    }
}

pub struct RedundancyManager {
    client: Arc<dyn BlobClient>,
    store: Arc<ManifestStore>,
    mode: RedundancyMode,
    replication_factor: usize,
    codec: Option<ParityCodec>,
    remotes: Vec<String>,
    data_prefix: String,
}

impl RedundancyManager {
    pub fn new(
        client: Arc<dyn BlobClient>,
        store: Arc<ManifestStore>,
        config: &PoolConfig,
    ) -> PoolResult<Self> {
        let codec = if config.redundancy_mode.uses_parity() {
            Some(ParityCodec::new(
                config.parity_data_shards,
                config.parity_shards,
            )?)
        } else {
            None
        };
        Ok(RedundancyManager {
            client,
            store,
            mode: config.redundancy_mode,
            replication_factor: config.replication_factor,
            codec,
            remotes: config.remotes.clone(),
            data_prefix: config.data_prefix.clone(),
        })
    }

    pub fn mode(&self) -> RedundancyMode {
        self.mode
    }

    pub fn codec(&self) -> Option<&ParityCodec> {
        self.codec.as_ref()
    }

    /// Write `replication_factor - 1` copies of a freshly uploaded chunk
    /// and record them in the descriptor. Best effort: a failed replica is
    /// logged and skipped.
    pub async fn replicate_chunk(&self, chunk: &mut ChunkRef, stored: &Bytes) -> PoolResult<()> {
        if !self.mode.uses_replication() || self.replication_factor <= 1 {
            return Ok(());
        }
        let wanted = self.replication_factor - 1;
        let targets: Vec<&String> = self
            .remotes
            .iter()
            .filter(|r| **r != chunk.remote)
            .take(wanted)
            .collect();
        for target in targets {
            match self.client.upload(target, &chunk.path, stored.clone()).await {
                Ok(()) => {
                    chunk.replicas.push(ReplicaRef {
                        remote: target.clone(),
                        path: chunk.path.clone(),
                    });
                    tracing::debug!(chunk = chunk.index, remote = %target, "replica written");
                }
                Err(e) => {
                    tracing::warn!(chunk = chunk.index, remote = %target, error = %e, "replica upload failed");
                }
            }
        }
        Ok(())
    }

    /// Encode and place parity for one group of stored chunk bytes.
    /// `group_index` counts groups of `parity_data_shards` chunks.
    pub async fn make_parity_group(
        &self,
        file_name: &str,
        group_index: usize,
        group: &[Bytes],
        group_remotes: &BTreeSet<String>,
    ) -> PoolResult<Vec<ChunkRef>> {
        let codec = self
            .codec
            .as_ref()
            .ok_or_else(|| PoolError::Policy("parity codec not configured".into()))?;
        let shards = codec.encode(group)?;
        let mut refs = Vec::with_capacity(shards.len());
        for (j, shard) in shards.into_iter().enumerate() {
            let index = (group_index * codec.parity_shards() + j) as u32;
            let path = parity_object_key(&self.data_prefix, file_name, index);
            let remote = self.select_parity_remote(group_remotes, index as usize);
            self.client.upload(&remote, &path, shard.clone()).await?;
            tracing::debug!(parity = index, remote = %remote, bytes = shard.len(), "parity chunk written");
            refs.push(ChunkRef {
                index,
                remote,
                path,
                size: shard.len() as u64,
                offset: 0,
                replicas: Vec::new(),
                kind: ChunkKind::Parity,
                compressed: false,
                stored_size: None,
            });
        }
        Ok(refs)
    }

    /// Prefer remotes holding none of the group's data; fall back to the
    /// full configured list.
    fn select_parity_remote(&self, group_remotes: &BTreeSet<String>, salt: usize) -> String {
        let outside: Vec<&String> = self
            .remotes
            .iter()
            .filter(|r| !group_remotes.contains(*r))
            .collect();
        if !outside.is_empty() {
            outside[salt % outside.len()].clone()
        } else {
            self.remotes[salt % self.remotes.len()].clone()
        }
    }

    /// Probe every copy of every chunk of a file.
    pub async fn check_health(&self, file_path: &str) -> PoolResult<HealthStatus> {
        let Some(manifest) = self.store.load(file_path).await? else {
            return Ok(HealthStatus::absent(file_path));
        };

        let mut healthy = 0usize;
        let mut degraded = 0usize;
        let mut missing = 0usize;
        let mut warnings = Vec::new();

        for chunk in &manifest.chunks {
            if self.object_present(&chunk.remote, &chunk.path).await {
                healthy += 1;
                continue;
            }
            let mut replica_alive = false;
            for replica in &chunk.replicas {
                if self.object_present(&replica.remote, &replica.path).await {
                    replica_alive = true;
                    break;
                }
            }
            if replica_alive {
                degraded += 1;
                warnings.push(format!(
                    "chunk {} primary missing on {}, replica available",
                    chunk.index, chunk.remote
                ));
            } else {
                missing += 1;
                warnings.push(format!("chunk {} has no surviving copy", chunk.index));
            }
        }

        let mut parity_healthy = 0usize;
        for parity in &manifest.parity_chunks {
            if self.object_present(&parity.remote, &parity.path).await {
                parity_healthy += 1;
            }
        }

        let is_recoverable = match self.mode {
            RedundancyMode::Parity | RedundancyMode::Hybrid => missing <= parity_healthy,
            _ => missing == 0,
        };

        Ok(HealthStatus {
            file_path: manifest.file_path.clone(),
            total_chunks: manifest.chunks.len(),
            healthy_chunks: healthy,
            degraded_chunks: degraded,
            missing_chunks: missing,
            parity_total: manifest.parity_chunks.len(),
            parity_healthy,
            is_recoverable,
            warnings,
        })
    }

    pub async fn check_health_all(&self) -> PoolResult<Vec<HealthStatus>> {
        let manifests = self.store.list("/", true).await?;
        let mut report = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            report.push(self.check_health(&manifest.file_path).await?);
        }
        Ok(report)
    }

    /// Restore every absent primary: from a replica when one survives,
    /// otherwise through erasure decoding. Succeeds when the post-rebuild
    /// health shows no missing chunks.
    pub async fn rebuild(
        &self,
        file_path: &str,
        cancel: &CancellationToken,
    ) -> PoolResult<RebuildOutcome> {
        let health = self.check_health(file_path).await?;
        if health.total_chunks == 0 {
            return Err(PoolError::NotFound(file_path.to_string()));
        }
        if !health.is_recoverable {
            return Err(PoolError::Integrity(format!(
                "{file_path}: {} chunks missing, not recoverable in {:?} mode",
                health.missing_chunks, self.mode
            )));
        }
        if health.is_fully_healthy() {
            return Ok(RebuildOutcome {
                restored_chunks: 0,
                health,
            });
        }

        let manifest = self
            .store
            .load(file_path)
            .await?
            .ok_or_else(|| PoolError::NotFound(file_path.to_string()))?;

        let mut restored = 0usize;
        for chunk in &manifest.chunks {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            if self.object_present(&chunk.remote, &chunk.path).await {
                continue;
            }
            tracing::info!(path = %manifest.file_path, chunk = chunk.index, "rebuilding chunk");
            if self.restore_from_replica(chunk).await {
                restored += 1;
                continue;
            }
            match self.restore_from_parity(&manifest, chunk).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::error!(chunk = chunk.index, error = %e, "chunk reconstruction failed");
                }
            }
        }

        let health = self.check_health(file_path).await?;
        if health.missing_chunks == 0 {
            tracing::info!(path = %file_path, restored, "rebuild complete");
        } else {
            tracing::error!(
                path = %file_path,
                still_missing = health.missing_chunks,
                "rebuild left chunks missing"
            );
        }
        Ok(RebuildOutcome {
            restored_chunks: restored,
            health,
        })
    }

    async fn restore_from_replica(&self, chunk: &ChunkRef) -> bool {
        for replica in &chunk.replicas {
            match self.client.download(&replica.remote, &replica.path).await {
                Ok(data) => match self.client.upload(&chunk.remote, &chunk.path, data).await {
                    Ok(()) => {
                        tracing::info!(
                            chunk = chunk.index,
                            from = %replica.remote,
                            to = %chunk.remote,
                            "restored from replica"
                        );
                        return true;
                    }
                    Err(e) => {
                        tracing::warn!(chunk = chunk.index, error = %e, "replica restore upload failed");
                    }
                },
                Err(e) => {
                    tracing::debug!(chunk = chunk.index, remote = %replica.remote, error = %e, "replica unavailable");
                }
            }
        }
        false
    }

    async fn restore_from_parity(&self, manifest: &Manifest, target: &ChunkRef) -> PoolResult<()> {
        let codec = self.codec.as_ref().ok_or_else(|| {
            PoolError::Integrity(format!(
                "chunk {} has no replica and parity is not configured",
                target.index
            ))
        })?;
        let d = codec.data_shards();
        let p = codec.parity_shards();
        let group = target.index as usize / d;

        let mut shards: Vec<Option<Bytes>> = Vec::with_capacity(d + p);
        for slot in 0..d {
            let index = (group * d + slot) as u32;
            if index as usize >= manifest.chunks.len() {
                // virtual zero shard of a short tail group
                shards.push(Some(Bytes::new()));
                continue;
            }
            let chunk = manifest
                .chunks
                .iter()
                .find(|c| c.index == index)
                .ok_or_else(|| PoolError::Integrity(format!("chunk {index} absent from manifest")))?;
            shards.push(self.fetch_any_copy(chunk).await);
        }
        for slot in 0..p {
            let index = (group * p + slot) as u32;
            let shard = match manifest.parity_chunks.iter().find(|c| c.index == index) {
                Some(parity) => self.fetch_any_copy(parity).await,
                None => None,
            };
            shards.push(shard);
        }

        let rebuilt = codec.reconstruct(shards)?;
        let shard = &rebuilt[target.index as usize % d];
        let data = shard.slice(..(target.stored_len() as usize).min(shard.len()));
        self.client
            .upload(&target.remote, &target.path, data)
            .await?;
        tracing::info!(chunk = target.index, remote = %target.remote, "reconstructed from parity");
        Ok(())
    }

    async fn fetch_any_copy(&self, chunk: &ChunkRef) -> Option<Bytes> {
        match self.client.download(&chunk.remote, &chunk.path).await {
            Ok(data) => return Some(data),
            Err(e) => {
                tracing::debug!(chunk = chunk.index, remote = %chunk.remote, error = %e, "primary copy unavailable");
            }
        }
        for replica in &chunk.replicas {
            if let Ok(data) = self.client.download(&replica.remote, &replica.path).await {
                return Some(data);
            }
        }
        None
    }

    async fn object_present(&self, remote: &str, path: &str) -> bool {
        self.client.exists(remote, path).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest_cache::ManifestCache;
    use rpool_core::types::chunk_object_key;
    use rpool_storage::MemoryClient;

    const REMOTES: [&str; 4] = ["a", "b", "c", "d"];

    struct Fixture {
        client: Arc<MemoryClient>,
        store: Arc<ManifestStore>,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(MemoryClient::new(REMOTES.iter().map(|s| s.to_string())));
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(ManifestCache::open(&tmp.path().join("cache.json")));
        let store = Arc::new(ManifestStore::new(
            client.clone(),
            REMOTES.iter().map(|s| s.to_string()).collect(),
            "rclonepool_manifests".into(),
            cache,
        ));
        Fixture {
            client,
            store,
            _tmp: tmp,
        }
    }

    fn config(mode: RedundancyMode, replication: usize) -> PoolConfig {
        PoolConfig {
            remotes: REMOTES.iter().map(|s| s.to_string()).collect(),
            redundancy_mode: mode,
            replication_factor: replication,
            parity_data_shards: 3,
            parity_shards: 1,
            ..Default::default()
        }
    }

    async fn upload_file(
        fx: &Fixture,
        mgr: &RedundancyManager,
        name: &str,
        chunk_bytes: &[&[u8]],
    ) -> Manifest {
        let mut chunks = Vec::new();
        let mut offset = 0u64;
        let mut stored = Vec::new();
        for (i, data) in chunk_bytes.iter().enumerate() {
            let remote = REMOTES[i % REMOTES.len()].to_string();
            let path = chunk_object_key("rclonepool_data", name, i as u32);
            fx.client
                .upload(&remote, &path, Bytes::copy_from_slice(data))
                .await
                .unwrap();
            let mut chunk = ChunkRef {
                index: i as u32,
                remote,
                path,
                size: data.len() as u64,
                offset,
                replicas: Vec::new(),
                kind: ChunkKind::Data,
                compressed: false,
                stored_size: None,
            };
            mgr.replicate_chunk(&mut chunk, &Bytes::copy_from_slice(data))
                .await
                .unwrap();
            offset += data.len() as u64;
            stored.push(Bytes::copy_from_slice(data));
            chunks.push(chunk);
        }
        let file_size = offset;
        let mut manifest = Manifest::new(name, "/", file_size, 100, chunks);
        if mgr.mode().uses_parity() {
            let remotes: BTreeSet<String> = manifest.remotes();
            let parity = mgr
                .make_parity_group(name, 0, &stored, &remotes)
                .await
                .unwrap();
            manifest.parity_chunks = parity;
        }
        fx.store.save(&manifest).await.unwrap();
        manifest
    }

    #[tokio::test]
    async fn replication_writes_distinct_remotes() {
        let fx = fixture();
        let mgr = RedundancyManager::new(
            fx.client.clone(),
            fx.store.clone(),
            &config(RedundancyMode::Replication, 3),
        )
        .unwrap();
        let manifest = upload_file(&fx, &mgr, "f.bin", &[b"0123456789"]).await;
        let chunk = &manifest.chunks[0];
        assert_eq!(chunk.replicas.len(), 2);
        let mut all: BTreeSet<&str> = chunk.replicas.iter().map(|r| r.remote.as_str()).collect();
        all.insert(&chunk.remote);
        assert_eq!(all.len(), 3, "primary and replicas on distinct remotes");
    }

    #[tokio::test]
    async fn health_reports_degraded_and_missing() {
        let fx = fixture();
        let mgr = RedundancyManager::new(
            fx.client.clone(),
            fx.store.clone(),
            &config(RedundancyMode::Replication, 2),
        )
        .unwrap();
        let manifest = upload_file(&fx, &mgr, "f.bin", &[b"xxxxx", b"yyyyy"]).await;

        // fully healthy
        let health = mgr.check_health("/f.bin").await.unwrap();
        assert!(health.is_fully_healthy());
        assert!(health.is_recoverable);

        // kill chunk 0's primary: degraded but recoverable
        let c0 = &manifest.chunks[0];
        fx.client.delete(&c0.remote, &c0.path).await.unwrap();
        let health = mgr.check_health("/f.bin").await.unwrap();
        assert_eq!(health.degraded_chunks, 1);
        assert_eq!(health.missing_chunks, 0);
        assert!(health.is_recoverable);

        // kill its replica too: missing, unrecoverable under replication
        let r0 = &c0.replicas[0];
        fx.client.delete(&r0.remote, &r0.path).await.unwrap();
        let health = mgr.check_health("/f.bin").await.unwrap();
        assert_eq!(health.missing_chunks, 1);
        assert!(!health.is_recoverable);
    }

    #[tokio::test]
    async fn rebuild_restores_from_replica() {
        let fx = fixture();
        let mgr = RedundancyManager::new(
            fx.client.clone(),
            fx.store.clone(),
            &config(RedundancyMode::Replication, 2),
        )
        .unwrap();
        let manifest = upload_file(&fx, &mgr, "f.bin", &[b"abcde"]).await;
        let c0 = &manifest.chunks[0];
        fx.client.delete(&c0.remote, &c0.path).await.unwrap();

        let outcome = mgr
            .rebuild("/f.bin", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.ok());
        assert_eq!(outcome.restored_chunks, 1);
        assert_eq!(
            fx.client.download(&c0.remote, &c0.path).await.unwrap(),
            Bytes::from_static(b"abcde")
        );
    }

    #[tokio::test]
    async fn parity_placed_off_group_remotes() {
        let fx = fixture();
        let mgr = RedundancyManager::new(
            fx.client.clone(),
            fx.store.clone(),
            &config(RedundancyMode::Parity, 1),
        )
        .unwrap();
        let manifest = upload_file(&fx, &mgr, "f.bin", &[b"aaa", b"bbb", b"ccc"]).await;
        assert_eq!(manifest.parity_chunks.len(), 1);
        // data went to a, b, c: parity must land on d
        assert_eq!(manifest.parity_chunks[0].remote, "d");
        assert_eq!(manifest.parity_chunks[0].kind, ChunkKind::Parity);
    }

    #[tokio::test]
    async fn rebuild_reconstructs_from_parity() {
        let fx = fixture();
        let mgr = RedundancyManager::new(
            fx.client.clone(),
            fx.store.clone(),
            &config(RedundancyMode::Parity, 1),
        )
        .unwrap();
        let manifest = upload_file(&fx, &mgr, "f.bin", &[b"aaaa", b"bbbb", b"cc"]).await;

        let victim = &manifest.chunks[1];
        fx.client.delete(&victim.remote, &victim.path).await.unwrap();

        let health = mgr.check_health("/f.bin").await.unwrap();
        assert_eq!(health.missing_chunks, 1);
        assert!(health.is_recoverable);

        let outcome = mgr
            .rebuild("/f.bin", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.ok());
        assert_eq!(
            fx.client.download(&victim.remote, &victim.path).await.unwrap(),
            Bytes::from_static(b"bbbb")
        );
    }

    #[tokio::test]
    async fn rebuild_refuses_unrecoverable() {
        let fx = fixture();
        let mgr = RedundancyManager::new(
            fx.client.clone(),
            fx.store.clone(),
            &config(RedundancyMode::Parity, 1),
        )
        .unwrap();
        let manifest = upload_file(&fx, &mgr, "f.bin", &[b"aaaa", b"bbbb", b"cccc"]).await;
        for chunk in &manifest.chunks[..2] {
            fx.client.delete(&chunk.remote, &chunk.path).await.unwrap();
        }
        let err = mgr
            .rebuild("/f.bin", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Integrity(_)));
    }

    #[tokio::test]
    async fn rebuild_missing_file_is_not_found() {
        let fx = fixture();
        let mgr = RedundancyManager::new(
            fx.client.clone(),
            fx.store.clone(),
            &config(RedundancyMode::None, 1),
        )
        .unwrap();
        assert!(mgr
            .rebuild("/ghost", &CancellationToken::new())
            .await
            .unwrap_err()
            .is_not_found());
    }
}
