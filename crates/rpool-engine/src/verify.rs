//! Chunk existence/size audit, repair from a local source, and orphan
//! scanning.

use rpool_core::{PoolError, PoolResult};
use rpool_storage::BlobClient;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::hooks::{Hook, PluginRegistry};
use crate::manifest_store::ManifestStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Ok,
    MissingChunks,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub file_path: String,
    pub status: VerifyStatus,
    pub missing_chunks: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_chunks: usize,
    pub verified_chunks: usize,
}

impl VerificationResult {
    fn error(file_path: &str, message: &str) -> Self {
        VerificationResult {
            file_path: file_path.to_string(),
            status: VerifyStatus::Error,
            missing_chunks: Vec::new(),
            error: Some(message.to_string()),
            total_chunks: 0,
            verified_chunks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OrphanChunk {
    pub remote: String,
    pub path: String,
    pub size: u64,
}

pub struct Verifier {
    client: Arc<dyn BlobClient>,
    store: Arc<ManifestStore>,
    plugins: Arc<PluginRegistry>,
    remotes: Vec<String>,
    data_prefix: String,
}

impl Verifier {
    pub fn new(
        client: Arc<dyn BlobClient>,
        store: Arc<ManifestStore>,
        plugins: Arc<PluginRegistry>,
        remotes: Vec<String>,
        data_prefix: String,
    ) -> Self {
        Verifier {
            client,
            store,
            plugins,
            remotes,
            data_prefix,
        }
    }

    /// Audit one file. `quick` probes existence only; a full check downloads
    /// each chunk and compares its stored length (a mismatch counts as
    /// missing and is left to repair/rebuild).
    pub async fn verify(&self, file_path: &str, quick: bool) -> PoolResult<VerificationResult> {
        let Some(manifest) = self.store.load(file_path).await? else {
            return Ok(VerificationResult::error(file_path, "manifest not found"));
        };

        let mut missing = Vec::new();
        let mut verified = 0usize;
        for chunk in &manifest.chunks {
            let present = if quick {
                self.client
                    .exists(&chunk.remote, &chunk.path)
                    .await
                    .unwrap_or(false)
            } else {
                match self.client.download(&chunk.remote, &chunk.path).await {
                    Ok(data) => {
                        let expected = chunk.stored_len();
                        if data.len() as u64 != expected {
                            tracing::warn!(
                                chunk = chunk.index,
                                got = data.len(),
                                expected,
                                "chunk size mismatch, treating as missing"
                            );
                            false
                        } else {
                            true
                        }
                    }
                    Err(_) => false,
                }
            };
            if present {
                verified += 1;
            } else {
                tracing::warn!(path = %manifest.file_path, chunk = chunk.index, remote = %chunk.remote, "chunk missing");
                self.plugins.trigger(
                    Hook::ChunkMissing,
                    &[
                        ("file_path", manifest.file_path.clone().into()),
                        ("chunk_index", chunk.index.into()),
                        ("remote", chunk.remote.clone().into()),
                    ],
                );
                missing.push(chunk.index);
            }
        }

        let status = if missing.is_empty() {
            VerifyStatus::Ok
        } else {
            VerifyStatus::MissingChunks
        };
        let result = VerificationResult {
            file_path: manifest.file_path.clone(),
            status,
            missing_chunks: missing,
            error: None,
            total_chunks: manifest.chunks.len(),
            verified_chunks: verified,
        };
        self.plugins.trigger(
            Hook::FileVerified,
            &[
                ("file_path", manifest.file_path.clone().into()),
                ("ok", (status == VerifyStatus::Ok).into()),
            ],
        );
        Ok(result)
    }

    pub async fn verify_all(
        &self,
        quick: bool,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<VerificationResult>> {
        let manifests = self.store.list("/", true).await?;
        let mut results = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            results.push(self.verify(&manifest.file_path, quick).await?);
        }
        let failed = results
            .iter()
            .filter(|r| r.status != VerifyStatus::Ok)
            .count();
        tracing::info!(
            total = results.len(),
            passed = results.len() - failed,
            failed,
            "pool verification finished"
        );
        Ok(results)
    }

    /// Re-upload missing chunks by slicing a local copy of the file at the
    /// offsets recorded in the manifest.
    pub async fn repair(
        &self,
        file_path: &str,
        local_source: &std::path::Path,
    ) -> PoolResult<VerificationResult> {
        let Some(mut manifest) = self.store.load(file_path).await? else {
            return Err(PoolError::NotFound(file_path.to_string()));
        };
        let meta = tokio::fs::metadata(local_source).await?;
        if meta.len() < manifest.file_size {
            return Err(PoolError::Policy(format!(
                "local source {} is {} bytes, file needs {}",
                local_source.display(),
                meta.len(),
                manifest.file_size
            )));
        }

        let before = self.verify(file_path, false).await?;
        if before.status == VerifyStatus::Ok {
            tracing::info!(path = %file_path, "file intact, no repair needed");
            return Ok(before);
        }

        let mut file = tokio::fs::File::open(local_source).await?;
        let mut repaired = 0usize;
        let mut manifest_dirty = false;
        for index in &before.missing_chunks {
            let chunk = manifest
                .chunks
                .iter_mut()
                .find(|c| c.index == *index)
                .ok_or_else(|| PoolError::Integrity(format!("chunk {index} not in manifest")))?;
            file.seek(std::io::SeekFrom::Start(chunk.offset)).await?;
            let mut buf = vec![0u8; chunk.size as usize];
            file.read_exact(&mut buf).await?;

            let stored = if chunk.compressed {
                let (stored, still_compressed) = rpool_chunks::maybe_compress(&buf);
                // recompression may not land on the original stored length
                let stored_size = (stored.len() as u64 != chunk.size).then_some(stored.len() as u64);
                if chunk.compressed != still_compressed || chunk.stored_size != stored_size {
                    chunk.compressed = still_compressed;
                    chunk.stored_size = stored_size;
                    manifest_dirty = true;
                }
                stored
            } else {
                bytes::Bytes::from(buf)
            };
            match self
                .client
                .upload(&chunk.remote, &chunk.path, stored)
                .await
            {
                Ok(()) => {
                    tracing::info!(chunk = index, remote = %chunk.remote, "chunk repaired");
                    repaired += 1;
                }
                Err(e) => {
                    tracing::error!(chunk = index, error = %e, "chunk repair failed");
                }
            }
        }
        if manifest_dirty {
            self.store.save(&manifest).await?;
        }
        tracing::info!(
            path = %file_path,
            repaired,
            of = before.missing_chunks.len(),
            "repair pass finished"
        );

        let after = self.verify(file_path, false).await?;
        if after.status == VerifyStatus::Ok {
            self.plugins.trigger(
                Hook::FileRepaired,
                &[("file_path", manifest.file_path.clone().into())],
            );
        }
        Ok(after)
    }

    /// Every object under the data prefix not referenced (as primary,
    /// replica, or parity) by any live manifest.
    pub async fn find_orphans(&self) -> PoolResult<Vec<OrphanChunk>> {
        let manifests = self.store.list("/", true).await?;
        let mut referenced: HashSet<(String, String)> = HashSet::new();
        for manifest in &manifests {
            for chunk in manifest.chunks.iter().chain(manifest.parity_chunks.iter()) {
                referenced.insert((chunk.remote.clone(), chunk.path.clone()));
                for replica in &chunk.replicas {
                    referenced.insert((replica.remote.clone(), replica.path.clone()));
                }
            }
        }
        tracing::info!(
            referenced = referenced.len(),
            manifests = manifests.len(),
            "orphan scan reference set built"
        );

        let mut orphans = Vec::new();
        for remote in &self.remotes {
            let names = match self.client.list(remote, &self.data_prefix).await {
                Ok(names) => names,
                Err(e) => {
                    tracing::error!(remote = %remote, error = %e, "orphan scan listing failed");
                    continue;
                }
            };
            for name in names {
                let path = format!("{}/{name}", self.data_prefix);
                if referenced.contains(&(remote.clone(), path.clone())) {
                    continue;
                }
                let size = self.client.stat(remote, &path).await.unwrap_or(0);
                tracing::warn!(remote = %remote, path = %path, "orphan chunk");
                orphans.push(OrphanChunk {
                    remote: remote.clone(),
                    path,
                    size,
                });
            }
        }
        Ok(orphans)
    }

    /// Delete the given orphans; returns how many were removed.
    pub async fn delete_orphans(&self, orphans: &[OrphanChunk]) -> usize {
        let mut deleted = 0usize;
        for orphan in orphans {
            match self.client.delete(&orphan.remote, &orphan.path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => deleted += 1,
                Err(e) => {
                    tracing::error!(remote = %orphan.remote, path = %orphan.path, error = %e, "orphan delete failed");
                }
            }
        }
        tracing::info!(deleted, of = orphans.len(), "orphan cleanup finished");
        deleted
    }
}
