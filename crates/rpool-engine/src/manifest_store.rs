//! Manifest placement and retrieval.
//!
//! A manifest is written to every configured remote (best effort: one
//! success makes it readable, per-remote failures are logged). Loads try
//! the persistent cache first, then the remotes in configured order.
//! Listing unions the manifest prefixes of all remotes and dedupes by pool
//! path, so a remote holding a stale subset cannot hide files.

use rpool_core::types::{
    dir_is_within, manifest_object_key, normalize_path, Manifest,
};
use rpool_core::{PoolError, PoolResult};
use rpool_storage::BlobClient;
use std::collections::HashSet;
use std::sync::Arc;

use crate::manifest_cache::ManifestCache;

pub struct ManifestStore {
    client: Arc<dyn BlobClient>,
    remotes: Vec<String>,
    manifest_prefix: String,
    cache: Arc<ManifestCache>,
}

impl ManifestStore {
    pub fn new(
        client: Arc<dyn BlobClient>,
        remotes: Vec<String>,
        manifest_prefix: String,
        cache: Arc<ManifestCache>,
    ) -> Self {
        ManifestStore {
            client,
            remotes,
            manifest_prefix,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ManifestCache> {
        &self.cache
    }

    fn object_key(&self, file_path: &str) -> String {
        manifest_object_key(&self.manifest_prefix, file_path)
    }

    /// Fan-out save. Succeeds if at least one remote accepted the manifest.
    pub async fn save(&self, manifest: &Manifest) -> PoolResult<()> {
        let key = self.object_key(&manifest.file_path);
        let payload = bytes::Bytes::from(manifest.to_json()?);

        let mut ok = 0usize;
        for remote in &self.remotes {
            match self.client.upload(remote, &key, payload.clone()).await {
                Ok(()) => ok += 1,
                Err(e) => {
                    tracing::warn!(remote = %remote, key = %key, error = %e, "manifest save failed");
                }
            }
        }
        if ok == 0 {
            return Err(PoolError::Integrity(format!(
                "manifest for {} not accepted by any remote",
                manifest.file_path
            )));
        }
        tracing::debug!(
            path = %manifest.file_path,
            replicas = ok,
            total = self.remotes.len(),
            "manifest saved"
        );
        self.cache.put(manifest.clone());
        Ok(())
    }

    /// Load a manifest by pool path: cache first, then each remote in
    /// configured order until one copy parses.
    pub async fn load(&self, file_path: &str) -> PoolResult<Option<Manifest>> {
        let path = normalize_path(file_path);
        if let Some(manifest) = self.cache.get(&path) {
            return Ok(Some(manifest));
        }

        let key = self.object_key(&path);
        for remote in &self.remotes {
            match self.client.download(remote, &key).await {
                Ok(data) => match Manifest::from_json(&data) {
                    Ok(manifest) => {
                        tracing::debug!(path = %path, remote = %remote, "manifest loaded");
                        self.cache.put(manifest.clone());
                        return Ok(Some(manifest));
                    }
                    Err(e) => {
                        tracing::warn!(remote = %remote, key = %key, error = %e, "corrupt manifest copy, trying next remote");
                    }
                },
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::debug!(remote = %remote, key = %key, error = %e, "manifest load failed, trying next remote");
                }
            }
        }
        Ok(None)
    }

    /// List manifests under `dir`, unioned across all remotes and deduped
    /// by pool path.
    pub async fn list(&self, dir: &str, recursive: bool) -> PoolResult<Vec<Manifest>> {
        let dir = normalize_path(dir);
        let mut seen: HashSet<String> = HashSet::new();
        let mut manifests = Vec::new();

        for remote in &self.remotes {
            let names = match self.client.list(remote, &self.manifest_prefix).await {
                Ok(names) => names,
                Err(e) => {
                    tracing::debug!(remote = %remote, error = %e, "manifest listing failed, trying next remote");
                    continue;
                }
            };
            for name in names {
                if !name.ends_with(".manifest.json") || seen.contains(&name) {
                    continue;
                }
                let key = format!("{}/{name}", self.manifest_prefix);
                let data = match self.client.download(remote, &key).await {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::debug!(remote = %remote, key = %key, error = %e, "manifest download failed");
                        continue;
                    }
                };
                let manifest = match Manifest::from_json(&data) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        tracing::warn!(remote = %remote, key = %key, error = %e, "corrupt manifest");
                        continue;
                    }
                };
                seen.insert(name);
                self.cache.put(manifest.clone());

                let included = if recursive {
                    dir_is_within(&manifest.remote_dir, &dir)
                } else {
                    manifest.remote_dir == dir
                };
                if included {
                    manifests.push(manifest);
                }
            }
        }

        manifests.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(manifests)
    }

    /// Delete the manifest object everywhere (missing copies ignored) and
    /// evict the cache entry.
    pub async fn delete(&self, file_path: &str) -> PoolResult<()> {
        let path = normalize_path(file_path);
        let key = self.object_key(&path);
        for remote in &self.remotes {
            match self.client.delete(remote, &key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(remote = %remote, key = %key, error = %e, "manifest delete failed");
                }
            }
        }
        self.cache.delete(&path);
        Ok(())
    }

    /// Move a file within the namespace: rewrite manifest identity, save
    /// under the new key, then drop the old key. Chunk objects stay put.
    pub async fn rename(&self, src: &str, dst: &str) -> PoolResult<()> {
        let src = normalize_path(src);
        let mut manifest = self
            .load(&src)
            .await?
            .ok_or_else(|| PoolError::NotFound(src.clone()))?;
        manifest.rename_to(dst);
        self.save(&manifest).await?;
        self.delete(&src).await?;
        Ok(())
    }
}
