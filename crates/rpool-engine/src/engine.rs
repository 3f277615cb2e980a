//! The orchestrator: upload, download, range reads, delete, listing.
//!
//! One `PoolEngine` owns the single instances of every subcomponent for its
//! pool; frontends borrow it and may run concurrently. Upload, delete, and
//! rename serialize per pool path through a lock map, since the manifest
//! format has no cross-writer coherence.

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use rpool_chunks::{ChunkPiece, ChunkReader};
use rpool_core::types::{
    chunk_object_key, join_path, normalize_path, resolve_upload_target, ChunkKind, ChunkRef,
    FileSummary, Manifest,
};
use rpool_core::{PoolConfig, PoolError, PoolResult};
use rpool_storage::BlobClient;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::balancer::Balancer;
use crate::chunk_cache::ChunkCache;
use crate::hooks::{Hook, PluginRegistry};
use crate::manifest_cache::ManifestCache;
use crate::manifest_store::ManifestStore;
use crate::prefetch::{PrefetchRequest, Prefetcher};
use crate::rebalance::Rebalancer;
use crate::redundancy::RedundancyManager;
use crate::verify::Verifier;

/// How many chunks to queue for read-ahead after serving a range.
const PREFETCH_AHEAD: u32 = 2;

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub uploads: AtomicU64,
    pub downloads: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub uploads: u64,
    pub downloads: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate pool totals for the stats surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub files: usize,
    pub total_size: u64,
    pub chunks: usize,
    pub remotes: usize,
    pub used_space: u64,
    pub total_capacity: u64,
    pub utilization: f64,
}

pub struct PoolEngine {
    config: PoolConfig,
    client: Arc<dyn BlobClient>,
    store: Arc<ManifestStore>,
    balancer: Arc<Balancer>,
    rebalancer: Rebalancer,
    redundancy: RedundancyManager,
    verifier: Verifier,
    chunk_cache: Arc<ChunkCache>,
    prefetcher: Prefetcher,
    plugins: Arc<PluginRegistry>,
    path_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    counters: EngineCounters,
}

impl PoolEngine {
    pub fn new(config: PoolConfig, client: Arc<dyn BlobClient>) -> PoolResult<Self> {
        config.validate()?;
        if config.remotes.is_empty() {
            return Err(PoolError::Policy("no remotes configured".into()));
        }

        let manifest_cache = Arc::new(ManifestCache::open(&config.manifest_cache_file()));
        let store = Arc::new(ManifestStore::new(
            client.clone(),
            config.remotes.clone(),
            config.manifest_prefix.clone(),
            manifest_cache,
        ));
        let balancer = Arc::new(Balancer::new(client.clone(), &config));
        let plugins = Arc::new(PluginRegistry::new());
        let chunk_cache = Arc::new(ChunkCache::new(
            &config.chunk_cache_dir,
            config.chunk_cache_max_bytes(),
        )?);
        let prefetcher = Prefetcher::start(client.clone(), chunk_cache.clone());
        let redundancy = RedundancyManager::new(client.clone(), store.clone(), &config)?;
        let verifier = Verifier::new(
            client.clone(),
            store.clone(),
            plugins.clone(),
            config.remotes.clone(),
            config.data_prefix.clone(),
        );
        let rebalancer = Rebalancer::new(
            client.clone(),
            store.clone(),
            config.remotes.clone(),
            config.rebalance_threshold,
        );

        Ok(PoolEngine {
            config,
            client,
            store,
            balancer,
            rebalancer,
            redundancy,
            verifier,
            chunk_cache,
            prefetcher,
            plugins,
            path_locks: tokio::sync::Mutex::new(HashMap::new()),
            counters: EngineCounters::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn BlobClient> {
        &self.client
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    pub fn rebalancer(&self) -> &Rebalancer {
        &self.rebalancer
    }

    pub fn redundancy(&self) -> &RedundancyManager {
        &self.redundancy
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn chunk_cache(&self) -> &Arc<ChunkCache> {
        &self.chunk_cache
    }

    pub fn manifest_store(&self) -> &Arc<ManifestStore> {
        &self.store
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    async fn lock_path(&self, path: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.path_locks.lock().await;
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Upload a local file, splitting it into placed chunks and committing
    /// a manifest once every chunk (and its redundancy) landed.
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> PoolResult<Manifest> {
        let meta = tokio::fs::metadata(local_path).await.map_err(|_| {
            PoolError::NotFound(format!("local file {}", local_path.display()))
        })?;
        if !meta.is_file() {
            return Err(PoolError::Policy(format!(
                "{} is not a regular file",
                local_path.display()
            )));
        }
        let file_size = meta.len();
        let local_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PoolError::Policy("local path has no file name".into()))?;
        let (remote_dir, file_name) = resolve_upload_target(remote_path, &local_name);
        let file_path = join_path(&remote_dir, &file_name);
        let _guard = self.lock_path(&file_path).await;

        let content_hash = rpool_chunks::hash_file(local_path).await?;
        if let Some(existing) = self.store.load(&file_path).await? {
            if existing.file_size == file_size
                && existing.content_hash.as_deref() == Some(content_hash.as_str())
            {
                tracing::info!(path = %file_path, "identical content already in pool, skipping upload");
                return Ok(existing);
            }
        }

        tracing::info!(
            local = %local_path.display(),
            path = %file_path,
            size = file_size,
            "uploading"
        );
        self.plugins.trigger(
            Hook::PreUpload,
            &[
                ("file_path", file_path.clone().into()),
                ("file_size", file_size.into()),
            ],
        );

        let chunk_size = self.config.chunk_size;
        if file_size <= chunk_size {
            tracing::debug!(path = %file_path, "small file, storing as a single chunk");
        }

        let parity_mode = self.config.redundancy_mode.uses_parity();
        let mut chunks = if self.config.parallel_uploads && !parity_mode {
            self.upload_chunks_parallel(local_path, &file_name, cancel)
                .await?
        } else {
            self.upload_chunks_sequential(local_path, &file_name, cancel)
                .await?
        };
        chunks.sort_by_key(|(chunk, _)| chunk.index);
        let (chunk_refs, stored): (Vec<ChunkRef>, Vec<Bytes>) = chunks.into_iter().unzip();

        let mut manifest = Manifest::new(&file_name, &remote_dir, file_size, chunk_size, chunk_refs);
        manifest.content_hash = Some(content_hash);

        if parity_mode {
            manifest.parity_chunks = self.build_parity(&manifest, &stored).await?;
        }

        self.store.save(&manifest).await?;
        self.counters.uploads.fetch_add(1, Ordering::Relaxed);
        self.plugins.trigger(
            Hook::PostUpload,
            &[
                ("file_path", manifest.file_path.clone().into()),
                ("chunks", manifest.chunk_count.into()),
            ],
        );
        tracing::info!(
            path = %manifest.file_path,
            chunks = manifest.chunk_count,
            "upload complete"
        );
        Ok(manifest)
    }

    async fn upload_chunks_sequential(
        &self,
        local_path: &Path,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<(ChunkRef, Bytes)>> {
        let mut reader = ChunkReader::open(local_path, self.config.chunk_size).await?;
        let mut out = Vec::new();
        while let Some(piece) = reader.next_chunk().await? {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            out.push(self.upload_piece(file_name, piece).await?);
        }
        Ok(out)
    }

    /// Up to `max_parallel_workers` chunk uploads in flight; any failure
    /// aborts the whole upload before a manifest becomes visible.
    async fn upload_chunks_parallel(
        &self,
        local_path: &Path,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<(ChunkRef, Bytes)>> {
        let workers = self.config.max_parallel_workers;
        let mut reader = ChunkReader::open(local_path, self.config.chunk_size).await?;
        let mut in_flight = FuturesUnordered::new();
        let mut out = Vec::new();
        let mut drained = false;

        loop {
            while !drained && in_flight.len() < workers {
                match reader.next_chunk().await? {
                    Some(piece) => in_flight.push(self.upload_piece(file_name, piece)),
                    None => drained = true,
                }
            }
            match in_flight.next().await {
                Some(result) => out.push(result?),
                None => break,
            }
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
        }
        Ok(out)
    }

    /// Place one chunk: transform, compress, pick a remote, upload, then
    /// replicate. Returns the descriptor and the stored bytes (the parity
    /// encoder consumes the latter).
    async fn upload_piece(&self, file_name: &str, piece: ChunkPiece) -> PoolResult<(ChunkRef, Bytes)> {
        let index = piece.index;
        let plain_len = piece.len();
        self.plugins.trigger(
            Hook::PreChunk,
            &[("index", index.into()), ("size", plain_len.into())],
        );

        let (mut stored, compressed) = if self.config.enable_compression {
            rpool_chunks::maybe_compress(&piece.data)
        } else {
            (piece.data.clone(), false)
        };
        if self.plugins.has_transformers() {
            stored = self.plugins.transform_upload(stored)?;
        }

        let remote = self.pick_remote(stored.len() as u64).await;
        let path = chunk_object_key(&self.config.data_prefix, file_name, index);
        tracing::debug!(chunk = index, bytes = stored.len(), remote = %remote, "uploading chunk");
        if let Err(e) = self.client.upload(&remote, &path, stored.clone()).await {
            self.plugins.trigger(
                Hook::RemoteError,
                &[("remote", remote.clone().into()), ("error", e.to_string().into())],
            );
            return Err(e);
        }
        self.balancer.record_usage(&remote, stored.len() as i64).await;
        self.counters
            .bytes_uploaded
            .fetch_add(stored.len() as u64, Ordering::Relaxed);

        let mut chunk = ChunkRef {
            index,
            remote,
            path,
            size: plain_len,
            offset: piece.offset,
            replicas: Vec::new(),
            kind: ChunkKind::Data,
            compressed,
            stored_size: (stored.len() as u64 != plain_len).then_some(stored.len() as u64),
        };
        self.redundancy.replicate_chunk(&mut chunk, &stored).await?;

        self.plugins.trigger(
            Hook::PostChunk,
            &[("index", index.into()), ("remote", chunk.remote.clone().into())],
        );
        Ok((chunk, stored))
    }

    async fn pick_remote(&self, chunk_size: u64) -> String {
        self.plugins.trigger(Hook::PreBalance, &[]);
        let choice = if self.plugins.has_selectors() {
            let report = self.balancer.usage_report().await;
            let snapshot: Vec<_> = report.into_values().collect();
            self.plugins.select_remote(&snapshot, chunk_size)
        } else {
            None
        };
        let remote = match choice {
            Some(remote) => remote,
            None => self.balancer.next().await,
        };
        self.plugins
            .trigger(Hook::PostBalance, &[("remote", remote.clone().into())]);
        remote
    }

    /// Encode parity group by group over the stored chunk bytes.
    async fn build_parity(&self, manifest: &Manifest, stored: &[Bytes]) -> PoolResult<Vec<ChunkRef>> {
        let codec = self
            .redundancy
            .codec()
            .ok_or_else(|| PoolError::Policy("parity mode without codec".into()))?;
        let d = codec.data_shards();
        let mut parity = Vec::new();
        for (group_index, group) in stored.chunks(d).enumerate() {
            let group_remotes: BTreeSet<String> = manifest
                .chunks
                .iter()
                .skip(group_index * d)
                .take(d)
                .map(|c| c.remote.clone())
                .collect();
            parity.extend(
                self.redundancy
                    .make_parity_group(&manifest.file_name, group_index, group, &group_remotes)
                    .await?,
            );
        }
        Ok(parity)
    }

    /// Download a whole file, reassembling chunks in index order.
    pub async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> PoolResult<u64> {
        let path = normalize_path(remote_path);
        let manifest = self
            .store
            .load(&path)
            .await?
            .ok_or_else(|| PoolError::NotFound(path.clone()))?;
        self.plugins
            .trigger(Hook::PreDownload, &[("file_path", path.clone().into())]);
        tracing::info!(
            path = %path,
            size = manifest.file_size,
            chunks = manifest.chunk_count,
            "downloading"
        );

        let mut chunks = manifest.chunks.clone();
        chunks.sort_by_key(|c| c.index);
        let workers = if self.config.parallel_downloads {
            self.config.max_parallel_workers
        } else {
            1
        };

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut stream = futures::stream::iter(
            chunks
                .iter()
                .map(|chunk| self.fetch_chunk_plain(chunk, false)),
        )
        .buffered(workers);
        while let Some(result) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            let data = result?;
            file.write_all(&data).await?;
        }
        drop(stream);
        file.flush().await?;

        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_downloaded
            .fetch_add(manifest.file_size, Ordering::Relaxed);
        self.plugins
            .trigger(Hook::PostDownload, &[("file_path", path.into())]);
        Ok(manifest.file_size)
    }

    /// Serve `[offset, offset + length)` by touching only the overlapping
    /// chunks. Plain chunks are range-read server-side; compressed or
    /// transformed chunks go through the chunk cache and are sliced after
    /// decoding. Read-ahead for the following chunks is queued best-effort.
    pub async fn download_range(
        &self,
        remote_path: &str,
        offset: u64,
        length: u64,
    ) -> PoolResult<Bytes> {
        let path = normalize_path(remote_path);
        let manifest = self
            .store
            .load(&path)
            .await?
            .ok_or_else(|| PoolError::NotFound(path.clone()))?;

        let end = offset
            .saturating_add(length)
            .min(manifest.file_size);
        if offset >= end {
            return Ok(Bytes::new());
        }

        let mut chunks = manifest.chunks.clone();
        chunks.sort_by_key(|c| c.index);
        let mut result = BytesMut::with_capacity((end - offset) as usize);
        let mut last_index = 0u32;

        for chunk in &chunks {
            let chunk_start = chunk.offset;
            let chunk_end = chunk.offset + chunk.size;
            if chunk_end <= offset {
                continue;
            }
            if chunk_start >= end {
                break;
            }
            let within_offset = offset.max(chunk_start) - chunk_start;
            let within_len = end.min(chunk_end) - (chunk_start + within_offset);
            last_index = chunk.index;

            let needs_whole_chunk = chunk.compressed
                || self.plugins.has_transformers()
                || self.chunk_cache.contains(&self.cache_key(chunk));
            let slice = if needs_whole_chunk {
                let plain = self.fetch_chunk_plain(chunk, true).await?;
                plain.slice(within_offset as usize..(within_offset + within_len) as usize)
            } else {
                self.range_read(chunk, within_offset, within_len).await?
            };
            if slice.len() as u64 != within_len {
                return Err(PoolError::Integrity(format!(
                    "chunk {} returned {} bytes for a {}-byte range",
                    chunk.index,
                    slice.len(),
                    within_len
                )));
            }
            result.extend_from_slice(&slice);
        }

        // queue read-ahead for a streaming consumer
        let ahead: Vec<PrefetchRequest> = chunks
            .iter()
            .filter(|c| c.index > last_index && c.index <= last_index + PREFETCH_AHEAD)
            .map(|c| PrefetchRequest {
                key: self.cache_key(c),
                remote: c.remote.clone(),
                path: c.path.clone(),
            })
            .collect();
        self.prefetcher.request(ahead);

        self.counters
            .bytes_downloaded
            .fetch_add(result.len() as u64, Ordering::Relaxed);
        Ok(result.freeze())
    }

    /// Plaintext bytes of one chunk; the WebDAV streaming GET pulls chunks
    /// through this in index order.
    pub async fn read_chunk(&self, chunk: &ChunkRef) -> PoolResult<Bytes> {
        self.fetch_chunk_plain(chunk, false).await
    }

    async fn range_read(&self, chunk: &ChunkRef, offset: u64, length: u64) -> PoolResult<Bytes> {
        match self
            .client
            .download_range(&chunk.remote, &chunk.path, offset, length)
            .await
        {
            Ok(data) => Ok(data),
            Err(primary_err) => {
                for replica in &chunk.replicas {
                    if let Ok(data) = self
                        .client
                        .download_range(&replica.remote, &replica.path, offset, length)
                        .await
                    {
                        tracing::warn!(chunk = chunk.index, remote = %replica.remote, "served range from replica");
                        return Ok(data);
                    }
                }
                Err(primary_err)
            }
        }
    }

    fn cache_key(&self, chunk: &ChunkRef) -> String {
        format!("{}_{}", chunk.remote, chunk.path.replace('/', "_"))
    }

    /// Stored-to-plain chunk fetch: cache, then primary, then replicas.
    async fn fetch_chunk_plain(&self, chunk: &ChunkRef, populate_cache: bool) -> PoolResult<Bytes> {
        let key = self.cache_key(chunk);
        let stored = match self.chunk_cache.get(&key).await {
            Some(data) => data,
            None => {
                let data = match self.client.download(&chunk.remote, &chunk.path).await {
                    Ok(data) => data,
                    Err(primary_err) => {
                        let mut found = None;
                        for replica in &chunk.replicas {
                            if let Ok(data) =
                                self.client.download(&replica.remote, &replica.path).await
                            {
                                tracing::warn!(
                                    chunk = chunk.index,
                                    remote = %replica.remote,
                                    "primary unavailable, read replica"
                                );
                                found = Some(data);
                                break;
                            }
                        }
                        found.ok_or(primary_err)?
                    }
                };
                if populate_cache {
                    self.chunk_cache.put(&key, data.clone()).await;
                }
                data
            }
        };

        let mut plain = if self.plugins.has_transformers() {
            self.plugins.transform_download(stored)?
        } else {
            stored
        };
        if chunk.compressed {
            plain = rpool_chunks::decompress(&plain, chunk.size as usize)?;
        }
        if plain.len() as u64 != chunk.size {
            return Err(PoolError::Integrity(format!(
                "chunk {} decoded to {} bytes, manifest says {}",
                chunk.index,
                plain.len(),
                chunk.size
            )));
        }
        Ok(plain)
    }

    /// Remove a file: every chunk copy first, manifests last, so a racing
    /// reader sees either the complete file or none of it.
    pub async fn delete(&self, remote_path: &str) -> PoolResult<()> {
        let path = normalize_path(remote_path);
        let _guard = self.lock_path(&path).await;
        let manifest = self
            .store
            .load(&path)
            .await?
            .ok_or_else(|| PoolError::NotFound(path.clone()))?;
        self.plugins
            .trigger(Hook::PreDelete, &[("file_path", path.clone().into())]);
        tracing::info!(path = %path, chunks = manifest.chunk_count, "deleting");

        for chunk in manifest.chunks.iter().chain(manifest.parity_chunks.iter()) {
            self.delete_object(&chunk.remote, &chunk.path).await;
            self.balancer
                .record_usage(&chunk.remote, -(chunk.stored_len() as i64))
                .await;
            for replica in &chunk.replicas {
                self.delete_object(&replica.remote, &replica.path).await;
                self.balancer
                    .record_usage(&replica.remote, -(chunk.stored_len() as i64))
                    .await;
            }
        }
        self.store.delete(&path).await?;
        self.plugins
            .trigger(Hook::PostDelete, &[("file_path", path.into())]);
        Ok(())
    }

    async fn delete_object(&self, remote: &str, path: &str) {
        match self.client.delete(remote, path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(remote = %remote, path = %path, error = %e, "chunk delete failed");
            }
        }
    }

    pub async fn ls(&self, dir: &str) -> PoolResult<Vec<FileSummary>> {
        Ok(self
            .store
            .list(dir, false)
            .await?
            .iter()
            .map(FileSummary::from)
            .collect())
    }

    pub async fn list(&self, dir: &str, recursive: bool) -> PoolResult<Vec<FileSummary>> {
        Ok(self
            .store
            .list(dir, recursive)
            .await?
            .iter()
            .map(FileSummary::from)
            .collect())
    }

    pub async fn load_manifest(&self, remote_path: &str) -> PoolResult<Option<Manifest>> {
        self.store.load(remote_path).await
    }

    /// Rename within the namespace (WebDAV MOVE). Chunk objects stay put.
    pub async fn rename(&self, src: &str, dst: &str) -> PoolResult<()> {
        let src = normalize_path(src);
        let dst = normalize_path(dst);
        if src == dst {
            return Ok(());
        }
        // lock in sorted order so concurrent renames cannot deadlock
        let (first, second) = if src < dst { (&src, &dst) } else { (&dst, &src) };
        let _a = self.lock_path(first).await;
        let _b = self.lock_path(second).await;
        self.store.rename(&src, &dst).await
    }

    pub async fn stats(&self) -> PoolResult<PoolStats> {
        let manifests = self.store.list("/", true).await?;
        let report = self.balancer.usage_report().await;
        let used_space: u64 = report.values().map(|r| r.used).sum();
        let total_capacity: u64 = report.values().map(|r| r.total).sum();
        Ok(PoolStats {
            files: manifests.len(),
            total_size: manifests.iter().map(|m| m.file_size).sum(),
            chunks: manifests.iter().map(|m| m.chunk_count).sum(),
            remotes: report.len(),
            used_space,
            total_capacity,
            utilization: if total_capacity > 0 {
                used_space as f64 / total_capacity as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    /// Stop background workers and flush the manifest cache.
    pub async fn shutdown(&self) {
        self.prefetcher.stop().await;
        self.store.cache().save(false);
        tracing::info!("pool engine shut down");
    }
}
