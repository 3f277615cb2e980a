//! Persistent on-disk manifest index.
//!
//! One JSON file keyed by canonical pool path, written via temp-file +
//! atomic rename. A dirty flag elides no-op writes; dropping the cache
//! flushes it, so every exit path persists pending updates.

use rpool_core::types::{dir_is_within, normalize_path, Manifest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    updated_at: f64,
    manifests: HashMap<String, Manifest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestCacheStats {
    pub manifest_count: usize,
    pub total_file_size: u64,
    pub total_chunks: usize,
    pub remotes_used: usize,
    pub cache_file: PathBuf,
    pub cache_exists: bool,
}

#[derive(Debug)]
struct CacheState {
    manifests: HashMap<String, Manifest>,
    dirty: bool,
}

#[derive(Debug)]
pub struct ManifestCache {
    file: PathBuf,
    state: Mutex<CacheState>,
}

impl ManifestCache {
    /// Open (or start fresh when the file is missing or corrupt).
    pub fn open(file: &Path) -> Self {
        let manifests = match std::fs::read(file) {
            Ok(data) => match serde_json::from_slice::<CacheFile>(&data) {
                Ok(parsed) => {
                    tracing::info!(
                        count = parsed.manifests.len(),
                        file = %file.display(),
                        "manifest cache loaded"
                    );
                    parsed.manifests
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "corrupt manifest cache, starting fresh");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        ManifestCache {
            file: file.to_path_buf(),
            state: Mutex::new(CacheState {
                manifests,
                dirty: false,
            }),
        }
    }

    pub fn get(&self, file_path: &str) -> Option<Manifest> {
        let key = normalize_path(file_path);
        self.state.lock().unwrap().manifests.get(&key).cloned()
    }

    pub fn put(&self, manifest: Manifest) {
        let mut state = self.state.lock().unwrap();
        state
            .manifests
            .insert(normalize_path(&manifest.file_path), manifest);
        state.dirty = true;
    }

    pub fn delete(&self, file_path: &str) {
        let mut state = self.state.lock().unwrap();
        if state.manifests.remove(&normalize_path(file_path)).is_some() {
            state.dirty = true;
        }
    }

    pub fn list_all(&self) -> Vec<Manifest> {
        self.state.lock().unwrap().manifests.values().cloned().collect()
    }

    pub fn list_by_directory(&self, dir: &str, recursive: bool) -> Vec<Manifest> {
        let dir = normalize_path(dir);
        self.state
            .lock()
            .unwrap()
            .manifests
            .values()
            .filter(|m| {
                if recursive {
                    dir_is_within(&m.remote_dir, &dir)
                } else {
                    m.remote_dir == dir
                }
            })
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.manifests.clear();
        state.dirty = true;
    }

    /// Persist when dirty (or `force`). Temp file + rename keeps the cache
    /// readable across a crash mid-write.
    pub fn save(&self, force: bool) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if !state.dirty && !force {
                return;
            }
            state.dirty = false;
            state.manifests.clone()
        };

        let payload = CacheFile {
            version: CACHE_VERSION,
            updated_at: rpool_core::types::unix_now(),
            manifests: snapshot,
        };
        if let Err(e) = self.write_atomic(&payload) {
            tracing::warn!(file = %self.file.display(), error = %e, "failed to save manifest cache");
            self.state.lock().unwrap().dirty = true;
        }
    }

    fn write_atomic(&self, payload: &CacheFile) -> std::io::Result<()> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(payload)?)?;
        std::fs::rename(&tmp, &self.file)?;
        tracing::debug!(
            count = payload.manifests.len(),
            file = %self.file.display(),
            "manifest cache saved"
        );
        Ok(())
    }

    pub fn stats(&self) -> ManifestCacheStats {
        let state = self.state.lock().unwrap();
        let mut total_file_size = 0u64;
        let mut total_chunks = 0usize;
        let mut remotes = std::collections::HashSet::new();
        for manifest in state.manifests.values() {
            total_file_size += manifest.file_size;
            total_chunks += manifest.chunk_count;
            for chunk in &manifest.chunks {
                remotes.insert(chunk.remote.clone());
            }
        }
        ManifestCacheStats {
            manifest_count: state.manifests.len(),
            total_file_size,
            total_chunks,
            remotes_used: remotes.len(),
            cache_file: self.file.clone(),
            cache_exists: self.file.exists(),
        }
    }
}

impl Drop for ManifestCache {
    fn drop(&mut self) {
        self.save(false);
    }
}
