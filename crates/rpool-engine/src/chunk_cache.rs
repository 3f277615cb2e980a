//! Bounded LRU of chunk bytes on fast local storage.
//!
//! Entries are raw `{key}.chunk` files under the cache directory (a
//! RAM-backed filesystem is the intended home). The index is in-memory
//! only and starts empty; `current_size` always equals the sum of live
//! entry sizes. The mutex guards the index; file I/O happens outside the
//! critical section once the reservation is booked.

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    size: u64,
    last_access: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    current_size: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkCacheStats {
    pub cached_chunks: usize,
    pub current_size_bytes: u64,
    pub max_size_bytes: u64,
    pub utilization_percent: f64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct ChunkCache {
    dir: PathBuf,
    max_size: u64,
    state: Mutex<CacheState>,
}

impl ChunkCache {
    pub fn new(dir: &Path, max_size_bytes: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        tracing::info!(
            dir = %dir.display(),
            max_mb = max_size_bytes / (1024 * 1024),
            "chunk cache initialized"
        );
        Ok(ChunkCache {
            dir: dir.to_path_buf(),
            max_size: max_size_bytes,
            state: Mutex::new(CacheState::default()),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.chunk"))
    }

    /// Cheap index-only membership probe (does not touch access time).
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let path = {
            let mut state = self.state.lock().unwrap();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.last_access = Instant::now();
                    let path = entry.path.clone();
                    state.hits += 1;
                    path
                }
                None => {
                    state.misses += 1;
                    return None;
                }
            }
        };
        match tokio::fs::read(&path).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                // file vanished or unreadable: drop the entry
                tracing::warn!(key, error = %e, "cached chunk unreadable, evicting");
                self.remove_entry(key);
                None
            }
        }
    }

    pub async fn put(&self, key: &str, data: Bytes) {
        let size = data.len() as u64;
        if size > self.max_size {
            tracing::debug!(key, size, "chunk larger than cache, skipping");
            return;
        }
        let path = self.entry_path(key);
        let mut evicted: Vec<PathBuf> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(old) = state.entries.remove(key) {
                state.current_size -= old.size;
            }
            while state.current_size + size > self.max_size && !state.entries.is_empty() {
                let lru_key = state
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone())
                    .unwrap();
                let entry = state.entries.remove(&lru_key).unwrap();
                state.current_size -= entry.size;
                evicted.push(entry.path);
            }
            state.entries.insert(
                key.to_string(),
                Entry {
                    path: path.clone(),
                    size,
                    last_access: Instant::now(),
                },
            );
            state.current_size += size;
        }
        for path in evicted {
            let _ = tokio::fs::remove_file(&path).await;
        }
        if let Err(e) = tokio::fs::write(&path, &data).await {
            tracing::warn!(key, error = %e, "failed to write chunk cache entry");
            self.remove_entry(key);
        }
    }

    fn remove_entry(&self, key: &str) {
        let path = {
            let mut state = self.state.lock().unwrap();
            match state.entries.remove(key) {
                Some(entry) => {
                    state.current_size -= entry.size;
                    entry.path
                }
                None => return,
            }
        };
        let _ = std::fs::remove_file(path);
    }

    pub fn clear(&self) {
        let paths: Vec<PathBuf> = {
            let mut state = self.state.lock().unwrap();
            let paths = state.entries.values().map(|e| e.path.clone()).collect();
            state.entries.clear();
            state.current_size = 0;
            paths
        };
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!("chunk cache cleared");
    }

    pub fn stats(&self) -> ChunkCacheStats {
        let state = self.state.lock().unwrap();
        ChunkCacheStats {
            cached_chunks: state.entries.len(),
            current_size_bytes: state.current_size,
            max_size_bytes: self.max_size,
            utilization_percent: if self.max_size > 0 {
                state.current_size as f64 / self.max_size as f64 * 100.0
            } else {
                0.0
            },
            hits: state.hits,
            misses: state.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: u64) -> (tempfile::TempDir, ChunkCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(dir.path(), max).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_d, cache) = cache(1024);
        cache.put("k1", Bytes::from_static(b"hello")).await;
        assert_eq!(cache.get("k1").await.unwrap(), Bytes::from_static(b"hello"));
        assert!(cache.get("k2").await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn size_bound_holds_under_eviction() {
        let (_d, cache) = cache(100);
        for i in 0..10 {
            cache.put(&format!("k{i}"), Bytes::from(vec![0u8; 30])).await;
            assert!(cache.stats().current_size_bytes <= 100);
        }
        // 100 / 30 -> at most 3 entries resident
        assert!(cache.stats().cached_chunks <= 3);
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let (_d, cache) = cache(100);
        cache.put("a", Bytes::from(vec![1u8; 40])).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("b", Bytes::from(vec![2u8; 40])).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // touch a so b becomes the LRU
        cache.get("a").await.unwrap();
        cache.put("c", Bytes::from(vec![3u8; 40])).await;
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[tokio::test]
    async fn oversized_chunk_not_cached() {
        let (_d, cache) = cache(10);
        cache.put("big", Bytes::from(vec![0u8; 100])).await;
        assert!(!cache.contains("big"));
        assert_eq!(cache.stats().current_size_bytes, 0);
    }

    #[tokio::test]
    async fn externally_deleted_file_is_evicted_on_get() {
        let (dir, cache) = cache(1024);
        cache.put("k", Bytes::from_static(b"data")).await;
        std::fs::remove_file(dir.path().join("k.chunk")).unwrap();
        assert!(cache.get("k").await.is_none());
        assert!(!cache.contains("k"));
        assert_eq!(cache.stats().current_size_bytes, 0);
    }

    #[tokio::test]
    async fn clear_removes_files() {
        let (dir, cache) = cache(1024);
        cache.put("k", Bytes::from_static(b"data")).await;
        cache.clear();
        assert_eq!(cache.stats().cached_chunks, 0);
        assert!(!dir.path().join("k.chunk").exists());
    }

    #[tokio::test]
    async fn overwrite_same_key_adjusts_size() {
        let (_d, cache) = cache(1024);
        cache.put("k", Bytes::from(vec![0u8; 100])).await;
        cache.put("k", Bytes::from(vec![0u8; 10])).await;
        assert_eq!(cache.stats().current_size_bytes, 10);
    }
}
