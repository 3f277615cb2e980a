//! In-memory [`BlobClient`] used by tests, demos, and configs that declare
//! remotes without backends. Supports taking a remote "offline" to exercise
//! failure paths.

use async_trait::async_trait;
use bytes::Bytes;
use rpool_core::{PoolError, PoolResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::client::{BlobClient, SpaceInfo};

const DEFAULT_CAPACITY: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug)]
struct RemoteState {
    objects: BTreeMap<String, Bytes>,
    capacity: u64,
    offline: bool,
}

impl RemoteState {
    fn used(&self) -> u64 {
        self.objects.values().map(|b| b.len() as u64).sum()
    }
}

#[derive(Debug, Default)]
pub struct MemoryClient {
    remotes: Mutex<HashMap<String, RemoteState>>,
}

impl MemoryClient {
    pub fn new(remotes: impl IntoIterator<Item = String>) -> Self {
        let map = remotes
            .into_iter()
            .map(|name| {
                (
                    name,
                    RemoteState {
                        objects: BTreeMap::new(),
                        capacity: DEFAULT_CAPACITY,
                        offline: false,
                    },
                )
            })
            .collect();
        MemoryClient {
            remotes: Mutex::new(map),
        }
    }

    pub fn set_capacity(&self, remote: &str, capacity: u64) {
        if let Some(state) = self.remotes.lock().unwrap().get_mut(remote) {
            state.capacity = capacity;
        }
    }

    /// Make every operation against `remote` fail until re-enabled.
    pub fn set_offline(&self, remote: &str, offline: bool) {
        if let Some(state) = self.remotes.lock().unwrap().get_mut(remote) {
            state.offline = offline;
        }
    }

    pub fn object_count(&self, remote: &str) -> usize {
        self.remotes
            .lock()
            .unwrap()
            .get(remote)
            .map(|s| s.objects.len())
            .unwrap_or(0)
    }

    fn with_remote<T>(
        &self,
        remote: &str,
        f: impl FnOnce(&mut RemoteState) -> PoolResult<T>,
    ) -> PoolResult<T> {
        let mut remotes = self.remotes.lock().unwrap();
        let state = remotes
            .get_mut(remote)
            .ok_or_else(|| PoolError::remote(remote, "unknown remote"))?;
        if state.offline {
            return Err(PoolError::remote(remote, "remote offline"));
        }
        f(state)
    }
}

#[async_trait]
impl BlobClient for MemoryClient {
    async fn upload(&self, remote: &str, path: &str, data: Bytes) -> PoolResult<()> {
        self.with_remote(remote, |state| {
            state.objects.insert(path.to_string(), data);
            Ok(())
        })
    }

    async fn download(&self, remote: &str, path: &str) -> PoolResult<Bytes> {
        self.with_remote(remote, |state| {
            state
                .objects
                .get(path)
                .cloned()
                .ok_or_else(|| PoolError::NotFound(format!("{remote}:{path}")))
        })
    }

    async fn download_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> PoolResult<Bytes> {
        self.with_remote(remote, |state| {
            let data = state
                .objects
                .get(path)
                .ok_or_else(|| PoolError::NotFound(format!("{remote}:{path}")))?;
            let start = (offset as usize).min(data.len());
            let end = (offset.saturating_add(length) as usize).min(data.len());
            Ok(data.slice(start..end))
        })
    }

    async fn delete(&self, remote: &str, path: &str) -> PoolResult<()> {
        self.with_remote(remote, |state| {
            state
                .objects
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| PoolError::NotFound(format!("{remote}:{path}")))
        })
    }

    async fn list(&self, remote: &str, prefix: &str) -> PoolResult<Vec<String>> {
        let dir = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };
        self.with_remote(remote, |state| {
            Ok(state
                .objects
                .keys()
                .filter_map(|key| key.strip_prefix(&dir))
                .filter(|rest| !rest.is_empty())
                .map(|rest| rest.to_string())
                .collect())
        })
    }

    async fn stat(&self, remote: &str, path: &str) -> PoolResult<u64> {
        self.with_remote(remote, |state| {
            state
                .objects
                .get(path)
                .map(|d| d.len() as u64)
                .ok_or_else(|| PoolError::NotFound(format!("{remote}:{path}")))
        })
    }

    async fn about(&self, remote: &str) -> PoolResult<SpaceInfo> {
        self.with_remote(remote, |state| {
            let used = state.used();
            Ok(SpaceInfo::new(
                used,
                state.capacity.saturating_sub(used),
                state.capacity,
            ))
        })
    }
}
