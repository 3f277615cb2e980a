use async_trait::async_trait;
use bytes::Bytes;
use rpool_core::PoolResult;
use serde::{Deserialize, Serialize};

/// Space usage reported by a remote. All values in bytes; a backend that
/// cannot report usage returns zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub used: u64,
    pub free: u64,
    pub total: u64,
}

impl SpaceInfo {
    pub fn new(used: u64, free: u64, total: u64) -> Self {
        Self { used, free, total }
    }

    /// Derive a missing `total` as `used + free`.
    pub fn normalized(mut self) -> Self {
        if self.total == 0 {
            self.total = self.used + self.free;
        }
        self
    }

    /// `used / total` as a percentage; 0 when total is unknown.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

/// Uniform byte I/O against one named remote.
///
/// Implementations must be safe to call concurrently from any number of
/// tasks. Callers treat delete-of-missing as idempotent success; the client
/// reports it as `NotFound` and leaves the decision to the call site.
#[async_trait]
pub trait BlobClient: Send + Sync + 'static {
    async fn upload(&self, remote: &str, path: &str, data: Bytes) -> PoolResult<()>;

    async fn download(&self, remote: &str, path: &str) -> PoolResult<Bytes>;

    /// Byte-range read. Backends with server-side range support must use it;
    /// others may emulate by downloading and slicing.
    async fn download_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> PoolResult<Bytes>;

    async fn delete(&self, remote: &str, path: &str) -> PoolResult<()>;

    /// Object names directly under `prefix`. An empty listing is distinct
    /// from an error.
    async fn list(&self, remote: &str, prefix: &str) -> PoolResult<Vec<String>>;

    /// Object size in bytes.
    async fn stat(&self, remote: &str, path: &str) -> PoolResult<u64>;

    async fn about(&self, remote: &str) -> PoolResult<SpaceInfo>;

    /// Existence probe, implemented as a 1-byte range read by default.
    async fn exists(&self, remote: &str, path: &str) -> PoolResult<bool> {
        match self.download_range(remote, path, 0, 1).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
