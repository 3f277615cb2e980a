//! Uniform per-remote byte I/O for the pool.
//!
//! [`BlobClient`] is the seam between the pool engine and whatever actually
//! stores bytes: OpenDAL-backed remotes in production, an in-memory map in
//! tests. Retry and bandwidth throttling are stacked on as wrapping clients
//! so the engine never needs to know about either.

pub mod client;
pub mod health;
pub mod memory;
pub mod operator;
pub mod retry;
pub mod throttle;

pub use client::{BlobClient, SpaceInfo};
pub use health::{check_health, is_healthy};
pub use memory::MemoryClient;
pub use operator::OpendalClient;
pub use retry::RetryClient;
pub use throttle::{ThrottledClient, Throttler};

use rpool_core::{PoolConfig, PoolResult};
use std::sync::Arc;

/// Build the client stack for a configuration: backend client, then retry
/// with per-call timeouts, then bandwidth throttling (when limits are set).
///
/// Remotes without a `[remote_backends]` entry are served by a shared
/// in-memory client, which keeps demo and test configs trivial.
pub fn build_client(config: &PoolConfig) -> PoolResult<Arc<dyn BlobClient>> {
    let base: Arc<dyn BlobClient> = if config.remote_backends.is_empty() {
        Arc::new(MemoryClient::new(config.remotes.iter().cloned()))
    } else {
        Arc::new(OpendalClient::from_config(config)?)
    };

    let retried: Arc<dyn BlobClient> = Arc::new(RetryClient::new(
        base,
        config.retry,
        std::time::Duration::from_secs(config.io_timeout_secs),
    ));

    if config.bandwidth_limit_upload_mbps > 0.0 || config.bandwidth_limit_download_mbps > 0.0 {
        Ok(Arc::new(ThrottledClient::new(
            retried,
            Throttler::new(
                config.bandwidth_limit_upload_mbps,
                config.bandwidth_limit_download_mbps,
            ),
        )))
    } else {
        Ok(retried)
    }
}
