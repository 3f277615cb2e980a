//! Token-bucket bandwidth limiting.
//!
//! Two independent buckets (upload, download), each with capacity
//! `2 x rate`. Before an I/O of `n` bytes the bucket is refilled by
//! `elapsed * rate` and `n` tokens are consumed; a deficit sleeps for
//! `deficit / rate` and resets the bucket to zero. A rate of 0 disables the
//! bucket entirely.

use async_trait::async_trait;
use bytes::Bytes;
use rpool_core::PoolResult;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::client::{BlobClient, SpaceInfo};

#[derive(Debug)]
struct Bucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(rate_bytes_per_sec: f64) -> Self {
        Bucket {
            rate: rate_bytes_per_sec,
            tokens: 0.0,
            last: Instant::now(),
        }
    }

    /// Returns how long the caller must sleep before proceeding.
    fn consume(&mut self, n: u64) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;

        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate * 2.0);
        self.tokens -= n as f64;

        if self.tokens < 0.0 {
            let sleep = Duration::from_secs_f64(-self.tokens / self.rate);
            self.tokens = 0.0;
            sleep
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug)]
pub struct Throttler {
    buckets: Mutex<(Bucket, Bucket)>,
}

impl Throttler {
    /// Rates in MB/s; 0 means unlimited.
    pub fn new(upload_mbps: f64, download_mbps: f64) -> Self {
        Throttler {
            buckets: Mutex::new((
                Bucket::new(upload_mbps * 1024.0 * 1024.0),
                Bucket::new(download_mbps * 1024.0 * 1024.0),
            )),
        }
    }

    pub async fn throttle_upload(&self, n: u64) {
        let sleep = self.buckets.lock().unwrap().0.consume(n);
        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }
    }

    pub async fn throttle_download(&self, n: u64) {
        let sleep = self.buckets.lock().unwrap().1.consume(n);
        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }
    }
}

/// [`BlobClient`] wrapper applying the throttler around transfers.
pub struct ThrottledClient {
    inner: Arc<dyn BlobClient>,
    throttler: Arc<Throttler>,
}

impl ThrottledClient {
    pub fn new(inner: Arc<dyn BlobClient>, throttler: Throttler) -> Self {
        Self {
            inner,
            throttler: Arc::new(throttler),
        }
    }
}

#[async_trait]
impl BlobClient for ThrottledClient {
    async fn upload(&self, remote: &str, path: &str, data: Bytes) -> PoolResult<()> {
        self.throttler.throttle_upload(data.len() as u64).await;
        self.inner.upload(remote, path, data).await
    }

    async fn download(&self, remote: &str, path: &str) -> PoolResult<Bytes> {
        let data = self.inner.download(remote, path).await?;
        self.throttler.throttle_download(data.len() as u64).await;
        Ok(data)
    }

    async fn download_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> PoolResult<Bytes> {
        let data = self
            .inner
            .download_range(remote, path, offset, length)
            .await?;
        self.throttler.throttle_download(data.len() as u64).await;
        Ok(data)
    }

    async fn delete(&self, remote: &str, path: &str) -> PoolResult<()> {
        self.inner.delete(remote, path).await
    }

    async fn list(&self, remote: &str, prefix: &str) -> PoolResult<Vec<String>> {
        self.inner.list(remote, prefix).await
    }

    async fn stat(&self, remote: &str, path: &str) -> PoolResult<u64> {
        self.inner.stat(remote, path).await
    }

    async fn about(&self, remote: &str) -> PoolResult<SpaceInfo> {
        self.inner.about(remote).await
    }
}
