//! Retry with exponential backoff, plus per-call timeouts.
//!
//! Every primitive is given `io_timeout` to complete; a timeout counts as a
//! transient remote failure. Transient failures are retried with
//! `delay_i = min(base * factor^i, max)`; `NotFound`, policy, and auth
//! errors surface immediately.

use async_trait::async_trait;
use bytes::Bytes;
use rpool_core::config::RetryConfig;
use rpool_core::{PoolError, PoolResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{BlobClient, SpaceInfo};

pub struct RetryClient {
    inner: Arc<dyn BlobClient>,
    policy: RetryConfig,
    io_timeout: Duration,
}

impl RetryClient {
    pub fn new(inner: Arc<dyn BlobClient>, policy: RetryConfig, io_timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            io_timeout,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let ms = (self.policy.base_delay_ms as f64 * self.policy.factor.powi(attempt as i32))
            .min(self.policy.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    async fn run<T, F, Fut>(&self, op: &str, remote: &str, mut call: F) -> PoolResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PoolResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.io_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(PoolError::remote(
                    remote,
                    format!("{op} timed out after {:?}", self.io_timeout),
                )),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        op,
                        remote,
                        attempt,
                        max = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl BlobClient for RetryClient {
    async fn upload(&self, remote: &str, path: &str, data: Bytes) -> PoolResult<()> {
        self.run("upload", remote, || {
            self.inner.upload(remote, path, data.clone())
        })
        .await
    }

    async fn download(&self, remote: &str, path: &str) -> PoolResult<Bytes> {
        self.run("download", remote, || self.inner.download(remote, path))
            .await
    }

    async fn download_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> PoolResult<Bytes> {
        self.run("download_range", remote, || {
            self.inner.download_range(remote, path, offset, length)
        })
        .await
    }

    async fn delete(&self, remote: &str, path: &str) -> PoolResult<()> {
        self.run("delete", remote, || self.inner.delete(remote, path))
            .await
    }

    async fn list(&self, remote: &str, prefix: &str) -> PoolResult<Vec<String>> {
        self.run("list", remote, || self.inner.list(remote, prefix))
            .await
    }

    async fn stat(&self, remote: &str, path: &str) -> PoolResult<u64> {
        self.run("stat", remote, || self.inner.stat(remote, path))
            .await
    }

    async fn about(&self, remote: &str) -> PoolResult<SpaceInfo> {
        self.run("about", remote, || self.inner.about(remote)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls of every operation, then delegates.
    struct Flaky {
        inner: crate::memory::MemoryClient,
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn gate(&self, remote: &str) -> PoolResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(PoolError::remote(remote, "transient"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BlobClient for Flaky {
        async fn upload(&self, remote: &str, path: &str, data: Bytes) -> PoolResult<()> {
            self.gate(remote)?;
            self.inner.upload(remote, path, data).await
        }
        async fn download(&self, remote: &str, path: &str) -> PoolResult<Bytes> {
            self.gate(remote)?;
            self.inner.download(remote, path).await
        }
        async fn download_range(
            &self,
            remote: &str,
            path: &str,
            offset: u64,
            length: u64,
        ) -> PoolResult<Bytes> {
            self.gate(remote)?;
            self.inner.download_range(remote, path, offset, length).await
        }
        async fn delete(&self, remote: &str, path: &str) -> PoolResult<()> {
            self.gate(remote)?;
            self.inner.delete(remote, path).await
        }
        async fn list(&self, remote: &str, prefix: &str) -> PoolResult<Vec<String>> {
            self.gate(remote)?;
            self.inner.list(remote, prefix).await
        }
        async fn stat(&self, remote: &str, path: &str) -> PoolResult<u64> {
            self.gate(remote)?;
            self.inner.stat(remote, path).await
        }
        async fn about(&self, remote: &str) -> PoolResult<SpaceInfo> {
            self.gate(remote)?;
            self.inner.about(remote).await
        }
    }

    fn fast_policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let flaky = Arc::new(Flaky {
            inner: crate::memory::MemoryClient::new(["r".to_string()]),
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let client = RetryClient::new(flaky, fast_policy(3), Duration::from_secs(5));
        client
            .upload("r", "x", Bytes::from_static(b"ok"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let flaky = Arc::new(Flaky {
            inner: crate::memory::MemoryClient::new(["r".to_string()]),
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let client = RetryClient::new(flaky, fast_policy(2), Duration::from_secs(5));
        let err = client
            .upload("r", "x", Bytes::from_static(b"ok"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Remote { .. }));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let inner = Arc::new(crate::memory::MemoryClient::new(["r".to_string()]));
        let client = RetryClient::new(inner, fast_policy(3), Duration::from_secs(5));
        let start = std::time::Instant::now();
        assert!(client.download("r", "missing").await.unwrap_err().is_not_found());
        // no backoff sleeps happened
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn backoff_is_capped() {
        let inner = Arc::new(crate::memory::MemoryClient::new(std::iter::empty::<String>()));
        let client = RetryClient::new(
            inner,
            RetryConfig {
                max_retries: 10,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                factor: 2.0,
            },
            Duration::from_secs(600),
        );
        assert_eq!(client.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(client.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(client.delay_for(10), Duration::from_millis(60_000));
    }
}
