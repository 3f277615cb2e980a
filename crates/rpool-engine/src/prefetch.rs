//! Background read-ahead into the chunk cache.
//!
//! One worker drains a bounded queue of `(key, remote, path)` triples;
//! offers that would overflow the queue are silently dropped, since
//! prefetch is strictly best-effort. `stop` cancels the worker and waits
//! up to five seconds for it to drain.

use rpool_storage::BlobClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chunk_cache::ChunkCache;

const QUEUE_DEPTH: usize = 64;
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub key: String,
    pub remote: String,
    pub path: String,
}

pub struct Prefetcher {
    tx: mpsc::Sender<PrefetchRequest>,
    cancel: CancellationToken,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Prefetcher {
    pub fn start(client: Arc<dyn BlobClient>, cache: Arc<ChunkCache>) -> Self {
        let (tx, mut rx) = mpsc::channel::<PrefetchRequest>(QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = token.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                if cache.contains(&request.key) {
                    continue;
                }
                match client.download(&request.remote, &request.path).await {
                    Ok(data) => {
                        tracing::debug!(key = %request.key, bytes = data.len(), "prefetched chunk");
                        cache.put(&request.key, data).await;
                    }
                    Err(e) => {
                        tracing::debug!(key = %request.key, error = %e, "prefetch failed");
                    }
                }
            }
            tracing::debug!("prefetch worker stopped");
        });
        Prefetcher {
            tx,
            cancel,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Offer chunks for read-ahead without blocking; overflow is dropped.
    pub fn request(&self, requests: impl IntoIterator<Item = PrefetchRequest>) {
        for request in requests {
            if self.tx.try_send(request).is_err() {
                tracing::debug!("prefetch queue full, dropping request");
                break;
            }
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if tokio::time::timeout(STOP_GRACE, worker).await.is_err() {
                tracing::warn!("prefetch worker did not stop within grace period");
            }
        }
    }
}
