//! Remote reachability check

use rpool_core::PoolResult;

use crate::client::BlobClient;

/// Verify a remote is reachable; a usage query is the lightest probe.
pub async fn check_health(client: &dyn BlobClient, remote: &str) -> PoolResult<()> {
    client.about(remote).await.map(|_| ())
}

/// Returns true if the remote is reachable, false otherwise (non-panicking).
pub async fn is_healthy(client: &dyn BlobClient, remote: &str) -> bool {
    check_health(client, remote).await.is_ok()
}
