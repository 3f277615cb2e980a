//! OpenDAL-backed [`BlobClient`]: one `Operator` per configured remote.
//!
//! S3 uses path-style addressing (the opendal 0.55 default), which SeaweedFS
//! and MinIO require. Retries are handled by the wrapping [`RetryClient`],
//! not opendal's RetryLayer, so backoff behavior stays in one place.
//!
//! [`RetryClient`]: crate::retry::RetryClient

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use rpool_core::config::RemoteBackendConfig;
use rpool_core::{PoolConfig, PoolError, PoolResult};
use std::collections::HashMap;

use crate::client::{BlobClient, SpaceInfo};

pub struct OpendalClient {
    operators: HashMap<String, (Operator, Option<u64>)>,
}

impl OpendalClient {
    pub fn from_config(config: &PoolConfig) -> PoolResult<Self> {
        let mut operators = HashMap::new();
        for name in &config.remotes {
            let backend = config.remote_backends.get(name).ok_or_else(|| {
                PoolError::Policy(format!("remote {name} has no [remote_backends] entry"))
            })?;
            operators.insert(name.clone(), build_operator(name, backend)?);
        }
        Ok(OpendalClient { operators })
    }

    fn operator(&self, remote: &str) -> PoolResult<&(Operator, Option<u64>)> {
        self.operators
            .get(remote)
            .ok_or_else(|| PoolError::remote(remote, "unknown remote"))
    }
}

fn build_operator(
    name: &str,
    backend: &RemoteBackendConfig,
) -> PoolResult<(Operator, Option<u64>)> {
    let (op, capacity) = match backend {
        RemoteBackendConfig::S3 {
            endpoint,
            region,
            bucket,
            access_key_id,
            secret_access_key,
            root,
            capacity_bytes,
        } => {
            let mut builder = opendal::services::S3::default()
                .endpoint(endpoint)
                .region(region)
                .bucket(bucket)
                .access_key_id(access_key_id)
                .secret_access_key(secret_access_key);
            if let Some(root) = root {
                builder = builder.root(root);
            }
            (
                Operator::new(builder)
                    .map_err(|e| PoolError::remote(name, e))?
                    .layer(opendal::layers::LoggingLayer::default())
                    .finish(),
                *capacity_bytes,
            )
        }
        RemoteBackendConfig::Fs {
            root,
            capacity_bytes,
        } => {
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            (
                Operator::new(builder)
                    .map_err(|e| PoolError::remote(name, e))?
                    .layer(opendal::layers::LoggingLayer::default())
                    .finish(),
                *capacity_bytes,
            )
        }
    };
    Ok((op, capacity))
}

fn map_err(remote: &str, e: opendal::Error) -> PoolError {
    if e.kind() == opendal::ErrorKind::NotFound {
        PoolError::NotFound(format!("{remote}: {e}"))
    } else {
        PoolError::remote(remote, e)
    }
}

#[async_trait]
impl BlobClient for OpendalClient {
    async fn upload(&self, remote: &str, path: &str, data: Bytes) -> PoolResult<()> {
        let (op, _) = self.operator(remote)?;
        op.write(path, data)
            .await
            .map(|_| ())
            .map_err(|e| map_err(remote, e))
    }

    async fn download(&self, remote: &str, path: &str) -> PoolResult<Bytes> {
        let (op, _) = self.operator(remote)?;
        op.read(path)
            .await
            .map(|buf| buf.to_bytes())
            .map_err(|e| map_err(remote, e))
    }

    async fn download_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> PoolResult<Bytes> {
        let (op, _) = self.operator(remote)?;
        op.read_with(path)
            .range(offset..offset + length)
            .await
            .map(|buf| buf.to_bytes())
            .map_err(|e| map_err(remote, e))
    }

    async fn delete(&self, remote: &str, path: &str) -> PoolResult<()> {
        let (op, _) = self.operator(remote)?;
        op.delete(path).await.map_err(|e| map_err(remote, e))
    }

    async fn list(&self, remote: &str, prefix: &str) -> PoolResult<Vec<String>> {
        let (op, _) = self.operator(remote)?;
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let entries = match op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_err(remote, e)),
        };
        Ok(entries
            .into_iter()
            .filter(|e| e.metadata().mode().is_file())
            .map(|e| e.name().to_string())
            .collect())
    }

    async fn stat(&self, remote: &str, path: &str) -> PoolResult<u64> {
        let (op, _) = self.operator(remote)?;
        op.stat(path)
            .await
            .map(|meta| meta.content_length())
            .map_err(|e| map_err(remote, e))
    }

    async fn about(&self, remote: &str) -> PoolResult<SpaceInfo> {
        // Object stores rarely expose quotas; report the declared capacity
        // when configured, zeros otherwise.
        let (_, capacity) = self.operator(remote)?;
        Ok(match capacity {
            Some(total) => SpaceInfo::new(0, *total, *total),
            None => SpaceInfo::default(),
        })
    }
}
