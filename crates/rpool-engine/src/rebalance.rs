//! Imbalance analysis and chunk migration.
//!
//! A move follows write-new -> rewrite-manifest -> delete-old, so a crash
//! at any point leaves the chunk readable at its old location until the
//! manifest update commits. Per-chunk failures skip the move and the batch
//! continues.

use rpool_core::{PoolError, PoolResult};
use rpool_storage::BlobClient;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::manifest_store::ManifestStore;

#[derive(Debug, Clone, Serialize)]
pub struct RemoteBalance {
    pub used: u64,
    pub free: u64,
    pub total: u64,
    pub utilization: f64,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceAnalysis {
    pub remote_usage: BTreeMap<String, RemoteBalance>,
    pub avg_utilization: f64,
    pub max_utilization: f64,
    pub min_utilization: f64,
    pub variance: f64,
    pub is_balanced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStatus {
    AlreadyBalanced,
    NoActionNeeded,
    DryRun,
    Completed,
}

impl RebalanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceStatus::AlreadyBalanced => "already_balanced",
            RebalanceStatus::NoActionNeeded => "no_action_needed",
            RebalanceStatus::DryRun => "dry_run",
            RebalanceStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkMove {
    pub file_path: String,
    pub chunk_index: u32,
    pub source_remote: String,
    pub target_remote: String,
    pub chunk_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebalanceOutcome {
    pub status: RebalanceStatus,
    pub moves: Vec<ChunkMove>,
}

pub struct Rebalancer {
    client: Arc<dyn BlobClient>,
    store: Arc<ManifestStore>,
    remotes: Vec<String>,
    threshold: f64,
}

impl Rebalancer {
    pub fn new(
        client: Arc<dyn BlobClient>,
        store: Arc<ManifestStore>,
        remotes: Vec<String>,
        threshold: f64,
    ) -> Self {
        Rebalancer {
            client,
            store,
            remotes,
            threshold,
        }
    }

    /// Usage spread across remotes; `variance` is max - min utilization in
    /// percentage points. Chunk counts come from live manifests.
    pub async fn analyze(&self) -> PoolResult<BalanceAnalysis> {
        let mut usage: BTreeMap<String, RemoteBalance> = BTreeMap::new();
        for remote in &self.remotes {
            let space = self.client.about(remote).await.unwrap_or_default().normalized();
            usage.insert(
                remote.clone(),
                RemoteBalance {
                    used: space.used,
                    free: space.free,
                    total: space.total,
                    utilization: space.utilization(),
                    chunk_count: 0,
                },
            );
        }

        for manifest in self.store.list("/", true).await? {
            for chunk in &manifest.chunks {
                if let Some(balance) = usage.get_mut(&chunk.remote) {
                    balance.chunk_count += 1;
                }
            }
        }

        let utilizations: Vec<f64> = usage.values().map(|r| r.utilization).collect();
        let avg = if utilizations.is_empty() {
            0.0
        } else {
            utilizations.iter().sum::<f64>() / utilizations.len() as f64
        };
        let max = utilizations.iter().cloned().fold(0.0, f64::max);
        let min = utilizations.iter().cloned().fold(f64::INFINITY, f64::min);
        let min = if min.is_finite() { min } else { 0.0 };
        let variance = max - min;

        let analysis = BalanceAnalysis {
            remote_usage: usage,
            avg_utilization: avg,
            max_utilization: max,
            min_utilization: min,
            variance,
            is_balanced: variance < self.threshold,
        };
        tracing::info!(
            avg = format!("{avg:.1}"),
            variance = format!("{variance:.1}"),
            balanced = analysis.is_balanced,
            "balance analyzed"
        );
        Ok(analysis)
    }

    pub async fn rebalance(
        &self,
        target_variance: f64,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> PoolResult<RebalanceOutcome> {
        let mut analysis = self.analyze().await?;
        if analysis.is_balanced {
            return Ok(RebalanceOutcome {
                status: RebalanceStatus::AlreadyBalanced,
                moves: Vec::new(),
            });
        }

        let avg = analysis.avg_utilization;
        let over: Vec<String> = analysis
            .remote_usage
            .iter()
            .filter(|(_, b)| b.utilization > avg + target_variance)
            .map(|(name, _)| name.clone())
            .collect();
        let under: Vec<String> = analysis
            .remote_usage
            .iter()
            .filter(|(_, b)| b.utilization < avg - target_variance)
            .map(|(name, _)| name.clone())
            .collect();
        tracing::info!(over = over.len(), under = under.len(), "partitioned remotes");

        if over.is_empty() || under.is_empty() {
            return Ok(RebalanceOutcome {
                status: RebalanceStatus::NoActionNeeded,
                moves: Vec::new(),
            });
        }

        let moves = self.plan_moves(&over, &under, &mut analysis).await?;
        tracing::info!(planned = moves.len(), "move plan ready");

        if dry_run {
            return Ok(RebalanceOutcome {
                status: RebalanceStatus::DryRun,
                moves,
            });
        }

        let executed = self.execute_moves(moves, cancel).await?;
        tracing::info!(moved = executed.len(), "rebalance finished");
        Ok(RebalanceOutcome {
            status: RebalanceStatus::Completed,
            moves: executed,
        })
    }

    /// Plan moves from each over-utilized remote, largest chunks first, to
    /// whichever under-utilized remote currently sits lowest. Simulated
    /// utilizations are updated after each planned move; a source stops
    /// once it sits within 5 points of its target.
    async fn plan_moves(
        &self,
        over: &[String],
        under: &[String],
        analysis: &mut BalanceAnalysis,
    ) -> PoolResult<Vec<ChunkMove>> {
        let manifests = self.store.list("/", true).await?;
        let mut moves = Vec::new();

        for source in over {
            let mut candidates: Vec<ChunkMove> = manifests
                .iter()
                .flat_map(|m| {
                    m.chunks
                        .iter()
                        .filter(|c| c.remote == *source)
                        .map(|c| ChunkMove {
                            file_path: m.file_path.clone(),
                            chunk_index: c.index,
                            source_remote: source.clone(),
                            target_remote: String::new(),
                            chunk_path: c.path.clone(),
                            size: c.stored_len(),
                        })
                })
                .collect();
            candidates.sort_by(|a, b| b.size.cmp(&a.size));

            for mut candidate in candidates {
                let Some(target) = under
                    .iter()
                    .min_by(|a, b| {
                        let ua = analysis.remote_usage[*a].utilization;
                        let ub = analysis.remote_usage[*b].utilization;
                        ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned()
                else {
                    break;
                };
                candidate.target_remote = target.clone();
                let size = candidate.size;
                moves.push(candidate);

                {
                    let source_balance = analysis.remote_usage.get_mut(source).unwrap();
                    source_balance.used = source_balance.used.saturating_sub(size);
                    source_balance.utilization = utilization(source_balance);
                }
                {
                    let target_balance = analysis.remote_usage.get_mut(&target).unwrap();
                    target_balance.used += size;
                    target_balance.utilization = utilization(target_balance);
                }

                let diff = (analysis.remote_usage[source].utilization
                    - analysis.remote_usage[&target].utilization)
                    .abs();
                if diff < 5.0 {
                    break;
                }
            }
        }
        Ok(moves)
    }

    async fn execute_moves(
        &self,
        moves: Vec<ChunkMove>,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<ChunkMove>> {
        let mut executed = Vec::new();
        for chunk_move in moves {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            match self.execute_one(&chunk_move).await {
                Ok(()) => executed.push(chunk_move),
                Err(e) => {
                    tracing::error!(
                        path = %chunk_move.file_path,
                        chunk = chunk_move.chunk_index,
                        error = %e,
                        "move failed, chunk stays on source"
                    );
                }
            }
        }
        Ok(executed)
    }

    async fn execute_one(&self, chunk_move: &ChunkMove) -> PoolResult<()> {
        tracing::info!(
            path = %chunk_move.file_path,
            chunk = chunk_move.chunk_index,
            from = %chunk_move.source_remote,
            to = %chunk_move.target_remote,
            "moving chunk"
        );
        let data = self
            .client
            .download(&chunk_move.source_remote, &chunk_move.chunk_path)
            .await?;
        self.client
            .upload(&chunk_move.target_remote, &chunk_move.chunk_path, data)
            .await?;

        let mut manifest = self
            .store
            .load(&chunk_move.file_path)
            .await?
            .ok_or_else(|| PoolError::NotFound(chunk_move.file_path.clone()))?;
        let chunk = manifest
            .chunks
            .iter_mut()
            .find(|c| c.index == chunk_move.chunk_index)
            .ok_or_else(|| {
                PoolError::Integrity(format!("chunk {} vanished from manifest", chunk_move.chunk_index))
            })?;
        chunk.remote = chunk_move.target_remote.clone();
        if let Err(e) = self.store.save(&manifest).await {
            // manifest still points at the source: roll the new copy back
            let _ = self
                .client
                .delete(&chunk_move.target_remote, &chunk_move.chunk_path)
                .await;
            return Err(e);
        }

        match self
            .client
            .delete(&chunk_move.source_remote, &chunk_move.chunk_path)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(error = %e, "source copy not deleted, will surface as orphan");
            }
        }
        Ok(())
    }
}

fn utilization(balance: &RemoteBalance) -> f64 {
    if balance.total == 0 {
        0.0
    } else {
        balance.used as f64 / balance.total as f64 * 100.0
    }
}
