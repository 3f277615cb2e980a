//! Per-chunk remote selection.
//!
//! The balancer keeps a usage table lazily populated from `about()` and
//! adjusted locally by `record_usage` as chunks land, so a long upload does
//! not hammer the remotes with quota queries. All selection state lives
//! behind one mutex; `next`, `record_usage`, and the policy setters
//! serialize under it.

use rand::Rng;
use rpool_core::config::BalancingStrategy;
use rpool_core::PoolConfig;
use rpool_storage::BlobClient;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Usage and policy attributes of one remote.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteStatus {
    pub name: String,
    pub used: u64,
    pub free: u64,
    pub total: u64,
    pub weight: f64,
    pub priority: i64,
    pub enabled: bool,
}

impl RemoteStatus {
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug)]
struct BalancerState {
    strategy: BalancingStrategy,
    info: HashMap<String, RemoteStatus>,
    round_robin_index: usize,
    initialized: bool,
    weights: HashMap<String, f64>,
    priorities: HashMap<String, i64>,
}

pub struct Balancer {
    client: Arc<dyn BlobClient>,
    remotes: Vec<String>,
    state: Mutex<BalancerState>,
}

impl Balancer {
    pub fn new(client: Arc<dyn BlobClient>, config: &PoolConfig) -> Self {
        Balancer {
            client,
            remotes: config.remotes.clone(),
            state: Mutex::new(BalancerState {
                strategy: config.balancing_strategy,
                info: HashMap::new(),
                round_robin_index: 0,
                initialized: false,
                weights: config.remote_weights.clone(),
                priorities: config.remote_priorities.clone(),
            }),
        }
    }

    async fn ensure_initialized(&self, state: &mut BalancerState) {
        if state.initialized {
            return;
        }
        for remote in &self.remotes {
            let space = match self.client.about(remote).await {
                Ok(space) => space.normalized(),
                Err(e) => {
                    tracing::warn!(remote = %remote, error = %e, "about() failed, assuming empty");
                    Default::default()
                }
            };
            let status = RemoteStatus {
                name: remote.clone(),
                used: space.used,
                free: space.free,
                total: space.total,
                weight: state.weights.get(remote).copied().unwrap_or(1.0),
                priority: state.priorities.get(remote).copied().unwrap_or(0),
                enabled: true,
            };
            tracing::debug!(
                remote = %remote,
                used = status.used,
                free = status.free,
                weight = status.weight,
                priority = status.priority,
                "balancer remote initialized"
            );
            state.info.insert(remote.clone(), status);
        }
        state.initialized = true;
    }

    pub async fn set_strategy(&self, strategy: BalancingStrategy) {
        let mut state = self.state.lock().await;
        state.strategy = strategy;
        tracing::info!(strategy = ?strategy, "balancing strategy changed");
    }

    pub async fn set_weight(&self, remote: &str, weight: f64) {
        let mut state = self.state.lock().await;
        state.weights.insert(remote.to_string(), weight);
        if let Some(info) = state.info.get_mut(remote) {
            info.weight = weight;
        }
    }

    pub async fn set_priority(&self, remote: &str, priority: i64) {
        let mut state = self.state.lock().await;
        state.priorities.insert(remote.to_string(), priority);
        if let Some(info) = state.info.get_mut(remote) {
            info.priority = priority;
        }
    }

    pub async fn set_enabled(&self, remote: &str, enabled: bool) {
        let mut state = self.state.lock().await;
        if let Some(info) = state.info.get_mut(remote) {
            info.enabled = enabled;
        }
    }

    /// Pick the remote for the next chunk under the current strategy.
    ///
    /// Falls back to the first configured remote when no enabled remote has
    /// free space (degenerate but keeps uploads limping along).
    pub async fn next(&self) -> String {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await;

        let mut candidates: Vec<RemoteStatus> = state
            .info
            .values()
            .filter(|r| r.enabled && r.free > 0)
            .cloned()
            .collect();

        if candidates.is_empty() {
            tracing::warn!("no enabled remotes with free space, falling back to first configured");
            return self.remotes.first().cloned().unwrap_or_default();
        }

        let strategy = state.strategy;
        match strategy {
            BalancingStrategy::LeastUsed => {
                candidates.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.used.cmp(&b.used))
                        .then(a.name.cmp(&b.name))
                });
                candidates[0].name.clone()
            }
            BalancingStrategy::RoundRobin => {
                candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
                let picked = candidates[state.round_robin_index % candidates.len()]
                    .name
                    .clone();
                state.round_robin_index += 1;
                picked
            }
            BalancingStrategy::Weighted => {
                let tier = top_priority_tier(&mut candidates);
                let total: f64 = tier.iter().map(|r| r.weight).sum();
                if total <= 0.0 {
                    return tier[0].name.clone();
                }
                let r = rand::thread_rng().gen_range(0.0..total);
                let mut cumulative = 0.0;
                for remote in &tier {
                    cumulative += remote.weight;
                    if cumulative >= r {
                        return remote.name.clone();
                    }
                }
                tier[0].name.clone()
            }
            BalancingStrategy::Random => {
                let tier = top_priority_tier(&mut candidates);
                let idx = rand::thread_rng().gen_range(0..tier.len());
                tier[idx].name.clone()
            }
            BalancingStrategy::RoundRobinLeastUsed => {
                let tier = top_priority_tier(&mut candidates);
                let mut picked = tier[state.round_robin_index % tier.len()].clone();
                state.round_robin_index += 1;
                let least = tier
                    .iter()
                    .min_by(|a, b| {
                        a.utilization()
                            .partial_cmp(&b.utilization())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned()
                    .unwrap_or_else(|| picked.clone());
                if picked.utilization() - least.utilization() > 10.0 {
                    tracing::debug!(
                        picked = %picked.name,
                        substitute = %least.name,
                        "round-robin pick substituted by least-utilized"
                    );
                    picked = least;
                }
                picked.name.clone()
            }
        }
    }

    /// Adjust the cached usage view after an upload or delete; no remote
    /// round-trip.
    pub async fn record_usage(&self, remote: &str, bytes_added: i64) {
        let mut state = self.state.lock().await;
        if let Some(info) = state.info.get_mut(remote) {
            if bytes_added >= 0 {
                info.used = info.used.saturating_add(bytes_added as u64);
                info.free = info.free.saturating_sub(bytes_added as u64);
            } else {
                info.used = info.used.saturating_sub((-bytes_added) as u64);
                info.free = info.free.saturating_add((-bytes_added) as u64);
            }
        }
    }

    pub async fn usage_report(&self) -> BTreeMap<String, RemoteStatus> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await;
        state
            .info
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect()
    }

    /// Drop the cached usage table; the next call re-queries `about()`.
    pub async fn refresh(&self) {
        let mut state = self.state.lock().await;
        state.info.clear();
        state.initialized = false;
    }
}

/// Restrict sorted candidates to the highest-priority tier, name-ordered.
fn top_priority_tier(candidates: &mut [RemoteStatus]) -> Vec<RemoteStatus> {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
    let top = candidates[0].priority;
    candidates
        .iter()
        .filter(|r| r.priority == top)
        .cloned()
        .collect()
}
