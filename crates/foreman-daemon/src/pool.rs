//! Warm pool of pre-spawned idle workers.
//!
//! For every profile with a warm-pool entry (and a spawn policy that allows
//! the warm-pool pathway) the [`WarmPool`] keeps `size` idle instances parked
//! in the supervisor. Claiming one triggers an immediate refill. Idle
//! instances older than `idle_timeout_ms` are stopped down to `min_idle`, and
//! the profile goes dormant (refilled only to `min_idle`) until the next
//! demand for it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tracing::{debug, info, warn};

use foreman_core::config::{SpawnPolicyConfig, WarmPoolConfig, WarmPoolEntry};

use crate::events::{EventBus, ForemanEvent};
use crate::now_millis;
use crate::policy::{self, SpawnPathway};
use crate::supervisor::WorkerSupervisor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub profile_id: String,
    pub target: usize,
    pub idle: usize,
    pub dormant: bool,
}

pub struct WarmPool {
    supervisor: WorkerSupervisor,
    config: WarmPoolConfig,
    policy: Arc<RwLock<SpawnPolicyConfig>>,
    dormant: Mutex<HashSet<String>>,
    /// Serializes refills so concurrent triggers cannot overshoot the target.
    fill_lock: Mutex<()>,
}

impl WarmPool {
    pub fn new(
        supervisor: WorkerSupervisor,
        config: WarmPoolConfig,
        policy: Arc<RwLock<SpawnPolicyConfig>>,
    ) -> Self {
        Self {
            supervisor,
            config,
            policy,
            dormant: Mutex::new(HashSet::new()),
            fill_lock: Mutex::new(()),
        }
    }

    /// Profiles that currently get a warm pool, in a stable order.
    pub async fn enabled_profiles(&self) -> Vec<(String, WarmPoolEntry)> {
        let policy = self.policy.read().await;
        let mut enabled: Vec<_> = self
            .config
            .profiles
            .iter()
            .filter(|(id, entry)| {
                entry.size > 0 && policy::can_spawn(&policy, id, SpawnPathway::WarmPool)
            })
            .map(|(id, entry)| (id.clone(), *entry))
            .collect();
        enabled.sort_by(|a, b| a.0.cmp(&b.0));
        enabled
    }

    async fn entry(&self, profile_id: &str) -> Option<WarmPoolEntry> {
        let entry = *self.config.profiles.get(profile_id)?;
        let allowed = policy::can_spawn(
            &*self.policy.read().await,
            profile_id,
            SpawnPathway::WarmPool,
        );
        (allowed && entry.size > 0).then_some(entry)
    }

    async fn target(&self, profile_id: &str, entry: &WarmPoolEntry) -> usize {
        if self.dormant.lock().await.contains(profile_id) {
            entry.min_idle.min(entry.size)
        } else {
            entry.size
        }
    }

    /// Top up the idle instances of one profile. Returns how many were spawned.
    pub async fn fill(&self, profile_id: &str) -> usize {
        let Some(entry) = self.entry(profile_id).await else {
            return 0;
        };
        let _guard = self.fill_lock.lock().await;
        let target = self.target(profile_id, &entry).await;
        let idle = self.supervisor.idle_warm_instances(profile_id).await.len();

        let mut spawned = 0;
        for _ in idle..target {
            match self.supervisor.spawn_warm(profile_id).await {
                Ok(instance) => {
                    debug!(worker_id = %profile_id, instance_id = %instance.instance_id, "Warm worker parked");
                    spawned += 1;
                }
                Err(e) => {
                    warn!(worker_id = %profile_id, error = %e, "Warm pool refill failed");
                    break;
                }
            }
        }
        if spawned > 0 {
            info!(worker_id = %profile_id, spawned, target, "Warm pool refilled");
        }
        spawned
    }

    pub async fn fill_all(&self) -> usize {
        let mut spawned = 0;
        for (profile_id, _) in self.enabled_profiles().await {
            spawned += self.fill(&profile_id).await;
        }
        spawned
    }

    /// Stop idle instances past their idle timeout, keeping `min_idle`.
    /// Returns how many were stopped.
    pub async fn evict_idle(&self) -> usize {
        let now = now_millis();
        let mut evicted = 0;
        for (profile_id, entry) in self.enabled_profiles().await {
            let idle = self.supervisor.idle_warm_instances(&profile_id).await;
            let removable = idle.len().saturating_sub(entry.min_idle);
            let expired = idle
                .iter()
                .filter(|i| now.saturating_sub(i.last_activity) >= entry.idle_timeout_ms)
                .take(removable);

            let mut profile_evicted = 0;
            for instance in expired {
                if self.supervisor.stop_instance(&instance.instance_id).await {
                    profile_evicted += 1;
                }
            }
            if profile_evicted > 0 {
                self.dormant.lock().await.insert(profile_id.clone());
                info!(worker_id = %profile_id, evicted = profile_evicted, "Evicted idle warm workers");
                evicted += profile_evicted;
            }
        }
        evicted
    }

    /// A worker for `profile_id` was wanted: wake the pool and refill it.
    pub async fn note_demand(&self, profile_id: &str) {
        if self.entry(profile_id).await.is_none() {
            return;
        }
        if self.dormant.lock().await.remove(profile_id) {
            debug!(worker_id = %profile_id, "Warm pool leaves dormancy");
        }
        self.fill(profile_id).await;
    }

    pub async fn is_dormant(&self, profile_id: &str) -> bool {
        self.dormant.lock().await.contains(profile_id)
    }

    pub async fn status(&self) -> Vec<PoolStatus> {
        let mut out = Vec::new();
        for (profile_id, entry) in self.enabled_profiles().await {
            out.push(PoolStatus {
                target: self.target(&profile_id, &entry).await,
                idle: self.supervisor.idle_warm_instances(&profile_id).await.len(),
                dormant: self.is_dormant(&profile_id).await,
                profile_id,
            });
        }
        out
    }

    /// Periodic eviction and refill, plus immediate refill on claims and
    /// on-demand spawns, until shutdown.
    pub fn spawn_maintenance_task(
        self: Arc<Self>,
        events: &EventBus,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.maintenance_interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.evict_idle().await;
                        self.fill_all().await;
                    }
                    event = rx.recv() => match event {
                        Ok(ForemanEvent::WorkerClaimed { worker_id, .. }) => {
                            self.note_demand(&worker_id).await;
                        }
                        Ok(ForemanEvent::WorkerSpawned { worker_id, pathway, .. })
                            if pathway != SpawnPathway::WarmPool =>
                        {
                            self.note_demand(&worker_id).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Warm pool lagged behind events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.changed() => {
                        info!("Warm pool maintenance shutting down");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::backend::ScriptedBackend;
    use crate::session::SessionManager;
    use crate::supervisor::{SupervisorDeps, SupervisorSettings};
    use foreman_core::config::{DaemonConfig, SpawnPolicyEntry};
    use foreman_core::{ProfileCatalog, WorkerProfile};

    fn pool_with(
        entry: WarmPoolEntry,
        policy: SpawnPolicyConfig,
    ) -> (WarmPool, WorkerSupervisor, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new());
        let events = EventBus::default();
        let catalog = ProfileCatalog::build(vec![WorkerProfile::new("coder")]).unwrap();
        let policy = Arc::new(RwLock::new(policy));
        let supervisor = WorkerSupervisor::new(
            SupervisorDeps {
                backend: backend.clone(),
                profiles: Arc::new(RwLock::new(Arc::new(catalog))),
                policy: Arc::clone(&policy),
                sessions: Arc::new(SessionManager::new(events.clone(), 10)),
                events,
                registry_file: None,
            },
            SupervisorSettings {
                daemon: DaemonConfig {
                    port_range_start: 0,
                    ..DaemonConfig::default()
                },
                ..SupervisorSettings::default()
            },
        );
        let config = WarmPoolConfig {
            maintenance_interval_ms: 1_000,
            profiles: HashMap::from([("coder".to_string(), entry)]),
        };
        (
            WarmPool::new(supervisor.clone(), config, policy),
            supervisor,
            backend,
        )
    }

    fn entry(size: usize, min_idle: usize, idle_timeout_ms: u64) -> WarmPoolEntry {
        WarmPoolEntry {
            size,
            min_idle,
            idle_timeout_ms,
        }
    }

    #[tokio::test]
    async fn fill_reaches_target_once() {
        let (pool, supervisor, backend) = pool_with(entry(2, 0, 60_000), SpawnPolicyConfig::default());
        assert_eq!(pool.fill_all().await, 2);
        assert_eq!(pool.fill_all().await, 0);
        assert_eq!(supervisor.idle_warm_instances("coder").await.len(), 2);
        assert_eq!(backend.launch_count(), 2);
    }

    #[tokio::test]
    async fn policy_can_disable_warm_pool() {
        let mut policy = SpawnPolicyConfig::default();
        policy.profiles.insert(
            "coder".to_string(),
            SpawnPolicyEntry {
                warm_pool: Some(false),
                ..SpawnPolicyEntry::default()
            },
        );
        let (pool, _, backend) = pool_with(entry(2, 0, 60_000), policy);
        assert_eq!(pool.fill_all().await, 0);
        assert_eq!(backend.launch_count(), 0);
    }

    #[tokio::test]
    async fn claim_is_replaced_on_demand() {
        let (pool, supervisor, backend) = pool_with(entry(1, 0, 60_000), SpawnPolicyConfig::default());
        pool.fill_all().await;

        let claimed = supervisor
            .spawn_by_id("coder", SpawnPathway::OnDemand)
            .await
            .unwrap();
        assert_eq!(backend.launch_count(), 1);
        assert!(supervisor.idle_warm_instances("coder").await.is_empty());

        pool.note_demand("coder").await;
        let idle = supervisor.idle_warm_instances("coder").await;
        assert_eq!(idle.len(), 1);
        assert_ne!(idle[0].instance_id, claimed.instance_id);
    }

    #[tokio::test]
    async fn idle_eviction_shrinks_to_minimum_and_goes_dormant() {
        let (pool, supervisor, _) = pool_with(entry(3, 1, 0), SpawnPolicyConfig::default());
        pool.fill_all().await;

        assert_eq!(pool.evict_idle().await, 2);
        assert!(pool.is_dormant("coder").await);
        assert_eq!(supervisor.idle_warm_instances("coder").await.len(), 1);

        // dormant pools are not refilled past the minimum
        assert_eq!(pool.fill_all().await, 0);

        pool.note_demand("coder").await;
        assert!(!pool.is_dormant("coder").await);
        assert_eq!(supervisor.idle_warm_instances("coder").await.len(), 3);
    }

    #[tokio::test]
    async fn fresh_instances_are_not_evicted() {
        let (pool, _, _) = pool_with(entry(2, 0, 60_000), SpawnPolicyConfig::default());
        pool.fill_all().await;
        assert_eq!(pool.evict_idle().await, 0);
        assert!(!pool.is_dormant("coder").await);
    }

    #[tokio::test]
    async fn status_reports_targets() {
        let (pool, _, _) = pool_with(entry(2, 0, 60_000), SpawnPolicyConfig::default());
        pool.fill_all().await;
        let status = pool.status().await;
        assert_eq!(
            status,
            vec![PoolStatus {
                profile_id: "coder".to_string(),
                target: 2,
                idle: 2,
                dormant: false,
            }]
        );
    }
}
