//! Worker supervisor.
//!
//! Owns every live worker instance: launches them through the backend,
//! de-duplicates concurrent spawns of the same profile, serves requests,
//! probes health, and stops them. Instances are keyed by instance id; each
//! profile has at most one *active* instance, and any number of idle warm
//! instances parked for the warm pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use foreman_core::config::{DaemonConfig, HealthConfig, SessionConfig, SessionMode, SpawnPolicyConfig};
use foreman_core::{ProfileCatalog, WorkerProfile};

use super::health::{ProbeOutcome, probe_with_retries};
use super::orphans::{WorkerRecord, WorkerRegistryFile};
use super::ports::PortAllocator;
use super::types::{WorkerInstance, WorkerStatus};
use crate::backend::{LaunchedWorker, SessionRequest, WorkerBackend, WorkerReply, WorkerRequest};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, ForemanEvent};
use crate::policy::{self, SpawnPathway};
use crate::session::{NewSession, SessionManager};
use crate::now_millis;

/// Settings the supervisor reads on every spawn and probe.
#[derive(Debug, Clone, Default)]
pub struct SupervisorSettings {
    pub daemon: DaemonConfig,
    pub health: HealthConfig,
    pub sessions: SessionConfig,
}

/// Shared handles the supervisor needs from the rest of the daemon.
pub struct SupervisorDeps {
    pub backend: Arc<dyn WorkerBackend>,
    pub profiles: Arc<RwLock<Arc<ProfileCatalog>>>,
    pub policy: Arc<RwLock<SpawnPolicyConfig>>,
    pub sessions: Arc<SessionManager>,
    pub events: EventBus,
    pub registry_file: Option<WorkerRegistryFile>,
}

/// Outcome slot shared by every caller waiting on one spawn.
type SpawnSlot = Option<Result<WorkerInstance>>;

struct Entry {
    instance: WorkerInstance,
    launched: Option<LaunchedWorker>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    /// Profile id -> instance id of the instance serving it.
    active: HashMap<String, String>,
    in_flight: HashMap<String, watch::Receiver<SpawnSlot>>,
}

impl Registry {
    fn active_entry(&self, profile_id: &str) -> Option<&Entry> {
        self.active
            .get(profile_id)
            .and_then(|id| self.entries.get(id))
    }

    fn take_active(&mut self, profile_id: &str) -> Option<Entry> {
        let id = self.active.remove(profile_id)?;
        self.entries.remove(&id)
    }

    /// Instances holding (or about to hold) a process.
    fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| {
                matches!(
                    e.instance.status,
                    WorkerStatus::Starting | WorkerStatus::Ready | WorkerStatus::Busy
                )
            })
            .count()
    }

    fn idle_warm(&self, profile_id: &str) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(move |e| {
            e.instance.warm
                && e.instance.profile_id == profile_id
                && e.instance.status == WorkerStatus::Ready
                && e.launched.is_some()
        })
    }

    /// Hand the oldest idle warm instance of `profile_id` to the profile.
    fn promote_warm(&mut self, profile_id: &str) -> Option<WorkerInstance> {
        let id = self
            .idle_warm(profile_id)
            .min_by_key(|e| e.instance.started_at)
            .map(|e| e.instance.instance_id.clone())?;
        let entry = self.entries.get_mut(&id)?;
        entry.instance.warm = false;
        entry.instance.last_activity = now_millis();
        self.active.insert(profile_id.to_string(), id);
        Some(entry.instance.clone())
    }
}

struct Shared {
    deps: SupervisorDeps,
    settings: SupervisorSettings,
    registry: RwLock<Registry>,
    ports: Mutex<PortAllocator>,
}

/// Cloneable handle to the worker supervisor.
#[derive(Clone)]
pub struct WorkerSupervisor {
    shared: Arc<Shared>,
}

impl WorkerSupervisor {
    pub fn new(deps: SupervisorDeps, settings: SupervisorSettings) -> Self {
        let ports = PortAllocator::new(
            settings.daemon.host.clone(),
            settings.daemon.port_range_start,
            settings.daemon.port_range_len,
        );
        Self {
            shared: Arc::new(Shared {
                deps,
                settings,
                registry: RwLock::new(Registry::default()),
                ports: Mutex::new(ports),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// The instance currently serving `profile_id`, in any status.
    pub async fn get_worker(&self, profile_id: &str) -> Option<WorkerInstance> {
        self.shared
            .registry
            .read()
            .await
            .active_entry(profile_id)
            .map(|e| e.instance.clone())
    }

    pub async fn get_instance(&self, instance_id: &str) -> Option<WorkerInstance> {
        self.shared
            .registry
            .read()
            .await
            .entries
            .get(instance_id)
            .map(|e| e.instance.clone())
    }

    /// Every tracked instance (active and warm), oldest first.
    pub async fn list_workers(&self) -> Vec<WorkerInstance> {
        let mut workers: Vec<_> = self
            .shared
            .registry
            .read()
            .await
            .entries
            .values()
            .map(|e| e.instance.clone())
            .collect();
        workers.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.profile_id.cmp(&b.profile_id))
        });
        workers
    }

    pub async fn list_profiles(&self) -> Vec<WorkerProfile> {
        self.shared.deps.profiles.read().await.profiles().to_vec()
    }

    pub async fn idle_warm_instances(&self, profile_id: &str) -> Vec<WorkerInstance> {
        let mut idle: Vec<_> = self
            .shared
            .registry
            .read()
            .await
            .idle_warm(profile_id)
            .map(|e| e.instance.clone())
            .collect();
        idle.sort_by_key(|i| i.started_at);
        idle
    }

    pub async fn is_spawning(&self, profile_id: &str) -> bool {
        self.shared
            .registry
            .read()
            .await
            .in_flight
            .contains_key(profile_id)
    }

    async fn profile(&self, profile_id: &str) -> Result<WorkerProfile> {
        self.shared
            .deps
            .profiles
            .read()
            .await
            .get(profile_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::ProfileNotFound {
                profile_id: profile_id.to_string(),
            })
    }

    /// Get a serving instance of `profile_id`, launching one if needed.
    ///
    /// Concurrent callers for the same profile share a single launch. Spawn
    /// policy is the caller's concern; only `reuse_existing` is read here.
    pub async fn spawn_by_id(
        &self,
        profile_id: &str,
        pathway: SpawnPathway,
    ) -> Result<WorkerInstance> {
        let profile = self.profile(profile_id).await?;
        let reuse = policy::reuse_existing(&*self.shared.deps.policy.read().await, profile_id);

        let mut rx = {
            let mut reg = self.shared.registry.write().await;
            if let Some(rx) = reg.in_flight.get(profile_id) {
                debug!(worker_id = %profile_id, "Attaching to in-flight spawn");
                rx.clone()
            } else {
                if reuse
                    && let Some(entry) = reg.active_entry(profile_id)
                    && entry.instance.status.is_serving()
                {
                    let instance = entry.instance.clone();
                    drop(reg);
                    debug!(worker_id = %profile_id, "Reusing existing worker");
                    self.shared.deps.events.publish(ForemanEvent::WorkerReused {
                        worker_id: profile_id.to_string(),
                    });
                    return Ok(instance);
                }

                let stale = reg.take_active(profile_id);
                if let Some(instance) = reg.promote_warm(profile_id) {
                    drop(reg);
                    if let Some(stale) = stale {
                        self.retire(stale).await;
                    }
                    self.on_claimed(&instance).await;
                    return Ok(instance);
                }

                let (tx, rx) = watch::channel(None);
                reg.in_flight.insert(profile_id.to_string(), rx.clone());
                let this = self.clone();
                // Runs detached so a cancelled caller cannot strand the slot.
                tokio::spawn(async move { this.lead_spawn(profile, pathway, stale, tx).await });
                rx
            }
        };

        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map(|slot| (*slot).clone())
            .map_err(|_| OrchestratorError::SpawnFailed {
                profile_id: profile_id.to_string(),
                reason: "spawn task ended without a result".to_string(),
            })?;
        slot.unwrap_or_else(|| {
            Err(OrchestratorError::SpawnFailed {
                profile_id: profile_id.to_string(),
                reason: "spawn task ended without a result".to_string(),
            })
        })
    }

    async fn lead_spawn(
        self,
        profile: WorkerProfile,
        pathway: SpawnPathway,
        stale: Option<Entry>,
        tx: watch::Sender<SpawnSlot>,
    ) {
        if let Some(stale) = stale {
            self.retire(stale).await;
        }
        let result = self.launch(&profile, pathway, false).await;
        self.shared
            .registry
            .write()
            .await
            .in_flight
            .remove(&profile.id);
        tx.send_replace(Some(result));
    }

    /// Launch an idle instance for the warm pool.
    pub async fn spawn_warm(&self, profile_id: &str) -> Result<WorkerInstance> {
        let profile = self.profile(profile_id).await?;
        self.launch(&profile, SpawnPathway::WarmPool, true).await
    }

    async fn on_claimed(&self, instance: &WorkerInstance) {
        info!(
            worker_id = %instance.profile_id,
            instance_id = %instance.instance_id,
            "Claimed warm worker"
        );
        self.shared
            .deps
            .sessions
            .bind_worker(&instance.profile_id, &instance.instance_id)
            .await;
        self.shared.deps.events.publish(ForemanEvent::WorkerClaimed {
            worker_id: instance.profile_id.clone(),
            instance_id: instance.instance_id.clone(),
        });
    }

    fn session_request(&self, profile: &WorkerProfile) -> SessionRequest {
        let sessions = &self.shared.settings.sessions;
        SessionRequest {
            mode: sessions.mode,
            parent_session_id: sessions.parent_session_id.clone(),
            linked_session_id: sessions.linked_session_id.clone(),
            title: format!("foreman: {}", profile.display_name()),
        }
    }

    async fn launch(
        &self,
        profile: &WorkerProfile,
        pathway: SpawnPathway,
        warm: bool,
    ) -> Result<WorkerInstance> {
        let daemon = &self.shared.settings.daemon;
        let now = now_millis();

        let instance = {
            let mut reg = self.shared.registry.write().await;
            let live = reg.live_count();
            if live >= daemon.max_workers {
                warn!(worker_id = %profile.id, live, max = daemon.max_workers, "Worker capacity reached");
                return Err(OrchestratorError::CapacityExhausted {
                    current: live,
                    max: daemon.max_workers,
                });
            }
            let port = self.shared.ports.lock().await.allocate().map_err(|e| {
                OrchestratorError::SpawnFailed {
                    profile_id: profile.id.clone(),
                    reason: e.to_string(),
                }
            })?;

            let instance = WorkerInstance {
                instance_id: uuid::Uuid::new_v4().to_string(),
                profile_id: profile.id.clone(),
                status: WorkerStatus::Starting,
                host: daemon.host.clone(),
                port,
                pid: None,
                session_id: None,
                session_mode: self.shared.settings.sessions.mode,
                pathway,
                started_at: now,
                last_activity: now,
                in_flight: 0,
                warm,
                last_error: None,
            };
            reg.entries.insert(
                instance.instance_id.clone(),
                Entry {
                    instance: instance.clone(),
                    launched: None,
                },
            );
            if !warm {
                reg.active
                    .insert(profile.id.clone(), instance.instance_id.clone());
            }
            instance
        };

        info!(
            worker_id = %profile.id,
            instance_id = %instance.instance_id,
            port = instance.port,
            %pathway,
            "Launching worker"
        );

        let session = self.session_request(profile);
        let timeout = daemon.startup_timeout();
        let launched = match tokio::time::timeout(
            timeout,
            self.shared.deps.backend.launch(profile, instance.port, &session),
        )
        .await
        {
            Ok(Ok(launched)) => launched,
            Ok(Err(e)) => {
                let err = OrchestratorError::SpawnFailed {
                    profile_id: profile.id.clone(),
                    reason: e.to_string(),
                };
                return Err(self.fail_launch(&instance, err).await);
            }
            Err(_) => {
                let err = OrchestratorError::StartupTimeout {
                    profile_id: profile.id.clone(),
                    timeout_ms: daemon.startup_timeout_ms,
                };
                return Err(self.fail_launch(&instance, err).await);
            }
        };

        let ready = {
            let mut reg = self.shared.registry.write().await;
            reg.entries.get_mut(&instance.instance_id).map(|entry| {
                entry.instance.status = WorkerStatus::Ready;
                entry.instance.pid = launched.pid;
                entry.instance.session_id = Some(launched.session_id.clone());
                entry.instance.last_activity = now_millis();
                entry.launched = Some(launched.clone());
                entry.instance.clone()
            })
        };
        let Some(ready) = ready else {
            // Stopped while starting.
            warn!(worker_id = %profile.id, "Worker stopped during startup, shutting it down");
            if let Err(e) = self.shared.deps.backend.shutdown(&launched).await {
                warn!(worker_id = %profile.id, error = %e, "Shutdown after cancelled startup failed");
            }
            self.shared.ports.lock().await.release(instance.port);
            return Err(OrchestratorError::SpawnFailed {
                profile_id: profile.id.clone(),
                reason: "worker was stopped during startup".to_string(),
            });
        };

        self.shared
            .deps
            .sessions
            .create_session(
                NewSession {
                    worker_id: profile.id.clone(),
                    instance_id: ready.instance_id.clone(),
                    session_id: launched.session_id.clone(),
                    mode: session.mode,
                    parent_session_id: match session.mode {
                        SessionMode::Child => session.parent_session_id.clone(),
                        SessionMode::Isolated | SessionMode::Linked => None,
                    },
                },
                !warm,
            )
            .await;

        info!(
            worker_id = %profile.id,
            instance_id = %ready.instance_id,
            port = ready.port,
            pid = ?ready.pid,
            warm,
            "Worker ready"
        );
        self.shared.deps.events.publish(ForemanEvent::WorkerSpawned {
            worker_id: profile.id.clone(),
            port: ready.port,
            pathway,
        });
        self.shared.deps.events.publish(ForemanEvent::WorkerReady {
            worker_id: profile.id.clone(),
        });
        self.persist().await;
        Ok(ready)
    }

    /// Record a failed launch and hand the error back.
    async fn fail_launch(
        &self,
        instance: &WorkerInstance,
        err: OrchestratorError,
    ) -> OrchestratorError {
        self.shared.ports.lock().await.release(instance.port);
        {
            let mut reg = self.shared.registry.write().await;
            if instance.warm {
                reg.entries.remove(&instance.instance_id);
            } else if let Some(entry) = reg.entries.get_mut(&instance.instance_id) {
                // Kept as an error record until replaced or stopped.
                entry.instance.status = WorkerStatus::Error;
                entry.instance.port = 0;
                entry.instance.last_error = Some(err.to_string());
            }
        }
        error!(worker_id = %instance.profile_id, error = %err, "Worker launch failed");
        self.shared.deps.events.publish(ForemanEvent::WorkerError {
            worker_id: instance.profile_id.clone(),
            error: err.to_string(),
        });
        err
    }

    /// Shut down an entry already removed from the registry.
    async fn retire(&self, entry: Entry) {
        let Entry { instance, launched } = entry;
        if let Some(launched) = &launched {
            if let Err(e) = self.shared.deps.backend.shutdown(launched).await {
                warn!(worker_id = %instance.profile_id, error = %e, "Worker shutdown failed");
            }
            self.shared.ports.lock().await.release(instance.port);
        }
        if instance.session_id.is_some() {
            self.shared
                .deps
                .sessions
                .close_session(&instance.instance_id)
                .await;
        }
        info!(
            worker_id = %instance.profile_id,
            instance_id = %instance.instance_id,
            "Worker stopped"
        );
        self.shared.deps.events.publish(ForemanEvent::WorkerStopped {
            worker_id: instance.profile_id.clone(),
        });
        if launched.is_some() {
            self.persist().await;
        }
    }

    /// Stop the instance serving `profile_id`. Returns `false` if none exists.
    pub async fn stop_worker(&self, profile_id: &str) -> bool {
        let entry = self.shared.registry.write().await.take_active(profile_id);
        match entry {
            Some(entry) => {
                self.retire(entry).await;
                true
            }
            None => false,
        }
    }

    /// Stop a specific instance, active or warm.
    pub async fn stop_instance(&self, instance_id: &str) -> bool {
        let entry = {
            let mut reg = self.shared.registry.write().await;
            let entry = reg.entries.remove(instance_id);
            if let Some(entry) = &entry
                && reg.active.get(&entry.instance.profile_id).map(String::as_str) == Some(instance_id)
            {
                reg.active.remove(&entry.instance.profile_id);
            }
            entry
        };
        match entry {
            Some(entry) => {
                self.retire(entry).await;
                true
            }
            None => false,
        }
    }

    /// Stop every instance concurrently.
    pub async fn stop_all(&self) {
        let entries: Vec<Entry> = {
            let mut reg = self.shared.registry.write().await;
            reg.active.clear();
            reg.entries.drain().map(|(_, e)| e).collect()
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "Stopping all workers");
        let mut set = JoinSet::new();
        for entry in entries {
            let this = self.clone();
            set.spawn(async move { this.retire(entry).await });
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Worker stop task failed");
            }
        }
    }

    /// Send a request to the instance serving `profile_id`.
    ///
    /// Requests to one instance may overlap; the instance is `busy` while any
    /// is outstanding. A failed request leaves the instance usable.
    pub async fn send(&self, profile_id: &str, request: &WorkerRequest) -> Result<WorkerReply> {
        let (instance_id, launched) = {
            let mut reg = self.shared.registry.write().await;
            let id = reg.active.get(profile_id).cloned().ok_or_else(|| {
                OrchestratorError::WorkerNotFound {
                    worker_id: profile_id.to_string(),
                }
            })?;
            let entry = reg
                .entries
                .get_mut(&id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound {
                    worker_id: profile_id.to_string(),
                })?;
            let launched = match (&entry.launched, entry.instance.status.is_serving()) {
                (Some(launched), true) => launched.clone(),
                _ => {
                    return Err(OrchestratorError::WorkerRequestFailed {
                        worker_id: profile_id.to_string(),
                        message: format!("worker is {}", entry.instance.status.as_str()),
                    });
                }
            };
            entry.instance.in_flight += 1;
            entry.instance.status = WorkerStatus::Busy;
            entry.instance.last_activity = now_millis();
            (id, launched)
        };

        let sessions = &self.shared.deps.sessions;
        sessions
            .set_current_task(&instance_id, Some(&request.text))
            .await;
        sessions
            .record_message(&instance_id, &request.text)
            .await;
        debug!(worker_id = %profile_id, chars = request.text.len(), "Sending request to worker");

        let timeout = self.shared.settings.daemon.request_timeout();
        let outcome =
            tokio::time::timeout(timeout, self.shared.deps.backend.send(&launched, request)).await;

        {
            let mut reg = self.shared.registry.write().await;
            if let Some(entry) = reg.entries.get_mut(&instance_id) {
                entry.instance.in_flight = entry.instance.in_flight.saturating_sub(1);
                if entry.instance.in_flight == 0 && entry.instance.status == WorkerStatus::Busy {
                    entry.instance.status = WorkerStatus::Ready;
                }
                entry.instance.last_activity = now_millis();
            }
        }
        sessions.set_current_task(&instance_id, None).await;

        let message = match outcome {
            Ok(Ok(reply)) => {
                sessions
                    .record_message(&instance_id, &reply.text)
                    .await;
                for tool in &reply.tools {
                    sessions
                        .record_tool(&instance_id, &tool.name, &tool.summary)
                        .await;
                }
                return Ok(reply);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("request timed out after {}ms", timeout.as_millis()),
        };
        sessions.record_error(&instance_id, &message).await;
        warn!(worker_id = %profile_id, error = %message, "Worker request failed");
        Err(OrchestratorError::WorkerRequestFailed {
            worker_id: profile_id.to_string(),
            message,
        })
    }

    /// Probe every serving instance once (with retries); instances that
    /// exhaust their retries are marked `error`.
    pub async fn check_health(&self) {
        let health = self.shared.settings.health;
        if !health.enabled {
            return;
        }
        let targets: Vec<(String, LaunchedWorker)> = self
            .shared
            .registry
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.instance.status.is_serving())
            .filter_map(|e| {
                e.launched
                    .clone()
                    .map(|l| (e.instance.instance_id.clone(), l))
            })
            .collect();

        let mut set = JoinSet::new();
        for (instance_id, launched) in targets {
            let backend = Arc::clone(&self.shared.deps.backend);
            set.spawn(async move {
                let outcome = probe_with_retries(
                    backend.as_ref(),
                    &launched,
                    health.timeout(),
                    health.max_retries,
                )
                .await;
                (instance_id, launched.profile_id, outcome)
            });
        }

        while let Some(res) = set.join_next().await {
            match res {
                Ok((instance_id, profile_id, ProbeOutcome::Exhausted { attempts, reason })) => {
                    self.mark_unhealthy(&instance_id, &profile_id, attempts, reason)
                        .await;
                }
                Ok((_, _, ProbeOutcome::Healthy)) => {}
                Err(e) => warn!(error = %e, "Health probe task failed"),
            }
        }
    }

    async fn mark_unhealthy(
        &self,
        instance_id: &str,
        profile_id: &str,
        attempts: u32,
        reason: String,
    ) {
        let err = OrchestratorError::HealthCheckExhausted {
            worker_id: profile_id.to_string(),
            attempts,
            reason,
        };
        let marked = {
            let mut reg = self.shared.registry.write().await;
            reg.entries.get_mut(instance_id).and_then(|entry| {
                if !entry.instance.status.is_serving() {
                    return None;
                }
                entry.instance.status = WorkerStatus::Error;
                entry.instance.last_error = Some(err.to_string());
                Some((
                    entry.instance.warm,
                    entry.instance.pathway,
                    entry.instance.session_id.is_some(),
                ))
            })
        };
        // Stopped or already failed while probing.
        let Some((warm, pathway, has_session)) = marked else {
            return;
        };

        error!(worker_id = %profile_id, instance_id, error = %err, "Worker unhealthy");
        self.shared.deps.events.publish(ForemanEvent::WorkerError {
            worker_id: profile_id.to_string(),
            error: err.to_string(),
        });
        if has_session {
            self.shared
                .deps
                .sessions
                .record_error(instance_id, &err.to_string())
                .await;
        }

        if warm {
            self.stop_instance(instance_id).await;
            return;
        }
        if self.shared.settings.health.restart_on_error {
            info!(worker_id = %profile_id, "Restarting unhealthy worker");
            // The errored instance is replaced through the normal spawn path.
            if let Err(e) = self.spawn_by_id(profile_id, pathway).await {
                error!(worker_id = %profile_id, error = %e, "Restart failed");
            }
        }
    }

    async fn persist(&self) {
        let Some(file) = &self.shared.deps.registry_file else {
            return;
        };
        let records: Vec<WorkerRecord> = self
            .shared
            .registry
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.launched.is_some())
            .filter_map(|e| {
                e.instance.pid.map(|pid| WorkerRecord {
                    instance_id: e.instance.instance_id.clone(),
                    profile_id: e.instance.profile_id.clone(),
                    pid,
                    port: e.instance.port,
                    started_at: e.instance.started_at,
                })
            })
            .collect();
        if let Err(e) = file.save(&records).await {
            warn!(path = %file.path().display(), error = %e, "Failed to write worker registry");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::ScriptedBackend;
    use foreman_core::config::SpawnPolicyEntry;

    struct Harness {
        supervisor: WorkerSupervisor,
        backend: Arc<ScriptedBackend>,
        sessions: Arc<SessionManager>,
        policy: Arc<RwLock<SpawnPolicyConfig>>,
        events: EventBus,
    }

    fn harness_with(settings: SupervisorSettings) -> Harness {
        let backend = Arc::new(ScriptedBackend::new());
        let events = EventBus::default();
        let sessions = Arc::new(SessionManager::new(events.clone(), 20));
        let catalog = ProfileCatalog::build(vec![
            WorkerProfile::new("coder"),
            WorkerProfile::new("vision"),
        ])
        .unwrap();
        let policy = Arc::new(RwLock::new(SpawnPolicyConfig::default()));
        let supervisor = WorkerSupervisor::new(
            SupervisorDeps {
                backend: backend.clone(),
                profiles: Arc::new(RwLock::new(Arc::new(catalog))),
                policy: Arc::clone(&policy),
                sessions: Arc::clone(&sessions),
                events: events.clone(),
                registry_file: None,
            },
            settings,
        );
        Harness {
            supervisor,
            backend,
            sessions,
            policy,
            events,
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            daemon: DaemonConfig {
                port_range_start: 0,
                startup_timeout_ms: 1_000,
                ..DaemonConfig::default()
            },
            health: HealthConfig {
                timeout_ms: 50,
                ..HealthConfig::default()
            },
            sessions: SessionConfig::default(),
        }
    }

    fn harness() -> Harness {
        harness_with(settings())
    }

    #[tokio::test]
    async fn concurrent_spawns_share_one_launch() {
        let h = harness();
        h.backend
            .set_launch_delay("coder", Duration::from_millis(50));

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let supervisor = h.supervisor.clone();
            set.spawn(async move { supervisor.spawn_by_id("coder", SpawnPathway::OnDemand).await });
        }
        let mut ids = Vec::new();
        while let Some(res) = set.join_next().await {
            ids.push(res.unwrap().unwrap().instance_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.backend.launch_count_for("coder"), 1);
        assert!(!h.supervisor.is_spawning("coder").await);
    }

    #[tokio::test]
    async fn existing_instance_is_reused() {
        let h = harness();
        let first = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        let second = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::OnDemand)
            .await
            .unwrap();
        assert_eq!(first.instance_id, second.instance_id);
        assert_eq!(first.status, WorkerStatus::Ready);
        assert_eq!(h.backend.launch_count(), 1);
    }

    #[tokio::test]
    async fn reuse_disabled_replaces_instance() {
        let h = harness();
        h.policy.write().await.profiles.insert(
            "coder".to_string(),
            SpawnPolicyEntry {
                reuse_existing: Some(false),
                ..SpawnPolicyEntry::default()
            },
        );
        let first = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        let second = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(h.backend.launch_count_for("coder"), 2);
        assert_eq!(h.backend.shutdown_count(), 1);
        assert_eq!(h.supervisor.list_workers().await.len(), 1);
    }

    #[tokio::test]
    async fn startup_timeout_fails_every_waiter_and_frees_slot() {
        let mut s = settings();
        s.daemon.startup_timeout_ms = 20;
        let h = harness_with(s);
        h.backend
            .set_launch_delay("coder", Duration::from_millis(500));

        let (a, b) = tokio::join!(
            h.supervisor.spawn_by_id("coder", SpawnPathway::OnDemand),
            h.supervisor.spawn_by_id("coder", SpawnPathway::OnDemand),
        );
        let expected = OrchestratorError::StartupTimeout {
            profile_id: "coder".to_string(),
            timeout_ms: 20,
        };
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert!(!h.supervisor.is_spawning("coder").await);

        let record = h.supervisor.get_worker("coder").await.unwrap();
        assert_eq!(record.status, WorkerStatus::Error);

        // a later attempt launches again
        h.backend.set_launch_delay("coder", Duration::ZERO);
        let instance = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::OnDemand)
            .await
            .unwrap();
        assert_eq!(instance.status, WorkerStatus::Ready);
        assert_eq!(h.backend.launch_count_for("coder"), 2);
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let h = harness();
        h.backend.fail_launch("vision", "binary missing");
        let err = h
            .supervisor
            .spawn_by_id("vision", SpawnPathway::Manual)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::SpawnFailed {
                profile_id: "vision".to_string(),
                reason: "Failed to launch worker: binary missing".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected() {
        let h = harness();
        let err = h
            .supervisor
            .spawn_by_id("ghost", SpawnPathway::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProfileNotFound { .. }));
        assert_eq!(h.backend.launch_count(), 0);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let mut s = settings();
        s.daemon.max_workers = 1;
        let h = harness_with(s);
        h.supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        let err = h
            .supervisor
            .spawn_by_id("vision", SpawnPathway::Manual)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::CapacityExhausted { current: 1, max: 1 }
        );
    }

    #[tokio::test]
    async fn stop_closes_session_and_forgets_worker() {
        let h = harness();
        let instance = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        assert!(instance.session_id.is_some());
        assert!(h.sessions.get_session_by_worker("coder").await.is_some());

        assert!(h.supervisor.stop_worker("coder").await);
        assert!(!h.supervisor.stop_worker("coder").await);
        assert!(h.supervisor.get_worker("coder").await.is_none());
        assert!(
            !h.sessions
                .get_session(&instance.instance_id)
                .await
                .unwrap()
                .is_active()
        );
        assert_eq!(h.backend.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn send_records_activity_and_tracks_busy() {
        let h = harness();
        h.supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        h.backend
            .set_reply_delay("coder", Duration::from_millis(50));

        let supervisor = h.supervisor.clone();
        let pending = tokio::spawn(async move {
            supervisor
                .send("coder", &WorkerRequest::text("write tests"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let busy = h.supervisor.get_worker("coder").await.unwrap();
        assert_eq!(busy.status, WorkerStatus::Busy);
        assert_eq!(busy.in_flight, 1);

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.text, "coder: write tests");
        let idle = h.supervisor.get_worker("coder").await.unwrap();
        assert_eq!(idle.status, WorkerStatus::Ready);

        let session = h.sessions.get_session_by_worker("coder").await.unwrap();
        // prompt and reply
        assert_eq!(session.message_count, 2);
    }

    #[tokio::test]
    async fn failed_request_keeps_worker_usable() {
        let h = harness();
        h.supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        h.backend.fail_replies("coder", "context length exceeded");
        let err = h
            .supervisor
            .send("coder", &WorkerRequest::text("hi"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::WorkerRequestFailed {
                worker_id: "coder".to_string(),
                message: "context length exceeded".to_string(),
            }
        );
        let worker = h.supervisor.get_worker("coder").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Ready);
    }

    #[tokio::test]
    async fn exhausted_health_marks_error_without_restart() {
        let h = harness();
        let mut rx = h.events.subscribe();
        h.supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        h.backend.set_probe_failing("coder", true);

        h.supervisor.check_health().await;

        let worker = h.supervisor.get_worker("coder").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Error);
        assert_eq!(h.backend.probe_count_for("coder"), 4);
        assert_eq!(h.backend.launch_count_for("coder"), 1);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let ForemanEvent::WorkerError { worker_id, .. } = event {
                saw_error |= worker_id == "coder";
            }
        }
        assert!(saw_error);

        // errored workers are no longer probed or served
        h.supervisor.check_health().await;
        assert_eq!(h.backend.probe_count_for("coder"), 4);
        assert!(h
            .supervisor
            .send("coder", &WorkerRequest::text("hi"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn restart_on_error_relaunches() {
        let mut s = settings();
        s.health.restart_on_error = true;
        let h = harness_with(s);
        let first = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        h.backend.set_probe_failing("coder", true);
        h.supervisor.check_health().await;

        let replacement = h.supervisor.get_worker("coder").await.unwrap();
        assert_ne!(replacement.instance_id, first.instance_id);
        assert_eq!(replacement.status, WorkerStatus::Ready);
        assert_eq!(h.backend.launch_count_for("coder"), 2);
    }

    #[tokio::test]
    async fn warm_instance_is_promoted_instead_of_launching() {
        let h = harness();
        let warm = h.supervisor.spawn_warm("coder").await.unwrap();
        assert!(warm.warm);
        assert!(h.supervisor.get_worker("coder").await.is_none());
        assert!(h.sessions.get_session_by_worker("coder").await.is_none());

        let active = h
            .supervisor
            .spawn_by_id("coder", SpawnPathway::OnDemand)
            .await
            .unwrap();
        assert_eq!(active.instance_id, warm.instance_id);
        assert!(!active.warm);
        assert_eq!(h.backend.launch_count(), 1);
        assert!(h.sessions.get_session_by_worker("coder").await.is_some());
        assert!(h.supervisor.idle_warm_instances("coder").await.is_empty());
    }

    #[tokio::test]
    async fn stop_all_clears_registry() {
        let h = harness();
        h.supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        h.supervisor.spawn_warm("vision").await.unwrap();
        h.supervisor.stop_all().await;
        assert!(h.supervisor.list_workers().await.is_empty());
        assert_eq!(h.backend.shutdown_count(), 2);
    }

    #[tokio::test]
    async fn registry_file_tracks_live_workers() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let events = EventBus::default();
        let catalog = ProfileCatalog::build(vec![WorkerProfile::new("coder")]).unwrap();
        let file = WorkerRegistryFile::new(dir.path());
        let supervisor = WorkerSupervisor::new(
            SupervisorDeps {
                backend,
                profiles: Arc::new(RwLock::new(Arc::new(catalog))),
                policy: Arc::new(RwLock::new(SpawnPolicyConfig::default())),
                sessions: Arc::new(SessionManager::new(events.clone(), 10)),
                events,
                registry_file: Some(file.clone()),
            },
            settings(),
        );

        supervisor
            .spawn_by_id("coder", SpawnPathway::Manual)
            .await
            .unwrap();
        let records = file.load().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].profile_id, "coder");

        supervisor.stop_worker("coder").await;
        assert!(file.load().await.is_empty());
    }
}
