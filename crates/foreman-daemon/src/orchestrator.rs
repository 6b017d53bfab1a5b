//! Orchestrator facade.
//!
//! The single entry point callers use: it applies spawn policy before asking
//! the supervisor for a worker, routes ad hoc tasks, tracks async jobs, and
//! drives workflows. It also owns the background loops (health probing and
//! warm pool maintenance) and their shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use foreman_core::config::{SpawnPolicyConfig, WorkflowLimits, WorkflowsConfig};
use foreman_core::{Config, ProfileCatalog, WorkerProfile};

use crate::backend::{Attachment, WorkerBackend, WorkerReply, WorkerRequest};
use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::jobs::{AwaitedJob, Job, JobOutcome, JobRegistry, NewJob};
use crate::policy::{self, EffectivePolicy, EnsureReason, SpawnPathway};
use crate::pool::WarmPool;
use crate::router;
use crate::session::SessionManager;
use crate::supervisor::health::spawn_health_task;
use crate::supervisor::{
    SupervisorDeps, SupervisorSettings, WorkerInstance, WorkerRegistryFile, WorkerSupervisor,
};
use crate::workflow::{StepExecutor, WorkflowEngine, WorkflowRun, WorkflowSummary};

/// Grace period for orphaned workers between SIGTERM and SIGKILL.
const ORPHAN_GRACE: Duration = Duration::from_secs(3);

/// Result of [`Orchestrator::delegate_task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelegateResult {
    pub worker_id: String,
    pub response: String,
}

/// A profile as seen by callers: its config, resolved policy and whether an
/// instance is serving it.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    #[serde(flatten)]
    pub profile: WorkerProfile,
    pub policy: EffectivePolicy,
    pub running: bool,
}

/// What [`Orchestrator::start`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub orphans_reaped: usize,
    pub auto_spawned: Vec<String>,
    pub warm_spawned: usize,
}

struct Inner {
    supervisor: WorkerSupervisor,
    pool: Arc<WarmPool>,
    jobs: Arc<JobRegistry>,
    sessions: Arc<SessionManager>,
    events: EventBus,
    profiles: Arc<RwLock<Arc<ProfileCatalog>>>,
    policy: Arc<RwLock<SpawnPolicyConfig>>,
    workflows: RwLock<WorkflowsConfig>,
    default_await: Duration,
    registry_file: Option<WorkerRegistryFile>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to the orchestration engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Config, backend: Arc<dyn WorkerBackend>) -> Result<Self> {
        let catalog = ProfileCatalog::build(config.profiles)
            .map_err(|e| OrchestratorError::invalid(e.to_string()))?;
        let profiles = Arc::new(RwLock::new(Arc::new(catalog)));
        let policy = Arc::new(RwLock::new(config.spawn_policy));
        let events = EventBus::default();
        let sessions = Arc::new(SessionManager::new(
            events.clone(),
            config.sessions.activity_limit,
        ));
        let registry_file = config
            .daemon
            .state_dir
            .as_deref()
            .map(WorkerRegistryFile::new);

        let supervisor = WorkerSupervisor::new(
            SupervisorDeps {
                backend,
                profiles: Arc::clone(&profiles),
                policy: Arc::clone(&policy),
                sessions: Arc::clone(&sessions),
                events: events.clone(),
                registry_file: registry_file.clone(),
            },
            SupervisorSettings {
                daemon: config.daemon,
                health: config.health,
                sessions: config.sessions,
            },
        );
        let pool = Arc::new(WarmPool::new(
            supervisor.clone(),
            config.warm_pool,
            Arc::clone(&policy),
        ));
        let jobs = Arc::new(JobRegistry::new(events.clone(), config.jobs.max_retained));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                supervisor,
                pool,
                jobs,
                sessions,
                events,
                profiles,
                policy,
                workflows: RwLock::new(config.workflows),
                default_await: Duration::from_millis(config.jobs.default_await_timeout_ms),
                registry_file,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.inner.supervisor
    }

    pub fn pool(&self) -> &Arc<WarmPool> {
        &self.inner.pool
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.inner.jobs
    }

    /// Reap orphans, auto-spawn, fill warm pools and start background loops.
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();
        if let Some(file) = &self.inner.registry_file {
            report.orphans_reaped = file.reconcile(ORPHAN_GRACE).await;
        }

        let auto: Vec<String> = {
            let catalog = Arc::clone(&*self.inner.profiles.read().await);
            let policy = self.inner.policy.read().await;
            catalog
                .ids()
                .filter(|id| policy::can_spawn(&policy, id, SpawnPathway::Auto))
                .map(str::to_string)
                .collect()
        };
        let mut set = JoinSet::new();
        for id in auto {
            let supervisor = self.inner.supervisor.clone();
            set.spawn(async move {
                let result = supervisor.spawn_by_id(&id, SpawnPathway::Auto).await;
                (id, result)
            });
        }
        while let Some(res) = set.join_next().await {
            match res {
                Ok((id, Ok(_))) => report.auto_spawned.push(id),
                Ok((id, Err(e))) => error!(worker_id = %id, error = %e, "Auto-spawn failed"),
                Err(e) => warn!(error = %e, "Auto-spawn task failed"),
            }
        }
        report.auto_spawned.sort();

        report.warm_spawned = self.inner.pool.fill_all().await;

        let health = self.inner.supervisor.settings().health;
        let mut tasks = self.inner.tasks.lock().await;
        if health.enabled {
            tasks.push(spawn_health_task(
                self.inner.supervisor.clone(),
                health.interval(),
                self.inner.shutdown_tx.subscribe(),
            ));
        }
        tasks.push(
            Arc::clone(&self.inner.pool)
                .spawn_maintenance_task(&self.inner.events, self.inner.shutdown_tx.subscribe()),
        );

        info!(
            orphans_reaped = report.orphans_reaped,
            auto_spawned = report.auto_spawned.len(),
            warm_spawned = report.warm_spawned,
            "Orchestrator started"
        );
        report
    }

    /// Stop background loops and every worker.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.inner.supervisor.stop_all().await;
        info!("Orchestrator stopped");
    }

    async fn require_profile(&self, profile_id: &str) -> Result<()> {
        if self.inner.profiles.read().await.contains(profile_id) {
            Ok(())
        } else {
            Err(OrchestratorError::ProfileNotFound {
                profile_id: profile_id.to_string(),
            })
        }
    }

    /// Return a serving instance of `profile_id`, spawning one if policy
    /// allows the pathway `reason` maps to.
    pub async fn ensure_worker(
        &self,
        profile_id: &str,
        reason: EnsureReason,
    ) -> Result<WorkerInstance> {
        self.require_profile(profile_id).await?;
        let pathway = SpawnPathway::from(reason);
        {
            let policy = self.inner.policy.read().await;
            if policy::reuse_existing(&policy, profile_id)
                && let Some(existing) = self.inner.supervisor.get_worker(profile_id).await
                && existing.status.is_serving()
            {
                debug!(worker_id = %profile_id, "Using existing worker");
                return Ok(existing);
            }
            if !policy::can_spawn(&policy, profile_id, pathway) {
                warn!(worker_id = %profile_id, %pathway, "Spawn denied by policy");
                return Err(OrchestratorError::PolicyDenied {
                    profile_id: profile_id.to_string(),
                    pathway,
                });
            }
        }
        self.inner.supervisor.spawn_by_id(profile_id, pathway).await
    }

    /// Manually start a worker.
    pub async fn spawn_worker(&self, profile_id: &str) -> Result<WorkerInstance> {
        self.ensure_worker(profile_id, EnsureReason::Manual).await
    }

    pub async fn stop_worker(&self, profile_id: &str) -> bool {
        self.inner.supervisor.stop_worker(profile_id).await
    }

    pub async fn list_workers(&self) -> Vec<WorkerInstance> {
        self.inner.supervisor.list_workers().await
    }

    pub async fn list_profiles(&self) -> Vec<ProfileView> {
        let profiles = self.inner.supervisor.list_profiles().await;
        let policy = self.inner.policy.read().await.clone();
        let mut views = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let running = self
                .inner
                .supervisor
                .get_worker(&profile.id)
                .await
                .is_some_and(|w| w.status.is_serving());
            views.push(ProfileView {
                policy: policy::effective(&policy, &profile.id),
                running,
                profile,
            });
        }
        views
    }

    /// Swap the profile catalog. Running workers keep their instances.
    pub async fn reload_profiles(&self, profiles: Vec<WorkerProfile>) -> Result<usize> {
        let catalog =
            ProfileCatalog::build(profiles).map_err(|e| OrchestratorError::invalid(e.to_string()))?;
        let count = catalog.len();
        *self.inner.profiles.write().await = Arc::new(catalog);
        info!(profiles = count, "Profiles reloaded");
        Ok(count)
    }

    pub async fn set_spawn_policy(&self, policy: SpawnPolicyConfig) {
        *self.inner.policy.write().await = policy;
    }

    pub async fn set_workflow_limits(&self, limits: WorkflowLimits) {
        self.inner.workflows.write().await.limits = limits;
    }

    /// Find a serving worker, spawning on demand when `auto_spawn` is set.
    async fn resolve_worker(&self, profile_id: &str, auto_spawn: bool) -> Result<WorkerInstance> {
        if auto_spawn {
            return self.ensure_worker(profile_id, EnsureReason::OnDemand).await;
        }
        self.require_profile(profile_id).await?;
        self.inner
            .supervisor
            .get_worker(profile_id)
            .await
            .filter(|w| w.status.is_serving())
            .ok_or_else(|| OrchestratorError::WorkerNotFound {
                worker_id: profile_id.to_string(),
            })
    }

    /// Send `message` to a worker and wait for the reply.
    pub async fn ask_worker(
        &self,
        profile_id: &str,
        message: &str,
        attachments: Vec<Attachment>,
        auto_spawn: bool,
    ) -> Result<WorkerReply> {
        self.resolve_worker(profile_id, auto_spawn).await?;
        let request = WorkerRequest {
            text: message.to_string(),
            attachments,
        };
        self.inner.supervisor.send(profile_id, &request).await
    }

    /// Like [`Self::ask_worker`] but returns a job immediately. The exchange
    /// runs in the background and completes the job either way.
    pub async fn ask_worker_async(
        &self,
        profile_id: &str,
        message: &str,
        attachments: Vec<Attachment>,
        auto_spawn: bool,
        requested_by: Option<String>,
    ) -> Result<Job> {
        self.require_profile(profile_id).await?;
        let session_id = self
            .inner
            .supervisor
            .get_worker(profile_id)
            .await
            .and_then(|w| w.session_id);
        let job = self
            .inner
            .jobs
            .create(NewJob {
                worker_id: profile_id.to_string(),
                message: message.to_string(),
                session_id,
                requested_by,
            })
            .await;

        let this = self.clone();
        let job_id = job.id.clone();
        let profile_id = profile_id.to_string();
        let message = message.to_string();
        tokio::spawn(async move {
            this.inner.jobs.mark_running(&job_id).await;
            let outcome = match this
                .dispatch_job(&job_id, &profile_id, &message, attachments, auto_spawn)
                .await
            {
                Ok(reply) => JobOutcome::Response(reply.text),
                Err(e) => JobOutcome::Error(e.to_string()),
            };
            if let Err(e) = this.inner.jobs.set_result(&job_id, outcome).await {
                warn!(job_id = %job_id, error = %e, "Job vanished before completion");
            }
        });
        Ok(job)
    }

    /// Resolve the worker for a background job, record its session on the
    /// job, then send the request.
    async fn dispatch_job(
        &self,
        job_id: &str,
        profile_id: &str,
        message: &str,
        attachments: Vec<Attachment>,
        auto_spawn: bool,
    ) -> Result<WorkerReply> {
        let worker = self.resolve_worker(profile_id, auto_spawn).await?;
        if let Some(session_id) = worker.session_id {
            self.inner.jobs.attach_session(job_id, session_id).await;
        }
        let request = WorkerRequest {
            text: message.to_string(),
            attachments,
        };
        self.inner.supervisor.send(profile_id, &request).await
    }

    /// Wait for a job, up to `timeout` or the configured default.
    pub async fn await_job(&self, job_id: &str, timeout: Option<Duration>) -> Result<AwaitedJob> {
        self.inner
            .jobs
            .await_job(job_id, timeout.unwrap_or(self.inner.default_await))
            .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.inner
            .jobs
            .get(job_id)
            .await
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    pub async fn list_jobs(&self, worker_id: Option<&str>) -> Vec<Job> {
        match worker_id {
            Some(id) => self.inner.jobs.list_for_worker(id).await,
            None => self.inner.jobs.list().await,
        }
    }

    /// Route `task` to the best profile and run it there.
    pub async fn delegate_task(
        &self,
        task: &str,
        attachments: Vec<Attachment>,
        auto_spawn: bool,
    ) -> Result<DelegateResult> {
        let catalog = Arc::clone(&*self.inner.profiles.read().await);
        let worker_id = router::select_worker_id(task, catalog.profiles(), &attachments)
            .ok_or(OrchestratorError::NoWorkerAvailable)?;
        info!(worker_id = %worker_id, "Delegating task");
        let reply = self
            .ask_worker(&worker_id, task, attachments, auto_spawn)
            .await?;
        Ok(DelegateResult {
            worker_id,
            response: reply.text,
        })
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.inner
            .workflows
            .read()
            .await
            .definitions
            .iter()
            .map(|d| WorkflowSummary {
                id: d.id.clone(),
                name: d.name.clone(),
                description: d.description.clone(),
                steps: d.steps.iter().map(|s| s.id.clone()).collect(),
            })
            .collect()
    }

    /// Run a configured workflow under the current limits.
    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        task: &str,
        attachments: &[Attachment],
        auto_spawn: bool,
    ) -> Result<WorkflowRun> {
        let (definition, limits) = {
            let workflows = self.inner.workflows.read().await;
            let definition = workflows
                .definitions
                .iter()
                .find(|d| d.id == workflow_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::WorkflowNotFound {
                    workflow_id: workflow_id.to_string(),
                })?;
            (definition, workflows.limits)
        };

        let engine =
            WorkflowEngine::new(limits).with_shutdown(self.inner.shutdown_tx.subscribe());
        engine.validate(&definition)?;
        for step in &definition.steps {
            self.require_profile(&step.worker_id).await?;
        }
        engine
            .run(&definition, task, attachments, auto_spawn, self)
            .await
    }
}

#[async_trait]
impl StepExecutor for Orchestrator {
    async fn execute(
        &self,
        worker_id: &str,
        prompt: &str,
        attachments: &[Attachment],
        auto_spawn: bool,
    ) -> Result<String> {
        self.ask_worker(worker_id, prompt, attachments.to_vec(), auto_spawn)
            .await
            .map(|reply| reply.text)
    }
}
