//! Asynchronous job registry.
//!
//! A [`Job`] is one request/response exchange with a worker that callers
//! can wait on. Each job completes exactly once; the first `set_result`
//! wins and later calls are no-ops. Completion is published through a
//! per-job [`watch`] channel carrying the job snapshot, so any number of
//! awaiters, each with its own deadline, observe it even if the registry
//! prunes the job afterwards. An await that times out returns the job as it
//! is and never touches its state.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, ForemanEvent};
use crate::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: String,
    pub worker_id: String,
    pub message: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

/// Input for [`JobRegistry::create`].
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub worker_id: String,
    pub message: String,
    pub session_id: Option<String>,
    pub requested_by: Option<String>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Response(String),
    Error(String),
}

/// Result of [`JobRegistry::await_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwaitedJob {
    pub job: Job,
    /// The deadline passed before the job finished.
    pub timed_out: bool,
}

struct JobEntry {
    job: Job,
    tx: watch::Sender<Job>,
}

#[derive(Default)]
struct JobTable {
    entries: HashMap<String, JobEntry>,
    /// Creation order, for listing and pruning.
    order: VecDeque<String>,
}

pub struct JobRegistry {
    table: RwLock<JobTable>,
    events: EventBus,
    max_retained: usize,
}

impl JobRegistry {
    pub fn new(events: EventBus, max_retained: usize) -> Self {
        Self {
            table: RwLock::new(JobTable::default()),
            events,
            max_retained: max_retained.max(1),
        }
    }

    pub async fn create(&self, input: NewJob) -> Job {
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            worker_id: input.worker_id,
            message: input.message,
            status: JobStatus::Created,
            result: None,
            error: None,
            session_id: input.session_id,
            requested_by: input.requested_by,
            created_at: now_millis(),
            finished_at: None,
        };
        let (tx, _) = watch::channel(job.clone());
        {
            let mut table = self.table.write().await;
            table.order.push_back(job.id.clone());
            table.entries.insert(
                job.id.clone(),
                JobEntry {
                    job: job.clone(),
                    tx,
                },
            );
            Self::prune(&mut table, self.max_retained, None);
        }
        debug!(job_id = %job.id, worker_id = %job.worker_id, "Job created");
        self.events.publish(ForemanEvent::JobCreated {
            job_id: job.id.clone(),
            worker_id: job.worker_id.clone(),
        });
        job
    }

    /// Move a created job to `running`. No effect on any other state.
    pub async fn mark_running(&self, job_id: &str) -> bool {
        let mut table = self.table.write().await;
        let Some(entry) = table.entries.get_mut(job_id) else {
            return false;
        };
        if entry.job.status != JobStatus::Created {
            return false;
        }
        entry.job.status = JobStatus::Running;
        entry.tx.send_replace(entry.job.clone());
        true
    }

    /// Record the worker session serving a job once it is known.
    pub async fn attach_session(&self, job_id: &str, session_id: String) {
        let mut table = self.table.write().await;
        if let Some(entry) = table.entries.get_mut(job_id)
            && !entry.job.status.is_terminal()
            && entry.job.session_id.is_none()
        {
            entry.job.session_id = Some(session_id);
            entry.tx.send_replace(entry.job.clone());
        }
    }

    /// Complete a job. Only the first call has an effect; every call returns
    /// the job's resulting state.
    pub async fn set_result(&self, job_id: &str, outcome: JobOutcome) -> Result<Job> {
        let (job, event) = {
            let mut table = self.table.write().await;
            let entry = table
                .entries
                .get_mut(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound {
                    job_id: job_id.to_string(),
                })?;
            if entry.job.status.is_terminal() {
                debug!(job_id, "Job already completed, ignoring result");
                return Ok(entry.job.clone());
            }

            let event = match outcome {
                JobOutcome::Response(text) => {
                    entry.job.status = JobStatus::Succeeded;
                    entry.job.result = Some(text);
                    ForemanEvent::JobSucceeded {
                        job_id: job_id.to_string(),
                        worker_id: entry.job.worker_id.clone(),
                    }
                }
                JobOutcome::Error(error) => {
                    entry.job.status = JobStatus::Failed;
                    entry.job.error = Some(error.clone());
                    ForemanEvent::JobFailed {
                        job_id: job_id.to_string(),
                        worker_id: entry.job.worker_id.clone(),
                        error,
                    }
                }
            };
            entry.job.finished_at = Some(now_millis());
            let job = entry.job.clone();
            entry.tx.send_replace(job.clone());
            Self::prune(&mut table, self.max_retained, Some(job_id));
            (job, event)
        };

        info!(job_id, worker_id = %job.worker_id, status = ?job.status, "Job finished");
        self.events.publish(event);
        Ok(job)
    }

    /// Drop the oldest terminal jobs beyond `max_retained`, sparing `keep`.
    fn prune(table: &mut JobTable, max_retained: usize, keep: Option<&str>) {
        let mut excess = table.entries.len().saturating_sub(max_retained);
        if excess == 0 {
            return;
        }
        let JobTable { entries, order } = table;
        order.retain(|id| {
            if excess > 0
                && keep != Some(id.as_str())
                && entries
                    .get(id)
                    .is_some_and(|e| e.job.status.is_terminal())
            {
                entries.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Wait until the job is terminal or `timeout` passes, whichever is first.
    pub async fn await_job(&self, job_id: &str, timeout: Duration) -> Result<AwaitedJob> {
        let mut rx = {
            let table = self.table.read().await;
            let entry = table
                .entries
                .get(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound {
                    job_id: job_id.to_string(),
                })?;
            entry.tx.subscribe()
        };

        let waited = tokio::time::timeout(timeout, rx.wait_for(|j| j.status.is_terminal()))
            .await
            .map(|finished| finished.map(|job| (*job).clone()));
        let awaited = match waited {
            Ok(Ok(job)) => AwaitedJob {
                job,
                timed_out: false,
            },
            // Sender gone: the job was pruned, its last snapshot is final.
            Ok(Err(_)) => AwaitedJob {
                job: rx.borrow().clone(),
                timed_out: false,
            },
            Err(_) => {
                debug!(job_id, timeout_ms = timeout.as_millis(), "Job await timed out");
                AwaitedJob {
                    job: rx.borrow().clone(),
                    timed_out: true,
                }
            }
        };
        Ok(awaited)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.table
            .read()
            .await
            .entries
            .get(job_id)
            .map(|e| e.job.clone())
    }

    /// Snapshot of every retained job, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.entries.get(id).map(|e| e.job.clone()))
            .collect()
    }

    pub async fn list_for_worker(&self, worker_id: &str) -> Vec<Job> {
        self.list()
            .await
            .into_iter()
            .filter(|j| j.worker_id == worker_id)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_job(worker: &str) -> NewJob {
        NewJob {
            worker_id: worker.to_string(),
            message: "do it".to_string(),
            ..NewJob::default()
        }
    }

    #[tokio::test]
    async fn first_result_wins() {
        let jobs = JobRegistry::new(EventBus::default(), 10);
        let job = jobs.create(new_job("coder")).await;
        assert_eq!(job.status, JobStatus::Created);

        let first = jobs
            .set_result(&job.id, JobOutcome::Response("done".to_string()))
            .await
            .unwrap();
        let second = jobs
            .set_result(&job.id, JobOutcome::Error("late".to_string()))
            .await
            .unwrap();

        assert_eq!(first.status, JobStatus::Succeeded);
        assert_eq!(second, first);
        assert_eq!(jobs.get(&job.id).await.unwrap().result.as_deref(), Some("done"));
        assert!(!jobs.mark_running(&job.id).await);
    }

    #[tokio::test]
    async fn await_timeout_leaves_job_untouched() {
        let jobs = Arc::new(JobRegistry::new(EventBus::default(), 10));
        let job = jobs.create(new_job("coder")).await;
        jobs.mark_running(&job.id).await;

        let awaited = jobs
            .await_job(&job.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(awaited.timed_out);
        assert_eq!(awaited.job.status, JobStatus::Running);

        jobs.set_result(&job.id, JobOutcome::Response("late answer".to_string()))
            .await
            .unwrap();
        let awaited = jobs
            .await_job(&job.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!awaited.timed_out);
        assert_eq!(awaited.job.status, JobStatus::Succeeded);
        assert_eq!(awaited.job.result.as_deref(), Some("late answer"));
    }

    #[tokio::test]
    async fn concurrent_awaiters_have_independent_deadlines() {
        let jobs = Arc::new(JobRegistry::new(EventBus::default(), 10));
        let job = jobs.create(new_job("coder")).await;

        let short = {
            let jobs = Arc::clone(&jobs);
            let id = job.id.clone();
            tokio::spawn(async move { jobs.await_job(&id, Duration::from_millis(10)).await })
        };
        let long = {
            let jobs = Arc::clone(&jobs);
            let id = job.id.clone();
            tokio::spawn(async move { jobs.await_job(&id, Duration::from_secs(5)).await })
        };

        let short = short.await.unwrap().unwrap();
        assert!(short.timed_out);

        jobs.set_result(&job.id, JobOutcome::Error("boom".to_string()))
            .await
            .unwrap();
        let long = long.await.unwrap().unwrap();
        assert!(!long.timed_out);
        assert_eq!(long.job.status, JobStatus::Failed);
        assert_eq!(long.job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let jobs = JobRegistry::new(EventBus::default(), 10);
        let err = jobs
            .await_job("missing", Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound { .. }));
        assert!(jobs
            .set_result("missing", JobOutcome::Response(String::new()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn oldest_finished_jobs_are_pruned() {
        let jobs = JobRegistry::new(EventBus::default(), 2);
        let pending = jobs.create(new_job("a")).await;
        let done1 = jobs.create(new_job("b")).await;
        let done2 = jobs.create(new_job("c")).await;
        jobs.set_result(&done1.id, JobOutcome::Response("1".to_string()))
            .await
            .unwrap();
        jobs.set_result(&done2.id, JobOutcome::Response("2".to_string()))
            .await
            .unwrap();

        let ids: Vec<_> = jobs.list().await.into_iter().map(|j| j.id).collect();
        // the unfinished job is never pruned
        assert_eq!(ids, vec![pending.id, done2.id]);
    }

    #[tokio::test]
    async fn list_for_worker_filters() {
        let jobs = JobRegistry::new(EventBus::default(), 10);
        jobs.create(new_job("a")).await;
        jobs.create(new_job("b")).await;
        jobs.create(new_job("a")).await;
        assert_eq!(jobs.list_for_worker("a").await.len(), 2);
        assert_eq!(jobs.list().await.len(), 3);
    }

    #[tokio::test]
    async fn completion_events_are_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let jobs = JobRegistry::new(bus, 10);
        let job = jobs.create(new_job("a")).await;
        jobs.set_result(&job.id, JobOutcome::Error("x".to_string()))
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().name(), "job.created");
        assert_eq!(rx.try_recv().unwrap().name(), "job.failed");
    }

    #[tokio::test]
    async fn completed_job_survives_a_full_table() {
        let jobs = Arc::new(JobRegistry::new(EventBus::default(), 1));
        let first = jobs.create(new_job("a")).await;
        jobs.create(new_job("b")).await;

        let waiter = {
            let jobs = Arc::clone(&jobs);
            let id = first.id.clone();
            tokio::spawn(async move { jobs.await_job(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        let done = jobs
            .set_result(&first.id, JobOutcome::Response("ok".to_string()))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);

        let awaited = waiter.await.unwrap().unwrap();
        assert!(!awaited.timed_out);
        assert_eq!(awaited.job.result.as_deref(), Some("ok"));
        assert_eq!(
            jobs.get(&first.id).await.unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn awaiter_keeps_snapshot_after_pruning() {
        let jobs = Arc::new(JobRegistry::new(EventBus::default(), 1));
        let old = jobs.create(new_job("a")).await;
        let waiter = {
            let jobs = Arc::clone(&jobs);
            let id = old.id.clone();
            tokio::spawn(async move { jobs.await_job(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        jobs.set_result(&old.id, JobOutcome::Error("gone".to_string()))
            .await
            .unwrap();
        // a newer job pushes the finished one out
        jobs.create(new_job("b")).await;
        assert!(jobs.get(&old.id).await.is_none());

        let awaited = waiter.await.unwrap().unwrap();
        assert_eq!(awaited.job.status, JobStatus::Failed);
        assert_eq!(awaited.job.error.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn session_is_attached_until_completion() {
        let jobs = JobRegistry::new(EventBus::default(), 10);
        let job = jobs.create(new_job("coder")).await;
        jobs.attach_session(&job.id, "ses_1".to_string()).await;
        jobs.attach_session(&job.id, "ses_2".to_string()).await;
        assert_eq!(
            jobs.get(&job.id).await.unwrap().session_id.as_deref(),
            Some("ses_1")
        );

        let done = jobs.create(new_job("coder")).await;
        jobs.set_result(&done.id, JobOutcome::Response("ok".to_string()))
            .await
            .unwrap();
        jobs.attach_session(&done.id, "ses_3".to_string()).await;
        assert!(jobs.get(&done.id).await.unwrap().session_id.is_none());
    }
}
