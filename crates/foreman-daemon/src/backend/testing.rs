//! In-memory scripted backend.
//!
//! Used by the test suites and by `foreman-daemon --dry-run`. Launches and
//! probes are counted per profile; launch failures, launch delays, probe
//! failures and reply errors can be scripted per profile at any time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use foreman_core::WorkerProfile;
use foreman_core::config::SessionMode;

use super::{
    BackendError, LaunchedWorker, SessionRequest, ToolUse, WorkerBackend, WorkerReply,
    WorkerRequest,
};

/// A message the scripted backend received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub profile_id: String,
    pub session_id: String,
    pub text: String,
    pub attachments: usize,
}

#[derive(Debug, Default)]
struct Script {
    launch_delays: HashMap<String, Duration>,
    launch_failures: HashMap<String, String>,
    failing_probes: HashSet<String>,
    reply_errors: HashMap<String, String>,
    reply_delays: HashMap<String, Duration>,
    replies: HashMap<String, String>,
    tools: HashMap<String, Vec<ToolUse>>,
}

#[derive(Debug, Default)]
struct Record {
    launches: HashMap<String, usize>,
    probes: HashMap<String, usize>,
    shutdowns: Vec<String>,
    sent: Vec<SentMessage>,
}

/// Backend that answers every request in-process.
///
/// By default every launch succeeds immediately and every reply echoes
/// `"<profile>: <text>"`.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    record: Mutex<Record>,
    total_launches: AtomicUsize,
    next_pid: AtomicU32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_launch_delay(&self, profile_id: &str, delay: Duration) {
        lock(&self.script)
            .launch_delays
            .insert(profile_id.to_string(), delay);
    }

    pub fn fail_launch(&self, profile_id: &str, reason: &str) {
        lock(&self.script)
            .launch_failures
            .insert(profile_id.to_string(), reason.to_string());
    }

    pub fn clear_launch_failure(&self, profile_id: &str) {
        lock(&self.script).launch_failures.remove(profile_id);
    }

    pub fn set_probe_failing(&self, profile_id: &str, failing: bool) {
        let mut script = lock(&self.script);
        if failing {
            script.failing_probes.insert(profile_id.to_string());
        } else {
            script.failing_probes.remove(profile_id);
        }
    }

    pub fn fail_replies(&self, profile_id: &str, message: &str) {
        lock(&self.script)
            .reply_errors
            .insert(profile_id.to_string(), message.to_string());
    }

    pub fn set_reply_delay(&self, profile_id: &str, delay: Duration) {
        lock(&self.script)
            .reply_delays
            .insert(profile_id.to_string(), delay);
    }

    /// Fixed reply text for a profile instead of the echo.
    pub fn set_reply(&self, profile_id: &str, text: &str) {
        lock(&self.script)
            .replies
            .insert(profile_id.to_string(), text.to_string());
    }

    pub fn set_tools(&self, profile_id: &str, tools: Vec<ToolUse>) {
        lock(&self.script)
            .tools
            .insert(profile_id.to_string(), tools);
    }

    pub fn launch_count(&self) -> usize {
        self.total_launches.load(Ordering::SeqCst)
    }

    pub fn launch_count_for(&self, profile_id: &str) -> usize {
        lock(&self.record)
            .launches
            .get(profile_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn probe_count_for(&self, profile_id: &str) -> usize {
        lock(&self.record)
            .probes
            .get(profile_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn shutdown_count(&self) -> usize {
        lock(&self.record).shutdowns.len()
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock(&self.record).sent.clone()
    }
}

#[async_trait]
impl WorkerBackend for ScriptedBackend {
    async fn launch(
        &self,
        profile: &WorkerProfile,
        port: u16,
        session: &SessionRequest,
    ) -> Result<LaunchedWorker, BackendError> {
        self.total_launches.fetch_add(1, Ordering::SeqCst);
        *lock(&self.record)
            .launches
            .entry(profile.id.clone())
            .or_default() += 1;

        let (delay, failure) = {
            let script = lock(&self.script);
            (
                script.launch_delays.get(&profile.id).copied(),
                script.launch_failures.get(&profile.id).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(BackendError::LaunchFailed { reason });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 10_000;
        let session_id = match session.mode {
            SessionMode::Linked => session
                .linked_session_id
                .clone()
                .ok_or_else(|| BackendError::NotReady {
                    reason: "linked session mode requires a session id".to_string(),
                })?,
            SessionMode::Child | SessionMode::Isolated => format!("ses_{}_{pid}", profile.id),
        };

        Ok(LaunchedWorker {
            profile_id: profile.id.clone(),
            host: "127.0.0.1".to_string(),
            port,
            pid: Some(pid),
            session_id,
            model: profile.model.clone(),
            system_prompt: profile.system_prompt.clone(),
        })
    }

    async fn send(
        &self,
        worker: &LaunchedWorker,
        request: &WorkerRequest,
    ) -> Result<WorkerReply, BackendError> {
        lock(&self.record).sent.push(SentMessage {
            profile_id: worker.profile_id.clone(),
            session_id: worker.session_id.clone(),
            text: request.text.clone(),
            attachments: request.attachments.len(),
        });

        let (delay, error, reply, tools) = {
            let script = lock(&self.script);
            (
                script.reply_delays.get(&worker.profile_id).copied(),
                script.reply_errors.get(&worker.profile_id).cloned(),
                script.replies.get(&worker.profile_id).cloned(),
                script
                    .tools
                    .get(&worker.profile_id)
                    .cloned()
                    .unwrap_or_default(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = error {
            return Err(BackendError::Request { message });
        }

        Ok(WorkerReply {
            text: reply.unwrap_or_else(|| format!("{}: {}", worker.profile_id, request.text)),
            tools,
        })
    }

    async fn probe(&self, worker: &LaunchedWorker) -> Result<(), BackendError> {
        *lock(&self.record)
            .probes
            .entry(worker.profile_id.clone())
            .or_default() += 1;
        if lock(&self.script).failing_probes.contains(&worker.profile_id) {
            return Err(BackendError::NotReady {
                reason: "scripted probe failure".to_string(),
            });
        }
        Ok(())
    }

    async fn shutdown(&self, worker: &LaunchedWorker) -> Result<(), BackendError> {
        lock(&self.record)
            .shutdowns
            .push(worker.profile_id.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn isolated() -> SessionRequest {
        SessionRequest {
            mode: SessionMode::Isolated,
            parent_session_id: None,
            linked_session_id: None,
            title: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn echoes_by_default() {
        let backend = ScriptedBackend::new();
        let worker = backend
            .launch(&WorkerProfile::new("coder"), 1, &isolated())
            .await
            .unwrap();
        let reply = backend
            .send(&worker, &WorkerRequest::text("hello"))
            .await
            .unwrap();
        assert_eq!(reply.text, "coder: hello");
        assert_eq!(backend.launch_count_for("coder"), 1);
        assert_eq!(backend.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_apply_per_profile() {
        let backend = ScriptedBackend::new();
        backend.fail_launch("vision", "no gpu");
        let err = backend
            .launch(&WorkerProfile::new("vision"), 1, &isolated())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to launch worker: no gpu");

        let worker = backend
            .launch(&WorkerProfile::new("coder"), 2, &isolated())
            .await
            .unwrap();
        backend.set_probe_failing("coder", true);
        assert!(backend.probe(&worker).await.is_err());
        backend.set_probe_failing("coder", false);
        assert!(backend.probe(&worker).await.is_ok());
        assert_eq!(backend.probe_count_for("coder"), 2);
        assert_eq!(backend.launch_count(), 2);
    }

    #[tokio::test]
    async fn linked_mode_reuses_session_id() {
        let backend = ScriptedBackend::new();
        let session = SessionRequest {
            mode: SessionMode::Linked,
            parent_session_id: None,
            linked_session_id: Some("ses_existing".to_string()),
            title: "t".to_string(),
        };
        let worker = backend
            .launch(&WorkerProfile::new("coder"), 1, &session)
            .await
            .unwrap();
        assert_eq!(worker.session_id, "ses_existing");
    }
}
