//! Process-backed workers.
//!
//! Each worker is a separate OS process serving HTTP on its own port. Launch
//! waits for `GET /health` to answer, then opens (or links) a session. The
//! child is spawned with `kill_on_drop`, so dropping an in-progress launch
//! (startup timeout) takes the process down with it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use foreman_core::WorkerProfile;
use foreman_core::config::{DaemonConfig, SessionMode};

use super::{
    AttachmentKind, BackendError, LaunchedWorker, SessionRequest, ToolUse, WorkerBackend,
    WorkerReply, WorkerRequest,
};

const HEALTH_PATH: &str = "/health";

/// Delay between readiness polls while a worker starts.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Launches workers as child processes and talks to them over HTTP.
pub struct ProcessBackend {
    config: DaemonConfig,
    http: reqwest::Client,
    /// Live children keyed by port.
    children: Arc<Mutex<HashMap<u16, Child>>>,
}

impl ProcessBackend {
    pub fn new(config: DaemonConfig) -> Result<Self, BackendError> {
        // reqwest is built with rustls-no-provider; Err only means a provider
        // is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            http,
            children: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Substitute `{port}`, `{model}` and `{profile}` into the argument list.
    pub fn render_args(args: &[String], port: u16, profile: &WorkerProfile) -> Vec<String> {
        let model = profile.model.as_deref().unwrap_or_default();
        args.iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{model}", model)
                    .replace("{profile}", &profile.id)
            })
            .collect()
    }

    fn spawn_child(&self, profile: &WorkerProfile, port: u16) -> Result<Child, BackendError> {
        let args = Self::render_args(&self.config.worker_args, port, profile);
        let mut cmd = Command::new(&self.config.worker_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("FOREMAN_PROFILE_ID", &profile.id)
            .env("FOREMAN_WORKER_PORT", port.to_string());

        // Keep the essentials even under a stripped service environment.
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", &home);
        }
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", &path);
        }

        info!(
            profile_id = %profile.id,
            port,
            bin = %self.config.worker_bin.display(),
            "Spawning worker process"
        );
        let mut child = cmd.spawn().map_err(|e| BackendError::LaunchFailed {
            reason: format!("{}: {e}", self.config.worker_bin.display()),
        })?;

        if let Some(stdout) = child.stdout.take() {
            let id = profile.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(worker_id = %id, "stdout: {}", line);
                }
                debug!(worker_id = %id, "stdout reader finished");
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let id = profile.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker_id = %id, "stderr: {}", line);
                }
                debug!(worker_id = %id, "stderr reader finished");
            });
        }

        Ok(child)
    }

    async fn get_health(&self, base: &str) -> Result<(), BackendError> {
        let resp = self.http.get(format!("{base}{HEALTH_PATH}")).send().await?;
        check_status(&resp)
    }

    async fn wait_until_ready(&self, child: &mut Child, base: &str) -> Result<(), BackendError> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BackendError::LaunchFailed {
                    reason: format!("worker exited during startup ({status})"),
                });
            }
            match self.get_health(base).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(base, error = %e, "Worker not ready yet"),
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    async fn open_session(
        &self,
        base: &str,
        session: &SessionRequest,
    ) -> Result<String, BackendError> {
        let body = match session.mode {
            SessionMode::Linked => {
                return session
                    .linked_session_id
                    .clone()
                    .ok_or_else(|| BackendError::NotReady {
                        reason: "linked session mode requires a session id".to_string(),
                    });
            }
            SessionMode::Child => json!({
                "title": session.title,
                "parentID": session.parent_session_id,
            }),
            SessionMode::Isolated => json!({ "title": session.title }),
        };

        let resp = self
            .http
            .post(format!("{base}/session"))
            .json(&body)
            .send()
            .await?;
        check_status(&resp)?;
        let value: Value = resp.json().await?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Protocol {
                reason: "session response has no id".to_string(),
            })
    }

    async fn terminate(&self, mut child: Child, port: u16) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id()
                && !crate::supervisor::orphans::signal(pid, libc::SIGINT)
            {
                let err = std::io::Error::last_os_error();
                warn!(port, pid, error = %err, "Failed to send SIGINT");
            }
        }

        match tokio::time::timeout(self.config.shutdown_timeout(), child.wait()).await {
            Ok(Ok(status)) => info!(port, ?status, "Worker exited gracefully"),
            Ok(Err(e)) => {
                warn!(port, error = %e, "Error waiting for worker");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(port, "Timeout waiting for graceful shutdown, killing");
                child.kill().await.ok();
            }
        }
    }
}

#[async_trait]
impl WorkerBackend for ProcessBackend {
    async fn launch(
        &self,
        profile: &WorkerProfile,
        port: u16,
        session: &SessionRequest,
    ) -> Result<LaunchedWorker, BackendError> {
        let mut child = self.spawn_child(profile, port)?;
        let pid = child.id();
        let base = format!("http://{}:{}", self.config.host, port);

        self.wait_until_ready(&mut child, &base).await?;
        let session_id = self.open_session(&base, session).await?;

        self.children.lock().await.insert(port, child);
        info!(profile_id = %profile.id, port, ?pid, session_id = %session_id, "Worker ready");

        Ok(LaunchedWorker {
            profile_id: profile.id.clone(),
            host: self.config.host.clone(),
            port,
            pid,
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
        let body = message_body(worker, request);
        let resp = self
            .http
            .post(format!(
                "{}/session/{}/message",
                worker.endpoint(),
                worker.session_id
            ))
            .timeout(self.config.request_timeout())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if let Some(message) = extract_error(&value) {
            return Err(BackendError::Request { message });
        }
        if !status.is_success() {
            return Err(BackendError::Request {
                message: format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            });
        }
        Ok(parse_reply(&value))
    }

    async fn probe(&self, worker: &LaunchedWorker) -> Result<(), BackendError> {
        {
            let mut children = self.children.lock().await;
            if let Some(child) = children.get_mut(&worker.port)
                && let Some(status) = child.try_wait()?
            {
                return Err(BackendError::NotReady {
                    reason: format!("worker process exited ({status})"),
                });
            }
        }
        self.get_health(&worker.endpoint()).await
    }

    async fn shutdown(&self, worker: &LaunchedWorker) -> Result<(), BackendError> {
        let child = self.children.lock().await.remove(&worker.port);
        match child {
            Some(child) => self.terminate(child, worker.port).await,
            None => debug!(port = worker.port, "No child to terminate"),
        }
        Ok(())
    }
}

fn check_status(resp: &reqwest::Response) -> Result<(), BackendError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(BackendError::NotReady {
            reason: format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ),
        });
    }
    Ok(())
}

fn message_body(worker: &LaunchedWorker, request: &WorkerRequest) -> Value {
    let mut parts = vec![json!({ "type": "text", "text": request.text })];
    for att in &request.attachments {
        let Some(url) = &att.url else { continue };
        let mime = att.mime_type.clone().unwrap_or_else(|| match att.kind {
            AttachmentKind::Image => "image/png".to_string(),
            AttachmentKind::File => "application/octet-stream".to_string(),
        });
        parts.push(json!({
            "type": "file",
            "mime": mime,
            "url": url,
            "filename": att.name,
        }));
    }

    let mut body = json!({ "parts": parts });
    if let Some(model) = &worker.model {
        body["model"] = json!(model);
    }
    if let Some(system) = &worker.system_prompt {
        body["system"] = json!(system);
    }
    body
}

/// Pull an error message out of a worker response, if it carries one.
fn extract_error(value: &Value) -> Option<String> {
    let err = value
        .get("error")
        .or_else(|| value.get("info").and_then(|info| info.get("error")))?;
    if let Some(s) = err.as_str() {
        return Some(s.to_string());
    }
    err.get("data")
        .and_then(|d| d.get("message"))
        .or_else(|| err.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| Some(err.to_string()))
}

fn parse_reply(value: &Value) -> WorkerReply {
    let mut reply = WorkerReply::default();
    let Some(parts) = value.get("parts").and_then(Value::as_array) else {
        if let Some(text) = value.get("text").and_then(Value::as_str) {
            reply.text = text.to_string();
        }
        return reply;
    };

    let mut texts = Vec::new();
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    texts.push(text);
                }
            }
            Some("tool") => {
                let name = part
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let summary = part
                    .get("state")
                    .and_then(|s| s.get("title").or_else(|| s.get("status")))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                reply.tools.push(ToolUse { name, summary });
            }
            _ => {}
        }
    }
    reply.text = texts.join("\n");
    reply
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::Attachment;

    fn worker() -> LaunchedWorker {
        LaunchedWorker {
            profile_id: "coder".to_string(),
            host: "127.0.0.1".to_string(),
            port: 14100,
            pid: None,
            session_id: "ses_1".to_string(),
            model: Some("anthropic/sonnet".to_string()),
            system_prompt: None,
        }
    }

    #[test]
    fn args_are_substituted() {
        let mut profile = WorkerProfile::new("vision");
        profile.model = Some("gpt-vision".to_string());
        let args = vec![
            "serve".to_string(),
            "--port={port}".to_string(),
            "--model".to_string(),
            "{model}".to_string(),
            "--agent={profile}".to_string(),
        ];
        let rendered = ProcessBackend::render_args(&args, 14_123, &profile);
        assert_eq!(
            rendered,
            vec!["serve", "--port=14123", "--model", "gpt-vision", "--agent=vision"]
        );
    }

    #[test]
    fn body_carries_attachments_and_model() {
        let request = WorkerRequest {
            text: "look".to_string(),
            attachments: vec![Attachment::image("file:///tmp/a.png")],
        };
        let body = message_body(&worker(), &request);
        assert_eq!(body["parts"][0]["text"], "look");
        assert_eq!(body["parts"][1]["type"], "file");
        assert_eq!(body["parts"][1]["mime"], "image/png");
        assert_eq!(body["model"], "anthropic/sonnet");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn reply_joins_text_and_collects_tools() {
        let value = json!({
            "info": {"id": "msg_1"},
            "parts": [
                {"type": "text", "text": "first"},
                {"type": "tool", "tool": "bash", "state": {"status": "completed", "title": "ls -la"}},
                {"type": "text", "text": "second"}
            ]
        });
        let reply = parse_reply(&value);
        assert_eq!(reply.text, "first\nsecond");
        assert_eq!(reply.tools.len(), 1);
        assert_eq!(reply.tools[0].name, "bash");
        assert_eq!(reply.tools[0].summary, "ls -la");
    }

    #[test]
    fn nested_worker_error_is_extracted() {
        let value = json!({"info": {"error": {"name": "APIError", "data": {"message": "overloaded"}}}});
        assert_eq!(extract_error(&value).as_deref(), Some("overloaded"));
        assert_eq!(
            extract_error(&json!({"error": "bad request"})).as_deref(),
            Some("bad request")
        );
        assert!(extract_error(&json!({"parts": []})).is_none());
    }

    #[tokio::test]
    async fn launch_of_missing_binary_fails() {
        let config = DaemonConfig {
            worker_bin: "/nonexistent/foreman-worker".into(),
            ..DaemonConfig::default()
        };
        let backend = ProcessBackend::new(config).unwrap();
        let session = SessionRequest {
            mode: SessionMode::Isolated,
            parent_session_id: None,
            linked_session_id: None,
            title: "t".to_string(),
        };
        let err = backend
            .launch(&WorkerProfile::new("coder"), 14_100, &session)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::LaunchFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_interrupts_child_without_waiting_for_grace() {
        let config = DaemonConfig {
            shutdown_timeout_ms: 10_000,
            ..DaemonConfig::default()
        };
        let backend = ProcessBackend::new(config).unwrap();
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let started = std::time::Instant::now();
        backend.terminate(child, 0).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
