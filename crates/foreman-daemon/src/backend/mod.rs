//! Worker launch backends.
//!
//! A [`WorkerBackend`] knows how to bring a worker process up on a port, talk
//! to it, probe it and take it down. The supervisor never touches processes
//! directly; it only drives this trait.

pub mod process;
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use foreman_core::WorkerProfile;
use foreman_core::config::SessionMode;

pub use process::ProcessBackend;
pub use testing::ScriptedBackend;

/// How the worker's session should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub mode: SessionMode,
    pub parent_session_id: Option<String>,
    pub linked_session_id: Option<String>,
    pub title: String,
}

/// A worker the backend has brought up and opened a session on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchedWorker {
    pub profile_id: String,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub session_id: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

impl LaunchedWorker {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

/// Extra input sent along with a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Location of the content (`file://`, `data:` or `http(s)://`).
    #[serde(default)]
    pub url: Option<String>,
}

impl Attachment {
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            name: None,
            mime_type: None,
            url: Some(url.into()),
        }
    }

    pub const fn is_image(&self) -> bool {
        matches!(self.kind, AttachmentKind::Image)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRequest {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl WorkerRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// A tool invocation the worker reported while answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolUse {
    pub name: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReply {
    pub text: String,
    pub tools: Vec<ToolUse>,
}

impl WorkerReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tools: Vec::new(),
        }
    }
}

/// Errors from the launch backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to launch worker: {reason}")]
    LaunchFailed { reason: String },

    #[error("Worker not ready: {reason}")]
    NotReady { reason: String },

    /// Error reported by the worker itself; the message is kept verbatim.
    #[error("{message}")]
    Request { message: String },

    #[error("Unexpected worker response: {reason}")]
    Protocol { reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start a worker for `profile` on `port` and open its session.
    ///
    /// The returned future may be dropped at any point (startup timeout);
    /// implementations must not leave a process behind when that happens.
    async fn launch(
        &self,
        profile: &WorkerProfile,
        port: u16,
        session: &SessionRequest,
    ) -> Result<LaunchedWorker, BackendError>;

    async fn send(
        &self,
        worker: &LaunchedWorker,
        request: &WorkerRequest,
    ) -> Result<WorkerReply, BackendError>;

    async fn probe(&self, worker: &LaunchedWorker) -> Result<(), BackendError>;

    async fn shutdown(&self, worker: &LaunchedWorker) -> Result<(), BackendError>;
}
