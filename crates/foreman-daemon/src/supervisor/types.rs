//! Worker instance types.

use serde::Serialize;

use foreman_core::config::SessionMode;

use crate::policy::SpawnPathway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Error,
    Stopped,
}

impl WorkerStatus {
    /// Ready or busy: the instance can take requests.
    pub const fn is_serving(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// Snapshot of a live (or failed) worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInstance {
    pub instance_id: String,
    pub profile_id: String,
    pub status: WorkerStatus,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub session_id: Option<String>,
    pub session_mode: SessionMode,
    pub pathway: SpawnPathway,
    pub started_at: u64,
    pub last_activity: u64,
    /// Requests currently being served.
    pub in_flight: usize,
    /// Idle in the warm pool rather than serving its profile.
    pub warm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WorkerInstance {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
