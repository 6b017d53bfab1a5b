//! Lifecycle event fan-out.
//!
//! Events are published on a [`broadcast`] channel. Subscribers obtain a
//! receiver with [`EventBus::subscribe`] and unsubscribe by dropping it.
//! Publishing never fails: with no subscribers, or with lagging ones, the
//! event is simply dropped for them.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use foreman_core::config::SessionMode;

use crate::policy::SpawnPathway;

/// Broadcast channel buffer size for lifecycle events.
const EVENT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForemanEvent {
    WorkerSpawned {
        worker_id: String,
        port: u16,
        pathway: SpawnPathway,
    },
    WorkerReused {
        worker_id: String,
    },
    /// An idle warm-pool instance was handed to its profile.
    WorkerClaimed {
        worker_id: String,
        instance_id: String,
    },
    WorkerReady {
        worker_id: String,
    },
    WorkerError {
        worker_id: String,
        error: String,
    },
    WorkerStopped {
        worker_id: String,
    },
    JobCreated {
        job_id: String,
        worker_id: String,
    },
    JobSucceeded {
        job_id: String,
        worker_id: String,
    },
    JobFailed {
        job_id: String,
        worker_id: String,
        error: String,
    },
    SessionCreated {
        worker_id: String,
        session_id: String,
        mode: SessionMode,
    },
    SessionMessage {
        worker_id: String,
        session_id: String,
        summary: String,
    },
    SessionTool {
        worker_id: String,
        session_id: String,
        tool: String,
    },
    SessionClosed {
        worker_id: String,
        session_id: String,
    },
    SessionError {
        worker_id: String,
        session_id: String,
        error: String,
    },
}

impl ForemanEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WorkerSpawned { .. } => "worker.spawned",
            Self::WorkerReused { .. } => "worker.reused",
            Self::WorkerClaimed { .. } => "worker.claimed",
            Self::WorkerReady { .. } => "worker.ready",
            Self::WorkerError { .. } => "worker.error",
            Self::WorkerStopped { .. } => "worker.stopped",
            Self::JobCreated { .. } => "job.created",
            Self::JobSucceeded { .. } => "job.succeeded",
            Self::JobFailed { .. } => "job.failed",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionMessage { .. } => "session.message",
            Self::SessionTool { .. } => "session.tool",
            Self::SessionClosed { .. } => "session.closed",
            Self::SessionError { .. } => "session.error",
        }
    }
}

/// Cloneable handle for publishing and subscribing to lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ForemanEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a subscriber. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ForemanEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget delivery.
    pub fn publish(&self, event: ForemanEvent) {
        trace!(event = event.name(), "Publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BROADCAST_CAPACITY)
    }
}
