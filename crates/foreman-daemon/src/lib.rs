//! Foreman Daemon Library
//!
//! Worker orchestration and workflow engine:
//! - Spawn policy evaluation across the auto, on-demand, manual and warm-pool pathways
//! - Worker process supervision with de-duplicated spawns and health probing
//! - Warm pool of pre-spawned idle workers
//! - Async job registry with await-with-timeout
//! - Per-worker session tracking and lifecycle events
//! - Task routing and bounded multi-step workflows
//! - A JSON tool-call surface over all of the above

pub mod backend;
pub mod error;
pub mod events;
pub mod jobs;
pub mod orchestrator;
pub mod policy;
pub mod pool;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod tools;
pub mod workflow;

pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use tools::ToolSurface;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
