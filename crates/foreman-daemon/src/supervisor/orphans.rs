//! Orphan reconciliation.
//!
//! The supervisor mirrors its live workers into `<state_dir>/workers.json`.
//! If the daemon dies without stopping them, the next start reads the file
//! and terminates whatever is still running under the recorded PIDs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const REGISTRY_FILE: &str = "workers.json";

/// Poll interval while waiting for an orphan to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub instance_id: String,
    pub profile_id: String,
    pub pid: u32,
    pub port: u16,
    pub started_at: u64,
}

/// On-disk registry of worker processes started by this daemon.
#[derive(Debug, Clone)]
pub struct WorkerRegistryFile {
    path: PathBuf,
}

impl WorkerRegistryFile {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read recorded workers. A missing or unreadable file yields nothing.
    pub async fn load(&self) -> Vec<WorkerRecord> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read worker registry");
                return Vec::new();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Corrupt worker registry, ignoring");
            Vec::new()
        })
    }

    pub async fn save(&self, records: &[WorkerRecord]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(records).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    /// Terminate every recorded worker that is still alive, then clear the
    /// registry. Returns the number of processes that were terminated.
    pub async fn reconcile(&self, grace: Duration) -> usize {
        let records = self.load().await;
        let mut reaped = 0;
        for record in &records {
            if !is_alive(record.pid) {
                debug!(pid = record.pid, profile_id = %record.profile_id, "Recorded worker already gone");
                continue;
            }
            warn!(
                pid = record.pid,
                port = record.port,
                profile_id = %record.profile_id,
                "Terminating orphaned worker"
            );
            terminate(record.pid, grace).await;
            reaped += 1;
        }
        if !records.is_empty() {
            if let Err(e) = self.save(&[]).await {
                warn!(error = %e, "Failed to clear worker registry");
            }
            info!(recorded = records.len(), reaped, "Orphan reconciliation finished");
        }
        reaped
    }
}

/// Send `sig` to a single process. Values that would address a process
/// group (0, negative after conversion) are refused.
#[cfg(unix)]
pub(crate) fn signal(pid: u32, sig: i32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) takes plain integers; pid is a single positive process.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, sig) };
    ret == 0
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    signal(pid, 0)
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
async fn terminate(pid: u32, grace: Duration) {
    if !signal(pid, libc::SIGTERM) {
        return;
    }
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    warn!(pid, "Orphan ignored SIGTERM, killing");
    signal(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
async fn terminate(_pid: u32, _grace: Duration) {}
