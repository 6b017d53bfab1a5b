//! Per-worker session tracking.
//!
//! Tracked sessions are keyed by the owning worker instance. In linked mode
//! several instances attach to the same backend session id, so the backend
//! id is only a field of the record.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use foreman_core::config::SessionMode;

use super::types::{
    Activity, ActivityKind, SessionStatus, SessionSummary, TrackedSession, summarize,
};
use crate::events::{EventBus, ForemanEvent};
use crate::now_millis;

/// Closed sessions kept around for inspection before being dropped.
const MAX_CLOSED_SESSIONS: usize = 256;

/// Parameters for a freshly opened worker session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub worker_id: String,
    pub instance_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    pub parent_session_id: Option<String>,
}

#[derive(Default)]
struct SessionTable {
    /// Instance id -> session.
    sessions: HashMap<String, TrackedSession>,
    /// Worker id -> instance id currently serving it.
    by_worker: HashMap<String, String>,
    closed_order: VecDeque<String>,
}

/// Owns every [`TrackedSession`]; all reads and writes go through it.
pub struct SessionManager {
    table: RwLock<SessionTable>,
    events: EventBus,
    activity_limit: usize,
    next_activity_id: AtomicU64,
}

impl SessionManager {
    pub fn new(events: EventBus, activity_limit: usize) -> Self {
        Self {
            table: RwLock::new(SessionTable::default()),
            events,
            activity_limit: activity_limit.max(1),
            next_activity_id: AtomicU64::new(1),
        }
    }

    /// Start tracking the session of `new.instance_id`. When `bind` is set it
    /// becomes the session returned by [`Self::get_session_by_worker`].
    pub async fn create_session(&self, new: NewSession, bind: bool) -> TrackedSession {
        let now = now_millis();
        let session = TrackedSession {
            worker_id: new.worker_id.clone(),
            instance_id: new.instance_id.clone(),
            session_id: new.session_id.clone(),
            mode: new.mode,
            parent_session_id: new.parent_session_id,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Active,
            message_count: 0,
            tool_count: 0,
            recent_activity: VecDeque::new(),
            current_task: None,
            error: None,
        };

        {
            let mut table = self.table.write().await;
            table
                .sessions
                .insert(new.instance_id.clone(), session.clone());
            if bind {
                table
                    .by_worker
                    .insert(new.worker_id.clone(), new.instance_id.clone());
            }
        }

        info!(
            worker_id = %new.worker_id,
            instance_id = %new.instance_id,
            session_id = %new.session_id,
            mode = new.mode.as_str(),
            "Session created"
        );
        self.events.publish(ForemanEvent::SessionCreated {
            worker_id: new.worker_id,
            session_id: new.session_id,
            mode: new.mode,
        });
        session
    }

    /// Make the session of `instance_id` the one serving `worker_id`.
    pub async fn bind_worker(&self, worker_id: &str, instance_id: &str) {
        let mut table = self.table.write().await;
        if table.sessions.contains_key(instance_id) {
            table
                .by_worker
                .insert(worker_id.to_string(), instance_id.to_string());
        }
    }

    pub async fn set_current_task(&self, instance_id: &str, task: Option<&str>) {
        let mut table = self.table.write().await;
        if let Some(session) = table.sessions.get_mut(instance_id) {
            session.current_task = task.map(summarize);
            session.last_activity = now_millis();
        }
    }

    pub async fn record_message(&self, instance_id: &str, text: &str) {
        let summary = summarize(text);
        let Some((worker_id, session_id)) = self
            .push_activity(instance_id, ActivityKind::Message, &summary, None)
            .await
        else {
            return;
        };
        self.events.publish(ForemanEvent::SessionMessage {
            worker_id,
            session_id,
            summary,
        });
    }

    pub async fn record_tool(&self, instance_id: &str, tool: &str, summary: &str) {
        let Some((worker_id, session_id)) = self
            .push_activity(
                instance_id,
                ActivityKind::Tool,
                tool,
                (!summary.is_empty()).then(|| summarize(summary)),
            )
            .await
        else {
            return;
        };
        self.events.publish(ForemanEvent::SessionTool {
            worker_id,
            session_id,
            tool: tool.to_string(),
        });
    }

    /// Record a failure; the session is marked `error` until its next message.
    pub async fn record_error(&self, instance_id: &str, error: &str) {
        let Some((worker_id, session_id)) = self
            .push_activity(instance_id, ActivityKind::Error, &summarize(error), None)
            .await
        else {
            return;
        };
        {
            let mut table = self.table.write().await;
            if let Some(session) = table.sessions.get_mut(instance_id) {
                session.status = SessionStatus::Error;
                session.error = Some(error.to_string());
            }
        }
        warn!(worker_id = %worker_id, session_id = %session_id, error, "Session error");
        self.events.publish(ForemanEvent::SessionError {
            worker_id,
            session_id,
            error: error.to_string(),
        });
    }

    /// Append an activity; yields the worker and backend session ids.
    async fn push_activity(
        &self,
        instance_id: &str,
        kind: ActivityKind,
        summary: &str,
        details: Option<String>,
    ) -> Option<(String, String)> {
        let mut table = self.table.write().await;
        let Some(session) = table.sessions.get_mut(instance_id) else {
            debug!(instance_id, "Activity for unknown session ignored");
            return None;
        };
        if matches!(session.status, SessionStatus::Closed) {
            return None;
        }

        let now = now_millis();
        let activity = Activity {
            id: self.next_activity_id.fetch_add(1, Ordering::Relaxed),
            kind,
            timestamp: now,
            summary: summary.to_string(),
            details,
        };
        if session.recent_activity.len() >= self.activity_limit {
            session.recent_activity.pop_front();
        }
        session.recent_activity.push_back(activity);
        session.last_activity = now;
        match kind {
            ActivityKind::Message => {
                session.message_count += 1;
                if matches!(session.status, SessionStatus::Error) {
                    session.status = SessionStatus::Active;
                    session.error = None;
                }
            }
            ActivityKind::Tool => session.tool_count += 1,
            ActivityKind::Error => {}
        }
        Some((session.worker_id.clone(), session.session_id.clone()))
    }

    /// Close the session of `instance_id`. Returns `false` if it is unknown
    /// or already closed.
    pub async fn close_session(&self, instance_id: &str) -> bool {
        let (worker_id, session_id) = {
            let mut table = self.table.write().await;
            let Some(session) = table.sessions.get_mut(instance_id) else {
                return false;
            };
            if matches!(session.status, SessionStatus::Closed) {
                return false;
            }
            session.status = SessionStatus::Closed;
            session.current_task = None;
            session.last_activity = now_millis();
            let worker_id = session.worker_id.clone();
            let session_id = session.session_id.clone();

            if table.by_worker.get(&worker_id).map(String::as_str) == Some(instance_id) {
                table.by_worker.remove(&worker_id);
            }
            table.closed_order.push_back(instance_id.to_string());
            while table.closed_order.len() > MAX_CLOSED_SESSIONS {
                if let Some(old) = table.closed_order.pop_front() {
                    table.sessions.remove(&old);
                }
            }
            (worker_id, session_id)
        };

        info!(worker_id = %worker_id, instance_id, session_id = %session_id, "Session closed");
        self.events.publish(ForemanEvent::SessionClosed {
            worker_id,
            session_id,
        });
        true
    }

    /// The session owned by `instance_id`.
    pub async fn get_session(&self, instance_id: &str) -> Option<TrackedSession> {
        self.table.read().await.sessions.get(instance_id).cloned()
    }

    pub async fn get_session_by_worker(&self, worker_id: &str) -> Option<TrackedSession> {
        let table = self.table.read().await;
        let instance_id = table.by_worker.get(worker_id)?;
        table.sessions.get(instance_id).cloned()
    }

    /// Every tracked session attached to backend session `session_id`.
    pub async fn get_sessions_by_backend_id(&self, session_id: &str) -> Vec<TrackedSession> {
        let mut sessions: Vec<_> = self
            .table
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Sessions not yet closed, most recently active first.
    pub async fn get_active_sessions(&self) -> Vec<TrackedSession> {
        let mut sessions: Vec<_> = self
            .table
            .read()
            .await
            .sessions
            .values()
            .filter(|s| !matches!(s.status, SessionStatus::Closed))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    pub async fn get_sessions_by_mode(&self, mode: SessionMode) -> Vec<TrackedSession> {
        let mut sessions: Vec<_> = self
            .table
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.mode == mode)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn get_summary(&self) -> SessionSummary {
        let table = self.table.read().await;
        let mut summary = SessionSummary {
            total: table.sessions.len(),
            ..SessionSummary::default()
        };
        for session in table.sessions.values() {
            match session.status {
                SessionStatus::Active => summary.active += 1,
                SessionStatus::Error => summary.errored += 1,
                SessionStatus::Closed => summary.closed += 1,
            }
            *summary
                .by_mode
                .entry(session.mode.as_str().to_string())
                .or_default() += 1;
            summary.total_messages += session.message_count;
            summary.total_tools += session.tool_count;
        }
        summary
    }
}
