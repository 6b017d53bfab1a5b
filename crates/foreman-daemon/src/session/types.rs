//! Tracked session types.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use foreman_core::config::SessionMode;

/// Longest activity summary kept per entry.
pub const MAX_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Message,
    Tool,
    Error,
}

/// One entry in a session's activity ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub timestamp: u64,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Error,
    Closed,
}

/// Everything the daemon knows about one worker's session.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedSession {
    pub worker_id: String,
    pub instance_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub created_at: u64,
    pub last_activity: u64,
    pub status: SessionStatus,
    pub message_count: u64,
    pub tool_count: u64,
    /// Most recent activity, oldest first, capped at the configured limit.
    pub recent_activity: VecDeque<Activity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrackedSession {
    pub const fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Active)
    }
}

/// Aggregate view over all tracked sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub total: usize,
    pub active: usize,
    pub errored: usize,
    pub closed: usize,
    pub by_mode: BTreeMap<String, usize>,
    pub total_messages: u64,
    pub total_tools: u64,
}

/// Truncate to [`MAX_SUMMARY_CHARS`], on a char boundary.
pub fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_SUMMARY_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_SUMMARY_CHARS - 3).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_kept() {
        assert_eq!(summarize("  hello  "), "hello");
    }

    #[test]
    fn long_text_is_cut_on_char_boundary() {
        let text = "é".repeat(500);
        let out = summarize(&text);
        assert_eq!(out.chars().count(), MAX_SUMMARY_CHARS);
        assert!(out.ends_with("..."));
    }
}
