//! Workflow run records.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Stopped by daemon shutdown before the last step finished.
    Aborted,
}

impl WorkflowRunStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Interrupted by daemon shutdown while running.
    Aborted,
}

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub title: String,
    pub worker_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One execution of a workflow definition. Only started steps appear in
/// `steps`; steps skipped after a failure or shutdown are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    pub task: String,
    pub status: WorkflowRunStatus,
    pub steps: Vec<StepResult>,
    /// Length in chars of the carry buffer when the run ended.
    pub carry_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

impl WorkflowRun {
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowRunStatus::Succeeded
    }

    /// Response of the last successful step.
    pub fn final_response(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Succeeded)
            .and_then(|s| s.response.as_deref())
    }
}

/// Listing entry for a configured workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
}
