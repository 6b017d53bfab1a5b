//! Multi-step workflows over worker profiles.

pub mod engine;
pub mod types;

pub use engine::{StepExecutor, WorkflowEngine};
pub use types::{StepResult, StepStatus, WorkflowRun, WorkflowRunStatus, WorkflowSummary};
