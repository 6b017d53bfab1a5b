//! Sequential workflow runner.
//!
//! Steps run strictly in order. Each step's prompt is rendered from its
//! template, the output of earlier `carry` steps is threaded forward in a
//! bounded buffer, and every step runs under the per-step deadline. The
//! first failing step ends the run; later steps never execute.

use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::{Captures, Regex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use foreman_core::config::{WorkflowDefinition, WorkflowLimits};

use super::types::{StepResult, StepStatus, WorkflowRun, WorkflowRunStatus};
use crate::backend::Attachment;
use crate::error::{OrchestratorError, Result};
use crate::now_millis;

#[allow(clippy::expect_used)]
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(task|carry)\}").expect("static regex is valid"));

const CARRY_SEPARATOR: &str = "\n\n";
const CARRY_HEADER: &str = "\n\nContext from previous steps:\n";

/// Runs one step's prompt on a worker.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        worker_id: &str,
        prompt: &str,
        attachments: &[Attachment],
        auto_spawn: bool,
    ) -> Result<String>;
}

pub struct WorkflowEngine {
    limits: WorkflowLimits,
    shutdown: Option<watch::Receiver<bool>>,
}

impl WorkflowEngine {
    pub const fn new(limits: WorkflowLimits) -> Self {
        Self {
            limits,
            shutdown: None,
        }
    }

    /// Abort runs when `shutdown` flips to `true`.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub const fn limits(&self) -> &WorkflowLimits {
        &self.limits
    }

    /// Reject definitions the limits do not admit.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        if definition.steps.is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "workflow '{}' has no steps",
                definition.id
            )));
        }
        if definition.steps.len() > self.limits.max_steps {
            return Err(OrchestratorError::WorkflowLimitsExceeded {
                message: format!(
                    "workflow '{}' has {} steps, limit is {}",
                    definition.id,
                    definition.steps.len(),
                    self.limits.max_steps
                ),
            });
        }
        Ok(())
    }

    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        task: &str,
        attachments: &[Attachment],
        auto_spawn: bool,
        executor: &dyn StepExecutor,
    ) -> Result<WorkflowRun> {
        self.validate(definition)?;

        let mut run = WorkflowRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            task: task.to_string(),
            status: WorkflowRunStatus::Pending,
            steps: Vec::with_capacity(definition.steps.len()),
            carry_chars: 0,
            error: None,
            started_at: now_millis(),
            finished_at: None,
        };
        info!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            steps = definition.steps.len(),
            "Workflow started"
        );
        run.status = WorkflowRunStatus::Running;

        let mut shutdown = self.shutdown.clone();
        let mut carry = String::new();

        for (index, step) in definition.steps.iter().enumerate() {
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                Self::abort(&mut run, &step.id);
                break;
            }

            let bounded_carry = tail_chars(&carry, self.limits.max_carry_chars);
            let rendered = render_prompt(&step.prompt_template, task, bounded_carry);
            let prompt = head_chars(&rendered, self.limits.max_task_chars);
            let step_attachments: &[Attachment] = if index == 0 { attachments } else { &[] };
            debug!(
                workflow_id = %run.workflow_id,
                step_id = %step.id,
                worker_id = %step.worker_id,
                prompt_chars = prompt.chars().count(),
                carry_chars = bounded_carry.chars().count(),
                "Running workflow step"
            );

            let started = Instant::now();
            let call = tokio::time::timeout(
                self.limits.per_step_timeout(),
                executor.execute(&step.worker_id, prompt, step_attachments, auto_spawn),
            );
            let outcome = match shutdown.as_mut() {
                Some(rx) => tokio::select! {
                    outcome = call => Some(outcome),
                    () = shutdown_signalled(rx) => None,
                },
                None => Some(call.await),
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let Some(outcome) = outcome else {
                run.steps.push(StepResult {
                    step_id: step.id.clone(),
                    title: step.title.clone(),
                    worker_id: step.worker_id.clone(),
                    status: StepStatus::Aborted,
                    response: None,
                    error: Some("interrupted by shutdown".to_string()),
                    duration_ms,
                });
                Self::abort(&mut run, &step.id);
                break;
            };

            let failure = match outcome {
                Ok(Ok(response)) => {
                    if step.carry {
                        append_carry(&mut carry, &response, self.limits.max_carry_chars);
                    }
                    run.steps.push(StepResult {
                        step_id: step.id.clone(),
                        title: step.title.clone(),
                        worker_id: step.worker_id.clone(),
                        status: StepStatus::Succeeded,
                        response: Some(response),
                        error: None,
                        duration_ms,
                    });
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!(
                    "step '{}' timed out after {}ms",
                    step.id, self.limits.per_step_timeout_ms
                )),
            };

            if let Some(error) = failure {
                warn!(
                    workflow_id = %run.workflow_id,
                    step_id = %step.id,
                    worker_id = %step.worker_id,
                    error = %error,
                    "Workflow step failed"
                );
                run.steps.push(StepResult {
                    step_id: step.id.clone(),
                    title: step.title.clone(),
                    worker_id: step.worker_id.clone(),
                    status: StepStatus::Failed,
                    response: None,
                    error: Some(error.clone()),
                    duration_ms,
                });
                run.status = WorkflowRunStatus::Failed;
                run.error = Some(format!("step '{}' failed: {error}", step.id));
                break;
            }
        }

        if run.status == WorkflowRunStatus::Running {
            run.status = WorkflowRunStatus::Succeeded;
        }
        run.carry_chars = carry.chars().count();
        run.finished_at = Some(now_millis());
        info!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            status = ?run.status,
            steps_run = run.steps.len(),
            "Workflow finished"
        );
        Ok(run)
    }

    fn abort(run: &mut WorkflowRun, step_id: &str) {
        warn!(workflow_id = %run.workflow_id, step_id, "Workflow aborted by shutdown");
        run.status = WorkflowRunStatus::Aborted;
        run.error = Some(format!("aborted before step '{step_id}' completed"));
    }
}

/// Resolves once shutdown is requested; never resolves if the sender is gone.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Substitute `{task}` and `{carry}` in a single pass, so placeholder text
/// inside the task or carry is left alone. Carry is appended when the
/// template has no slot for it.
fn render_prompt(template: &str, task: &str, carry: &str) -> String {
    let mut rendered = PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            if &caps[1] == "task" {
                task.to_string()
            } else {
                carry.to_string()
            }
        })
        .into_owned();
    if !carry.is_empty() && !template.contains("{carry}") {
        rendered.push_str(CARRY_HEADER);
        rendered.push_str(carry);
    }
    rendered
}

fn append_carry(carry: &mut String, response: &str, max_chars: usize) {
    if !carry.is_empty() {
        carry.push_str(CARRY_SEPARATOR);
    }
    carry.push_str(response);
    let kept = tail_chars(carry, max_chars);
    if kept.len() != carry.len() {
        *carry = kept.to_string();
    }
}

/// The last `max` chars of `text`.
fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    text.char_indices()
        .nth(count - max)
        .map_or("", |(i, _)| &text[i..])
}

/// The first `max` chars of `text`.
fn head_chars(text: &str, max: usize) -> &str {
    text.char_indices().nth(max).map_or(text, |(i, _)| &text[..i])
}
