//! Tool-call surface.
//!
//! Exposes the orchestrator as named tools taking and returning JSON, the
//! shape agent runtimes and the `--stdio` transport speak. Arguments are
//! deserialized into typed structs; unknown tools and malformed arguments
//! are [`OrchestratorError::InvalidArguments`].

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::backend::Attachment;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;

pub const TOOL_NAMES: &[&str] = &[
    "spawn_worker",
    "stop_worker",
    "list_workers",
    "list_profiles",
    "ask_worker",
    "ask_worker_async",
    "await_worker_job",
    "delegate_task",
    "run_workflow",
    "list_workflows",
    "list_jobs",
    "session_summary",
];

const fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerArgs {
    worker_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AskArgs {
    worker_id: String,
    message: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default = "default_true")]
    auto_spawn: bool,
    /// Only read by `ask_worker_async`.
    #[serde(default)]
    requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AwaitArgs {
    job_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DelegateArgs {
    task: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default = "default_true")]
    auto_spawn: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowArgs {
    workflow_id: String,
    task: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default = "default_true")]
    auto_spawn: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListJobsArgs {
    #[serde(default)]
    worker_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

fn parse<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| OrchestratorError::invalid(format!("{tool}: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| OrchestratorError::invalid(format!("unserializable result: {e}")))
}

/// JSON body for a failed call.
pub fn error_value(err: &OrchestratorError) -> Value {
    json!({
        "code": err.code(),
        "message": err.to_string(),
        "retryable": err.is_retryable(),
    })
}

/// Dispatches named tool calls to an [`Orchestrator`].
#[derive(Clone)]
pub struct ToolSurface {
    orchestrator: Orchestrator,
}

impl ToolSurface {
    pub const fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        debug!(tool = name, "Tool call");
        let orch = &self.orchestrator;
        match name {
            "spawn_worker" => {
                let args: WorkerArgs = parse(name, args)?;
                to_value(&orch.spawn_worker(&args.worker_id).await?)
            }
            "stop_worker" => {
                let args: WorkerArgs = parse(name, args)?;
                let stopped = orch.stop_worker(&args.worker_id).await;
                Ok(json!({ "worker_id": args.worker_id, "stopped": stopped }))
            }
            "list_workers" => {
                parse::<NoArgs>(name, args)?;
                to_value(&orch.list_workers().await)
            }
            "list_profiles" => {
                parse::<NoArgs>(name, args)?;
                to_value(&orch.list_profiles().await)
            }
            "ask_worker" => {
                let args: AskArgs = parse(name, args)?;
                let reply = orch
                    .ask_worker(&args.worker_id, &args.message, args.attachments, args.auto_spawn)
                    .await?;
                Ok(json!({
                    "worker_id": args.worker_id,
                    "response": reply.text,
                    "tools": to_value(&reply.tools)?,
                }))
            }
            "ask_worker_async" => {
                let args: AskArgs = parse(name, args)?;
                let job = orch
                    .ask_worker_async(
                        &args.worker_id,
                        &args.message,
                        args.attachments,
                        args.auto_spawn,
                        args.requested_by,
                    )
                    .await?;
                to_value(&job)
            }
            "await_worker_job" => {
                let args: AwaitArgs = parse(name, args)?;
                let awaited = orch
                    .await_job(&args.job_id, args.timeout_ms.map(Duration::from_millis))
                    .await?;
                to_value(&awaited)
            }
            "delegate_task" => {
                let args: DelegateArgs = parse(name, args)?;
                to_value(
                    &orch
                        .delegate_task(&args.task, args.attachments, args.auto_spawn)
                        .await?,
                )
            }
            "run_workflow" => {
                let args: WorkflowArgs = parse(name, args)?;
                let run = orch
                    .run_workflow(
                        &args.workflow_id,
                        &args.task,
                        &args.attachments,
                        args.auto_spawn,
                    )
                    .await?;
                to_value(&run)
            }
            "list_workflows" => {
                parse::<NoArgs>(name, args)?;
                to_value(&orch.list_workflows().await)
            }
            "list_jobs" => {
                let args: ListJobsArgs = parse(name, args)?;
                to_value(&orch.list_jobs(args.worker_id.as_deref()).await)
            }
            "session_summary" => {
                parse::<NoArgs>(name, args)?;
                let sessions = orch.sessions();
                Ok(json!({
                    "summary": to_value(&sessions.get_summary().await)?,
                    "active": to_value(&sessions.get_active_sessions().await)?,
                }))
            }
            other => Err(OrchestratorError::invalid(format!("unknown tool '{other}'"))),
        }
    }
}
