//! Foreman Daemon
//!
//! Supervises agent worker processes and serves the orchestration tool
//! surface, either as a long-running service or as NDJSON over stdio.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use foreman_daemon::backend::{ProcessBackend, ScriptedBackend, WorkerBackend};
use foreman_daemon::tools::error_value;
use foreman_daemon::{Orchestrator, ToolSurface};

#[derive(Parser, Debug)]
#[command(name = "foreman-daemon")]
#[command(version, about = "Foreman daemon - agent worker orchestration")]
struct Args {
    /// Extra config file layered over global and project settings
    #[arg(long, env = "FOREMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Project directory whose `.foreman/settings.json` is loaded
    #[arg(long, env = "FOREMAN_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Worker executable (overrides `daemon.worker_bin`)
    #[arg(long, env = "FOREMAN_WORKER_BIN")]
    worker_bin: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "FOREMAN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FOREMAN_LOG_JSON")]
    log_json: bool,

    /// Serve the tool surface as NDJSON over stdin/stdout.
    #[arg(long)]
    stdio: bool,

    /// Use an in-memory scripted backend instead of launching processes.
    #[arg(long, env = "FOREMAN_DRY_RUN")]
    dry_run: bool,
}

/// One NDJSON request line.
#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    args: Value,
}

/// One NDJSON response line; exactly one of `ok`/`error` is set.
#[derive(Debug, Serialize)]
struct ToolResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        foreman_core::config::load_config(args.project_dir.as_deref(), args.config.as_deref())?;
    if let Some(bin) = args.worker_bin {
        config.daemon.worker_bin = bin;
    }
    if let Some(level) = args.log_level {
        config.daemon.log_level = level;
    }

    let level = &config.daemon.log_level;
    let log_filter = format!("foreman_daemon={level},foreman_core={level}");
    foreman_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        profiles = config.profiles.len(),
        workflows = config.workflows.definitions.len(),
        dry_run = args.dry_run,
        "Starting foreman-daemon"
    );

    let backend: Arc<dyn WorkerBackend> = if args.dry_run {
        // Scripted pids are fake; never record them for orphan reaping.
        config.daemon.state_dir = None;
        Arc::new(ScriptedBackend::new())
    } else {
        config.daemon.state_dir = config.daemon.resolved_state_dir();
        Arc::new(ProcessBackend::new(config.daemon.clone())?)
    };

    let orchestrator = Orchestrator::new(config, backend)?;
    orchestrator.start().await;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so worker processes
    // don't accidentally notify systemd.
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "systemd notification failed");
    }

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let stdio_mode = args.stdio;
    let surface = ToolSurface::new(orchestrator.clone());
    let stdio = async {
        if stdio_mode {
            serve_stdio(surface).await
        } else {
            std::future::pending().await
        }
    };

    info!(stdio = stdio_mode, "Foreman ready");

    tokio::select! {
        result = stdio => {
            if let Err(e) = result {
                warn!(error = %e, "Stdio transport failed");
            }
            info!("Stdin closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    orchestrator.shutdown().await;
    info!("Daemon stopped");
    Ok(())
}

/// Read NDJSON tool requests from stdin until EOF. Requests run
/// concurrently; responses are written one per line as they complete.
async fn serve_stdio(surface: ToolSurface) -> std::io::Result<()> {
    serve_lines(
        surface,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

async fn serve_lines<R, W>(surface: ToolSurface, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ToolResponse>(64);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode tool response");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = output.write_all(&line).await {
                warn!(error = %e, "Failed to write tool response");
                return;
            }
            if let Err(e) = output.flush().await {
                warn!(error = %e, "Failed to flush tool response");
                return;
            }
        }
    });

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: ToolRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let response = ToolResponse {
                    id: Value::Null,
                    ok: None,
                    error: Some(serde_json::json!({
                        "code": "invalid_request",
                        "message": e.to_string(),
                        "retryable": false,
                    })),
                };
                if tx.send(response).await.is_err() {
                    debug!("Response writer gone, dropping parse error");
                }
                continue;
            }
        };

        let surface = surface.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let tool = request.tool.clone();
            let response = match surface.call(&request.tool, request.args).await {
                Ok(value) => ToolResponse {
                    id: request.id,
                    ok: Some(value),
                    error: None,
                },
                Err(e) => ToolResponse {
                    id: request.id,
                    ok: None,
                    error: Some(error_value(&e)),
                },
            };
            if tx.send(response).await.is_err() {
                debug!(tool = %tool, "Response writer gone, dropping tool response");
            }
        });
    }

    drop(tx);
    if let Err(e) = writer.await {
        warn!(error = %e, "Response writer task failed");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use foreman_core::{Config, WorkerProfile};
    use tokio::io::AsyncReadExt;

    fn surface() -> ToolSurface {
        let mut config = Config::default();
        config.daemon.port_range_start = 0;
        config.health.enabled = false;
        config.profiles = vec![WorkerProfile::new("coder")];
        let orch = Orchestrator::new(config, Arc::new(ScriptedBackend::new())).unwrap();
        ToolSurface::new(orch)
    }

    #[tokio::test]
    async fn answers_each_request_line() {
        let input = concat!(
            r#"{"id": 1, "tool": "list_profiles"}"#,
            "\n",
            "not json\n",
            "\n",
        );
        let (out_tx, mut out_rx) = tokio::io::duplex(64 * 1024);
        serve_lines(surface(), input.as_bytes(), out_tx)
            .await
            .unwrap();

        let mut text = String::new();
        out_rx.read_to_string(&mut text).await.unwrap();
        let responses: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        let ok = responses.iter().find(|r| r["id"] == 1).unwrap();
        assert_eq!(ok["ok"][0]["id"], "coder");
        let bad = responses.iter().find(|r| r["id"].is_null()).unwrap();
        assert_eq!(bad["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn closed_output_does_not_stop_input() {
        let input = concat!(
            r#"{"id": 1, "tool": "list_workers"}"#,
            "\n",
            r#"{"id": 2, "tool": "list_jobs"}"#,
            "\n",
        );
        let (out_tx, out_rx) = tokio::io::duplex(64);
        drop(out_rx);
        serve_lines(surface(), input.as_bytes(), out_tx)
            .await
            .unwrap();
    }
}
