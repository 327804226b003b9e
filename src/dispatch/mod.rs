//! Agent subprocess dispatch.
//!
//! A dispatch spawns the configured agent command, feeds it the prompt on
//! stdin, collects stdout under a deadline, and extracts the fenced YAML
//! block from the reply. The dispatcher is the sole owner of child
//! processes: a timeout or cancel terminates the child before the result
//! is reported, and partial output captured up to that point survives in
//! the result.

pub mod schema;
pub mod testing;

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::DispatchError;
use crate::util::estimate_tokens;
use schema::OutputSchema;

static YAML_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:yaml|yml)?\s*\n(.*?)\n\s*```").unwrap());

/// Default per-dispatch deadline when the request does not carry one.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Terminal status of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Completed,
    Failed,
    Timeout,
}

/// Input/output token estimate for one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenEstimate {
    pub input: u64,
    pub output: u64,
}

/// One agent dispatch request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub prompt: String,
    /// Agent name recorded in token usage (e.g. `dev-story`).
    pub agent: String,
    /// Task label used for log file names (e.g. `dev-story-13-5-b1`).
    pub task_type: String,
    pub timeout: Option<Duration>,
    pub output_schema: Option<OutputSchema>,
}

/// Terminal result of a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub id: String,
    pub status: DispatchStatus,
    pub exit_code: i32,
    /// Raw agent output (possibly partial on timeout/cancel).
    pub output: String,
    /// Schema-validated YAML document; present iff `status == Completed`
    /// and the extracted block validates.
    pub parsed: Option<serde_yaml::Value>,
    pub parse_error: Option<String>,
    pub duration_ms: u64,
    pub token_estimate: TokenEstimate,
}

/// The seam the orchestrator and workflows dispatch through. Tests script
/// this; production uses [`SubprocessDispatcher`].
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResult>;
}

/// Extract the single fenced YAML block from agent output.
pub fn extract_yaml_block(output: &str) -> Option<&str> {
    YAML_BLOCK
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Parse and validate the fenced YAML block for a completed dispatch.
/// Returns `(parsed, parse_error)`; exactly one side is set.
fn parse_output(
    output: &str,
    schema: &OutputSchema,
) -> (Option<serde_yaml::Value>, Option<String>) {
    let Some(block) = extract_yaml_block(output) else {
        return (None, Some(DispatchError::NoYamlBlock.to_string()));
    };
    let value: serde_yaml::Value = match serde_yaml::from_str(block) {
        Ok(v) => v,
        Err(e) => return (None, Some(format!("YAML parse error: {e}"))),
    };
    match schema.validate(&value) {
        Ok(()) => (Some(value), None),
        Err(message) => (
            None,
            Some(
                DispatchError::SchemaValidation {
                    schema: schema.name.to_string(),
                    message,
                }
                .to_string(),
            ),
        ),
    }
}

/// Handle over an in-flight subprocess dispatch.
pub struct DispatchHandle {
    result: tokio::task::JoinHandle<Result<DispatchResult>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl DispatchHandle {
    /// Terminate the subprocess. The awaited result reports `Failed` with
    /// whatever output was captured.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Await the terminal result.
    pub async fn result(self) -> Result<DispatchResult> {
        self.result
            .await
            .context("dispatch task panicked or was aborted")?
    }
}

/// Production dispatcher: spawns the agent CLI as a child process.
pub struct SubprocessDispatcher {
    command: String,
    base_args: Vec<String>,
    log_dir: Option<PathBuf>,
}

impl SubprocessDispatcher {
    pub fn new(command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            base_args,
            log_dir: None,
        }
    }

    /// Write per-dispatch prompt/output files under this directory.
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    fn write_log(&self, name: &str, content: &str) {
        if let Some(dir) = &self.log_dir {
            let path = dir.join(name);
            if let Err(e) = std::fs::write(&path, content) {
                warn!(path = %path.display(), error = %e, "failed to write dispatch log");
            }
        }
    }

    /// Spawn the agent and return a handle that can be cancelled.
    pub fn spawn(&self, request: DispatchRequest) -> Result<DispatchHandle> {
        let id = Uuid::new_v4().to_string();
        let timeout = request.timeout.unwrap_or(DEFAULT_DISPATCH_TIMEOUT);
        let input_tokens = estimate_tokens(&request.prompt) as u64;

        self.write_log(&format!("{}-prompt.md", request.task_type), &request.prompt);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.base_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| DispatchError::SpawnFailed {
            command: self.command.clone(),
            source,
        })?;

        debug!(agent = %request.agent, task = %request.task_type, pid = child.id().unwrap_or(0), "agent spawned");

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let log_dir = self.log_dir.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let deadline = started + timeout;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(request.prompt.as_bytes())
                    .await
                    .map_err(DispatchError::StdinWriteFailed)?;
                stdin
                    .shutdown()
                    .await
                    .map_err(DispatchError::StdinWriteFailed)?;
            }

            let stdout = child
                .stdout
                .take()
                .context("agent child has no piped stdout")?;
            let mut reader = BufReader::new(stdout).lines();

            let mut output = String::new();
            let mut timed_out = false;
            let mut cancelled = false;
            loop {
                tokio::select! {
                    line = reader.next_line() => match line {
                        Ok(Some(line)) => {
                            output.push_str(&line);
                            output.push('\n');
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "error reading agent stdout");
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        timed_out = true;
                        let _ = child.start_kill();
                        break;
                    }
                    _ = &mut cancel_rx => {
                        cancelled = true;
                        let _ = child.start_kill();
                        break;
                    }
                }
            }

            let exit = child.wait().await.context("failed to reap agent child")?;
            let exit_code = exit.code().unwrap_or(-1);
            let duration_ms = started.elapsed().as_millis() as u64;

            if let Some(dir) = &log_dir {
                let path = dir.join(format!("{}-output.log", request.task_type));
                if let Err(e) = std::fs::write(&path, &output) {
                    warn!(path = %path.display(), error = %e, "failed to write dispatch log");
                }
            }

            let status = if timed_out {
                DispatchStatus::Timeout
            } else if cancelled || !exit.success() {
                DispatchStatus::Failed
            } else {
                DispatchStatus::Completed
            };

            let (parsed, parse_error) = match (&status, &request.output_schema) {
                (DispatchStatus::Completed, Some(schema)) => parse_output(&output, schema),
                _ => (None, None),
            };

            Ok(DispatchResult {
                id,
                status,
                exit_code,
                token_estimate: TokenEstimate {
                    input: input_tokens,
                    output: estimate_tokens(&output) as u64,
                },
                output,
                parsed,
                parse_error,
                duration_ms,
            })
        });

        Ok(DispatchHandle {
            result: task,
            cancel: Some(cancel_tx),
        })
    }
}

#[async_trait]
impl AgentDispatcher for SubprocessDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResult> {
        self.spawn(request)?.result().await
    }
}
