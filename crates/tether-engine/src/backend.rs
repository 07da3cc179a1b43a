//! Collaborator seams: the agent that produces messages, the cooperative
//! interrupt it may offer, the permission question it may ask, and the shell
//! that runs raw commands. Production implementations talk to child
//! processes; tests use [`crate::mock`].

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use tether_core::ids::{OperationId, SessionId};
use tether_core::permission::{PermissionMode, PermissionOutcome};

use crate::error::EngineError;

/// Time a child gets between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Everything an agent backend needs to run one query.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub operation_id: OperationId,
    /// Agent session to resume; `None` starts a new conversation.
    pub resume: Option<SessionId>,
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: String,
    pub permission_mode: PermissionMode,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Value, EngineError>> + Send>>;

/// A started agent query.
pub struct AgentRun {
    pub messages: MessageStream,
    pub interrupter: Option<Arc<dyn Interrupter>>,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn start(
        &self,
        request: QueryRequest,
        gate: Arc<dyn PermissionGate>,
        cancel: CancellationToken,
    ) -> Result<AgentRun, EngineError>;
}

/// Cooperative stop: the agent finishes its current step and ends cleanly.
#[async_trait]
pub trait Interrupter: Send + Sync {
    async fn interrupt(&self) -> Result<(), EngineError>;
}

/// Answers the agent's "may I use this tool?" question.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        reason: Option<String>,
    ) -> PermissionOutcome;
}

/// One item of shell output.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessOutput {
    Stdout(String),
    Stderr(String),
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

pub type OutputStream = Pin<Box<dyn Stream<Item = ProcessOutput> + Send>>;

/// Starts raw shell commands. The stream always ends with `Exit`.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        command: &str,
        cwd: &Path,
        cancel: CancellationToken,
    ) -> Result<OutputStream, EngineError>;
}

fn send_signal(pid: Option<u32>, signal: i32) -> bool {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: kill(2) has no memory-safety preconditions.
        return unsafe { libc::kill(pid, signal) } == 0;
    }
    let _ = (pid, signal);
    false
}

/// Signal every process in the group led by `pgid`.
fn signal_group(pgid: Option<u32>, signal: i32) -> bool {
    #[cfg(unix)]
    if let Some(pgid) = pgid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0) {
        // SAFETY: kill(2) has no memory-safety preconditions.
        return unsafe { libc::kill(-pgid, signal) } == 0;
    }
    let _ = (pgid, signal);
    false
}

/// SIGTERM the child's process group, then SIGKILL whatever is left once
/// the leader exits or the grace period runs out. Children are spawned as
/// group leaders, so this reaches everything they forked.
async fn terminate(child: &mut Child) -> Option<std::process::ExitStatus> {
    let pgid = child.id();
    signal_group(pgid, libc::SIGTERM);
    let status = match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!(pid = ?pgid, "child ignored SIGTERM, killing");
            signal_group(pgid, libc::SIGKILL);
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };
    signal_group(pgid, libc::SIGKILL);
    status
}

/// Split a pipe into lines, decoding each one lossily and dropping the
/// line terminator.
fn output_lines<R>(reader: R) -> impl Stream<Item = std::io::Result<String>> + Send
where
    R: tokio::io::AsyncRead + Send + Unpin,
{
    SplitStream::new(BufReader::new(reader).split(b'\n')).map(|chunk| {
        chunk.map(|mut bytes| {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn exit_parts(status: Option<std::process::ExitStatus>) -> (Option<i32>, Option<i32>) {
    let Some(status) = status else {
        return (None, None);
    };
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

/// Runs `sh -c <command>` and streams its output line by line.
#[derive(Clone, Debug, Default)]
pub struct ShellLauncher;

#[async_trait]
impl ProcessLauncher for ShellLauncher {
    async fn launch(
        &self,
        command: &str,
        cwd: &Path,
        cancel: CancellationToken,
    ) -> Result<OutputStream, EngineError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("sh -c {command:?}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Spawn("stderr not captured".into()))?;

        let out = output_lines(stdout).map(|line| line.map(ProcessOutput::Stdout));
        let err = output_lines(stderr).map(|line| line.map(ProcessOutput::Stderr));
        let mut merged = out.merge(err);

        let stream = async_stream::stream! {
            let mut cancelled = false;
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => None,
                    line = merged.next() => Some(line),
                };
                match next {
                    None => {
                        cancelled = true;
                        break;
                    }
                    Some(Some(Ok(output))) => yield output,
                    Some(Some(Err(e))) => {
                        tracing::debug!(error = %e, "unreadable output line");
                    }
                    Some(None) => break,
                }
            }

            let status = if cancelled {
                terminate(&mut child).await
            } else {
                child.wait().await.ok()
            };
            let (code, signal) = exit_parts(status);
            yield ProcessOutput::Exit { code, signal };
        };

        Ok(Box::pin(stream))
    }
}

/// Agent backend that talks newline-delimited JSON to a child process.
///
/// The query is written to the child's stdin as the first line. Every stdout
/// line is one agent message, except `{"type":"permission_request", ...}`
/// lines, which are answered with a `permission_response` line on stdin.
/// SIGINT is the cooperative interrupt.
#[derive(Clone, Debug)]
pub struct ProcessAgentBackend {
    program: String,
    args: Vec<String>,
}

impl ProcessAgentBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace.
    pub fn from_command_line(command: &str) -> Result<Self, EngineError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| EngineError::InvalidInput("empty agent command".into()))?;
        Ok(Self::new(program, parts.collect()))
    }
}

struct SignalInterrupter {
    pid: Option<u32>,
}

#[async_trait]
impl Interrupter for SignalInterrupter {
    async fn interrupt(&self) -> Result<(), EngineError> {
        if send_signal(self.pid, libc::SIGINT) {
            Ok(())
        } else {
            Err(EngineError::Interrupt("agent process is gone".into()))
        }
    }
}

async fn write_line(stdin: &tokio::sync::Mutex<ChildStdin>, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

#[async_trait]
impl AgentBackend for ProcessAgentBackend {
    async fn start(
        &self,
        request: QueryRequest,
        gate: Arc<dyn PermissionGate>,
        cancel: CancellationToken,
    ) -> Result<AgentRun, EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {e}", self.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Spawn("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("stdout not captured".into()))?;
        let stdin = Arc::new(tokio::sync::Mutex::new(stdin));

        let query = json!({
            "type": "query",
            "prompt": request.prompt,
            "cwd": request.cwd,
            "model": request.model,
            "permissionMode": request.permission_mode,
            "resume": request.resume,
        });
        write_line(&stdin, &query)
            .await
            .map_err(|e| EngineError::Spawn(format!("failed to send query: {e}")))?;

        let interrupter: Arc<dyn Interrupter> = Arc::new(SignalInterrupter { pid: child.id() });
        let mut lines = Box::pin(output_lines(stdout));
        let program = self.program.clone();

        let messages = async_stream::stream! {
            let mut cancelled = false;
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => None,
                    line = lines.next() => Some(line),
                };
                let line = match next {
                    None => {
                        cancelled = true;
                        break;
                    }
                    Some(Some(Ok(line))) => line,
                    Some(None) => break,
                    Some(Some(Err(e))) => {
                        yield Err(EngineError::Collaborator(format!("read failed: {e}")));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "agent wrote a non-JSON line");
                        continue;
                    }
                };

                if value.get("type").and_then(Value::as_str) == Some("permission_request") {
                    let gate = Arc::clone(&gate);
                    let stdin = Arc::clone(&stdin);
                    tokio::spawn(async move {
                        let id = value.get("id").cloned().unwrap_or(Value::Null);
                        let tool = value.get("toolName").and_then(Value::as_str).unwrap_or_default();
                        let input = value.get("input").cloned().unwrap_or_else(|| json!({}));
                        let reason = value.get("reason").and_then(Value::as_str).map(str::to_string);
                        let outcome = gate.can_use_tool(tool, input, reason).await;
                        let answer = json!({ "type": "permission_response", "id": id, "outcome": outcome });
                        if let Err(e) = write_line(&stdin, &answer).await {
                            tracing::debug!(error = %e, "could not deliver permission answer");
                        }
                    });
                    continue;
                }

                yield Ok(value);
            }

            if cancelled {
                terminate(&mut child).await;
                return;
            }
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    yield Err(EngineError::Collaborator(format!("{program} exited with {status}")));
                }
                Err(e) => {
                    yield Err(EngineError::Collaborator(format!("{program}: {e}")));
                }
            }
        };

        Ok(AgentRun {
            messages: Box::pin(messages),
            interrupter: Some(interrupter),
        })
    }
}
