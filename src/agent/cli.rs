//! Streamed-stdout CLI dialect.
//!
//! Spawns the agent binary once per turn with `--output-format stream-json`
//! style flags, writes the prompt to stdin, and parses stdout as
//! newline-delimited JSON. Malformed lines are logged and skipped; they never
//! abort the run.

use super::{AdapterError, AgentEvent, TurnOutcome, TurnRequest};
use crate::supervisor::AgentSpec;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How long a soft-stopped child gets before SIGKILL on cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Execute one turn against a stream-json CLI agent.
///
/// Every decoded stdout object is handed to `sink` before the next line is
/// read. Exit code 0 maps to success, non-zero to `NonZeroExit`; the overall
/// timeout maps to `Timeout` (an error, not a cancellation).
pub async fn run_cli_turn(
    spec: &AgentSpec,
    req: &TurnRequest,
    sink: &mut (dyn FnMut(AgentEvent) + Send),
    cancel: &CancellationToken,
) -> Result<TurnOutcome, AdapterError> {
    let mut cmd = Command::new(spec.binary);
    cmd.args(spec.turn_args);
    if let Some(model) = &req.model {
        cmd.args(["--model", model]);
    }
    if let Some(sub_agent) = &req.sub_agent {
        cmd.args(["--agent", sub_agent]);
    }
    if let Some(resume) = &req.resume_session {
        cmd.args(["--resume", resume]);
    }
    if let Some(system) = &req.system_prompt {
        cmd.args(["--append-system-prompt", system]);
    }
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group so cancellation reaches nested children.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0)).ok();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| AdapterError::SpawnFailed {
        binary: spec.binary.to_string(),
        message: e.to_string(),
    })?;

    let pid = child.id().and_then(|p| i32::try_from(p).ok());
    tracing::debug!(agent = spec.id, session = %req.session_id, ?pid, "Spawned turn process");

    // Prompt goes to stdin; closing it signals end of input.
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(req.prompt.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await?;
    }

    if let Some(stderr) = child.stderr.take() {
        let agent_id = spec.id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "agent_stderr", agent = agent_id, "{line}");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AdapterError::Protocol("child has no stdout".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut final_text: Option<String> = None;
    let deadline = tokio::time::sleep(req.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                soft_then_hard_kill(&mut child, pid).await;
                return Ok(TurnOutcome::Cancelled);
            }
            () = &mut deadline => {
                tracing::warn!(session = %req.session_id, timeout = ?req.timeout, "Turn timed out");
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                let _ = child.wait().await;
                return Err(AdapterError::Timeout(req.timeout));
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let payload: Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!(session = %req.session_id, error = %e, "Skipping unparseable agent line");
                                continue;
                            }
                        };
                        if payload.get("type").and_then(Value::as_str) == Some("result") {
                            final_text = payload
                                .get("result")
                                .and_then(Value::as_str)
                                .map(String::from);
                        }
                        sink(AgentEvent::from_payload(payload));
                    }
                    None => break,
                }
            }
        }
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(TurnOutcome::Success { final_text })
    } else {
        Err(AdapterError::NonZeroExit(status.code().unwrap_or(-1)))
    }
}

/// Cooperative termination: soft signal, short grace, hard signal.
async fn soft_then_hard_kill(child: &mut Child, pid: Option<i32>) {
    if let Some(pid) = pid {
        signal_group(pid, Signal::SIGTERM);
        if tokio::time::timeout(CANCEL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        signal_group(pid, Signal::SIGKILL);
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Signal the child's process group, falling back to the process itself.
fn signal_group(pid: i32, sig: Signal) {
    if killpg(Pid::from_raw(pid), sig).is_err() {
        let _ = kill(Pid::from_raw(pid), sig);
    }
}
