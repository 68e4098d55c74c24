//! Shell command execution
//!
//! Commands run under `sh -c` in their own process group with a wall-clock
//! limit that is independent of the conversation's cancellation token. On
//! timeout or cancellation the group receives SIGTERM, then SIGKILL after a
//! grace period. Output pipes inherited by background processes are drained
//! for a bounded window after the shell exits; stragglers are then killed.

use crate::tools::types::required_str;
use crate::tools::{Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const MAX_TIMEOUT_SECS: u64 = 600;
/// Time between SIGTERM and SIGKILL
pub const KILL_GRACE: Duration = Duration::from_secs(5);
/// Bounds on how long output pipes are drained after the shell exits
const MIN_PIPE_DRAIN: Duration = Duration::from_millis(200);
const MAX_PIPE_DRAIN: Duration = Duration::from_secs(2);

enum Exit {
    Finished(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

pub struct BashTool {
    default_timeout: Duration,
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl BashTool {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout: default_timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS)),
        }
    }

    fn timeout_for(&self, args: &serde_json::Value) -> Duration {
        match args.get("timeout").and_then(|v| v.as_u64()) {
            Some(ms) => Duration::from_millis(ms).min(Duration::from_secs(MAX_TIMEOUT_SECS)),
            None => self.default_timeout,
        }
    }
}

/// SIGTERM the process group, wait out the grace period, then force kill
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "Process group ignored SIGTERM; killing");
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
}

/// Force kill whatever is left in the group once the shell itself is gone
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Read a pipe into a shared buffer so partial output survives an abort
fn spawn_reader<R>(pipe: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let captured: Captured = Arc::default();
    let sink = captured.clone();
    let handle = tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    });
    (captured, handle)
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace. Output combines stdout and stderr. \
         timeout is in milliseconds (default 120000, max 600000)."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "timeout": {"type": "integer", "description": "Timeout in milliseconds"},
                "description": {"type": "string", "description": "What the command does, in a few words"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let command = required_str(args, "command")?;
        let timeout = self.timeout_for(args);

        let decision = ctx.permissions.check_bash(command).await;
        if !decision.allowed {
            return Ok(ToolOutput::success(decision.denial_message()));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", command))?;
        ctx.log(format!("running: {}", command));
        let pid = child.id();
        let deadline = Instant::now() + timeout;

        let (stdout, mut stdout_task) = spawn_reader(child.stdout.take());
        let (stderr, mut stderr_task) = spawn_reader(child.stderr.take());

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status.context("Failed to wait for command")?),
            _ = tokio::time::sleep_until(deadline) => Exit::TimedOut,
            _ = ctx.cancel.cancelled() => Exit::Cancelled,
        };
        if !matches!(exit, Exit::Finished(_)) {
            terminate(&mut child, KILL_GRACE).await;
        }
        if matches!(exit, Exit::Cancelled) {
            stdout_task.abort();
            stderr_task.abort();
            anyhow::bail!("Command cancelled: {}", command);
        }

        // Background children may still hold the pipes open
        let drain = deadline
            .saturating_duration_since(Instant::now())
            .clamp(MIN_PIPE_DRAIN, MAX_PIPE_DRAIN);
        let drained = tokio::select! {
            biased;
            _ = async {
                let _ = (&mut stdout_task).await;
                let _ = (&mut stderr_task).await;
            } => true,
            _ = tokio::time::sleep(drain) => false,
            _ = ctx.cancel.cancelled() => false,
        };
        if !drained {
            tracing::warn!(?pid, "Output pipes still open after shell exit; killing process group");
            kill_group(pid);
            stdout_task.abort();
            stderr_task.abort();
            if ctx.cancel.is_cancelled() {
                anyhow::bail!("Command cancelled: {}", command);
            }
        }

        let stdout = std::mem::take(&mut *stdout.lock().await);
        let stderr = std::mem::take(&mut *stderr.lock().await);
        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        if !stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&String::from_utf8_lossy(&stderr));
        }

        let (exit_code, timed_out) = match exit {
            Exit::Finished(status) => (status.code(), false),
            _ => (None, true),
        };
        if timed_out {
            output.push_str(&format!(
                "\n\nCommand timed out after {} ms and was terminated",
                timeout.as_millis()
            ));
        } else if let Some(code) = exit_code.filter(|c| *c != 0) {
            output.push_str(&format!("\n\nExit code: {}", code));
        }
        if output.is_empty() {
            output.push_str("(no output)");
        }

        let title = args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or(command)
            .to_string();
        let mut out = ToolOutput::success(output)
            .with_title(title)
            .with_metadata(serde_json::json!({ "exit_code": exit_code, "timed_out": timed_out }));
        out.is_error = timed_out;
        Ok(out)
    }
}
