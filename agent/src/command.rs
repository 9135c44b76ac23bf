//! Command Runner
//!
//! Every host utility the agent shells out to — `dladm`, `ipadm`, `netstat`,
//! `kstat`, `zfs`, `zoneadm`, `zlogin` — goes through here. Centralising the
//! spawn means the timeout, environment overrides and output-capture
//! behaviour are identical for a collector's `dladm show-link` and a task
//! handler's `zoneadm install`. Callers always pass argv arrays; nothing in
//! this module ever touches a shell.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Default timeout applied to a host utility invocation unless the caller
/// asks for something else.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between sending `SIGTERM` and escalating to `SIGKILL` on a
/// timed-out command.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// One invocation: argv plus optional per-call timeout and environment
/// overrides layered on top of the agent's own environment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            env: HashMap::new(),
            stdin: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }
}

/// Outcome of a completed (or timed-out) invocation. `ok` mirrors
/// `exit_code == Some(0) && !timed_out`.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Error produced when a command cannot be spawned at all. A timeout is not
/// an error here — it is reported as `CommandResult { timed_out: true, .. }`
/// per the runner's contract — but an error raised at a boundary that wants
/// a terse `?`-able type can still go through [`CommandError`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{description} failed to spawn: {source}")]
    Spawn {
        description: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{description} timed out after {timeout:?}")]
    Timeout { description: String, timeout: Duration },
    #[error("{description} exited with status {status}: {stderr}")]
    NonZeroExit {
        description: String,
        status: i32,
        stderr: String,
    },
}

/// Thin wrapper over `tokio::process::Command` that enforces a timeout and
/// captures stdout/stderr. Stateless and cheap to clone, so it can live on
/// every struct that needs to shell out.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    default_timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { default_timeout: timeout }
    }

    /// Run a [`CommandSpec`], honouring its per-call timeout and environment
    /// overrides. The child inherits the agent's own environment; `env`
    /// entries only add to or shadow it, never replace it wholesale. On
    /// timeout the child is sent `SIGTERM`, given a grace period to exit,
    /// then `SIGKILL`ed if it hasn't.
    pub async fn run(&self, spec: &CommandSpec) -> CommandResult {
        let description = format!("{} {}", spec.program, spec.args.join(" "));
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        debug!(%description, ?timeout, "running host command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        if spec.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                warn!(%description, error = %source, "failed to spawn host command");
                return CommandResult {
                    ok: false,
                    stdout: String::new(),
                    stderr: source.to_string(),
                    exit_code: None,
                    timed_out: false,
                };
            }
        };

        if let (Some(stdin_data), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&stdin_data).await;
                let _ = stdin.shutdown().await;
            });
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_output = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await;
            (status, stdout, stderr, child)
        };

        match tokio::time::timeout(timeout, read_output).await {
            Ok((status, stdout, stderr, _child)) => {
                let status = match status {
                    Ok(status) => status,
                    Err(source) => {
                        warn!(%description, error = %source, "failed to wait on host command");
                        return CommandResult {
                            ok: false,
                            stdout: String::from_utf8_lossy(&stdout).to_string(),
                            stderr: source.to_string(),
                            exit_code: None,
                            timed_out: false,
                        };
                    }
                };
                CommandResult {
                    ok: status.success(),
                    stdout: String::from_utf8_lossy(&stdout).to_string(),
                    stderr: String::from_utf8_lossy(&stderr).to_string(),
                    exit_code: exit_code_of(&status),
                    timed_out: false,
                }
            }
            Err(_elapsed) => {
                warn!(%description, ?timeout, "host command timed out, escalating to termination");
                let mut child = child;
                terminate_then_kill(&mut child).await;
                CommandResult {
                    ok: false,
                    stdout: String::new(),
                    stderr: format!("{description} timed out after {timeout:?}"),
                    exit_code: None,
                    timed_out: true,
                }
            }
        }
    }

    /// Convenience wrapper for the common case of a simple argv call with no
    /// env/stdin overrides, returning stdout on success or a typed error
    /// otherwise — what most collectors and handlers reach for.
    pub async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let spec = CommandSpec::new(program, args);
        let description = format!("{program} {}", args.join(" "));
        let result = self.run(&spec).await;

        if result.timed_out {
            return Err(CommandError::Timeout {
                description,
                timeout: spec.timeout.unwrap_or(self.default_timeout),
            });
        }
        if !result.ok {
            return Err(CommandError::NonZeroExit {
                description,
                status: result.exit_code.unwrap_or(-1),
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result.stdout)
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| -s))
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    status.code()
}

/// Send `SIGTERM`, wait out the grace period, then `SIGKILL` if the child is
/// still alive. `tokio::process::Child::kill` always sends `SIGKILL`
/// directly, which is why this reaches for `libc::kill` for the first,
/// softer signal.
#[cfg(unix)]
async fn terminate_then_kill(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is a live process id owned by this `child` handle;
        // sending SIGTERM to it is the same operation `kill(1)` performs.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await.is_ok() {
        return;
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_then_kill(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_checked_returns_stdout_on_success() {
        let runner = CommandRunner::new(Duration::from_secs(5));
        let out = runner.run_checked("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn run_checked_surfaces_stderr_on_non_zero_exit() {
        let runner = CommandRunner::new(Duration::from_secs(5));
        let err = runner
            .run_checked("sh", &["-c", "echo boom 1>&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            CommandError::NonZeroExit { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_times_out_on_slow_command() {
        let runner = CommandRunner::new(Duration::from_millis(50));
        let spec = CommandSpec::new("sleep", &["5"]);
        let result = runner.run(&spec).await;
        assert!(result.timed_out);
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn spawn_failure_on_missing_binary() {
        let runner = CommandRunner::new(Duration::from_secs(5));
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", &[]);
        let result = runner.run(&spec).await;
        assert!(!result.ok);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn env_overrides_are_visible_to_child() {
        let runner = CommandRunner::new(Duration::from_secs(5));
        let spec = CommandSpec::new("sh", &["-c", "echo $ZONEWEAVER_TEST"]).with_env("ZONEWEAVER_TEST", "present");
        let result = runner.run(&spec).await;
        assert!(result.ok);
        assert_eq!(result.stdout.trim(), "present");
    }

    #[tokio::test]
    async fn stdin_is_forwarded_to_child() {
        let runner = CommandRunner::new(Duration::from_secs(5));
        let spec = CommandSpec::new("cat", &[]).with_stdin(b"piped data".to_vec());
        let result = runner.run(&spec).await;
        assert!(result.ok);
        assert_eq!(result.stdout.trim(), "piped data");
    }
}
