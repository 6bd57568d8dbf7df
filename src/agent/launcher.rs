//! Agent process lifecycle management
//!
//! Spawns the external agent with piped stdio, drains its stderr into the log,
//! and runs an exit monitor that owns the child. The monitor records the exit
//! and cancels the exit token observed by the protocol channel, so pending
//! calls fail as soon as the agent is gone.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// The agent's input and output streams, handed to the protocol channel
pub struct AgentIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// How the agent process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub uptime_ms: u64,
}

enum StopRequest {
    Graceful(Duration),
    Kill,
}

/// A supervised agent subprocess
pub struct AgentProcess {
    pid: Option<u32>,
    binary: PathBuf,
    io: std::sync::Mutex<Option<AgentIo>>,
    stop_tx: mpsc::Sender<StopRequest>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    exited: CancellationToken,
    grace: Duration,
}

impl AgentProcess {
    /// Launch the agent described by `config`
    pub fn spawn(config: &AgentConfig) -> Result<Self> {
        let binary = resolve_agent_binary(&config.command)?;

        let mut command = Command::new(&binary);
        command
            .args(&config.args)
            .envs(config.resolve_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        tracing::info!(
            binary = %binary.display(),
            args = ?config.args,
            "Spawning agent process"
        );

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", binary.display(), e)))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("agent stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("agent stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr, pid);
        }

        let (stop_tx, stop_rx) = mpsc::channel(2);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exited = CancellationToken::new();

        tokio::spawn(monitor_exit(
            child,
            pid,
            stop_rx,
            exit_tx,
            exited.clone(),
            now_millis(),
        ));

        Ok(Self {
            pid,
            binary,
            io: std::sync::Mutex::new(Some(AgentIo { stdin, stdout })),
            stop_tx,
            exit_rx,
            exited,
            grace: config.shutdown_grace(),
        })
    }

    /// Take the stdio pair. Returns `None` after the first call.
    pub fn take_io(&self) -> Option<AgentIo> {
        self.io.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Non-blocking liveness check
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Cancelled once the process has exited
    pub fn exit_token(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Exit details, if the process has exited
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Wait until the process has exited
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            Err(_) => self.exit_status(),
        };
        exit
    }

    /// Stop the agent and wait for it to exit.
    ///
    /// Graceful closes the agent's input (when still held here; once the
    /// streams belong to a protocol channel, close them through
    /// [`RpcChannel::close_input`](crate::agent::rpc::RpcChannel::close_input))
    /// and waits up to the configured grace period before killing. Forceful
    /// kills immediately. Calling either on a dead process is a no-op.
    pub async fn terminate(&self, graceful: bool) -> Option<ProcessExit> {
        if self.is_alive() {
            let request = if graceful {
                drop(self.take_io());
                StopRequest::Graceful(self.grace)
            } else {
                StopRequest::Kill
            };
            tracing::info!(pid = ?self.pid, graceful, "Terminating agent process");
            // A full queue means a stop is already in progress.
            let _ = self.stop_tx.try_send(request);
        }
        self.wait().await
    }
}

async fn monitor_exit(
    mut child: Child,
    pid: Option<u32>,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    exited: CancellationToken,
    spawned_at: u64,
) {
    let first = tokio::select! {
        status = child.wait() => Ok(status),
        request = stop_rx.recv() => Err(request),
    };

    let natural = match first {
        Ok(status) => Some(status),
        Err(Some(StopRequest::Graceful(grace))) => {
            let waited = tokio::select! {
                waited = tokio::time::timeout(grace, child.wait()) => waited.ok(),
                Some(StopRequest::Kill) = stop_rx.recv() => None,
            };
            if waited.is_none() {
                tracing::warn!(pid = ?pid, ?grace, "Agent did not exit gracefully, killing");
            }
            waited
        }
        // Kill request, or the supervisor handle was dropped
        Err(_) => None,
    };

    let status = match natural {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid = ?pid, "Kill failed: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(pid = ?pid, "Waiting on agent process failed: {}", e);
            None
        }
    };
    let uptime_ms = now_millis().saturating_sub(spawned_at);

    tracing::info!(
        pid = ?pid,
        exit_code = ?code,
        uptime_ms = uptime_ms,
        "Agent process exited"
    );

    let _ = exit_tx.send(Some(ProcessExit { code, uptime_ms }));
    exited.cancel();
}

/// Forward stderr lines to the log without ever blocking the agent
fn spawn_stderr_drain(stderr: ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        tracing::debug!(target: "agent_stderr", pid = ?pid, "{}", line);
                    }
                }
                Err(e) => {
                    tracing::debug!(target: "agent_stderr", pid = ?pid, "stderr read failed: {}", e);
                    break;
                }
            }
        }
    });
}

/// Resolve the agent executable.
///
/// Paths (anything with a separator) must exist as given. Bare names are
/// searched on `PATH`, then in common per-user and system install locations.
pub fn resolve_agent_binary(command: &str) -> Result<PathBuf> {
    let path = Path::new(command);
    if path.is_absolute() || path.components().count() > 1 {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(Error::Spawn(format!(
                "agent executable not found at {}",
                path.display()
            )))
        };
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(command);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let candidates = [
        home.join(".local").join("bin").join(command),
        home.join(".npm-global").join("bin").join(command),
        PathBuf::from("/usr/local/bin").join(command),
        PathBuf::from("/opt/homebrew/bin").join(command),
    ];

    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }

    Err(Error::Spawn(format!(
        "'{}' not found on PATH or in common install locations",
        command
    )))
}

/// Current time in milliseconds since UNIX epoch
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::rpc::{ChannelOptions, RpcChannel};
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;

    fn agent(command: &str, args: &[&str]) -> AgentConfig {
        AgentConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            shutdown_grace_secs: 1,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_now_millis() {
        let now = now_millis();
        assert!(now > 1_700_000_000_000); // After 2023
    }

    #[test]
    fn test_resolve_binary_on_path() {
        let path = resolve_agent_binary("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn test_resolve_binary_missing() {
        let err = resolve_agent_binary("agentbridge-no-such-agent-binary").unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));

        let err = resolve_agent_binary("/nonexistent/dir/agent").unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = AgentProcess::spawn(&agent("agentbridge-no-such-agent-binary", &[]));
        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[tokio::test]
    async fn test_spawn_echo_and_graceful_exit() {
        let process = AgentProcess::spawn(&agent("cat", &[])).unwrap();
        assert!(process.is_alive());
        assert!(process.pid().is_some());

        let AgentIo { mut stdin, stdout } = process.take_io().unwrap();
        assert!(process.take_io().is_none());

        stdin.write_all(b"{\"ping\":1}\n").await.unwrap();
        stdin.flush().await.unwrap();
        let mut lines = BufReader::new(stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"ping\":1}");

        // Closing input lets cat exit on its own
        drop(stdin);
        let exit = tokio::time::timeout(Duration::from_secs(5), process.terminate(true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(!process.is_alive());
        assert!(process.exit_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_forceful_terminate_is_idempotent() {
        let process = AgentProcess::spawn(&agent("sleep", &["30"])).unwrap();
        assert!(process.is_alive());

        let exit = tokio::time::timeout(Duration::from_secs(5), process.terminate(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, None);
        assert!(!process.is_alive());

        let again = process.terminate(false).await;
        assert_eq!(again, Some(exit));
        let graceful_after = process.terminate(true).await;
        assert_eq!(graceful_after, Some(exit));
    }

    #[tokio::test]
    async fn test_graceful_terminate_kills_after_grace() {
        let process = AgentProcess::spawn(&agent("sleep", &["30"])).unwrap();
        let started = std::time::Instant::now();
        let exit = tokio::time::timeout(Duration::from_secs(10), process.terminate(true))
            .await
            .unwrap();
        assert!(exit.is_some());
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_env_overrides_reach_agent() {
        let mut config = agent("sh", &["-c", "echo \"$AGENTBRIDGE_SPAWN_TEST\""]);
        config
            .env
            .insert("AGENTBRIDGE_SPAWN_TEST".to_string(), "injected".to_string());

        let process = AgentProcess::spawn(&config).unwrap();
        let io = process.take_io().unwrap();
        let mut lines = BufReader::new(io.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "injected");

        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code_repeatedly() {
        let process = AgentProcess::spawn(&agent("sh", &["-c", "exit 3"])).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.code, Some(3));
        assert_eq!(process.wait().await, Some(first));
        assert_eq!(process.exit_status(), Some(first));
    }

    #[tokio::test]
    async fn test_forced_exit_fails_pending_calls() {
        let process = AgentProcess::spawn(&agent("sleep", &["30"])).unwrap();
        let io = process.take_io().unwrap();
        let channel = RpcChannel::start(
            io.stdout,
            io.stdin,
            ChannelOptions::default(),
            process.exit_token(),
        );

        let calls: Vec<_> = ["initialize", "session/new"]
            .into_iter()
            .map(|method| {
                let channel = channel.clone();
                tokio::spawn(async move {
                    channel
                        .call_with_timeout(method, Value::Null, None)
                        .await
                })
            })
            .collect();

        while channel.pending_calls().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        process.terminate(false).await;

        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(5), call)
                .await
                .expect("pending call must fail in bounded time")
                .unwrap();
            assert!(matches!(result, Err(Error::ProcessTerminated)));
        }
        assert!(channel.is_terminated().await);
    }
}
