//! Subprocess supervisor (C5): spawn, observe, stop, and bounded-restart a
//! child MCP server.
//!
//! State machine: `starting -> running` on successful spawn, `running ->
//! stopping` on an external stop request, `stopping -> stopped` on exit, and
//! any unexpected exit while `running` -> `failed`. A `failed` state with
//! `restart_on_failure` schedules a restart after `restart_cooldown`,
//! counting against `max_restarts`; exceeding it is a terminal error and the
//! caller is expected to deregister the upstream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as TokioMutex, broadcast, mpsc};

use crate::error::{TransportError, TransportResult};

const MARKER_GATEWAY_ENV: &str = "HATAGO_GATEWAY";
const MARKER_SERVER_ID_ENV: &str = "HATAGO_SERVER_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubprocessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub enum SubprocessEvent {
    StateChange(SubprocessState),
    Output { line: String, is_stderr: bool },
    Error(String),
    Restart(u32),
    /// `restart_on_failure` exhausted `max_restarts`; the process is left
    /// `Failed` and will not be restarted again. Listeners should treat the
    /// upstream as permanently gone (§8 scenario 6).
    RestartLimitReached { max_restarts: u32 },
}

#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub server_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<String>,
    pub environment: Vec<(String, String)>,
    pub graceful_timeout: Duration,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    pub restart_cooldown: Duration,
    pub max_message_size: usize,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            command: String::new(),
            args: Vec::new(),
            working_directory: None,
            environment: Vec::new(),
            graceful_timeout: Duration::from_secs(5),
            restart_on_failure: false,
            max_restarts: 0,
            restart_cooldown: Duration::from_secs(1),
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// Everything `send_line`/`stop` need to reach a live child, minus the
/// `Child` handle itself — that stays owned by the `watch_exit` task so
/// `stop` never has to contend with it for the indefinitely-blocking
/// `wait()` call.
struct Running {
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    io_tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Owns one child process's lifecycle. `stdin_tx`/`stdout_rx` on
/// [`SubprocessSupervisor`] carry line-delimited JSON-RPC once `running`.
pub struct SubprocessSupervisor {
    config: SubprocessConfig,
    state: SyncMutex<SubprocessState>,
    restarts: SyncMutex<u32>,
    running: TokioMutex<Option<Running>>,
    events: broadcast::Sender<SubprocessEvent>,
    stdout_rx: TokioMutex<Option<mpsc::Receiver<String>>>,
}

impl SubprocessSupervisor {
    pub fn new(config: SubprocessConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            state: SyncMutex::new(SubprocessState::Stopped),
            restarts: SyncMutex::new(0),
            running: TokioMutex::new(None),
            events,
            stdout_rx: TokioMutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubprocessEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SubprocessState {
        *self.state.lock()
    }

    fn set_state(&self, state: SubprocessState) {
        *self.state.lock() = state;
        let _ = self.events.send(SubprocessEvent::StateChange(state));
    }

    /// Send one line to the child's stdin. Errors if the process is not running.
    pub async fn send_line(&self, line: &str) -> TransportResult<()> {
        let guard = self.running.lock().await;
        let Some(running) = guard.as_ref() else {
            return Err(TransportError::BadRequest {
                message: "subprocess is not running".into(),
            });
        };
        running
            .stdin_tx
            .send(line.to_string())
            .await
            .map_err(|err| TransportError::StreamWriteFailed(err.to_string()))
    }

    /// Take ownership of the receiver side of the child's stdout line stream.
    /// Must be called at most once per spawn.
    pub async fn take_stdout(&self) -> Option<mpsc::Receiver<String>> {
        self.stdout_rx.lock().await.take()
    }

    /// Spawn the child process. Transitions `stopped|failed -> starting -> running`.
    pub async fn start(self: &Arc<Self>) -> TransportResult<()> {
        self.set_state(SubprocessState::Starting);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env(MARKER_GATEWAY_ENV, "hatago")
            .env(MARKER_SERVER_ID_ENV, &self.config.server_id);

        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.environment {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            self.set_state(SubprocessState::Failed);
            TransportError::SpawnFailed(err.to_string())
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("child stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("child stderr not piped".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(100);
        let stdin_task = tokio::spawn(async move {
            let mut writer = BufWriter::new(stdin);
            while let Some(line) = stdin_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() || writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(100);
        let max_size = self.config.max_message_size;
        let events = self.events.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.len() > max_size {
                    continue;
                }
                let _ = events.send(SubprocessEvent::Output {
                    line: line.clone(),
                    is_stderr: false,
                });
                if stdout_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let events = self.events.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = events.send(SubprocessEvent::Output {
                    line,
                    is_stderr: true,
                });
            }
        });

        let pid = child.id();
        *self.running.lock().await = Some(Running {
            pid,
            stdin_tx,
            io_tasks: vec![stdin_task, stdout_task, stderr_task],
        });
        *self.stdout_rx.lock().await = Some(stdout_rx);

        self.set_state(SubprocessState::Running);

        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.watch_exit(child).await });

        Ok(())
    }

    /// Waits on the child's exit and drives the `failed`/restart path. Spawned
    /// once per successful start, owning the `Child` handle exclusively so
    /// `stop` never needs to share it: `stop` signals the process by pid and
    /// polls state instead of contending for this `wait()`.
    async fn watch_exit(self: Arc<Self>, mut child: Child) {
        let status = child.wait().await;
        // The process has exited; drop the now-stale handle so `stop`
        // on an already-dead process is a cheap no-op.
        *self.running.lock().await = None;

        if matches!(self.state(), SubprocessState::Stopping) {
            self.set_state(SubprocessState::Stopped);
            return;
        }

        match status {
            Ok(status) if status.success() => {
                self.set_state(SubprocessState::Stopped);
            }
            _ => {
                self.set_state(SubprocessState::Failed);
                let _ = self.events.send(SubprocessEvent::Error(
                    "subprocess exited unexpectedly".into(),
                ));
                self.maybe_restart().await;
            }
        }
    }

    async fn maybe_restart(self: &Arc<Self>) {
        if !self.config.restart_on_failure {
            return;
        }
        let attempt = {
            let mut restarts = self.restarts.lock();
            *restarts += 1;
            *restarts
        };
        if attempt > self.config.max_restarts {
            let err = TransportError::RestartLimitReached {
                max_restarts: self.config.max_restarts,
            };
            self.set_state(SubprocessState::Failed);
            let _ = self.events.send(SubprocessEvent::Error(err.to_string()));
            let _ = self.events.send(SubprocessEvent::RestartLimitReached {
                max_restarts: self.config.max_restarts,
            });
            return;
        }
        tokio::time::sleep(self.config.restart_cooldown).await;
        let _ = self.events.send(SubprocessEvent::Restart(attempt));
        if let Err(err) = self.start().await {
            let _ = self.events.send(SubprocessEvent::Error(err.to_string()));
        }
    }

    #[cfg(unix)]
    fn signal(pid: u32, signal: nix::sys::signal::Signal) {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
    }

    /// Waits until `watch_exit` has observed the child's exit, without
    /// touching `self.running` — avoids re-introducing the lock contention
    /// this method exists to route around.
    async fn wait_until_exited(&self) {
        loop {
            if !matches!(self.state(), SubprocessState::Stopping) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop flow: polite signal, grace period, forceful kill. Transitions
    /// `running -> stopping -> stopped`. The signal is delivered by pid, not
    /// through the `Child` handle, so it never has to wait on the lock that
    /// `watch_exit` holds for the life of the process (§4.5).
    pub async fn stop(&self) -> TransportResult<()> {
        self.set_state(SubprocessState::Stopping);
        let (pid, io_tasks) = {
            let mut guard = self.running.lock().await;
            let Some(running) = guard.take() else {
                self.set_state(SubprocessState::Stopped);
                return Ok(());
            };
            (running.pid, running.io_tasks)
        };

        #[cfg(unix)]
        if let Some(pid) = pid {
            Self::signal(pid, nix::sys::signal::Signal::SIGTERM);
        }

        if tokio::time::timeout(self.config.graceful_timeout, self.wait_until_exited())
            .await
            .is_err()
        {
            #[cfg(unix)]
            if let Some(pid) = pid {
                Self::signal(pid, nix::sys::signal::Signal::SIGKILL);
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), self.wait_until_exited()).await;
        }

        for task in io_tasks {
            task.abort();
        }
        self.set_state(SubprocessState::Stopped);
        Ok(())
    }
}

/// Marker environment variables a spawned server can use to identify its
/// launching gateway and its own configured id.
pub fn marker_env(server_id: &str) -> HashMap<String, String> {
    HashMap::from([
        (MARKER_GATEWAY_ENV.to_string(), "hatago".to_string()),
        (MARKER_SERVER_ID_ENV.to_string(), server_id.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, args: &[&str]) -> SubprocessConfig {
        SubprocessConfig {
            server_id: "demo".into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            graceful_timeout: Duration::from_millis(200),
            restart_cooldown: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_then_stop_then_start_ends_running() {
        let supervisor = SubprocessSupervisor::new(config("cat", &[]));
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SubprocessState::Running);

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), SubprocessState::Stopped);

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SubprocessState::Running);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn marker_env_carries_gateway_and_server_id() {
        let env = marker_env("demo-server");
        assert_eq!(env.get(MARKER_GATEWAY_ENV).map(String::as_str), Some("hatago"));
        assert_eq!(env.get(MARKER_SERVER_ID_ENV).map(String::as_str), Some("demo-server"));
    }

    #[tokio::test]
    async fn spawn_failure_of_a_missing_command_reports_failed() {
        let supervisor = SubprocessSupervisor::new(config("definitely-not-a-real-binary", &[]));
        let result = supervisor.start().await;
        assert!(result.is_err());
        assert_eq!(supervisor.state(), SubprocessState::Failed);
    }

    #[tokio::test]
    async fn stop_delivers_sigterm_promptly_to_a_long_running_process() {
        let supervisor = SubprocessSupervisor::new(config("sleep", &["30"]));
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SubprocessState::Running);

        let stopped = tokio::time::timeout(Duration::from_secs(2), supervisor.stop()).await;
        assert!(stopped.is_ok(), "stop() must not block on watch_exit's lock");
        assert_eq!(supervisor.state(), SubprocessState::Stopped);
    }

    #[tokio::test]
    async fn exhausting_restarts_emits_restart_limit_reached() {
        let mut cfg = config("false", &[]);
        cfg.restart_on_failure = true;
        cfg.max_restarts = 1;
        let supervisor = SubprocessSupervisor::new(cfg);
        let mut events = supervisor.subscribe();
        supervisor.start().await.unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SubprocessEvent::RestartLimitReached { max_restarts }) = events.recv().await {
                    return max_restarts;
                }
            }
        })
        .await
        .expect("restart limit event within timeout");
        assert_eq!(found, 1);
    }
}
