// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process lifecycle for a single instance.
//!
//! The supervisor picks a free loopback port, launches the artifact with
//! `BIND_ADDR`/`BIND_PORT` in its environment, dials that address until it
//! accepts a connection, and then holds the process until either the
//! supervision context is cancelled or the process exits on its own.
//!
//! Every exit path reaps the child. Cancellation and readiness timeouts
//! terminate it first; the child is also spawned with `kill_on_drop` so an
//! aborted task cannot leak it.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::instance::{Instance, InstanceState};
use crate::proxy::{self, ReverseProxy};
use crate::supervision::SupervisionContext;

/// Environment variable carrying the address the artifact must bind.
pub const BIND_ADDR_ENV: &str = "BIND_ADDR";

/// Environment variable carrying the port the artifact must bind.
pub const BIND_PORT_ENV: &str = "BIND_PORT";

/// How long a failed start waits for the stderr forwarder to drain.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Errors ending an instance's run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// No ephemeral port could be reserved.
    #[error("failed to allocate a port: {0}")]
    PortAllocation(#[source] io::Error),

    /// The artifact could not be executed.
    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn {
        /// Artifact path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The process exited before its listener came up.
    #[error("process exited before becoming ready ({status}){}", format_tail(.stderr))]
    PrematureExit {
        /// Exit status description.
        status: String,
        /// Last lines the process wrote to stderr.
        stderr: Vec<String>,
    },

    /// The listener did not come up before the deadline. The process was killed.
    #[error("{addr} not accepting connections after {timeout:?}{}", .last_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    ReadinessTimeout {
        /// Address that was probed.
        addr: SocketAddr,
        /// Readiness deadline.
        timeout: Duration,
        /// Last dial error, if any.
        last_error: Option<String>,
    },

    /// The supervision context was cancelled. The process was terminated.
    #[error("instance cancelled")]
    Cancelled,

    /// The process exited on its own after becoming ready.
    #[error("process exited ({status}){}", format_tail(.stderr))]
    Exited {
        /// Exit status description.
        status: String,
        /// Last lines the process wrote to stderr.
        stderr: Vec<String>,
    },

    /// Waiting on the child process failed.
    #[error("failed to wait on process: {0}")]
    Wait(#[source] io::Error),

    /// The proxy HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\n{}", lines.join("\n"))
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Loopback address handed to artifacts.
    pub host: IpAddr,
    /// Deadline for the artifact's listener to accept a connection.
    pub readiness_timeout: Duration,
    /// Delay between readiness dials.
    pub probe_interval: Duration,
    /// Bound on a single readiness dial.
    pub dial_timeout: Duration,
    /// SIGTERM to SIGKILL grace when stopping.
    pub stop_grace: Duration,
    /// Stderr lines kept for diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            readiness_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(50),
            dial_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_secs(5),
            stderr_tail_lines: 64,
        }
    }
}

/// Spawns, probes and stops artifact processes.
#[derive(Debug, Clone)]
pub struct InstanceSupervisor {
    config: SupervisorConfig,
    client: reqwest::Client,
}

enum Startup {
    Ready,
    Cancelled,
    Exited(io::Result<ExitStatus>),
    TimedOut(String),
}

enum Serving {
    Cancelled,
    Exited(io::Result<ExitStatus>),
}

impl InstanceSupervisor {
    /// Create a supervisor. All proxies it hands out share one HTTP client.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        Ok(Self {
            config,
            client: proxy::http_client()?,
        })
    }

    /// Supervisor tuning.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run `instance` until it stops. Never returns `Ok`: the error is the
    /// reason the instance ended ([`SupervisorError::Cancelled`] for a
    /// requested stop).
    pub async fn run(
        &self,
        instance: &Instance,
        ctx: &SupervisionContext,
    ) -> Result<Infallible, SupervisorError> {
        let result = self.run_inner(instance, ctx).await;
        if let Err(err) = &result
            && !instance.state().is_terminal()
        {
            let state = match err {
                SupervisorError::Cancelled => InstanceState::Stopped,
                _ => InstanceState::Failed,
            };
            instance.set_state(state);
        }
        result
    }

    async fn run_inner(
        &self,
        instance: &Instance,
        ctx: &SupervisionContext,
    ) -> Result<Infallible, SupervisorError> {
        if ctx.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        let addr = allocate_port(self.config.host).map_err(SupervisorError::PortAllocation)?;
        instance.set_bound_addr(addr);

        let artifact = instance.function().artifact_path();
        let mut child = Command::new(artifact)
            .env(BIND_ADDR_ENV, addr.ip().to_string())
            .env(BIND_PORT_ENV, addr.port().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: artifact.to_path_buf(),
                source,
            })?;
        let pid = child.id();
        if let Some(pid) = pid {
            instance.set_pid(pid);
        }
        info!(
            function = %instance.name(),
            instance_id = %instance.id(),
            pid = pid.unwrap_or_default(),
            %addr,
            "Instance spawned"
        );

        let tail = StderrTail::new(self.config.stderr_tail_lines);
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tail.forward(stderr, instance.name().to_string(), pid));

        let startup = tokio::select! {
            biased;
            _ = ctx.cancelled() => Startup::Cancelled,
            status = child.wait() => Startup::Exited(status),
            probe = wait_for_listener(
                addr,
                self.config.readiness_timeout,
                self.config.probe_interval,
                self.config.dial_timeout,
            ) => match probe {
                Ok(()) => Startup::Ready,
                Err(last_error) => Startup::TimedOut(last_error),
            },
        };

        match startup {
            Startup::Ready => {}
            Startup::Cancelled => {
                kill(&mut child).await;
                abort(stderr_task);
                info!(function = %instance.name(), "Instance cancelled before ready");
                return Err(SupervisorError::Cancelled);
            }
            Startup::Exited(status) => {
                let status = status.map_err(SupervisorError::Wait)?;
                drain(stderr_task).await;
                let stderr = tail.lines();
                warn!(
                    function = %instance.name(),
                    %status,
                    stderr_lines = stderr.len(),
                    "Instance exited before becoming ready"
                );
                return Err(SupervisorError::PrematureExit {
                    status: status.to_string(),
                    stderr,
                });
            }
            Startup::TimedOut(last_error) => {
                kill(&mut child).await;
                abort(stderr_task);
                warn!(
                    function = %instance.name(),
                    %addr,
                    timeout_ms = self.config.readiness_timeout.as_millis() as u64,
                    "Instance readiness timed out"
                );
                return Err(SupervisorError::ReadinessTimeout {
                    addr,
                    timeout: self.config.readiness_timeout,
                    last_error: Some(last_error),
                });
            }
        }

        instance.mark_ready(ReverseProxy::new(addr, self.client.clone()));
        info!(function = %instance.name(), instance_id = %instance.id(), %addr, "Instance ready");

        let serving = tokio::select! {
            biased;
            _ = ctx.cancelled() => Serving::Cancelled,
            status = child.wait() => Serving::Exited(status),
        };

        match serving {
            Serving::Cancelled => {
                instance.set_state(InstanceState::Stopping);
                let status = terminate(&mut child, pid, self.config.stop_grace).await;
                abort(stderr_task);
                instance.set_state(InstanceState::Stopped);
                match status {
                    Ok(status) => info!(function = %instance.name(), %status, "Instance stopped"),
                    Err(e) => warn!(function = %instance.name(), error = %e, "Instance stop failed"),
                }
                Err(SupervisorError::Cancelled)
            }
            Serving::Exited(status) => {
                let status = status.map_err(SupervisorError::Wait)?;
                drain(stderr_task).await;
                instance.set_state(if status.success() {
                    InstanceState::Stopped
                } else {
                    InstanceState::Failed
                });
                warn!(function = %instance.name(), %status, "Instance exited");
                Err(SupervisorError::Exited {
                    status: status.to_string(),
                    stderr: tail.lines(),
                })
            }
        }
    }
}

/// Reserve an ephemeral port by binding and immediately releasing it.
fn allocate_port(host: IpAddr) -> io::Result<SocketAddr> {
    let listener = TcpListener::bind((host, 0))?;
    listener.local_addr()
}

/// Dial `addr` every `interval` until it accepts or `timeout` passes.
/// On timeout returns the last dial error.
async fn wait_for_listener(
    addr: SocketAddr,
    timeout: Duration,
    interval: Duration,
    dial_timeout: Duration,
) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    loop {
        let last_error = match tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("dial timed out after {dial_timeout:?}"),
        };
        if Instant::now() + interval >= deadline {
            return Err(last_error);
        }
        tokio::time::sleep(interval).await;
    }
}

/// SIGKILL and reap.
async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(pid) = pid {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
    }
    child.kill().await?;
    child.wait().await
}

fn abort(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Let the stderr forwarder finish reading, up to [`STDERR_DRAIN`]. A
/// grandchild can keep the pipe open, so the forwarder is aborted after that.
async fn drain(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task
        && tokio::time::timeout(STDERR_DRAIN, &mut task).await.is_err()
    {
        debug!("stderr still open after exit, detaching forwarder");
        task.abort();
    }
}

/// Bounded buffer of the most recent stderr lines.
#[derive(Clone)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// Log each stderr line and keep the tail.
    fn forward(&self, stderr: ChildStderr, function: String, pid: Option<u32>) -> JoinHandle<()> {
        let tail = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        info!(target: "fnhost_core::instance", function = %function, pid = pid.unwrap_or_default(), "{line}");
                        tail.push(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(function = %function, error = %e, "stderr read failed");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> Function {
        let path = dir.path().join(format!("{name}.out"));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Function::from_artifact(path)
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            readiness_timeout: Duration::from_millis(600),
            probe_interval: Duration::from_millis(20),
            stop_grace: Duration::from_millis(500),
            ..SupervisorConfig::default()
        }
    }

    /// Stand-in for a function: a loopback listener on the port handed to
    /// the process, kept open until the test ends.
    async fn listen_like(instance: &Instance) -> tokio::net::TcpListener {
        loop {
            if let Some(addr) = instance.bound_addr() {
                // the supervisor released the port right before spawning
                if let Ok(listener) = tokio::net::TcpListener::bind(addr).await {
                    return listener;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_allocate_port_is_loopback() {
        let addr = allocate_port(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::new(2);
        tail.push("a".into());
        tail.push("b".into());
        tail.push("c".into());
        assert_eq!(tail.lines(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_premature_exit_captures_stderr() {
        let dir = TempDir::new().unwrap();
        let function = script(&dir, "crash", "echo \"boom: port $BIND_PORT\" >&2\nexit 3");
        let supervisor = InstanceSupervisor::new(fast_config()).unwrap();
        let instance = Instance::new(function);
        let ctx = SupervisionContext::root("test");

        let err = supervisor.run(&instance, &ctx).await.unwrap_err();

        match err {
            SupervisorError::PrematureExit { stderr, .. } => {
                let port = instance.bound_addr().unwrap().port();
                assert_eq!(stderr, vec![format!("boom: port {port}")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(instance.state(), InstanceState::Failed);
    }

    #[tokio::test]
    async fn test_readiness_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let function = script(&dir, "sleepy", "exec sleep 30");
        let supervisor = InstanceSupervisor::new(fast_config()).unwrap();
        let instance = Instance::new(function);
        let ctx = SupervisionContext::root("test");

        let err = supervisor.run(&instance, &ctx).await.unwrap_err();

        assert!(matches!(err, SupervisorError::ReadinessTimeout { .. }), "{err}");
        assert_eq!(instance.state(), InstanceState::Failed);
        let pid = Pid::from_raw(instance.pid().unwrap() as i32);
        assert!(signal::kill(pid, None).is_err(), "process still alive");
    }

    #[tokio::test]
    async fn test_exit_after_ready_fails_instance() {
        let dir = TempDir::new().unwrap();
        let function = script(&dir, "flaky", "sleep 2\necho 'lost connection' >&2\nexit 4");
        let supervisor = InstanceSupervisor::new(fast_config()).unwrap();
        let instance = Arc::new(Instance::new(function));
        let ctx = SupervisionContext::root("test");

        let run = {
            let (instance, ctx) = (instance.clone(), ctx.clone());
            tokio::spawn(async move { supervisor.run(&instance, &ctx).await })
        };
        let _listener = listen_like(&instance).await;
        instance.wait_ready(Duration::from_secs(5)).await.unwrap();

        let err = run.await.unwrap().unwrap_err();

        match err {
            SupervisorError::Exited { status, stderr } => {
                assert!(status.contains('4'), "status: {status}");
                assert_eq!(stderr, vec!["lost connection"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(instance.state(), InstanceState::Failed);
    }

    #[tokio::test]
    async fn test_drain_aborts_stuck_forwarder() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await
        });

        drain(Some(task)).await;

        // the sender is dropped only once the task is aborted
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let supervisor = InstanceSupervisor::new(fast_config()).unwrap();
        let instance = Instance::new(Function::from_artifact("/nonexistent/fnhost/x.out"));
        let ctx = SupervisionContext::root("test");

        let err = supervisor.run(&instance, &ctx).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(instance.state(), InstanceState::Failed);
    }

    #[tokio::test]
    async fn test_ready_then_cancel_terminates() {
        let dir = TempDir::new().unwrap();
        let function = script(&dir, "idle", "exec sleep 30");
        let supervisor = InstanceSupervisor::new(fast_config()).unwrap();
        let instance = Arc::new(Instance::new(function));
        let ctx = SupervisionContext::root("test");

        let run = {
            let (instance, ctx) = (instance.clone(), ctx.clone());
            tokio::spawn(async move { supervisor.run(&instance, &ctx).await })
        };
        let _listener = listen_like(&instance).await;
        let proxy = instance.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(Some(proxy.target()), instance.bound_addr());

        ctx.cancel();
        let err = run.await.unwrap().unwrap_err();

        assert!(matches!(err, SupervisorError::Cancelled));
        assert_eq!(instance.state(), InstanceState::Stopped);
        let pid = Pid::from_raw(instance.pid().unwrap() as i32);
        assert!(signal::kill(pid, None).is_err(), "process still alive");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let function = script(&dir, "never", "exec sleep 30");
        let supervisor = InstanceSupervisor::new(fast_config()).unwrap();
        let instance = Instance::new(function);
        let ctx = SupervisionContext::root("test");
        ctx.cancel();

        let err = supervisor.run(&instance, &ctx).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled));
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(instance.pid().is_none());
    }
}
