//! Worker subprocess lifecycle: spawn with the Runtime API environment
//! override, observe exits, respawn crashed children with backoff, and
//! tear down with SIGTERM.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crie_common::config::AWS_LAMBDA_RUNTIME_API;
use crie_common::{Config, ListenAddress};

use crate::backoff::RespawnBackoff;
use crate::{ExecutorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Stopped,
    Running,
}

struct Inner {
    state: ProcessState,
    pid: Option<u32>,
    spawned_at: Option<Instant>,
    prev_delay: Option<Duration>,
}

/// One long-lived child process bound to a worker slot. The child inherits
/// the parent environment with `AWS_LAMBDA_RUNTIME_API` overridden to the
/// slot's private endpoint, and inherits stdio.
pub struct WorkerProcess {
    id: String,
    command: String,
    args: Vec<String>,
    runtime_api: String,
    backoff: RespawnBackoff,
    inner: Mutex<Inner>,
    respawns: AtomicU32,
}

impl WorkerProcess {
    pub fn new(id: impl Into<String>, cfg: &Config, rapi: &ListenAddress) -> Self {
        Self {
            id: id.into(),
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            runtime_api: rapi.runtime_api(),
            backoff: RespawnBackoff::default(),
            inner: Mutex::new(Inner {
                state: ProcessState::Stopped,
                pid: None,
                spawned_at: None,
                prev_delay: None,
            }),
            respawns: AtomicU32::new(0),
        }
    }

    /// Idempotent: a no-op while a live child exists. Must run inside a
    /// tokio runtime (the exit waiter is spawned as a task).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state == ProcessState::Running && inner.pid.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env(AWS_LAMBDA_RUNTIME_API, &self.runtime_api)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;
        let pid = child.id();
        inner.state = ProcessState::Running;
        inner.pid = pid;
        inner.spawned_at = Some(Instant::now());
        drop(inner);

        info!(worker = %self.id, pid = ?pid, command = %self.command, "process started");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            match status {
                Ok(status) => info!(worker = %this.id, %status, "process ended"),
                Err(e) => error!(worker = %this.id, error = %e, "waiting for process failed"),
            }
            this.handle_exit().await;
        });

        Ok(())
    }

    async fn handle_exit(self: Arc<Self>) {
        let delay = {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            inner.pid = None;
            if inner.state != ProcessState::Running {
                return;
            }
            let uptime = inner
                .spawned_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            let delay = self.backoff.next(inner.prev_delay, uptime);
            inner.prev_delay = Some(delay);
            delay
        };

        warn!(worker = %self.id, delay = ?delay, "process exited unexpectedly, respawning");
        tokio::time::sleep(delay).await;

        {
            let inner = match self.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            // Stopped, or already restarted by someone else, while we slept.
            if inner.state != ProcessState::Running || inner.pid.is_some() {
                return;
            }
        }

        self.respawns.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.start() {
            error!(worker = %self.id, error = %e, "respawn failed");
        }
    }

    /// Flips the state to stopped and sends SIGTERM. Does not wait for the
    /// child to exit; the exit waiter reaps it.
    pub fn stop(&self) {
        let pid = {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            if inner.state == ProcessState::Stopped {
                return;
            }
            inner.state = ProcessState::Stopped;
            inner.pid
        };

        if let Some(pid) = pid {
            terminate(pid);
            info!(worker = %self.id, pid, "sent SIGTERM to process");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .map(|inner| inner.state == ProcessState::Running && inner.pid.is_some())
            .unwrap_or(false)
    }

    pub fn respawns(&self) -> u32 {
        self.respawns.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ExecutorError::Internal("worker process lock poisoned".to_string()))
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    warn!(pid, "graceful termination is not supported on this platform");
}

/// Nested-emulator mode: the command is spawned once with the unmodified
/// environment (`AWS_LAMBDA_RUNTIME_API` already points at the outer
/// runtime), signals are forwarded, and the child's exit code is returned.
pub async fn delegate(cfg: &Config, shutdown: CancellationToken) -> Result<i32> {
    let mut child = Command::new(&cfg.command)
        .args(&cfg.args)
        .kill_on_drop(true)
        .spawn()
        .map_err(ExecutorError::Spawn)?;
    let pid = child.id();
    info!(pid = ?pid, command = %cfg.command, "delegating to child runtime");

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown.cancelled() => {
            if let Some(pid) = pid {
                terminate(pid);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            info!(%status, "delegated child exited");
            Ok(status.code().unwrap_or(1))
        }
        Err(e) => Err(ExecutorError::Spawn(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(command: &str, args: &[&str]) -> Config {
        let argv: Vec<String> = ["crie", command]
            .iter()
            .map(|s| s.to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        Config::from_parts(&argv, &HashMap::new()).unwrap()
    }

    fn rapi_addr() -> ListenAddress {
        ":19900".parse::<ListenAddress>().unwrap().worker_address(0)
    }

    async fn wait_until(mut probe: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if probe() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_terminates() {
        let proc = Arc::new(WorkerProcess::new("pid-1", &config("sleep", &["30"]), &rapi_addr()));

        proc.start().unwrap();
        assert!(proc.is_running());
        let first_pid = proc.lock().unwrap().pid;

        proc.start().unwrap();
        assert_eq!(proc.lock().unwrap().pid, first_pid);

        proc.stop();
        assert!(
            wait_until(|| !proc.is_running(), Duration::from_secs(2)).await,
            "child should exit after SIGTERM"
        );
        assert_eq!(proc.respawns(), 0);
    }

    #[tokio::test]
    async fn crashing_child_is_respawned_with_backoff() {
        let proc = Arc::new(WorkerProcess::new("pid-1", &config("true", &[]), &rapi_addr()));

        proc.start().unwrap();
        assert!(
            wait_until(|| proc.respawns() >= 1, Duration::from_secs(3)).await,
            "a crashing child should be respawned"
        );

        proc.stop();
        assert!(wait_until(|| !proc.is_running(), Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn delegate_propagates_the_exit_code() {
        let cfg = config("sh", &["-c", "exit 7"]);
        let code = delegate(&cfg, CancellationToken::new()).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn delegate_forwards_cancellation() {
        let cfg = config("sleep", &["30"]);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let _ = delegate(&cfg, token).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
