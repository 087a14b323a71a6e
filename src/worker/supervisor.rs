//! Engine process supervision.
//!
//! [`WorkerSupervisor::launch`] spawns one supervising task per worker. The
//! task owns the child process and its port lease. It runs the optional
//! training phase, spawns the serving process, and multiplexes stdout and
//! stderr through [`OutputCodec`]. It fires the readiness notifier on the
//! first marker line and records how the process ended. Callers observe the
//! task only through the [`WorkerHandle`] state channel and stop it through
//! its cancellation token.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::OutputCodec;
use super::ports::{PortAllocator, PortLease};
use super::readiness::{ReadinessScanner, ScanState};
use crate::config::EngineConfig;
use crate::notifier::{ReadinessEvent, ReadinessNotifier};
use crate::workspace::WorkspaceHandle;
use crate::{AppError, Result};

/// Environment variables inherited by engine processes.
///
/// Everything else is stripped with `env_clear()` so the database path and
/// other server settings never reach the engine.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "VIRTUAL_ENV",
    "PYTHONPATH",
];

/// Session id passed to the engine.
pub const SESSION_ENV: &str = "ORCHESTRATOR_SESSION_ID";
/// Reserved port passed to the engine.
pub const PORT_ENV: &str = "ORCHESTRATOR_PORT";

/// Upper bound on reading leftover output after the process exits.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Runtime state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Serving process spawned; readiness marker not seen yet.
    Starting,
    /// Training phase running.
    Training,
    /// Readiness marker seen.
    Running,
    /// Exited unsuccessfully, or never got to serve.
    Crashed,
    /// Stopped on request or exited cleanly.
    Stopped,
}

impl WorkerState {
    /// Whether the worker process is gone.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::Stopped)
    }
}

/// Why a worker never became servable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// Training phase failed.
    Training(String),
    /// Serving process could not start or exited before readiness.
    Launch(String),
}

impl WorkerFailure {
    /// Convert into the caller-facing error.
    #[must_use]
    pub fn to_error(&self) -> AppError {
        match self {
            Self::Training(msg) => AppError::TrainingFailed(msg.clone()),
            Self::Launch(msg) => AppError::LaunchFailed(msg.clone()),
        }
    }
}

/// Result of waiting for readiness.
#[derive(Debug)]
pub enum ReadyOutcome {
    /// Marker seen; the worker is serving.
    Ready,
    /// Worker ended before the marker.
    Failed(AppError),
    /// Marker not seen in time; the worker has been stopped.
    TimedOut,
}

#[derive(Debug)]
struct WorkerInner {
    session_id: String,
    port: u16,
    endpoint: String,
    state: watch::Receiver<WorkerState>,
    failure: OnceLock<WorkerFailure>,
    marker_seen: AtomicBool,
    cancel: CancellationToken,
}

/// Shared handle to a supervised worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    /// Owning session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Reserved port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// URL participants interact with.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    /// Whether the worker is serving.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether the readiness marker was ever seen, even if the process has
    /// since exited.
    #[must_use]
    pub fn became_ready(&self) -> bool {
        self.inner.marker_seen.load(Ordering::Acquire)
    }

    /// Failure recorded by the supervising task, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&WorkerFailure> {
        self.inner.failure.get()
    }

    /// Whether both handles refer to the same worker instance.
    #[must_use]
    pub fn same_worker(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until the state satisfies `pred`; returns the matching state.
    ///
    /// Returns `Crashed` if the supervising task disappears.
    pub async fn wait_for_state(&self, pred: impl FnMut(&WorkerState) -> bool) -> WorkerState {
        let mut rx = self.inner.state.clone();
        let state = rx.wait_for(pred).await.map(|state| *state);
        state.unwrap_or(WorkerState::Crashed)
    }

    /// Wait until the process is gone.
    pub async fn exited(&self) -> WorkerState {
        self.wait_for_state(|state| state.is_terminal()).await
    }
}

/// Everything the supervising task needs, moved into it at launch.
struct WorkerTask {
    session_id: String,
    endpoint: String,
    workspace: WorkspaceHandle,
    engine: EngineConfig,
    ready: Regex,
    lease: PortLease,
    notifier: Arc<ReadinessNotifier>,
    state: watch::Sender<WorkerState>,
    inner: Arc<WorkerInner>,
}

/// Spawns, watches and stops engine processes.
pub struct WorkerSupervisor {
    engine: EngineConfig,
    ready: Regex,
    ports: PortAllocator,
    notifier: Arc<ReadinessNotifier>,
}

impl WorkerSupervisor {
    /// Build a supervisor.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the readiness pattern does not compile.
    pub fn new(
        engine: EngineConfig,
        ports: PortAllocator,
        notifier: Arc<ReadinessNotifier>,
    ) -> Result<Self> {
        let ready = engine.ready_regex()?;
        Ok(Self {
            engine,
            ready,
            ports,
            notifier,
        })
    }

    /// Whether launches begin with a training phase.
    #[must_use]
    pub fn trains_before_launch(&self) -> bool {
        self.engine.train_before_launch
    }

    /// Port allocator shared by every worker.
    #[must_use]
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Reserve a port and start the supervising task for `workspace`.
    ///
    /// Returns as soon as the task is running; spawn failures surface through
    /// [`await_ready`](Self::await_ready).
    ///
    /// # Errors
    ///
    /// Returns `AppError::LaunchFailed` if no port is free.
    pub fn launch(&self, workspace: &WorkspaceHandle) -> Result<WorkerHandle> {
        let lease = self.ports.reserve()?;
        let port = lease.port();
        let endpoint = self.engine.endpoint_for_port(port);
        let initial = if self.engine.train_before_launch {
            WorkerState::Training
        } else {
            WorkerState::Starting
        };
        let (state_tx, state_rx) = watch::channel(initial);

        let inner = Arc::new(WorkerInner {
            session_id: workspace.session_id.clone(),
            port,
            endpoint: endpoint.clone(),
            state: state_rx,
            failure: OnceLock::new(),
            marker_seen: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let task = WorkerTask {
            session_id: workspace.session_id.clone(),
            endpoint,
            workspace: workspace.clone(),
            engine: self.engine.clone(),
            ready: self.ready.clone(),
            lease,
            notifier: Arc::clone(&self.notifier),
            state: state_tx,
            inner: Arc::clone(&inner),
        };

        let span = info_span!("worker", session_id = %workspace.session_id, port);
        tokio::spawn(task.run().instrument(span));

        Ok(WorkerHandle { inner })
    }

    /// Wait for the worker to serve.
    ///
    /// The training phase is bounded by its own timeout; `timeout` starts
    /// once the serving process is spawned. On timeout a `Failed` event is
    /// published and the worker is stopped before returning.
    pub async fn await_ready(&self, worker: &WorkerHandle, timeout: Duration) -> ReadyOutcome {
        let state = worker
            .wait_for_state(|state| *state != WorkerState::Training)
            .await;

        let state = if state == WorkerState::Starting {
            let waited = tokio::time::timeout(
                timeout,
                worker.wait_for_state(|state| *state != WorkerState::Starting),
            )
            .await;
            match waited {
                Ok(state) => state,
                Err(_elapsed) => {
                    warn!(
                        session_id = worker.session_id(),
                        ?timeout,
                        "readiness marker not seen in time"
                    );
                    self.notifier.publish(
                        worker.session_id(),
                        ReadinessEvent::Failed {
                            reason: format!("readiness timeout after {timeout:?}"),
                        },
                    );
                    self.stop(worker).await;
                    return ReadyOutcome::TimedOut;
                }
            }
        } else {
            state
        };

        // A marker followed by a fast exit can coalesce to a terminal state.
        if state == WorkerState::Running || worker.became_ready() {
            return ReadyOutcome::Ready;
        }

        let error = worker.failure().map_or_else(
            || AppError::LaunchFailed("worker stopped before readiness".into()),
            WorkerFailure::to_error,
        );
        ReadyOutcome::Failed(error)
    }

    /// Terminate the worker and wait for its process to exit.
    ///
    /// Sends a graceful termination signal, then force-kills after the
    /// configured grace period. Safe to call repeatedly.
    pub async fn stop(&self, worker: &WorkerHandle) {
        worker.inner.cancel.cancel();
        let state = worker.exited().await;
        debug!(session_id = worker.session_id(), ?state, "worker stopped");
    }
}

impl WorkerTask {
    async fn run(self) {
        let logs = self.workspace.logs_dir();
        if let Err(err) = tokio::fs::create_dir_all(&logs).await {
            self.fail(WorkerFailure::Launch(format!(
                "cannot create log directory {}: {err}",
                logs.display()
            )));
            return;
        }

        if self.engine.train_before_launch {
            if let Err(failure) = self.train(&logs.join("train.log")).await {
                self.fail(failure);
                return;
            }
            if self.inner.cancel.is_cancelled() {
                self.finish(WorkerState::Stopped);
                return;
            }
            self.state.send_replace(WorkerState::Starting);
        }

        let mut child = match self.spawn_server() {
            Ok(child) => child,
            Err(err) => {
                self.fail(WorkerFailure::Launch(err.to_string()));
                return;
            }
        };
        info!(pid = child.id(), endpoint = %self.endpoint, "engine process spawned");

        let log = match open_log(&logs.join("worker.log")).await {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(%err, "worker log unavailable, output only traced");
                None
            }
        };

        self.supervise(&mut child, log).await;
    }

    async fn supervise(&self, child: &mut Child, mut log: Option<File>) {
        let max_line = self.engine.max_line_bytes;
        let stdout = child
            .stdout
            .take()
            .map(|out| FramedRead::new(out, OutputCodec::new(max_line)));
        let stderr = child
            .stderr
            .take()
            .map(|err| FramedRead::new(err, OutputCodec::new(max_line)));
        let mut output = futures_util::stream::select(
            futures_util::stream::iter(stdout).flatten(),
            futures_util::stream::iter(stderr).flatten(),
        );
        let mut output_open = true;
        let mut scanner = ReadinessScanner::new(self.ready.clone());

        let exit = loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => {
                    terminate(child, self.engine.stop_grace()).await;
                    self.finish(WorkerState::Stopped);
                    return;
                }
                line = output.next(), if output_open => match line {
                    Some(Ok(line)) => self.on_line(&mut scanner, &mut log, &line).await,
                    Some(Err(err)) => {
                        warn!(%err, "engine output stream failed");
                        output_open = false;
                    }
                    None => output_open = false,
                },
                status = child.wait() => break status,
            }
        };

        // Keep the tail of the output for diagnostics.
        {
            let drain = async {
                while let Some(Ok(line)) = output.next().await {
                    self.on_line(&mut scanner, &mut log, &line).await;
                }
            };
            if output_open && tokio::time::timeout(DRAIN_LIMIT, drain).await.is_err() {
                debug!("output still open after exit, detaching");
            }
        }

        let (state, reason) = classify_exit(&exit);
        if scanner.state() == ScanState::Ready {
            warn!(%reason, "engine process exited");
            self.finish(state);
        } else {
            self.fail(WorkerFailure::Launch(format!(
                "engine exited before readiness: {reason}"
            )));
        }
    }

    async fn on_line(&self, scanner: &mut ReadinessScanner, log: &mut Option<File>, line: &str) {
        debug!(line, "engine output");

        if let Some(file) = log.as_mut() {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            };
            if let Err(err) = written.await {
                warn!(%err, "failed to append worker log");
                *log = None;
            }
        }

        if scanner.observe(line) {
            info!(endpoint = %self.endpoint, "engine ready");
            self.inner.marker_seen.store(true, Ordering::Release);
            self.state.send_replace(WorkerState::Running);
            self.notifier.publish(
                &self.session_id,
                ReadinessEvent::Ready {
                    endpoint: self.endpoint.clone(),
                },
            );
        }
    }

    async fn train(&self, log_path: &Path) -> std::result::Result<(), WorkerFailure> {
        let log = std::fs::File::create(log_path).map_err(|err| {
            WorkerFailure::Training(format!("cannot create {}: {err}", log_path.display()))
        })?;
        let log_err = log
            .try_clone()
            .map_err(|err| WorkerFailure::Training(err.to_string()))?;

        let mut cmd = self.command(&self.engine.train_args);
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        let mut child = cmd.spawn().map_err(|err| {
            WorkerFailure::Training(format!("failed to spawn {}: {err}", self.engine.binary))
        })?;
        info!(pid = child.id(), "training started");

        let timeout = self.engine.train_timeout();
        tokio::select! {
            () = self.inner.cancel.cancelled() => {
                terminate(&mut child, self.engine.stop_grace()).await;
                Ok(())
            }
            waited = tokio::time::timeout(timeout, child.wait()) => match waited {
                Ok(Ok(status)) if status.success() => {
                    info!("training finished");
                    Ok(())
                }
                Ok(Ok(status)) => Err(WorkerFailure::Training(format!(
                    "training {}; see {}",
                    classify_exit(&Ok(status)).1,
                    log_path.display()
                ))),
                Ok(Err(err)) => Err(WorkerFailure::Training(format!("wait error: {err}"))),
                Err(_elapsed) => {
                    terminate(&mut child, self.engine.stop_grace()).await;
                    Err(WorkerFailure::Training(format!(
                        "training exceeded {timeout:?}"
                    )))
                }
            },
        }
    }

    fn spawn_server(&self) -> Result<Child> {
        let args = self.engine.run_args_for_port(self.lease.port());
        let mut cmd = self.command(&args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.spawn().map_err(|err| {
            AppError::LaunchFailed(format!("failed to spawn {}: {err}", self.engine.binary))
        })
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.engine.binary);
        cmd.args(args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env(SESSION_ENV, &self.session_id)
            .env(PORT_ENV, self.lease.port().to_string());

        cmd.current_dir(&self.workspace.path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn fail(&self, failure: WorkerFailure) {
        warn!(?failure, "worker failed");
        let reason = failure.to_error().to_string();
        // Set once per worker; a second failure keeps the first.
        let _ = self.inner.failure.set(failure);
        self.notifier
            .publish(&self.session_id, ReadinessEvent::Failed { reason });
        self.finish(WorkerState::Crashed);
    }

    fn finish(&self, state: WorkerState) {
        self.state.send_replace(state);
    }
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

fn classify_exit(exit: &std::io::Result<ExitStatus>) -> (WorkerState, String) {
    match exit {
        Ok(status) if status.success() => (WorkerState::Stopped, "exited with code 0".into()),
        Ok(status) => {
            let reason = status.code().map_or_else(
                || "terminated by signal".to_owned(),
                |code| format!("exited with code {code}"),
            );
            (WorkerState::Crashed, reason)
        }
        Err(err) => (WorkerState::Crashed, format!("wait error: {err}")),
    }
}

/// Ask the process to exit, then force-kill after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    send_sigterm(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "engine process exited gracefully"),
        Ok(Err(err)) => warn!(%err, "error waiting for engine process"),
        Err(_elapsed) => {
            warn!("engine process did not exit within grace period, forcing kill");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to force-kill engine process");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}
