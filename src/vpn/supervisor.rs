//! Lifecycle supervision of the external sing-box process.
//!
//! # Lifecycle
//! ```text
//! Stopped/Crashed ──start()──▶ Starting ──spawned──▶ Running
//! Running ──stop()──▶ Stopping ──exit observed──▶ Stopped
//! Running ──exit without stop()──▶ Crashed
//! Stopping ──survives SIGKILL──▶ Crashed
//! ```
//!
//! Transitions are serialized by one async lock held for the whole
//! transition body, so racing `start`/`stop`/`restart` calls can never
//! produce two live children. The monitor task owns the child handle and
//! is the only place that observes its exit.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use super::error::{VpnError, VpnResult};
use super::generator::ConfigGenerator;
use super::writer::ConfigWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Engine executable name looked up on PATH and in the fallback dirs.
    pub binary: String,
    /// Explicit executable path; skips the search when set.
    pub binary_path: Option<PathBuf>,
    pub config_path: PathBuf,
    /// Last directory searched for the executable.
    pub runtime_dir: PathBuf,
    pub grace_period: Duration,
    pub settle_delay: Duration,
    /// How long to wait for the child after a forced kill before giving up.
    pub kill_wait: Duration,
}

impl SupervisorOptions {
    pub fn new(config_path: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "sing-box".into(),
            binary_path: None,
            config_path: config_path.into(),
            runtime_dir: runtime_dir.into(),
            grace_period: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            kill_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ProcessState {
    /// States from which `start()` is accepted.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Point-in-time view of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitOutcome>,
    /// Bumped on every successful start.
    pub generation: u64,
}

struct Inner {
    state: ProcessState,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_exit: Option<ExitOutcome>,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<watch::Receiver<bool>>,
}

struct Shared {
    inner: parking_lot::Mutex<Inner>,
    state_tx: watch::Sender<ProcessState>,
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ProcessState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }
}

pub struct ProcessSupervisor {
    options: SupervisorOptions,
    generator: ConfigGenerator,
    writer: ConfigWriter,
    shared: Arc<Shared>,
    transition: tokio::sync::Mutex<()>,
}

impl ProcessSupervisor {
    /// `generator` supplies the minimal config written on first start.
    pub fn new(options: SupervisorOptions, generator: ConfigGenerator) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        Self {
            options,
            generator,
            writer: ConfigWriter::new(),
            shared: Arc::new(Shared {
                inner: parking_lot::Mutex::new(Inner {
                    state: ProcessState::Stopped,
                    pid: None,
                    started_at: None,
                    last_exit: None,
                    generation: 0,
                    kill_tx: None,
                    exit_rx: None,
                }),
                state_tx,
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.options.config_path
    }

    pub fn state(&self) -> ProcessState {
        self.shared.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn status(&self) -> ProcessStatus {
        let inner = self.shared.inner.lock();
        ProcessStatus {
            state: inner.state,
            pid: inner.pid,
            started_at: inner.started_at,
            last_exit: inner.last_exit,
            generation: inner.generation,
        }
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.shared.state_tx.subscribe()
    }

    pub async fn start(&self) -> VpnResult<()> {
        let _guard = self.transition.lock().await;
        self.start_locked().await
    }

    /// No-op success when nothing is running.
    pub async fn stop(&self) -> VpnResult<()> {
        let _guard = self.transition.lock().await;
        self.stop_locked().await.map(|_| ())
    }

    /// Stop (if running), wait for the settle delay, start. A failed stop
    /// aborts before the new process is spawned.
    pub async fn restart(&self) -> VpnResult<()> {
        let _guard = self.transition.lock().await;
        if self.stop_locked().await? {
            tokio::time::sleep(self.options.settle_delay).await;
        }
        self.start_locked().await
    }

    /// Restart only if the engine is `Running` once the transition lock is
    /// held; otherwise `NotRunning` and a crashed or stopped engine is left
    /// alone.
    pub async fn restart_if_running(&self) -> VpnResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() != ProcessState::Running {
            return Err(VpnError::NotRunning);
        }
        self.stop_locked().await?;
        tokio::time::sleep(self.options.settle_delay).await;
        self.start_locked().await
    }

    /// Resolve the engine executable: explicit path, PATH, the directory of
    /// the current executable (and its `bin/`), then the runtime dir.
    pub fn locate_binary(&self) -> VpnResult<PathBuf> {
        if let Some(path) = &self.options.binary_path {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(VpnError::ProcessLaunch(format!(
                    "configured engine path {} does not exist",
                    path.display()
                )))
            };
        }

        let binary = &self.options.binary;
        if let Ok(path) = which::which(binary) {
            return Ok(path);
        }

        let file_name = if Path::new(binary).extension().is_some() {
            binary.clone()
        } else {
            format!("{binary}{}", std::env::consts::EXE_SUFFIX)
        };
        let mut dirs = Vec::with_capacity(3);
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs.push(exe_dir.join("bin"));
            dirs.insert(0, exe_dir);
        }
        dirs.push(self.options.runtime_dir.clone());

        dirs.into_iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                VpnError::ProcessLaunch(format!(
                    "'{binary}' not found in PATH, next to the executable, or in {}",
                    self.options.runtime_dir.display()
                ))
            })
    }

    async fn start_locked(&self) -> VpnResult<()> {
        let previous = {
            let inner = self.shared.inner.lock();
            if !inner.state.is_idle() {
                return Err(VpnError::AlreadyRunning);
            }
            inner.state
        };

        let binary = self.locate_binary()?;
        self.ensure_config().await?;

        {
            let mut inner = self.shared.inner.lock();
            self.shared.set_state(&mut inner, ProcessState::Starting);
        }

        let spawned = Command::new(&binary)
            .arg("run")
            .arg("-c")
            .arg(&self.options.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let mut inner = self.shared.inner.lock();
                self.shared.set_state(&mut inner, previous);
                return Err(VpnError::ProcessLaunch(format!(
                    "failed to spawn {}: {e}",
                    binary.display()
                )));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, true);
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        let generation = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.pid = pid;
            inner.started_at = Some(Utc::now());
            inner.kill_tx = Some(kill_tx);
            inner.exit_rx = Some(exit_rx);
            self.shared.set_state(&mut inner, ProcessState::Running);
            inner.generation
        };

        tokio::spawn(monitor(
            child,
            kill_rx,
            exit_tx,
            Arc::clone(&self.shared),
            generation,
        ));
        tracing::info!(
            pid = pid.unwrap_or_default(),
            binary = %binary.display(),
            config = %self.options.config_path.display(),
            "engine started"
        );
        Ok(())
    }

    /// Returns whether a live process was stopped.
    async fn stop_locked(&self) -> VpnResult<bool> {
        let (pid, kill_tx, exit_rx, generation) = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_idle() {
                return Ok(false);
            }
            self.shared.set_state(&mut inner, ProcessState::Stopping);
            (
                inner.pid,
                inner.kill_tx.take(),
                inner.exit_rx.clone(),
                inner.generation,
            )
        };

        let Some(mut exit_rx) = exit_rx else {
            self.mark_stopped(generation);
            return Ok(true);
        };

        let mut kill_tx = kill_tx;
        if !send_terminate(pid) {
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
        }

        if !wait_exit(&mut exit_rx, self.options.grace_period).await {
            tracing::warn!(
                pid = pid.unwrap_or_default(),
                grace_ms = self.options.grace_period.as_millis() as u64,
                "engine did not exit in time, killing"
            );
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
            if !wait_exit(&mut exit_rx, self.options.kill_wait).await {
                self.abandon(generation);
                return Err(VpnError::Stop {
                    pid: pid.unwrap_or_default(),
                });
            }
        }

        self.mark_stopped(generation);
        Ok(true)
    }

    async fn ensure_config(&self) -> VpnResult<()> {
        let path = &self.options.config_path;
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        tracing::info!(path = %path.display(), "no engine config yet, writing default");
        let config = self.generator.default_config()?;
        self.writer.write(&config, path).await
    }

    /// Give up on a child that outlived SIGKILL so a later `start()` is
    /// accepted. Its monitor is ignored once the generation moves on.
    fn abandon(&self, generation: u64) {
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation && inner.state == ProcessState::Stopping {
            tracing::error!(
                pid = inner.pid.unwrap_or_default(),
                "engine survived forced kill, marking it crashed"
            );
            inner.kill_tx = None;
            inner.exit_rx = None;
            self.shared.set_state(&mut inner, ProcessState::Crashed);
        }
    }

    fn mark_stopped(&self, generation: u64) {
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation && inner.state == ProcessState::Stopping {
            inner.pid = None;
            self.shared.set_state(&mut inner, ProcessState::Stopped);
        }
    }
}

/// Owns the child until it exits. An exit while `Stopping` is voluntary;
/// any other exit of the current generation is a crash.
async fn monitor(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
    shared: Arc<Shared>,
    generation: u64,
) {
    let waited = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!("failed to kill engine: {e}");
            }
            child.wait().await
        }
    };

    let outcome = match waited {
        Ok(status) => ExitOutcome::from(status),
        Err(e) => {
            tracing::warn!("failed to collect engine exit status: {e}");
            ExitOutcome {
                code: None,
                signal: None,
            }
        }
    };

    {
        let mut inner = shared.inner.lock();
        if inner.generation == generation {
            inner.pid = None;
            inner.kill_tx = None;
            inner.exit_rx = None;
            inner.last_exit = Some(outcome);
            match inner.state {
                ProcessState::Stopping => {
                    shared.set_state(&mut inner, ProcessState::Stopped);
                    tracing::info!(exit = %outcome, "engine stopped");
                }
                ProcessState::Running | ProcessState::Starting => {
                    shared.set_state(&mut inner, ProcessState::Crashed);
                    tracing::error!(exit = %outcome, "engine exited unexpectedly");
                }
                ProcessState::Stopped | ProcessState::Crashed => {}
            }
        }
    }
    let _ = exit_tx.send(true);
}

async fn wait_exit(exit_rx: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    // A closed channel means the monitor already finished.
    tokio::time::timeout(limit, exit_rx.wait_for(|exited| *exited))
        .await
        .is_ok()
}

fn forward_output<R>(reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                tracing::warn!(target: "engine", "{line}");
            } else {
                tracing::info!(target: "engine", "{line}");
            }
        }
    });
}

#[cfg(unix)]
fn send_terminate(pid: Option<u32>) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, "SIGTERM not delivered: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: Option<u32>) -> bool {
    false
}
