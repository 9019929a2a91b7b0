use crate::config::BackendConfig;
use crate::error::StartError;
use parking_lot::Mutex;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, error, info, warn};

/// How long to wait for the OS to confirm a SIGKILL before giving up
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// How a backend process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
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

    /// Status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Exit code 0; everything else counts as abnormal
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Lifecycle of a supervised OS process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No process has been spawned yet
    NotStarted,
    /// Spawned, exit watcher not yet running
    Starting,
    /// Process is running
    Running,
    /// Termination has been requested
    Stopping,
    /// Exit has been observed; the pid is no longer meaningful
    Exited(ExitInfo),
}

impl ProcessState {
    pub fn exit_info(&self) -> Option<ExitInfo> {
        match self {
            ProcessState::Exited(info) => Some(*info),
            _ => None,
        }
    }

    pub fn is_exited(&self) -> bool {
        self.exit_info().is_some()
    }
}

/// Result of stopping a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited when stop was requested
    AlreadyExited(ExitInfo),
    /// The process exited within the grace period after SIGTERM
    Graceful(ExitInfo),
    /// The grace period elapsed and the process was killed
    ForceKilled(ExitInfo),
    /// Even SIGKILL was not confirmed in time
    Unresponsive,
}

impl StopOutcome {
    /// Whether the process is known to be gone
    pub fn completed(&self) -> bool {
        !matches!(self, StopOutcome::Unresponsive)
    }
}

enum Signal {
    Terminate,
    Kill,
}

/// One running (or exited) backend OS process.
///
/// The `Child` handle is owned by a dedicated exit-watcher task; signals are
/// routed through that task so they are only ever delivered before the
/// process has been reaped, never to a recycled pid.
pub struct BackendProcess {
    name: String,
    pid: u32,
    started_at: Instant,
    state: watch::Sender<ProcessState>,
    signals: mpsc::UnboundedSender<Signal>,
    stop_outcome: OnceCell<StopOutcome>,
}

impl BackendProcess {
    /// Spawn the backend command and return as soon as the OS process exists
    fn spawn(config: &BackendConfig) -> Result<Arc<Self>, StartError> {
        let (program, args) =
            config
                .program_and_args()
                .map_err(|reason| StartError::InvalidCommand {
                    backend: config.name.clone(),
                    reason,
                })?;

        info!(backend = %config.name, command = %program, ?args, "Starting backend");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        // Backends that take their port from the environment
        cmd.env("PORT", config.port.to_string());

        // Terminal signals go to the gateway only; it decides when backends stop
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| StartError::Spawn {
            backend: config.name.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| StartError::Spawn {
            backend: config.name.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before its pid could be read",
            ),
        })?;
        info!(backend = %config.name, pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            log_output(config.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            log_output(config.name.clone(), "stderr", stderr);
        }

        let (state, _) = watch::channel(ProcessState::Starting);
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let process = Arc::new(Self {
            name: config.name.clone(),
            pid,
            started_at: Instant::now(),
            state,
            signals,
            stop_outcome: OnceCell::new(),
        });

        tokio::spawn(Arc::clone(&process).watch_exit(child, signals_rx));

        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Wait until the process exit has been observed
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.state.subscribe();
        rx.wait_for(|state| state.is_exited())
            .await
            .ok()
            .and_then(|state| state.exit_info())
            .unwrap_or_else(ExitInfo::unknown)
    }

    /// Stop the process: SIGTERM, wait up to `grace_period`, then SIGKILL.
    ///
    /// Concurrent and repeated calls share the outcome of the first call.
    pub async fn stop(&self, grace_period: Duration) -> StopOutcome {
        *self
            .stop_outcome
            .get_or_init(|| self.stop_inner(grace_period))
            .await
    }

    async fn stop_inner(&self, grace_period: Duration) -> StopOutcome {
        if let Some(info) = self.state().exit_info() {
            debug!(backend = %self.name, pid = self.pid, %info, "Backend already exited");
            return StopOutcome::AlreadyExited(info);
        }

        self.state.send_if_modified(|state| {
            if state.is_exited() {
                return false;
            }
            *state = ProcessState::Stopping;
            true
        });

        info!(backend = %self.name, pid = self.pid, "Sending SIGTERM to backend");
        let _ = self.signals.send(Signal::Terminate);

        match tokio::time::timeout(grace_period, self.wait_exit()).await {
            Ok(info) => {
                info!(backend = %self.name, pid = self.pid, %info, "Backend process exited gracefully");
                StopOutcome::Graceful(info)
            }
            Err(_) => {
                warn!(
                    backend = %self.name,
                    pid = self.pid,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.signals.send(Signal::Kill);

                match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, self.wait_exit()).await {
                    Ok(info) => {
                        warn!(backend = %self.name, pid = self.pid, %info, "Backend process force-killed");
                        StopOutcome::ForceKilled(info)
                    }
                    Err(_) => {
                        error!(backend = %self.name, pid = self.pid, "Backend did not exit after SIGKILL");
                        StopOutcome::Unresponsive
                    }
                }
            }
        }
    }

    /// Owns the child until it exits, delivering signals while it is unreaped
    async fn watch_exit(
        self: Arc<Self>,
        mut child: Child,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        self.state.send_if_modified(|state| {
            if *state != ProcessState::Starting {
                return false;
            }
            *state = ProcessState::Running;
            true
        });

        let info = loop {
            tokio::select! {
                result = child.wait() => {
                    break match result {
                        Ok(status) => ExitInfo::from_status(status),
                        Err(e) => {
                            warn!(backend = %self.name, pid = self.pid, error = %e, "Error waiting for backend to exit");
                            ExitInfo::unknown()
                        }
                    };
                }
                Some(signal) = signals.recv() => {
                    self.deliver(&mut child, signal);
                }
            }
        };

        let requested = self.state() == ProcessState::Stopping;
        if requested {
            debug!(backend = %self.name, pid = self.pid, %info, "Backend process exit observed");
            // Descendants that outlived the leader still share its group
            #[cfg(unix)]
            {
                if self.signal_group(libc::SIGKILL).is_ok() {
                    debug!(backend = %self.name, pgid = self.pid, "Killed remaining process group members");
                }
            }
        } else if info.is_clean() {
            warn!(
                backend = %self.name,
                pid = self.pid,
                uptime_ms = self.started_at.elapsed().as_millis() as u64,
                "Backend process exited on its own"
            );
        } else {
            error!(
                backend = %self.name,
                pid = self.pid,
                %info,
                uptime_ms = self.started_at.elapsed().as_millis() as u64,
                "Backend process exited unexpectedly"
            );
        }

        self.state.send_replace(ProcessState::Exited(info));
    }

    /// The backend leads its own process group, so its pid is the group id
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> std::io::Result<()> {
        let result = unsafe { libc::killpg(self.pid as libc::pid_t, signal) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn deliver(&self, child: &mut Child, signal: Signal) {
        match signal {
            Signal::Terminate => {
                #[cfg(unix)]
                {
                    if let Err(e) = self.signal_group(libc::SIGTERM) {
                        warn!(backend = %self.name, pgid = self.pid, error = %e, "Failed to send SIGTERM");
                    }
                }

                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }
            Signal::Kill => {
                #[cfg(unix)]
                let result = self.signal_group(libc::SIGKILL).or_else(|e| {
                    debug!(backend = %self.name, pgid = self.pid, error = %e, "killpg failed, killing leader only");
                    child.start_kill()
                });

                #[cfg(not(unix))]
                let result = child.start_kill();

                if let Err(e) = result {
                    warn!(backend = %self.name, pid = self.pid, error = %e, "Failed to send SIGKILL");
                }
            }
        }
    }
}

/// Forward each line of a backend output stream to the log
fn log_output<R>(backend: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if stream == "stderr" {
                        warn!(target: "backend", backend = %backend, stream, "{}", line);
                    } else {
                        info!(target: "backend", backend = %backend, stream, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(backend = %backend, stream, error = %e, "Backend output stream closed");
                    break;
                }
            }
        }
    });
}

/// Owns the lifecycle of the OS process behind one backend descriptor.
///
/// At most one live process exists at a time: `start` refuses to spawn while
/// the previous process's exit has not been observed.
pub struct Supervisor {
    config: Arc<BackendConfig>,
    current: Mutex<Option<Arc<BackendProcess>>>,
}

impl Supervisor {
    pub fn new(config: Arc<BackendConfig>) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    /// Spawn the backend process; does not wait for readiness
    pub fn start(&self) -> Result<Arc<BackendProcess>, StartError> {
        let mut current = self.current.lock();
        if let Some(process) = current.as_ref() {
            if !process.state().is_exited() {
                return Err(StartError::AlreadyRunning {
                    backend: self.config.name.clone(),
                    pid: process.pid(),
                });
            }
        }

        let process = BackendProcess::spawn(&self.config)?;
        *current = Some(Arc::clone(&process));
        Ok(process)
    }

    /// The most recently started process, live or exited
    pub fn current(&self) -> Option<Arc<BackendProcess>> {
        self.current.lock().clone()
    }

    pub fn state(&self) -> ProcessState {
        self.current()
            .map(|process| process.state())
            .unwrap_or(ProcessState::NotStarted)
    }

    /// Stop the current process, if any
    pub async fn stop(&self, grace_period: Duration) -> Option<StopOutcome> {
        match self.current() {
            Some(process) => Some(process.stop(grace_period).await),
            None => None,
        }
    }
}
