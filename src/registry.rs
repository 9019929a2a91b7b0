//! Shared handles for every configured backend

use crate::config::{BackendConfig, BackendDefaults, Config, GatewayConfig, StartMode};
use crate::error::StartError;
use crate::process::{ProcessState, StopOutcome, Supervisor};
use crate::readiness::{ReadinessPhase, ReadinessRecord, ReadinessTracker};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

/// Decrements a session counter when dropped
pub struct SessionCount(Arc<AtomicUsize>);

impl SessionCount {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for SessionCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything the gateway knows about one backend
pub struct BackendHandle {
    config: Arc<BackendConfig>,
    defaults: BackendDefaults,
    supervisor: Supervisor,
    readiness: Arc<watch::Sender<ReadinessRecord>>,
    launched: AtomicBool,
    waiting: Arc<AtomicUsize>,
    relaying: Arc<AtomicUsize>,
}

impl BackendHandle {
    pub fn new(config: BackendConfig, defaults: BackendDefaults) -> Self {
        let config = Arc::new(config);
        let (readiness, _) = watch::channel(ReadinessRecord::starting());
        Self {
            supervisor: Supervisor::new(Arc::clone(&config)),
            config,
            defaults,
            readiness: Arc::new(readiness),
            launched: AtomicBool::new(false),
            waiting: Arc::new(AtomicUsize::new(0)),
            relaying: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn defaults(&self) -> &BackendDefaults {
        &self.defaults
    }

    /// Current readiness snapshot
    pub fn readiness(&self) -> ReadinessRecord {
        self.readiness.borrow().clone()
    }

    pub fn subscribe_readiness(&self) -> watch::Receiver<ReadinessRecord> {
        self.readiness.subscribe()
    }

    pub fn process_state(&self) -> ProcessState {
        self.supervisor.state()
    }

    /// Pid of the current process, if one was spawned
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.current().map(|process| process.pid())
    }

    /// Spawn the backend once and begin readiness polling.
    ///
    /// Only the first call spawns; later calls return `Ok` and callers wait on
    /// the readiness channel. A backend that exited or failed to start is not
    /// spawned again. Nothing is spawned once shutdown has been signalled.
    pub fn ensure_started(&self, shutdown_rx: watch::Receiver<bool>) -> Result<(), StartError> {
        if *shutdown_rx.borrow() {
            debug!(backend = %self.config.name, "Not starting backend, gateway is shutting down");
            return Err(StartError::ShuttingDown {
                backend: self.config.name.clone(),
            });
        }
        if self.launched.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let process = match self.supervisor.start() {
            Ok(process) => process,
            Err(e) => {
                error!(backend = %self.config.name, error = %e, "Backend failed to start");
                self.readiness.send_modify(|record| {
                    record.phase = ReadinessPhase::Failed;
                    record.listening = false;
                });
                return Err(e);
            }
        };

        let tracker = ReadinessTracker::new(
            &self.config,
            &self.defaults,
            process.pid(),
            process.started_at(),
            Arc::clone(&self.readiness),
        );
        tokio::spawn(tracker.run(async move { process.wait_exit().await }, shutdown_rx));

        Ok(())
    }

    /// Stop the backend process with its configured grace period
    pub async fn stop(&self) -> Option<StopOutcome> {
        self.supervisor
            .stop(self.config.stop_timeout(&self.defaults))
            .await
    }

    /// Register a session waiting for readiness
    pub fn enter_waiting(&self) -> SessionCount {
        SessionCount::enter(&self.waiting)
    }

    /// Register a session relaying bytes
    pub fn enter_relaying(&self) -> SessionCount {
        SessionCount::enter(&self.relaying)
    }

    pub fn waiting_sessions(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn relaying_sessions(&self) -> usize {
        self.relaying.load(Ordering::SeqCst)
    }
}

/// All backends plus the gateway-wide shutdown signal
pub struct Registry {
    gateway: GatewayConfig,
    backends: Vec<Arc<BackendHandle>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        let Config {
            gateway,
            defaults,
            backends,
        } = config;
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            gateway,
            backends: backends
                .into_iter()
                .map(|backend| Arc::new(BackendHandle::new(backend, defaults.clone())))
                .collect(),
            shutdown_tx,
        }
    }

    pub fn gateway(&self) -> &GatewayConfig {
        &self.gateway
    }

    /// Backends in configuration order
    pub fn backends(&self) -> &[Arc<BackendHandle>] {
        &self.backends
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendHandle>> {
        self.backends
            .iter()
            .find(|backend| backend.name() == name)
            .cloned()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown; returns false if it was already signalled
    pub fn signal_shutdown(&self) -> bool {
        let first = !self.shutdown_tx.send_replace(true);
        if first {
            debug!("Shutdown signalled");
        }
        first
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start every eager backend in order, collecting failures
    pub fn start_eager(&self) -> Vec<(String, StartError)> {
        let mut failures = Vec::new();
        for backend in &self.backends {
            if backend.config().start != StartMode::Eager {
                continue;
            }
            if let Err(e) = backend.ensure_started(self.shutdown_signal()) {
                failures.push((backend.name().to_string(), e));
            }
        }
        failures
    }
}
