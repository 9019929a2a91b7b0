//! Per-backend readiness state machine
//!
//! A backend moves `Starting → ListenPending → HealthPending → Ready`, driven
//! by two independent signals: the local port accepting connections and the
//! configured health probe passing. `Failed` is terminal and reachable from
//! any phase once the process exits. `stuck` is an informational flag set
//! when readiness takes longer than configured; polling carries on.

use crate::config::{BackendConfig, BackendDefaults, ProbeStart};
use crate::probe::{display_addr, listen_check, HealthProbe, ProbeOutcome};
use crate::process::ExitInfo;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Upper bound for a single listen-check dial
const LISTEN_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPhase {
    /// Process not running yet
    Starting,
    /// Waiting for the local port to accept connections
    ListenPending,
    /// Listening; waiting for the health probe
    HealthPending,
    /// Readiness policy satisfied
    Ready,
    /// Process exited or could not be started
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Pass,
    Fail,
}

/// Snapshot of a backend's readiness, shared with every waiting session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessRecord {
    pub phase: ReadinessPhase,
    /// Local port accepted the most recent listen check
    pub listening: bool,
    /// Latest probe result; `Unknown` without a health check
    pub healthy: HealthStatus,
    /// Readiness is overdue while the process is still running
    pub stuck: bool,
    /// Pid of the process this record describes
    pub pid: Option<u32>,
}

impl ReadinessRecord {
    pub fn starting() -> Self {
        Self {
            phase: ReadinessPhase::Starting,
            listening: false,
            healthy: HealthStatus::Unknown,
            stuck: false,
            pid: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == ReadinessPhase::Ready
    }

    pub fn is_failed(&self) -> bool {
        self.phase == ReadinessPhase::Failed
    }

    /// Ready or failed: nothing more to wait for
    pub fn is_settled(&self) -> bool {
        self.is_ready() || self.is_failed()
    }
}

/// When and how often the health probe runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub start: ProbeStart,
    pub grace_period: Duration,
    pub interval: Duration,
}

/// Pure transition logic, driven by the tracker with check results
#[derive(Debug, Clone)]
pub struct ReadinessMachine {
    probe: Option<ProbePolicy>,
    stuck_after: Option<Duration>,
    started_at: Instant,
    listened_at: Option<Instant>,
    last_probe_at: Option<Instant>,
    probe_passed: bool,
    record: ReadinessRecord,
}

impl ReadinessMachine {
    /// Machine for a process that is already running
    pub fn new(
        pid: u32,
        probe: Option<ProbePolicy>,
        stuck_after: Option<Duration>,
        started_at: Instant,
    ) -> Self {
        Self {
            probe,
            stuck_after,
            started_at,
            listened_at: None,
            last_probe_at: None,
            probe_passed: false,
            record: ReadinessRecord {
                phase: ReadinessPhase::ListenPending,
                listening: false,
                healthy: HealthStatus::Unknown,
                stuck: false,
                pid: Some(pid),
            },
        }
    }

    pub fn record(&self) -> &ReadinessRecord {
        &self.record
    }

    /// Whether a probe attempt should run at `now`
    pub fn probe_due(&self, now: Instant) -> bool {
        let Some(policy) = self.probe else {
            return false;
        };
        if self.probe_passed || self.record.is_settled() {
            return false;
        }

        let anchor = match policy.start {
            ProbeStart::AfterListen => match self.listened_at {
                Some(at) => at,
                None => return false,
            },
            ProbeStart::Immediate => self.started_at,
        };
        if now < anchor + policy.grace_period {
            return false;
        }

        match self.last_probe_at {
            Some(last) => now >= last + policy.interval,
            None => true,
        }
    }

    pub fn record_listen(&mut self, listening: bool, now: Instant) {
        if self.record.is_failed() {
            return;
        }
        self.record.listening = listening;
        if listening && self.listened_at.is_none() {
            self.listened_at = Some(now);
        }
        self.advance();
    }

    pub fn record_probe(&mut self, outcome: ProbeOutcome, now: Instant) {
        if self.record.is_settled() {
            return;
        }
        self.last_probe_at = Some(now);
        match outcome {
            ProbeOutcome::Pass => {
                self.probe_passed = true;
                self.record.healthy = HealthStatus::Pass;
            }
            ProbeOutcome::Fail => self.record.healthy = HealthStatus::Fail,
        }
        self.advance();
    }

    /// Set `stuck` once the deadline passes; returns true on the transition
    pub fn check_stuck(&mut self, now: Instant) -> bool {
        if self.record.stuck || self.record.is_settled() {
            return false;
        }
        match self.stuck_after {
            Some(limit) if now.duration_since(self.started_at) >= limit => {
                self.record.stuck = true;
                true
            }
            _ => false,
        }
    }

    pub fn record_exit(&mut self) {
        self.record.phase = ReadinessPhase::Failed;
        self.record.listening = false;
    }

    fn advance(&mut self) {
        if self.record.is_settled() {
            return;
        }
        self.record.phase = if self.listened_at.is_none() {
            ReadinessPhase::ListenPending
        } else if self.probe.is_some() && !self.probe_passed {
            ReadinessPhase::HealthPending
        } else {
            ReadinessPhase::Ready
        };
        if self.record.is_ready() {
            self.record.stuck = false;
        }
    }
}

struct CheckResults {
    listening: bool,
    probe: Option<ProbeOutcome>,
}

enum Step {
    Checked(CheckResults),
    Exited(ExitInfo),
    Shutdown,
}

/// Polls one backend process and publishes its readiness
pub struct ReadinessTracker {
    backend: String,
    host: String,
    port: u16,
    probe: Option<HealthProbe>,
    probe_timeout: Duration,
    poll_interval: Duration,
    machine: ReadinessMachine,
    publish: Arc<watch::Sender<ReadinessRecord>>,
}

impl ReadinessTracker {
    pub fn new(
        config: &BackendConfig,
        defaults: &BackendDefaults,
        pid: u32,
        started_at: Instant,
        publish: Arc<watch::Sender<ReadinessRecord>>,
    ) -> Self {
        let health_check = config.health_check.as_ref();
        let policy = health_check.map(|hc| ProbePolicy {
            start: hc.start,
            grace_period: hc.grace_period(),
            interval: hc.interval(defaults),
        });

        Self {
            backend: config.name.clone(),
            host: config.target_host.clone(),
            port: config.port,
            probe: health_check
                .map(|hc| HealthProbe::from_config(&hc.probe, &config.target_host, config.port)),
            probe_timeout: health_check
                .map(|hc| hc.timeout(defaults))
                .unwrap_or(Duration::ZERO),
            poll_interval: config.poll_interval(defaults),
            machine: ReadinessMachine::new(pid, policy, config.stuck_after(defaults), started_at),
            publish,
        }
    }

    /// Poll until the process exits or shutdown is signalled.
    ///
    /// `exited` resolves when the process exit is observed; every in-flight
    /// check is abandoned at that point.
    pub async fn run<F>(mut self, exited: F, mut shutdown_rx: watch::Receiver<bool>)
    where
        F: Future<Output = ExitInfo>,
    {
        tokio::pin!(exited);
        self.publish();
        debug!(
            backend = %self.backend,
            addr = %display_addr(&self.host, self.port),
            "Starting readiness polling"
        );

        let mut delay = Duration::ZERO;
        loop {
            let probe = if self.machine.probe_due(Instant::now()) {
                self.probe.as_ref()
            } else {
                None
            };

            let step = tokio::select! {
                biased;
                info = &mut exited => Step::Exited(info),
                _ = shutdown_rx.wait_for(|stop| *stop) => Step::Shutdown,
                results = run_checks(delay, &self.host, self.port, probe, self.probe_timeout) => Step::Checked(results),
            };
            delay = self.poll_interval;

            match step {
                Step::Checked(results) => self.apply(results),
                Step::Exited(info) => {
                    let was_ready = self.machine.record().is_ready();
                    self.machine.record_exit();
                    self.publish();
                    if was_ready {
                        warn!(backend = %self.backend, %info, "Backend exited after becoming ready");
                    } else {
                        error!(backend = %self.backend, %info, "Backend exited before becoming ready");
                    }
                    return;
                }
                Step::Shutdown => {
                    debug!(backend = %self.backend, "Stopping readiness polling, gateway shutting down");
                    return;
                }
            }
        }
    }

    fn apply(&mut self, results: CheckResults) {
        let before = self.machine.record().clone();
        let now = Instant::now();

        self.machine.record_listen(results.listening, now);
        if let Some(outcome) = results.probe {
            self.machine.record_probe(outcome, now);
            if !outcome.passed() {
                debug!(backend = %self.backend, "Health probe not passing yet");
            }
        }
        let became_stuck = self.machine.check_stuck(now);

        let after = self.machine.record().clone();
        let elapsed_ms = now.duration_since(self.machine.started_at).as_millis() as u64;

        if after.phase != before.phase {
            match after.phase {
                ReadinessPhase::HealthPending => {
                    info!(backend = %self.backend, elapsed_ms, "Backend is listening, waiting for health probe");
                }
                ReadinessPhase::Ready => {
                    info!(backend = %self.backend, pid = ?after.pid, elapsed_ms, "Backend is now ready");
                }
                _ => {}
            }
        } else if before.is_ready() && before.listening != after.listening {
            if after.listening {
                info!(backend = %self.backend, "Backend is accepting connections again");
            } else {
                warn!(backend = %self.backend, "Backend stopped accepting connections");
            }
        }

        if became_stuck {
            warn!(
                backend = %self.backend,
                elapsed_ms,
                phase = ?after.phase,
                "Backend has not become ready in time, still waiting"
            );
        }

        if after != before {
            self.publish();
        }
    }

    fn publish(&self) {
        let record = self.machine.record().clone();
        self.publish.send_if_modified(|current| {
            if *current == record {
                return false;
            }
            *current = record;
            true
        });
    }
}

async fn run_checks(
    delay: Duration,
    host: &str,
    port: u16,
    probe: Option<&HealthProbe>,
    probe_timeout: Duration,
) -> CheckResults {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let listening = listen_check(host, port, LISTEN_CHECK_TIMEOUT).await;
    let probe = match probe {
        Some(probe) => Some(
            tokio::time::timeout(probe_timeout, probe.attempt())
                .await
                .unwrap_or(ProbeOutcome::Fail),
        ),
        None => None,
    };

    CheckResults { listening, probe }
}
