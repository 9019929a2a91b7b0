//! Ordered, bounded teardown of listeners, waiting sessions and backends

use crate::process::StopOutcome;
use crate::registry::Registry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Interval for polling waiting sessions during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// What happened to each part of the gateway during shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Accept loops that did not finish within the drain timeout
    pub listeners_stuck: usize,
    /// Waiting sessions still present when the drain timeout elapsed
    pub sessions_abandoned: usize,
    /// Stop outcome per backend, in configuration order (`None`: never started)
    pub backends: Vec<(String, Option<StopOutcome>)>,
}

impl ShutdownReport {
    /// Every listener closed and every started process is known to be gone
    pub fn is_clean(&self) -> bool {
        self.listeners_stuck == 0
            && self
                .backends
                .iter()
                .all(|(_, outcome)| outcome.map_or(true, |o| o.completed()))
    }
}

pub struct ShutdownOrchestrator {
    registry: Arc<Registry>,
    listeners: Vec<JoinHandle<()>>,
}

impl ShutdownOrchestrator {
    /// `listeners` are the accept-loop tasks for every public port
    pub fn new(registry: Arc<Registry>, listeners: Vec<JoinHandle<()>>) -> Self {
        Self {
            registry,
            listeners,
        }
    }

    /// Close listeners, release waiting sessions, then stop every backend
    pub async fn run(mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let drain_timeout = self.registry.gateway().drain_timeout();

        self.registry.signal_shutdown();

        // 1. Listeners drop their sockets when their accept loop returns
        let total = self.listeners.len();
        let mut listeners = std::mem::take(&mut self.listeners);
        let closed = tokio::time::timeout(drain_timeout, async {
            for handle in listeners.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if closed.is_err() {
            for handle in &listeners {
                if !handle.is_finished() {
                    report.listeners_stuck += 1;
                    handle.abort();
                }
            }
            error!(stuck = report.listeners_stuck, "Listeners did not close in time");
        } else {
            info!(listeners = total, "All public listeners closed");
        }

        // 2. Waiting sessions see the same signal and close their clients
        report.sessions_abandoned = self.drain_waiting(drain_timeout).await;

        // 3. and 4. Stop every backend concurrently
        let backends = self.registry.backends();
        let outcomes = join_all(backends.iter().map(|backend| backend.stop())).await;
        for (backend, outcome) in backends.iter().zip(outcomes) {
            match outcome {
                Some(StopOutcome::Unresponsive) => {
                    error!(backend = %backend.name(), "Backend could not be stopped");
                }
                Some(StopOutcome::ForceKilled(_)) => {
                    warn!(backend = %backend.name(), "Backend had to be force-killed");
                }
                _ => {}
            }
            report.backends.push((backend.name().to_string(), outcome));
        }

        if report.is_clean() {
            info!("Shutdown complete");
        } else {
            error!(?report, "Shutdown finished with problems");
        }
        report
    }

    async fn drain_waiting(&self, drain_timeout: Duration) -> usize {
        let waiting = || {
            self.registry
                .backends()
                .iter()
                .map(|backend| backend.waiting_sessions())
                .sum::<usize>()
        };

        let drain_start = Instant::now();
        while waiting() > 0 {
            if drain_start.elapsed() > drain_timeout {
                let remaining = waiting();
                warn!(remaining, "Drain timeout exceeded, proceeding with shutdown");
                return remaining;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        0
    }
}
