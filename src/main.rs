use slowgate::config::Config;
use slowgate::gateway::GatewayListener;
use slowgate::registry::Registry;
use slowgate::shutdown::ShutdownOrchestrator;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slowgate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("slowgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let registry = Arc::new(Registry::new(config));

    // Bind every public port before any backend starts
    let mut listeners = Vec::new();
    for backend in registry.backends() {
        let listener = GatewayListener::bind(
            &registry.gateway().bind,
            Arc::clone(backend),
            registry.gateway().preamble,
            registry.shutdown_signal(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to bind public port");
            e
        })?;
        listeners.push(listener);
    }
    let listener_handles: Vec<_> = listeners
        .into_iter()
        .map(|listener| tokio::spawn(listener.run()))
        .collect();

    let start_failures = registry.start_eager();
    for (backend, e) in &start_failures {
        error!(backend = %backend, error = %e, "Eager backend failed to start");
    }

    wait_for_signal().await?;

    let report = ShutdownOrchestrator::new(Arc::clone(&registry), listener_handles)
        .run()
        .await;

    if report.is_clean() && start_failures.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.gateway.bind,
        preamble = ?config.gateway.preamble,
        drain_timeout_secs = config.gateway.drain_timeout_secs,
        "Gateway configuration"
    );
    info!(
        poll_interval_ms = config.defaults.poll_interval_ms,
        stuck_after_secs = config.defaults.stuck_after_secs,
        wait_timeout_secs = ?config.defaults.wait_timeout_secs,
        stop_timeout_secs = config.defaults.stop_timeout_secs,
        "Backend defaults"
    );
    for backend in &config.backends {
        info!(
            backend = %backend.name,
            port = backend.port,
            public_port = backend.public_port,
            start = ?backend.start,
            health_check = backend.health_check.is_some(),
            "Configured backend"
        );
    }
}
