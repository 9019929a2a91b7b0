//! Public listeners that hold clients until their backend is ready
//!
//! Each accepted connection becomes a session: it waits for the backend to
//! become ready, receives the backend pid as a preamble, and is then relayed
//! byte-for-byte to the backend's local port. Bytes a client sends while
//! waiting are held by the session and written to the backend first.

use crate::config::{PreambleFormat, StartMode};
use crate::error::GatewayError;
use crate::probe::display_addr;
use crate::registry::BackendHandle;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Most client bytes a waiting session holds before it stops reading
pub const EARLY_BYTES_LIMIT: usize = 64 * 1024;

/// How a waiting session stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Backend is ready; carries the pid to announce
    Ready(u32),
    /// Backend exited or could not be started
    Failed,
    /// Client hung up first
    ClientGone,
    /// The configured wait deadline elapsed
    DeadlineElapsed,
    /// Gateway is shutting down
    Shutdown,
}

/// A bound public port for one backend
pub struct GatewayListener {
    backend: Arc<BackendHandle>,
    listener: TcpListener,
    preamble: PreambleFormat,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayListener {
    /// Bind `bind:public_port`. A bind failure is fatal for the gateway.
    pub async fn bind(
        bind: &str,
        backend: Arc<BackendHandle>,
        preamble: PreambleFormat,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, GatewayError> {
        let port = backend.config().public_port;
        let listener = TcpListener::bind((bind, port))
            .await
            .map_err(|source| GatewayError::Bind {
                backend: backend.name().to_string(),
                addr: display_addr(bind, port),
                source,
            })?;

        Ok(Self {
            backend,
            listener,
            preamble,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until shutdown; the port is closed when this returns
    pub async fn run(self) {
        let addr = self
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(backend = %self.backend.name(), %addr, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let backend = Arc::clone(&self.backend);
                            let shutdown_rx = self.shutdown_rx.clone();
                            tokio::spawn(handle_session(stream, peer, backend, self.preamble, shutdown_rx));
                        }
                        Err(e) => {
                            error!(backend = %self.backend.name(), error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!(backend = %self.backend.name(), %addr, "Gateway listener closing");
                    break;
                }
            }
        }
    }
}

async fn handle_session(
    mut client: TcpStream,
    peer: SocketAddr,
    backend: Arc<BackendHandle>,
    preamble: PreambleFormat,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let session = Uuid::new_v4();
    let name = backend.name().to_string();
    debug!(backend = %name, %peer, %session, "Client connected");

    let mut early = Vec::new();
    let outcome = {
        // Counted before the start attempt so a drain always sees this session
        let _waiting = backend.enter_waiting();
        if backend.config().start == StartMode::OnDemand {
            if let Err(e) = backend.ensure_started(shutdown_rx.clone()) {
                debug!(backend = %name, %session, error = %e, "Closing client, backend could not be started");
                return;
            }
        }
        wait_for_ready(&client, &backend, &mut shutdown_rx, &mut early).await
    };

    let pid = match outcome {
        WaitOutcome::Ready(pid) => pid,
        WaitOutcome::Failed => {
            info!(backend = %name, %peer, %session, "Backend failed, closing client connection");
            return;
        }
        WaitOutcome::ClientGone => {
            debug!(backend = %name, %peer, %session, "Client disconnected while waiting");
            return;
        }
        WaitOutcome::DeadlineElapsed => {
            info!(backend = %name, %peer, %session, "Wait deadline elapsed, closing client connection");
            return;
        }
        WaitOutcome::Shutdown => {
            debug!(backend = %name, %peer, %session, "Releasing waiting client for shutdown");
            return;
        }
    };

    let _relaying = backend.enter_relaying();

    if let Err(e) = client.write_all(preamble.render(pid).as_bytes()).await {
        debug!(backend = %name, %session, error = %e, "Client went away before preamble");
        return;
    }

    let host = backend.config().target_host.as_str();
    let port = backend.config().port;
    let mut upstream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            let target = display_addr(host, port);
            warn!(backend = %name, %session, %target, error = %e, "Failed to connect to backend");
            return;
        }
    };

    if !early.is_empty() {
        if let Err(e) = upstream.write_all(&early).await {
            debug!(backend = %name, %session, error = %e, "Backend closed before early client bytes");
            return;
        }
        debug!(backend = %name, %session, bytes = early.len(), "Forwarded early client bytes");
    }

    debug!(backend = %name, %peer, %session, pid, "Relaying");
    relay(client, upstream, &name, session).await;
}

/// Block until the backend settles, the client leaves, the deadline passes or
/// shutdown begins.
///
/// Bytes the client sends meanwhile are appended to `early` (up to
/// [`EARLY_BYTES_LIMIT`]) so its hang-up stays observable; the caller owes
/// them to the backend.
pub async fn wait_for_ready(
    client: &TcpStream,
    backend: &BackendHandle,
    shutdown_rx: &mut watch::Receiver<bool>,
    early: &mut Vec<u8>,
) -> WaitOutcome {
    let mut readiness = backend.subscribe_readiness();
    let deadline = backend.config().wait_timeout(backend.defaults());

    tokio::select! {
        biased;
        _ = shutdown_rx.wait_for(|stop| *stop) => WaitOutcome::Shutdown,
        record = readiness.wait_for(|record| record.is_settled()) => {
            match record {
                Ok(record) if record.is_ready() => match record.pid {
                    Some(pid) => WaitOutcome::Ready(pid),
                    None => WaitOutcome::Failed,
                },
                _ => WaitOutcome::Failed,
            }
        }
        _ = watch_client(client, early) => WaitOutcome::ClientGone,
        _ = sleep_or_forever(deadline) => WaitOutcome::DeadlineElapsed,
    }
}

/// Resolves when the client closes its side or the socket fails.
///
/// Data read on the way is kept in `early`. Once the limit is reached the
/// socket is left alone and the client is held by the other wait conditions.
async fn watch_client(client: &TcpStream, early: &mut Vec<u8>) {
    let mut buf = [0u8; 4096];
    while early.len() < EARLY_BYTES_LIMIT {
        if client.readable().await.is_err() {
            return;
        }
        let room = (EARLY_BYTES_LIMIT - early.len()).min(buf.len());
        match client.try_read(&mut buf[..room]) {
            Ok(0) => return,
            Ok(n) => early.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    }
    std::future::pending::<()>().await
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

/// Copy bytes both ways until either side closes; both sockets are then dropped
async fn relay(client: TcpStream, upstream: TcpStream, backend: &str, session: Uuid) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            match result {
                Ok(bytes) => debug!(backend, %session, client_to_backend = bytes, "Client closed connection"),
                Err(e) => debug!(backend, %session, error = %e, "Client side of relay failed"),
            }
        }
        result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            match result {
                Ok(bytes) => debug!(backend, %session, backend_to_client = bytes, "Backend closed connection"),
                Err(e) => debug!(backend, %session, error = %e, "Backend side of relay failed"),
            }
        }
    }
}
