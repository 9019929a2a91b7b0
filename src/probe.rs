//! Listen checks and health probes against a backend's local ports

use crate::config::ProbeConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// Result of a single probe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Pass,
    Fail,
}

impl ProbeOutcome {
    pub fn passed(self) -> bool {
        self == ProbeOutcome::Pass
    }
}

impl From<bool> for ProbeOutcome {
    fn from(ok: bool) -> Self {
        if ok {
            ProbeOutcome::Pass
        } else {
            ProbeOutcome::Fail
        }
    }
}

/// A health probe resolved against a concrete backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// Passes when a TCP connection can be established
    Tcp { host: String, port: u16 },
    /// Passes on a 2xx response to `GET path`
    Http {
        host: String,
        port: u16,
        path: String,
    },
    /// Passes when the command exits with status 0
    Command { program: String, args: Vec<String> },
}

impl HealthProbe {
    /// Resolve a probe config; ports default to the backend's own port
    pub fn from_config(config: &ProbeConfig, host: &str, backend_port: u16) -> Self {
        match config {
            ProbeConfig::Tcp { port } => HealthProbe::Tcp {
                host: host.to_string(),
                port: port.unwrap_or(backend_port),
            },
            ProbeConfig::Http { port, path } => HealthProbe::Http {
                host: host.to_string(),
                port: port.unwrap_or(backend_port),
                path: path.clone(),
            },
            ProbeConfig::Command { command, args } => HealthProbe::Command {
                program: command.clone(),
                args: args.clone(),
            },
        }
    }

    /// Run one attempt. Any failure to reach or run the target is a `Fail`.
    ///
    /// Dropping the returned future cancels the attempt (command probes are
    /// killed on drop), so callers bound it with `tokio::time::timeout`.
    pub async fn attempt(&self) -> ProbeOutcome {
        match self {
            HealthProbe::Tcp { host, port } => {
                TcpStream::connect((host.as_str(), *port)).await.is_ok().into()
            }
            HealthProbe::Http { host, port, path } => check_http(host, *port, path).await.into(),
            HealthProbe::Command { program, args } => check_command(program, args).await.into(),
        }
    }
}

/// Whether `host:port` currently accepts TCP connections
pub async fn listen_check(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// `host:port` for logs and the HTTP `Host` header; IPv6 literals get brackets
pub fn display_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn check_http(host: &str, port: u16, path: &str) -> bool {
    let mut stream = match TcpStream::connect((host, port)).await {
        Ok(s) => s,
        Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path,
        display_addr(host, port)
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await.is_err() {
        return false;
    }

    // Format: "HTTP/1.1 200 OK\r\n"
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (200..300).contains(&code))
        .unwrap_or(false)
}

async fn check_command(program: &str, args: &[String]) -> bool {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;

    match status {
        Ok(status) => status.success(),
        Err(e) => {
            debug!(program, error = %e, "Health probe command could not be run");
            false
        }
    }
}
