//! Mock backend for integration testing
//!
//! Environment variables:
//! - PORT: Port to listen on (required)
//! - LISTEN_DELAY_MS: Delay before accepting connections (default: 0)
//! - NEVER_LISTEN: If set, never bind PORT (simulates a stuck startup)
//! - EXIT_AFTER_MS: Exit with status 1 after this delay (simulates a crash)
//! - HEALTH_PORT: Serve an HTTP health endpoint on this port
//! - HEALTH_DELAY_MS: Health endpoint answers 503 until this delay has passed
//! - IGNORE_SIGTERM: If set, SIGTERM is ignored (forces a SIGKILL on stop)
//!
//! Accepted connections are echoed back without any greeting.

use std::env;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn env_ms(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[tokio::main]
async fn main() {
    let started = Instant::now();

    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    if env::var("IGNORE_SIGTERM").is_ok() {
        ignore_sigterm();
    }

    if let Some(delay) = env_ms("EXIT_AFTER_MS") {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            eprintln!("Mock backend: exiting on purpose");
            std::process::exit(1);
        });
    }

    if let Ok(health_port) = env::var("HEALTH_PORT") {
        let health_port: u16 = health_port.parse().expect("HEALTH_PORT must be a valid port");
        let ready_at = started + env_ms("HEALTH_DELAY_MS").unwrap_or_default();
        let listener = TcpListener::bind(("127.0.0.1", health_port))
            .await
            .expect("Failed to bind health port");
        tokio::spawn(serve_health(listener, ready_at));
    }

    if env::var("NEVER_LISTEN").is_ok() {
        eprintln!("Mock backend: never listening");
        std::future::pending::<()>().await;
    }

    if let Some(delay) = env_ms("LISTEN_DELAY_MS") {
        eprintln!("Mock backend: sleeping for {}ms before listening", delay.as_millis());
        tokio::time::sleep(delay).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("Failed to bind");
    println!("Mock backend: listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(echo(stream));
            }
            Err(e) => {
                eprintln!("Mock backend: accept error: {}", e);
            }
        }
    }
}

async fn echo(mut stream: TcpStream) {
    let (mut read, mut write) = stream.split();
    let _ = tokio::io::copy(&mut read, &mut write).await;
}

async fn serve_health(listener: TcpListener, ready_at: Instant) {
    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let status = if Instant::now() >= ready_at {
                "200 OK"
            } else {
                "503 Service Unavailable"
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}

#[cfg(unix)]
fn ignore_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            eprintln!("Mock backend: ignoring SIGTERM");
        }
    });
}

#[cfg(not(unix))]
fn ignore_sigterm() {}
