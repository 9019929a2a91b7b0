//! Error types for configuration loading and backend supervision

use thiserror::Error;

/// Errors produced while loading the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema
    #[error("Invalid config format: {0}")]
    Parse(#[from] toml::de::Error),

    /// One or more semantic problems, all reported together
    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Errors produced when launching a backend process
#[derive(Debug, Error)]
pub enum StartError {
    /// The descriptor does not yield an executable command line
    #[error("Backend '{backend}' has an unusable command: {reason}")]
    InvalidCommand { backend: String, reason: String },

    /// The OS refused to spawn the process
    #[error("Failed to start backend '{backend}': {source}")]
    Spawn {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    /// A previous process for this backend has not exited yet
    #[error("Backend '{backend}' is already running (pid {pid})")]
    AlreadyRunning { backend: String, pid: u32 },

    /// The gateway began shutting down before the backend was launched
    #[error("Backend '{backend}' not started, gateway is shutting down")]
    ShuttingDown { backend: String },
}

/// Errors produced by the public listeners
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The public port could not be bound
    #[error("Failed to bind {addr} for backend '{backend}': {source}")]
    Bind {
        backend: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
