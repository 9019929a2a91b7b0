//! Slowgate - A TCP front door for slow-starting backends
//!
//! This library provides a gateway that:
//! - Supervises backend processes (spawn, exit watch, SIGTERM then SIGKILL)
//! - Tracks readiness from a listen check and an optional health probe
//! - Holds client connections open until their backend is ready
//! - Announces the backend pid to each client before relaying bytes
//! - Closes listeners and stops every backend on shutdown

pub mod config;
pub mod error;
pub mod gateway;
pub mod probe;
pub mod process;
pub mod readiness;
pub mod registry;
pub mod shutdown;
