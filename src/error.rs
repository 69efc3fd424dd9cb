//! Error types for seesaw.
//!
//! Per-connection variants end one Connection Context and are only logged.
//! Setup, connect and configuration variants end the process.

use crate::runtime::Direction;
use crate::sequence::Mismatch;
use std::collections::TryReserveError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures seen by the connector, the acceptor or a single connection.
#[derive(Debug, Error)]
pub enum Error {
    /// Resolve, socket, bind, listen or connect could not be set up.
    #[error("{op} failed: {source}")]
    Setup {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The outbound connection did not become writable in time.
    #[error("timeout connect after {0:?}")]
    ConnectTimeout(Duration),

    /// The outbound connection completed with a pending socket error.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    /// A pending read or write saw no readiness in time.
    #[error("timeout {direction} after {after:?}")]
    IoTimeout { direction: Direction, after: Duration },

    /// The peer shut the connection down with bytes still outstanding.
    #[error("remote shut down during {direction} ({progress}/{target} bytes)")]
    PeerShutdown {
        direction: Direction,
        progress: usize,
        target: usize,
    },

    /// A received round broke the canonical pattern.
    #[error("received incorrect data in round of {round} words: {mismatch}")]
    Integrity { round: usize, mismatch: Mismatch },

    /// A round buffer could not be allocated.
    #[error("allocating round buffer: {0}")]
    Allocation(#[from] TryReserveError),

    /// The connection registry is at capacity.
    #[error("connection limit reached ({0})")]
    RegistryFull(usize),

    /// Any other I/O error on an established connection.
    #[error("{direction}: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap a setup-time I/O error with the operation that produced it.
    pub fn setup(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Setup { op, source }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
