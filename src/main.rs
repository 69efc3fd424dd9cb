//! seesaw: an async TCP round exerciser
//!
//! Client and server take turns sending each other rounds of the integer
//! sequence `0, 1, ..., n - 1`, with `n` growing by one per transfer and
//! wrapping at a configured maximum. Every received round is checked.
//!
//! Features:
//! - Non-blocking, single-threaded event loop (epoll/kqueue via mio)
//! - Per-direction connect, accept, read and write timeouts
//! - Many simultaneous connections on the server side
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod runtime;
mod sequence;

use config::{Config, Mode};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("seesaw: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        max_round = config.max_round,
        rounds = ?config.rounds,
        connect_ms = config.timeouts.connect.as_millis() as u64,
        read_ms = config.timeouts.read.as_millis() as u64,
        write_ms = config.timeouts.write.as_millis() as u64,
        "Starting seesaw"
    );

    let result = match &config.mode {
        Mode::Client { host, port } => runtime::run_client(&config, host, *port),
        Mode::Server { port } => runtime::run_server(&config, *port),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Exiting");
            ExitCode::FAILURE
        }
    }
}
