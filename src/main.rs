//! echo-mux: a single-threaded TCP echo server
//!
//! Every byte a client sends is written back to that client unchanged.
//! All connections are serviced from one thread by a readiness-based
//! event loop (epoll on Linux, kqueue on macOS).
//!
//! Features:
//! - Non-blocking accept/read/write with per-connection output queues
//! - Graceful flush when a client half-closes
//! - Optional idle timeout and connection limit
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use runtime::ServerError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        read_buffer_size = config.read_buffer_size,
        events_capacity = config.events_capacity,
        "Starting echo-mux server"
    );

    match runtime::run(&config) {
        Ok(stats) => {
            info!(
                accepted = stats.accepted,
                bytes_sent = stats.bytes_sent,
                "Server stopped"
            );
            Ok(())
        }
        Err(ServerError::Bind(e)) if e.is_addr_in_use() => {
            error!(addr = %e.addr, "Address already in use");
            Err(ServerError::Bind(e).into())
        }
        Err(e) => Err(e.into()),
    }
}
