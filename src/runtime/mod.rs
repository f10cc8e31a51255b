//! Single-threaded readiness-based runtime.
//!
//! Layers, bottom up:
//! - `socket`: non-blocking accept/recv/send with a three-way result
//! - `poller`: READ/WRITE interest registration over `mio::Poll`
//! - `connection`: per-connection queues and the fd-keyed registry
//! - `event_loop`: the dispatcher that ties them together

mod connection;
mod event_loop;
mod poller;
mod shutdown;
mod socket;
mod stats;

use crate::config::{Config, ConfigError};
use event_loop::EventLoop;
use socket::BindError;
use stats::Stats;
use std::fmt;
use std::io;

/// Errors that stop the server as a whole.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Bind(BindError),
    /// The poller itself failed; no connection can be serviced.
    Poll(io::Error),
    Signal(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{e}"),
            ServerError::Bind(e) => write!(f, "{e}"),
            ServerError::Poll(e) => write!(f, "poll failed: {e}"),
            ServerError::Signal(e) => write!(f, "failed to install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Bind(e) => Some(e),
            ServerError::Poll(e) | ServerError::Signal(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<BindError> for ServerError {
    fn from(e: BindError) -> Self {
        ServerError::Bind(e)
    }
}

/// Bind, install signal handlers and serve until SIGINT/SIGTERM.
pub fn run(config: &Config) -> Result<Stats, ServerError> {
    let mut event_loop = EventLoop::new(config)?;
    event_loop
        .shutdown_handle()
        .install_signal_handlers()
        .map_err(ServerError::Signal)?;
    event_loop.run()?;
    Ok(event_loop.stats())
}
