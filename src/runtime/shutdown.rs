//! External shutdown signalling for the event loop.
//!
//! The loop polls with a bounded timeout and checks the flag between turns;
//! the waker just makes the stop prompt instead of waiting out the timeout.

use mio::Waker;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Cloneable handle that asks a running event loop to stop.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Request shutdown and interrupt a blocked poll.
    #[allow(dead_code)] // the binary stops through the signal handlers
    pub fn shutdown(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            debug!("Shutdown requested");
        }
        // The poll timeout bounds the delay if waking fails.
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Failed to wake event loop");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Set the flag on SIGINT or SIGTERM.
    ///
    /// Signal handlers cannot safely wake the poller, so the loop notices
    /// within one poll timeout.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.flag))?;
        }
        info!("Installed SIGINT/SIGTERM handlers");
        Ok(())
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::poller::{Poller, WAKER_TOKEN};
    use std::time::Duration;

    #[test]
    fn test_shutdown_sets_flag_and_wakes() {
        let mut poller = Poller::new(8).unwrap();
        let handle = ShutdownHandle::new(poller.waker());
        let clone = handle.clone();
        assert!(!handle.is_shutdown());

        clone.shutdown();
        assert!(handle.is_shutdown());

        let events = poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token == WAKER_TOKEN));

        // Repeated requests are harmless.
        handle.shutdown();
        assert!(handle.is_shutdown());
    }
}
